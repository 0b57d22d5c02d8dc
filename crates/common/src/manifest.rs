use std::fmt;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::token::{hmac_sha1_hex, signing_secret};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SizedDigest(String);

impl SizedDigest {
    pub fn from_locator(locator: &str) -> Option<Self> {
        let (hash, rest) = locator.split_once('+')?;
        if hash.len() != 32 || !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return None;
        }
        let size = rest.split('+').next()?;
        if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self(format!("{hash}+{size}")))
    }

    pub fn hash(&self) -> &str {
        &self.0[..32]
    }

    pub fn size(&self) -> u64 {
        self.0[33..].parse().unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SizedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest line {line}: invalid stream name {token:?}")]
    StreamName { line: usize, token: String },
    #[error("manifest line {line}: no block locators")]
    NoBlocks { line: usize },
    #[error("manifest line {line}: invalid token {token:?}")]
    Token { line: usize, token: String },
}

fn is_block_token(token: &str) -> bool {
    SizedDigest::from_locator(token).is_some()
}

fn is_file_token(token: &str) -> bool {
    let mut parts = token.splitn(3, ':');
    let pos = parts.next().unwrap_or_default();
    let len = parts.next().unwrap_or_default();
    let name = parts.next().unwrap_or_default();
    !pos.is_empty()
        && !len.is_empty()
        && !name.is_empty()
        && pos.bytes().all(|b| b.is_ascii_digit())
        && len.bytes().all(|b| b.is_ascii_digit())
}

pub fn block_digests(manifest: &str) -> Result<Vec<SizedDigest>, ManifestError> {
    let mut digests = Vec::new();
    for (idx, line) in manifest.split('\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let line_no = idx + 1;
        let mut tokens = line.split(' ');
        let stream = tokens.next().unwrap_or_default();
        if !stream.starts_with('.') {
            return Err(ManifestError::StreamName {
                line: line_no,
                token: stream.to_string(),
            });
        }

        let mut seen_block = false;
        let mut in_files = false;
        for token in tokens {
            if !in_files && let Some(digest) = SizedDigest::from_locator(token) {
                digests.push(digest);
                seen_block = true;
            } else if seen_block && is_file_token(token) {
                in_files = true;
            } else {
                return Err(ManifestError::Token {
                    line: line_no,
                    token: token.to_string(),
                });
            }
        }
        if !seen_block {
            return Err(ManifestError::NoBlocks { line: line_no });
        }
    }
    Ok(digests)
}

fn map_block_tokens(manifest: &str, mut f: impl FnMut(&str) -> String) -> String {
    manifest
        .split('\n')
        .map(|line| {
            line.split(' ')
                .enumerate()
                .map(|(idx, token)| {
                    if idx > 0 && is_block_token(token) {
                        f(token)
                    } else {
                        token.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_hints_where(locator: &str, drop: impl Fn(&str) -> bool) -> String {
    let mut parts = locator.split('+');
    let mut out = String::with_capacity(locator.len());
    out.push_str(parts.next().unwrap_or_default());
    for (idx, part) in parts.enumerate() {
        if idx > 0 && drop(part) {
            continue;
        }
        out.push('+');
        out.push_str(part);
    }
    out
}

pub fn strip_signatures(manifest: &str) -> String {
    map_block_tokens(manifest, |token| {
        strip_hints_where(token, |hint| hint.starts_with('A') || hint.starts_with('R'))
    })
}

/// Content hash of the unsigned manifest: every block token is reduced to
/// `hash+size` before hashing.
pub fn portable_data_hash(manifest: &str) -> String {
    let normalized = map_block_tokens(manifest, |token| {
        SizedDigest::from_locator(token)
            .map(|d| d.0)
            .unwrap_or_else(|| token.to_string())
    });
    format!(
        "{:x}+{}",
        md5::compute(normalized.as_bytes()),
        normalized.len()
    )
}

/// Route block reads through `remote_id`: `+A<sig>` becomes
/// `+R<remote_id>-<sig>`.
pub fn rewrite_manifest(manifest: &str, remote_id: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r" [0-9a-f]{32}\+[^ ]*").expect("static regex"));
    let replacement = format!("+R{remote_id}-");
    re.replace_all(manifest, |caps: &Captures<'_>| {
        caps[0].replace("+A", &replacement)
    })
    .into_owned()
}

pub fn sign_locator(
    locator: &str,
    token: &str,
    expiry_unix: i64,
    ttl_secs: u64,
    key: &[u8],
) -> String {
    let bare = strip_hints_where(locator, |hint| hint.starts_with('A'));
    let hash = &bare[..bare.find('+').unwrap_or(bare.len())];
    let expiry_hex = format!("{expiry_unix:08x}");
    let message = format!(
        "{hash}@{}@{expiry_hex}@{ttl_secs:x}",
        signing_secret(token)
    );
    format!("{bare}+A{}@{expiry_hex}", hmac_sha1_hex(key, message.as_bytes()))
}

pub fn sign_manifest(
    manifest: &str,
    token: &str,
    expiry_unix: i64,
    ttl_secs: u64,
    key: &[u8],
) -> String {
    map_block_tokens(manifest, |token_str| {
        sign_locator(token_str, token, expiry_unix, ttl_secs, key)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BAR: &str = ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:bar\n";
    const SIG: &str = "+Aabcdef0123456789abcdef0123456789abcdef01@5f5e1000";

    #[test]
    fn pdh_ignores_signatures() {
        let signed = BAR.replace("+3 ", &format!("+3{SIG} "));
        assert_eq!(portable_data_hash(BAR), "fa7aeb5140e2848d39b416daeef4ffc5+45");
        assert_eq!(portable_data_hash(&signed), "fa7aeb5140e2848d39b416daeef4ffc5+45");
        assert_eq!(portable_data_hash(""), "d41d8cd98f00b204e9800998ecf8427e+0");
    }

    #[test]
    fn rewrite_turns_access_hints_into_remote_hints() {
        let signed = BAR.replace("+3 ", &format!("+3{SIG} "));
        let rewritten = rewrite_manifest(&signed, "bbbbb");
        assert_eq!(
            rewritten,
            ". 37b51d194a7513e45b56f6524f2d51f2+3+Rbbbbb-abcdef0123456789abcdef0123456789abcdef01@5f5e1000 0:3:bar\n"
        );
        assert!(!rewritten.contains("+A"));
        assert_eq!(rewrite_manifest(&rewritten, "bbbbb"), rewritten);
    }

    #[test]
    fn signing_preserves_pdh_and_strips_back_to_original() {
        let signed = sign_manifest(BAR, "v2/zzzzz-gj3su-077z32aux8dg2s1/secret", 1_700_000_000, 1_209_600, b"key");
        assert!(signed.contains("+A"));
        assert_eq!(portable_data_hash(&signed), portable_data_hash(&strip_signatures(&signed)));
        assert_eq!(strip_signatures(&signed), BAR);

        let resigned = sign_manifest(&signed, "v2/zzzzz-gj3su-077z32aux8dg2s1/secret", 1_700_000_000, 1_209_600, b"key");
        assert_eq!(resigned, signed);
    }

    #[test]
    fn signature_depends_on_token_secret_and_expiry() {
        let a = sign_locator("37b51d194a7513e45b56f6524f2d51f2+3", "tokenA", 100, 60, b"key");
        let b = sign_locator("37b51d194a7513e45b56f6524f2d51f2+3", "tokenB", 100, 60, b"key");
        let c = sign_locator("37b51d194a7513e45b56f6524f2d51f2+3", "tokenA", 101, 60, b"key");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with("@00000064"));
    }

    #[test]
    fn block_digests_lists_every_block() {
        let manifest = ". acbd18db4cc2f85cedef654fccc4a4d8+3+Asig@1 37b51d194a7513e45b56f6524f2d51f2+3 0:3:foo 3:3:bar\n./sub acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:foo\n";
        let digests = block_digests(manifest).unwrap();
        let names: Vec<_> = digests.iter().map(SizedDigest::as_str).collect();
        assert_eq!(
            names,
            vec![
                "acbd18db4cc2f85cedef654fccc4a4d8+3",
                "37b51d194a7513e45b56f6524f2d51f2+3",
                "acbd18db4cc2f85cedef654fccc4a4d8+3",
            ]
        );
        assert_eq!(digests[0].size(), 3);
        assert_eq!(digests[0].hash(), "acbd18db4cc2f85cedef654fccc4a4d8");
    }

    #[test]
    fn block_digests_rejects_garbage() {
        assert!(matches!(
            block_digests("foo acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:foo\n"),
            Err(ManifestError::StreamName { line: 1, .. })
        ));
        assert!(matches!(
            block_digests(". 0:3:foo\n"),
            Err(ManifestError::NoBlocks { line: 1 }) | Err(ManifestError::Token { line: 1, .. })
        ));
        assert!(matches!(
            block_digests(". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:foo acbd18db4cc2f85cedef654fccc4a4d8+3\n"),
            Err(ManifestError::Token { line: 1, .. })
        ));
    }
}
