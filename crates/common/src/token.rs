use std::sync::OnceLock;

use hmac::{Hmac, Mac};
use regex::Regex;
use sha1::Sha1;
use sha2::Sha256;

use crate::ids::UUID_LEN;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaltOutcome {
    Salted(String),
    AlreadySalted(String),
    PassThrough(String),
}

impl SaltOutcome {
    pub fn into_token(self) -> String {
        match self {
            SaltOutcome::Salted(token)
            | SaltOutcome::AlreadySalted(token)
            | SaltOutcome::PassThrough(token) => token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed v2 token")]
    BadFormat,
    #[error("obsolete token format cannot be salted")]
    Obsolete,
    #[error("token is already salted for a different cluster")]
    Salted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V2Token<'a> {
    pub uuid: &'a str,
    pub secret: &'a str,
}

impl V2Token<'_> {
    pub fn is_salted(&self) -> bool {
        self.secret.len() == 40 && self.secret.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

pub fn parse_v2(token: &str) -> Option<V2Token<'_>> {
    let rest = token.strip_prefix("v2/")?;
    let mut parts = rest.splitn(3, '/');
    let uuid = parts.next()?;
    let secret = parts.next()?;
    if uuid.len() != UUID_LEN || secret.is_empty() {
        return None;
    }
    Some(V2Token { uuid, secret })
}

fn is_obsolete(token: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-z]{41,}$").expect("static regex"))
        .is_match(token)
}

/// Derive the token a remote cluster should see for `token`.
pub fn salt_token(token: &str, remote: &str) -> Result<SaltOutcome, TokenError> {
    if !token.starts_with("v2/") {
        if is_obsolete(token) {
            return Err(TokenError::Obsolete);
        }
        return Ok(SaltOutcome::PassThrough(token.to_string()));
    }

    let v2 = parse_v2(token).ok_or(TokenError::BadFormat)?;
    if v2.uuid.starts_with(remote) {
        return Ok(SaltOutcome::AlreadySalted(token.to_string()));
    }
    if v2.is_salted() {
        return Err(TokenError::Salted);
    }

    Ok(SaltOutcome::Salted(format!(
        "v2/{}/{}",
        v2.uuid,
        salt_secret(v2.secret, remote)
    )))
}

/// The token to present to `remote`. A token whose secret is already salted
/// is sent as it is, so applying this twice changes nothing.
pub fn forwarding_token(token: &str, remote: &str) -> Result<String, TokenError> {
    match salt_token(token, remote) {
        Ok(outcome) => Ok(outcome.into_token()),
        Err(TokenError::Salted) => Ok(token.to_string()),
        Err(err) => Err(err),
    }
}

pub fn salt_secret(secret: &str, remote: &str) -> String {
    hmac_sha1_hex(secret.as_bytes(), remote.as_bytes())
}

pub fn hmac_sha1_hex(key: &[u8], msg: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    hex::encode(mac.finalize().into_bytes())
}

pub fn hmac_sha256_hex(key: &[u8], msg: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    hex::encode(mac.finalize().into_bytes())
}

pub fn signing_secret(token: &str) -> &str {
    parse_v2(token).map(|v2| v2.secret).unwrap_or(token)
}

pub fn log_label(token: &str) -> String {
    if let Some(v2) = parse_v2(token) {
        return v2.uuid.to_string();
    }
    let tail: String = token
        .chars()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("v1 token ending in {tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNSALTED: &str = "v2/zzzzz-gj3su-077z32aux8dg2s1/3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1jqdmi";

    #[test]
    fn salting_replaces_secret_with_hmac() {
        let salted = salt_token(UNSALTED, "bbbbb").unwrap().into_token();
        let v2 = parse_v2(&salted).unwrap();
        assert_eq!(v2.uuid, "zzzzz-gj3su-077z32aux8dg2s1");
        assert!(v2.is_salted());
        assert_eq!(
            v2.secret,
            hmac_sha1_hex(
                b"3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1jqdmi",
                b"bbbbb"
            )
        );
    }

    #[test]
    fn token_issued_by_remote_is_sent_unchanged() {
        assert_eq!(
            salt_token(UNSALTED, "zzzzz").unwrap(),
            SaltOutcome::AlreadySalted(UNSALTED.to_string())
        );
    }

    #[test]
    fn salted_secret_cannot_be_salted_again() {
        let salted = salt_token(UNSALTED, "bbbbb").unwrap().into_token();
        assert_eq!(salt_token(&salted, "ccccc"), Err(TokenError::Salted));
    }

    #[test]
    fn forwarding_twice_equals_forwarding_once() {
        let oidc = "ya29.oidc-access-token";
        let remote_issued = "v2/bbbbb-gj3su-077z32aux8dg2s1/3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1jqdmi";
        for token in [UNSALTED, oidc, remote_issued] {
            for remote in ["bbbbb", "ccccc", "zzzzz"] {
                let once = forwarding_token(token, remote).unwrap();
                let twice = forwarding_token(&once, remote).unwrap();
                assert_eq!(twice, once, "{token} for {remote}");
            }
        }
        assert_eq!(
            forwarding_token(UNSALTED, "bbbbb").unwrap(),
            salt_token(UNSALTED, "bbbbb").unwrap().into_token()
        );
        assert_eq!(
            forwarding_token("3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1jqdmi", "bbbbb"),
            Err(TokenError::Obsolete)
        );
    }

    #[test]
    fn bare_tokens_are_obsolete_or_passthrough() {
        let legacy = "3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1jqdmi";
        assert_eq!(salt_token(legacy, "bbbbb"), Err(TokenError::Obsolete));
        assert_eq!(
            salt_token("ya29.oidc-access-token", "bbbbb").unwrap(),
            SaltOutcome::PassThrough("ya29.oidc-access-token".to_string())
        );
    }

    #[test]
    fn malformed_v2_tokens_are_rejected() {
        assert_eq!(salt_token("v2/short/secret", "bbbbb"), Err(TokenError::BadFormat));
        assert_eq!(
            salt_token("v2/zzzzz-gj3su-077z32aux8dg2s1", "bbbbb"),
            Err(TokenError::BadFormat)
        );
    }

    #[test]
    fn scope_tail_is_ignored_when_parsing() {
        let scoped = format!("{UNSALTED}/scope");
        let v2 = parse_v2(&scoped).unwrap();
        assert_eq!(v2.secret, "3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1jqdmi");
    }

    #[test]
    fn log_label_never_reveals_secret() {
        assert_eq!(log_label(UNSALTED), "zzzzz-gj3su-077z32aux8dg2s1");
        assert_eq!(log_label("abcdefghij12345"), "v1 token ending in 12345");
    }
}
