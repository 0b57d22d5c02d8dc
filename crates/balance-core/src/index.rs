use common::manifest::SizedDigest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub digest: SizedDigest,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("truncated index response (missing terminating blank line)")]
    Truncated,
    #[error("malformed index line {line}: {text:?}")]
    Malformed { line: usize, text: String },
    #[error("Index response included block {block} despite asking for prefix {prefix:?}")]
    OutsidePrefix { block: String, prefix: String },
}

pub fn parse_index(body: &str, prefix: &str) -> Result<Vec<IndexEntry>, IndexError> {
    let Some(content) = body.strip_suffix('\n') else {
        return Err(IndexError::Truncated);
    };
    if !content.is_empty() && !content.ends_with('\n') {
        return Err(IndexError::Truncated);
    }

    let mut entries = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let malformed = || IndexError::Malformed {
            line: idx + 1,
            text: line.to_string(),
        };
        let mut fields = line.split_whitespace();
        let (Some(locator), Some(mtime), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(malformed());
        };
        let digest = SizedDigest::from_locator(locator).ok_or_else(malformed)?;
        let mtime = mtime.parse::<i64>().map_err(|_| malformed())?;
        if !digest.hash().starts_with(prefix) {
            return Err(IndexError::OutsidePrefix {
                block: digest.to_string(),
                prefix: prefix.to_string(),
            });
        }
        entries.push(IndexEntry { digest, mtime });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOO: &str = "acbd18db4cc2f85cedef654fccc4a4d8+3";
    const BAR: &str = "37b51d194a7513e45b56f6524f2d51f2+3";

    #[test]
    fn parses_entries_until_blank_line() {
        let body = format!("{FOO} 12345678\n{BAR}+Zhint 12345679\n\n");
        let entries = parse_index(&body, "").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].digest.as_str(), FOO);
        assert_eq!(entries[1].digest.as_str(), BAR);
        assert_eq!(entries[1].mtime, 12345679);
    }

    #[test]
    fn empty_index_is_a_single_newline() {
        assert!(parse_index("\n", "").unwrap().is_empty());
    }

    #[test]
    fn missing_terminator_is_truncation() {
        assert_eq!(parse_index("", ""), Err(IndexError::Truncated));
        assert_eq!(
            parse_index(&format!("{FOO} 12345678\n"), ""),
            Err(IndexError::Truncated)
        );
    }

    #[test]
    fn garbage_lines_are_rejected() {
        let err = parse_index(&format!("{FOO}\n\n"), "").unwrap_err();
        assert!(matches!(err, IndexError::Malformed { line: 1, .. }));
        let err = parse_index(&format!("{FOO} soon\n\n"), "").unwrap_err();
        assert!(matches!(err, IndexError::Malformed { line: 1, .. }));
    }

    #[test]
    fn blocks_outside_prefix_are_an_error() {
        let err = parse_index(&format!("{FOO} 12345678\n\n"), "abc").unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Index response included block {FOO} despite asking for prefix \"abc\"")
        );
        assert!(parse_index(&format!("{FOO} 12345678\n\n"), "acb").is_ok());
    }
}
