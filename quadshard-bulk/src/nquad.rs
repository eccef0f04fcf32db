//! One-line N-Quad parsing.
//!
//! A record is three whitespace-separated tokens — subject, predicate,
//! object — with anything after the third kept verbatim as the trailing
//! annotation. Quote state is tracked so spaces inside `"…"` do not
//! terminate the object token.

#[derive(Debug, thiserror::Error)]
pub enum LineError {
    /// Harmless: an empty or whitespace-only line. Skipped without counting.
    #[error("empty line")]
    Empty,
    /// Fewer than three tokens. Counted, and fatal unless errors are
    /// ignored.
    #[error("error while parsing line {0:?}")]
    Malformed(String),
}

pub const BLANK_NODE_PREFIX: &str = "_:";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NQuad {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// Everything after the object token, verbatim (facets, graph label,
    /// the terminating dot).
    pub trailing: String,
}

impl NQuad {
    /// The record reassembled as a normalised line.
    pub fn to_line(&self) -> String {
        if self.trailing.is_empty() {
            format!("{} {} {}", self.subject, self.predicate, self.object)
        } else {
            format!(
                "{} {} {} {}",
                self.subject, self.predicate, self.object, self.trailing
            )
        }
    }
}

/// Split one line into its three tokens plus trailing annotation. Every
/// token, the object included, must be terminated by a separator.
pub fn parse_line(line: &str) -> Result<NQuad, LineError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return Err(LineError::Empty);
    }

    let mut tokens: [&str; 3] = ["", "", ""];
    let mut count = 0usize;
    let mut start = 0usize;
    let mut in_string = false;

    for (i, c) in line.char_indices() {
        if count == 3 {
            break;
        }
        match c {
            ' ' | '\t' if !in_string => {
                // Every separator outside a quoted string terminates a
                // token, so a run of separators yields empty tokens.
                tokens[count] = &line[start..i];
                count += 1;
                start = i + 1;
            }
            '"' => in_string = !in_string,
            _ => {}
        }
    }
    if count < 3 {
        return Err(LineError::Malformed(line.to_string()));
    }

    Ok(NQuad {
        subject: tokens[0].to_string(),
        predicate: tokens[1].to_string(),
        object: tokens[2].to_string(),
        trailing: line[start..].to_string(),
    })
}

/// Render a uid as its token form, `<0x{hex}>`.
pub fn uid_token(uid: u64) -> String {
    format!("<{uid:#x}>")
}

/// Parse a `<0x{hex}>` token back to a uid.
pub fn parse_uid_token(token: &str) -> Option<u64> {
    let inner = token.strip_prefix('<')?.strip_suffix('>')?;
    let hex = inner.strip_prefix("0x").or_else(|| inner.strip_prefix("0X"))?;
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_triple() {
        let nq = parse_line("<0x1> <name> \"alice\" .\n").unwrap();
        assert_eq!(nq.subject, "<0x1>");
        assert_eq!(nq.predicate, "<name>");
        assert_eq!(nq.object, "\"alice\"");
        assert_eq!(nq.trailing, ".");
    }

    #[test]
    fn test_parse_quoted_spaces() {
        let nq = parse_line("<0x1> <name> \"alice  in wonderland\" .").unwrap();
        assert_eq!(nq.object, "\"alice  in wonderland\"");
        assert_eq!(nq.trailing, ".");
    }

    #[test]
    fn test_parse_trailing_kept_verbatim() {
        let nq = parse_line("_:a <p> _:b <graph-label> .").unwrap();
        assert_eq!(nq.trailing, "<graph-label> .");
        assert_eq!(nq.to_line(), "_:a <p> _:b <graph-label> .");
    }

    #[test]
    fn test_parse_tab_separator() {
        let nq = parse_line("<0x1>\t<p> <0x2> .").unwrap();
        assert_eq!(nq.subject, "<0x1>");
        assert_eq!(nq.predicate, "<p>");
        assert_eq!(nq.object, "<0x2>");
    }

    #[test]
    fn test_run_of_separators_yields_empty_token() {
        // Two consecutive separators terminate an empty token and shift the
        // real object into the trailing annotation.
        let nq = parse_line("<0x1> <p>  <0x2> .").unwrap();
        assert_eq!(nq.predicate, "<p>");
        assert_eq!(nq.object, "");
        assert_eq!(nq.trailing, "<0x2> .");
    }

    #[test]
    fn test_unterminated_third_token_is_malformed() {
        assert!(matches!(
            parse_line("_:a <p> _:b"),
            Err(LineError::Malformed(_))
        ));
        let nq = parse_line("_:a <p> _:b ").unwrap();
        assert_eq!(nq.object, "_:b");
        assert_eq!(nq.trailing, "");
    }

    #[test]
    fn test_empty_and_malformed() {
        assert!(matches!(parse_line(""), Err(LineError::Empty)));
        assert!(matches!(parse_line("   \n"), Err(LineError::Empty)));
        assert!(matches!(
            parse_line("<0x1> <name>"),
            Err(LineError::Malformed(_))
        ));
    }

    #[test]
    fn test_uid_token_round_trip() {
        assert_eq!(uid_token(0x1f), "<0x1f>");
        assert_eq!(parse_uid_token("<0x1f>"), Some(0x1f));
        assert_eq!(parse_uid_token("<0x1>"), Some(1));
        assert_eq!(parse_uid_token("_:b"), None);
        assert_eq!(parse_uid_token("<name>"), None);
    }
}
