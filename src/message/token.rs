//! Character classes and a small cursor for header grammar.
//!
//! See RFC 2616 §2.2 for separators and RFC 7230 §3.2.6 for `quoted-string`.

const SP: char = ' ';
const HT: char = '\t';
const DQUOTE: char = '"';
const BACKSLASH: char = '\\';

/// `( ) < > @ , ; : \ " / [ ] ? = { } SP HT`
#[inline]
pub(crate) fn is_separator(c: char) -> bool {
    matches!(
        c,
        '(' | ')'
            | '<'
            | '>'
            | '@'
            | ','
            | ';'
            | ':'
            | '\\'
            | '"'
            | '/'
            | '['
            | ']'
            | '?'
            | '='
            | '{'
            | '}'
            | SP
            | HT
    )
}

/// Printable US-ASCII that is not a separator.
#[inline]
pub(crate) fn is_token_char(c: char) -> bool {
    (' '..='~').contains(&c) && !is_separator(c)
}

/// True for a non-empty run of token characters.
#[inline]
pub(crate) fn is_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_token_char)
}

#[inline]
pub(crate) fn is_sp_ht(c: char) -> bool {
    c == SP || c == HT
}

/// `HTAB / SP / %x21 / %x23-5B / %x5D-7E / obs-text`
#[inline]
fn is_qdtext(c: char) -> bool {
    let v = c as u32;
    c == HT || c == SP || v == 0x21 || (0x23..=0x5B).contains(&v) || (0x5D..=0x7E).contains(&v) || (0x80..=0xFF).contains(&v)
}

/// Second octet of a `quoted-pair`: `HTAB / SP / VCHAR / obs-text`.
#[inline]
fn is_quoted_pair_escapee(c: char) -> bool {
    let v = c as u32;
    c == HT || c == SP || (0x21..=0x7E).contains(&v) || (0x80..=0xFF).contains(&v)
}

/// Strips leading and trailing SP / HT.
#[inline]
pub(crate) fn trim_ows(s: &str) -> &str {
    s.trim_matches(is_sp_ht)
}

/// A forward-only cursor over a header value.
#[derive(Debug, Clone)]
pub(crate) struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(input: &'a str) -> Scanner<'a> {
        Scanner { rest: input }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    #[inline]
    pub(crate) fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    #[inline]
    pub(crate) fn rest(&self) -> &'a str {
        self.rest
    }

    /// Consumes `c` if it is next.
    pub(crate) fn eat(&mut self, c: char) -> bool {
        match self.rest.strip_prefix(c) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    pub(crate) fn skip_sp(&mut self) {
        self.rest = self.rest.trim_start_matches(SP);
    }

    pub(crate) fn skip_sp_ht(&mut self) {
        self.rest = self.rest.trim_start_matches(is_sp_ht);
    }

    /// Consumes the longest token prefix, if there is one.
    pub(crate) fn token(&mut self) -> Option<&'a str> {
        let end = self
            .rest
            .find(|c: char| !is_token_char(c))
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let (token, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(token)
    }

    /// Consumes a `quoted-string` and returns its unescaped content.
    ///
    /// The cursor does not move when the input is not a well-formed quoted string.
    pub(crate) fn quoted_string(&mut self) -> Option<String> {
        let mut chars = self.rest.char_indices();
        if chars.next().map(|(_, c)| c) != Some(DQUOTE) {
            return None;
        }

        let mut value = String::new();
        let mut escaped = false;
        for (idx, c) in chars {
            if escaped {
                if !is_quoted_pair_escapee(c) {
                    return None;
                }
                value.push(c);
                escaped = false;
            } else if c == BACKSLASH {
                escaped = true;
            } else if c == DQUOTE {
                self.rest = &self.rest[idx + c.len_utf8()..];
                return Some(value);
            } else if is_qdtext(c) {
                value.push(c);
            } else {
                return None;
            }
        }
        None
    }

    /// Moves past the next `c`. Returns false, leaving the cursor at the end,
    /// when there is none.
    pub(crate) fn skip_past(&mut self, c: char) -> bool {
        match self.rest.find(c) {
            Some(idx) => {
                self.rest = &self.rest[idx + c.len_utf8()..];
                true
            }
            None => {
                self.rest = "";
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_are_not_tokens() {
        for c in "()<>@,;:\\\"/[]?={} \t".chars() {
            assert!(!is_token_char(c), "{c:?}");
        }
        assert!(is_token("X-Custom-Header"));
        assert!(is_token("!#$%&'*+-.^_`|~"));
        assert!(!is_token(""));
        assert!(!is_token("Bad Name"));
        assert!(!is_token("caf\u{e9}"));
    }

    #[test]
    fn scanner_reads_token_prefix() {
        let mut s = Scanner::new("Basic realm=\"x\"");
        assert_eq!(s.token(), Some("Basic"));
        assert_eq!(s.peek(), Some(' '));
        s.skip_sp();
        assert_eq!(s.token(), Some("realm"));
        assert!(s.eat('='));
        assert_eq!(s.quoted_string().as_deref(), Some("x"));
        assert!(s.is_empty());
    }

    #[test]
    fn quoted_string_unescapes_pairs() {
        let mut s = Scanner::new(r#""a \"b\" \\c", rest"#);
        assert_eq!(s.quoted_string().as_deref(), Some(r#"a "b" \c"#));
        assert_eq!(s.rest(), ", rest");
    }

    #[test]
    fn quoted_string_rejects_control_chars() {
        let mut s = Scanner::new("\"a\u{1}b\"");
        assert_eq!(s.quoted_string(), None);
        assert_eq!(s.rest(), "\"a\u{1}b\"");

        let mut unterminated = Scanner::new("\"abc");
        assert_eq!(unterminated.quoted_string(), None);
    }

    #[test]
    fn skip_past_moves_to_end_without_match() {
        let mut s = Scanner::new("a, b");
        assert!(s.skip_past(','));
        assert_eq!(s.rest(), " b");
        assert!(!s.skip_past(','));
        assert!(s.is_empty());
    }

    #[test]
    fn trims_ows_both_sides() {
        assert_eq!(trim_ows(" \tvalue \t"), "value");
    }
}
