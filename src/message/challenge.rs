//! `WWW-Authenticate` challenges (RFC 7235 §4.1, RFC 7617).

use std::fmt;

use super::token::Scanner;

/// Authentication scheme name for HTTP Basic.
pub const AUTH_SCHEME_BASIC: &str = "basic";

/// An authentication challenge parsed from a `WWW-Authenticate` header field.
///
/// Only the parts the Basic scheme needs are parsed. Other schemes are
/// skipped by the parser.
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge {
    scheme: String,
    params: Vec<AuthParam>,
}

/// A single `name=value` auth parameter of a [`Challenge`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthParam {
    /// Parameter name as sent by the server.
    pub name: String,
    /// Parameter value with quoting removed.
    pub value: String,
}

impl Challenge {
    /// Parses every supported challenge in a field value.
    ///
    /// The search is eager: after each entry the scanner resumes after the
    /// next comma, whatever the entry turned out to be, so an unsupported or
    /// malformed challenge never hides a later Basic one.
    pub fn parse_all(field_value: &str) -> Vec<Challenge> {
        let mut challenges = Vec::new();
        let mut scanner = Scanner::new(field_value);

        while !scanner.is_empty() {
            let Some(scheme) = scanner.token() else {
                break;
            };

            if scheme.eq_ignore_ascii_case(AUTH_SCHEME_BASIC) {
                let challenge = Challenge {
                    scheme: scheme.to_owned(),
                    params: parse_params(scanner.clone()),
                };
                // realm is mandatory for Basic
                if challenge.param("realm").is_some() {
                    challenges.push(challenge);
                } else {
                    log::warn!("dropping Basic challenge without realm");
                }
            }

            if !scanner.skip_past(',') {
                break;
            }
            scanner.skip_sp();
        }

        challenges
    }

    /// The auth-scheme as sent by the server, e.g. `Basic`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// All parsed parameters, in order.
    pub fn params(&self) -> &[AuthParam] {
        &self.params
    }

    /// Case-insensitively looks up a parameter value.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }

    /// The `realm` parameter.
    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Challenge")
            .field("scheme", &self.scheme)
            .field("params", &self.params)
            .finish()
    }
}

// auth-param *( OWS "," OWS auth-param ), stopping at the first entry that does not parse
fn parse_params(mut scanner: Scanner<'_>) -> Vec<AuthParam> {
    let mut params = Vec::new();
    loop {
        scanner.skip_sp();
        let Some(param) = parse_param(&mut scanner) else {
            break;
        };
        params.push(param);
        scanner.skip_sp();
        if !scanner.eat(',') {
            break;
        }
    }
    params
}

// token BWS "=" BWS ( token / quoted-string )
fn parse_param(scanner: &mut Scanner<'_>) -> Option<AuthParam> {
    let name = scanner.token()?;
    scanner.skip_sp_ht();
    if !scanner.eat('=') {
        return None;
    }
    scanner.skip_sp_ht();
    let value = if scanner.peek() == Some('"') {
        scanner.quoted_string()?
    } else {
        scanner.token()?.to_owned()
    };
    Some(AuthParam {
        name: name.to_owned(),
        value,
    })
}
