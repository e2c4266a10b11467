use http::header::{Entry, HeaderMap, HeaderValue, OccupiedEntry};

pub(crate) fn basic_auth<U, P>(username: U, password: Option<P>) -> HeaderValue
where
    U: std::fmt::Display,
    P: std::fmt::Display,
{
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        let _ = write!(encoder, "{}:", username);
        if let Some(password) = password {
            let _ = write!(encoder, "{}", password);
        }
    }
    let mut header = HeaderValue::from_bytes(&buf).expect("base64 is always valid HeaderValue");
    header.set_sensitive(true);
    header
}

/// Overlays `src` on `dst`: every name present in `src` replaces all values
/// of that name in `dst`.
pub(crate) fn replace_headers(dst: &mut HeaderMap, src: HeaderMap) {
    // IntoIter of HeaderMap yields (Option<HeaderName>, HeaderValue).
    // The first time a name is yielded, it will be Some(name), and if
    // there are more values with the same name, the next yield will be
    // None.

    let mut prev_entry: Option<OccupiedEntry<_>> = None;
    for (key, value) in src {
        match key {
            Some(key) => match dst.entry(key) {
                Entry::Occupied(mut e) => {
                    e.insert(value);
                    prev_entry = Some(e);
                }
                Entry::Vacant(e) => {
                    let e = e.insert_entry(value);
                    prev_entry = Some(e);
                }
            },
            None => {
                if let Some(ref mut entry) = prev_entry {
                    entry.append(value);
                }
            }
        }
    }
}

/// Renders a header map as raw `Name: value` lines for the engine.
///
/// An empty value is sent in the `Name;` form, which the engine transmits as
/// an explicitly empty field instead of suppressing the header.
pub(crate) fn header_lines(headers: &HeaderMap) -> Vec<String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = String::from_utf8_lossy(value.as_bytes());
            if value.is_empty() {
                format!("{};", name.as_str())
            } else {
                format!("{}: {}", name.as_str(), value)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_is_sensitive() {
        let value = basic_auth("Aladdin", Some("open sesame"));
        assert_eq!(value, "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert!(value.is_sensitive());

        let no_password = basic_auth("user", None::<&str>);
        assert_eq!(no_password, "Basic dXNlcjo=");
    }

    #[test]
    fn replace_headers_overrides_by_name() {
        let mut dst = HeaderMap::new();
        dst.insert("accept", HeaderValue::from_static("*/*"));
        dst.append("x-multi", HeaderValue::from_static("a"));
        dst.append("x-multi", HeaderValue::from_static("b"));

        let mut src = HeaderMap::new();
        src.insert("Accept", HeaderValue::from_static("text/html"));
        src.append("x-multi", HeaderValue::from_static("c"));
        src.append("x-multi", HeaderValue::from_static("d"));
        replace_headers(&mut dst, src);

        assert_eq!(dst["accept"], "text/html");
        let multi: Vec<_> = dst.get_all("x-multi").iter().collect();
        assert_eq!(multi, vec!["c", "d"]);
    }

    #[test]
    fn empty_values_use_semicolon_form() {
        let mut headers = HeaderMap::new();
        headers.insert("x-empty", HeaderValue::from_static(""));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        let mut lines = header_lines(&headers);
        lines.sort();
        assert_eq!(lines, vec!["accept: */*", "x-empty;"]);
    }
}
