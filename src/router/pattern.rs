//! Route pattern splitting.
//!
//! ```text
//! route      := '/' segment ('/' segment)*
//! segment    := const | ':' name check? | '*' name? check?
//! check      := '|' atom | '|' '{' anything-balanced '}'
//! ```
//!
//! Constant text is accumulated across `/` so `/api/v1/:id` yields the two
//! pieces `"/api/v1/"` and `:id`. A `{…}` block is one unit: a `/` inside it
//! never splits.

use crate::params::split_unbraced;

/// Name given to a wildcard segment written as a bare `*`.
pub(crate) const WILDCARD_DEFAULT_NAME: &str = "*";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Segment {
    Const(String),
    Param { raw: String, name: String, check: Option<String> },
    Wildcard { raw: String, name: String, check: Option<String> },
}

/// Empty becomes `/`; a missing leading `/` is added.
pub(crate) fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_owned()
    } else if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

/// Splits a normalised route (no default params) into insertion segments.
///
/// # Panics
///
/// Panics when a wildcard is not the last segment or a parameter has no name:
/// both are programming errors in a route table.
pub(crate) fn split_pattern(route: &str) -> Vec<Segment> {
    let route = normalize_path(route);
    let raws = split_unbraced(&route, '/');
    let last = raws.len() - 1;

    let mut out = Vec::new();
    let mut buf = String::from("/");

    for (i, raw) in raws.iter().enumerate().skip(1) {
        match raw.as_bytes().first() {
            Some(b':') => {
                if !buf.is_empty() {
                    out.push(Segment::Const(std::mem::take(&mut buf)));
                }
                let (name, check) = split_check(&raw[1..]);
                if name.is_empty() {
                    panic!("invalid route `{route}`: parameter segment `{raw}` has no name");
                }
                out.push(Segment::Param { raw: (*raw).to_owned(), name, check });
            }
            Some(b'*') => {
                if i != last {
                    panic!("invalid route `{route}`: wildcard `{raw}` must be the last segment");
                }
                if !buf.is_empty() {
                    out.push(Segment::Const(std::mem::take(&mut buf)));
                }
                let (name, check) = split_check(&raw[1..]);
                let name = if name.is_empty() { WILDCARD_DEFAULT_NAME.to_owned() } else { name };
                out.push(Segment::Wildcard { raw: (*raw).to_owned(), name, check });
                return out;
            }
            _ => buf.push_str(strip_braces(raw)),
        }
        if i != last {
            buf.push('/');
        }
    }
    if !buf.is_empty() {
        out.push(Segment::Const(buf));
    }
    out
}

fn split_check(s: &str) -> (String, Option<String>) {
    match s.split_once('|') {
        Some((name, check)) => (name.to_owned(), Some(strip_braces(check).to_owned())),
        None => (s.to_owned(), None),
    }
}

fn strip_braces(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('{') && s.ends_with('}') { &s[1..s.len() - 1] } else { s }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> Segment {
        Segment::Const(s.to_owned())
    }

    #[test]
    fn constants_accumulate() {
        assert_eq!(split_pattern("/api/v1/users"), vec![c("/api/v1/users")]);
        assert_eq!(split_pattern(""), vec![c("/")]);
        assert_eq!(split_pattern("x/"), vec![c("/x/")]);
    }

    #[test]
    fn params_and_wildcards() {
        let segs = split_pattern("/u/:id|num/files/*path");
        assert_eq!(segs[0], c("/u/"));
        assert_eq!(
            segs[1],
            Segment::Param { raw: ":id|num".into(), name: "id".into(), check: Some("num".into()) }
        );
        assert_eq!(segs[2], c("/files/"));
        assert_eq!(
            segs[3],
            Segment::Wildcard { raw: "*path".into(), name: "path".into(), check: None }
        );
    }

    #[test]
    fn braces_keep_slashes() {
        let segs = split_pattern("/d/:v|{^[a-z/]+$}/x");
        assert_eq!(
            segs[1],
            Segment::Param {
                raw: ":v|{^[a-z/]+$}".into(),
                name: "v".into(),
                check: Some("^[a-z/]+$".into()),
            }
        );
        assert_eq!(segs[2], c("/x"));
    }

    #[test]
    fn bare_wildcard_gets_default_name() {
        let segs = split_pattern("/*");
        assert_eq!(segs[1], Segment::Wildcard { raw: "*".into(), name: "*".into(), check: None });
    }

    #[test]
    #[should_panic(expected = "must be the last segment")]
    fn wildcard_must_be_terminal() {
        split_pattern("/*p/x");
    }
}
