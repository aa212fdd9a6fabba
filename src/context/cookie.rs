use std::fmt;

/// A request cookie, or a `Set-Cookie` value when the attributes are set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Seconds; negative expires the cookie immediately.
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), ..Self::default() }
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={domain}")?;
        }
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={}", max_age.max(0))?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if let Some(same_site) = &self.same_site {
            write!(f, "; SameSite={same_site}")?;
        }
        Ok(())
    }
}

/// Parses a `Cookie` request header (`a=1; b=2`). Pairs without `=` are
/// skipped; surrounding quotes are removed from values.
pub(crate) fn parse_cookie_header(header: &str) -> Vec<Cookie> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"');
            Some(Cookie::new(name, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_header() {
        let cookies = parse_cookie_header(r#"sid=abc; theme="dark"; junk; =x"#);
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[1], Cookie::new("theme", "dark"));
    }

    #[test]
    fn set_cookie_attributes() {
        let mut c = Cookie::new("sid", "abc");
        c.path = Some("/".into());
        c.max_age = Some(-1);
        c.http_only = true;
        assert_eq!(c.to_string(), "sid=abc; Path=/; Max-Age=0; HttpOnly");
    }
}
