/// Case-sensitive wildcard match: `*` is any run of characters (including
/// none), `?` exactly one, everything else literal.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` and the text index it is currently absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        match p.get(pi) {
            Some('*') => {
                star = Some((pi, ti));
                pi += 1;
            }
            Some(&c) if c == '?' || c == t[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    pi = sp + 1;
                    ti = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::glob_match;

    #[test]
    fn literals_and_wildcards() {
        assert!(glob_match("read:doc", "read:doc"));
        assert!(!glob_match("read:doc", "read:docs"));
        assert!(glob_match("read:*", "read:doc"));
        assert!(glob_match("read:*", "read:"));
        assert!(glob_match("*", ""));
        assert!(glob_match("doc/*", "doc/42/page/1"));
        assert!(glob_match("d?c/*", "doc/42"));
        assert!(!glob_match("d?c/*", "dc/42"));
    }

    #[test]
    fn backtracks_over_stars() {
        assert!(glob_match("*a*b", "xxaxxab"));
        assert!(glob_match("a*b*c", "abbbc"));
        assert!(!glob_match("a*b*c", "abbb"));
        assert!(glob_match("https://*.example.com", "https://app.eu.example.com"));
        assert!(!glob_match("https://*.example.com", "https://example.com"));
    }

    #[test]
    fn is_case_sensitive() {
        assert!(!glob_match("Read:*", "read:doc"));
    }
}
