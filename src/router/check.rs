//! Segment checks for validated parameters and wildcards.
//!
//! A check text resolves in three steps:
//!
//! 1. a registered predicate by exact name (`num`, `nozero`, …);
//! 2. `name:arg` where `name` is a registered constructor (`min:100`);
//! 3. otherwise the text is compiled as a regular expression anchored `^…$`.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::error::Error;

pub type CheckFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type CheckBuilder = Arc<dyn Fn(&str) -> Option<CheckFn> + Send + Sync>;

/// A resolved check plus the text it came from (for diagnostics).
#[derive(Clone)]
pub(crate) struct Check {
    pub text: String,
    pub func: CheckFn,
}

impl Check {
    pub fn test(&self, value: &str) -> bool {
        (self.func)(value)
    }
}

impl std::fmt::Debug for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Check").field(&self.text).finish()
    }
}

/// Named predicates and constructors available to route patterns.
#[derive(Clone)]
pub struct CheckRegistry {
    funcs: HashMap<String, CheckFn>,
    builders: HashMap<String, CheckBuilder>,
}

impl CheckRegistry {
    /// A registry with the built-in checks.
    pub fn new() -> Self {
        let mut reg = Self { funcs: HashMap::new(), builders: HashMap::new() };
        reg.register("num", |s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()));
        reg.register("isnum", |s| s.parse::<f64>().is_ok());
        reg.register("nozero", |s| !s.is_empty() && s != "0");
        reg.register("isbool", |s| s.parse::<bool>().is_ok());
        reg.register("alpha", |s| !s.is_empty() && s.chars().all(char::is_alphabetic));
        reg.register("alphanum", |s| !s.is_empty() && s.chars().all(char::is_alphanumeric));
        reg.register("uuid", |s| uuid::Uuid::parse_str(s).is_ok());

        reg.register_builder("min", |arg| {
            let min = arg.parse::<f64>().ok()?;
            Some(Arc::new(move |s: &str| s.parse::<f64>().is_ok_and(|v| v >= min)) as CheckFn)
        });
        reg.register_builder("max", |arg| {
            let max = arg.parse::<f64>().ok()?;
            Some(Arc::new(move |s: &str| s.parse::<f64>().is_ok_and(|v| v <= max)) as CheckFn)
        });
        reg.register_builder("len", |arg| {
            let len = arg.parse::<usize>().ok()?;
            Some(Arc::new(move |s: &str| s.chars().count() == len) as CheckFn)
        });
        reg.register_builder("prefix", |arg| {
            let prefix = arg.to_owned();
            Some(Arc::new(move |s: &str| s.starts_with(&prefix)) as CheckFn)
        });
        reg.register_builder("suffix", |arg| {
            let suffix = arg.to_owned();
            Some(Arc::new(move |s: &str| s.ends_with(&suffix)) as CheckFn)
        });
        reg.register_builder("regexp", |arg| compile_anchored(arg).ok());
        reg
    }

    /// Registers (or replaces) a predicate usable as `:name|<name>`.
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.funcs.insert(name.to_owned(), Arc::new(f));
    }

    /// Registers a constructor usable as `:name|<name>:<arg>`.
    pub fn register_builder<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&str) -> Option<CheckFn> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_owned(), Arc::new(f));
    }

    pub(crate) fn resolve(&self, text: &str) -> Result<Check, Error> {
        if let Some(f) = self.funcs.get(text) {
            return Ok(Check { text: text.to_owned(), func: Arc::clone(f) });
        }
        if let Some((name, arg)) = text.split_once(':') {
            if let Some(builder) = self.builders.get(name) {
                return builder(arg)
                    .map(|func| Check { text: text.to_owned(), func })
                    .ok_or_else(|| {
                        Error::RouteRegistration(format!("check `{name}` rejected argument `{arg}`"))
                    });
            }
        }
        compile_anchored(text).map(|func| Check { text: text.to_owned(), func })
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_anchored(pattern: &str) -> Result<CheckFn, Error> {
    let body = pattern.strip_prefix('^').unwrap_or(pattern);
    let body = body.strip_suffix('$').filter(|b| !b.ends_with('\\')).unwrap_or(body);
    let anchored = format!("^(?:{body})$");
    let re = Regex::new(&anchored)
        .map_err(|e| Error::RouteRegistration(format!("invalid check regex `{pattern}`: {e}")))?;
    Ok(Arc::new(move |s: &str| re.is_match(s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(text: &str, value: &str) -> bool {
        CheckRegistry::new().resolve(text).unwrap().test(value)
    }

    #[test]
    fn named_predicates() {
        assert!(check("num", "42"));
        assert!(!check("num", "4a"));
        assert!(!check("num", ""));
        assert!(check("nozero", "7"));
        assert!(!check("nozero", "0"));
        assert!(check("uuid", "67e55044-10b1-426f-9247-bb680e5fe0c8"));
    }

    #[test]
    fn dynamic_constructors() {
        assert!(check("min:100", "150"));
        assert!(!check("min:100", "99"));
        assert!(check("max:10", "10"));
        assert!(check("len:3", "abc"));
        assert!(!check("len:3", "abcd"));
        assert!(check("prefix:v", "v1"));
    }

    #[test]
    fn regex_is_anchored() {
        assert!(check("[a-z]+", "abc"));
        assert!(!check("[a-z]+", "abc1"));
        assert!(check("^[0-9]{3}$", "123"));
        assert!(check("regexp:[0-9]+", "12"));
    }

    #[test]
    fn alternation_is_anchored_as_a_whole() {
        assert!(check("a|b", "a"));
        assert!(check("a|b", "b"));
        assert!(!check("a|b", "ax"));
        assert!(!check("a|b", "xb"));
        assert!(!check("^v1|v2$", "v1x"));
    }

    #[test]
    fn bad_arguments_fail_resolution() {
        let reg = CheckRegistry::new();
        assert!(reg.resolve("min:abc").is_err());
        assert!(reg.resolve("(unclosed").is_err());
    }
}
