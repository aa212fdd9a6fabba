//! Value validation for bound request data.
//!
//! Rules are attached per Rust type as `field → "rule,rule"` lists, the
//! analogue of struct tags:
//!
//! ```rust
//! use keel::Validator;
//! # #[derive(serde::Serialize)] struct SignUp { email: String, age: u32 }
//!
//! let mut v = Validator::new();
//! v.field_rules::<SignUp>("email", "nonzero,email").unwrap();
//! v.field_rules::<SignUp>("age", "min:18,max:130").unwrap();
//!
//! assert!(v.validate(&SignUp { email: "a@b.io".into(), age: 30 }).is_ok());
//! assert!(v.validate(&SignUp { email: "a@b.io".into(), age: 3 }).is_err());
//! ```
//!
//! Rules are evaluated over the value's `serde_json` form. Types may also
//! implement [`Validate`] and be registered with [`Validator::register_type`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::params::split_unbraced;

/// Self-validation for bound types.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

pub type RuleFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type RuleBuilder = Arc<dyn Fn(&str) -> Option<RuleFn> + Send + Sync>;
type TypeCheck = Arc<dyn Fn(&dyn Any) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct Validator {
    rules: HashMap<String, RuleFn>,
    builders: HashMap<String, RuleBuilder>,
    types: HashMap<TypeId, Vec<TypeCheck>>,
}

impl Validator {
    /// A validator with the built-in rules `nonzero`, `email`, `min:N`,
    /// `max:N`, `len:N` and `regexp:R`.
    pub fn new() -> Self {
        let mut v = Self { rules: HashMap::new(), builders: HashMap::new(), types: HashMap::new() };
        v.register_rule("nonzero", |value| !is_zero(value));
        if let Ok(email) = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$") {
            v.register_rule("email", move |value| value.as_str().is_some_and(|s| email.is_match(s)));
        }
        v.register_builder("min", |arg| {
            let min = arg.parse::<f64>().ok()?;
            Some(Arc::new(move |value: &Value| measure(value).is_some_and(|n| n >= min)) as RuleFn)
        });
        v.register_builder("max", |arg| {
            let max = arg.parse::<f64>().ok()?;
            Some(Arc::new(move |value: &Value| measure(value).is_some_and(|n| n <= max)) as RuleFn)
        });
        v.register_builder("len", |arg| {
            let len = arg.parse::<usize>().ok()?;
            Some(Arc::new(move |value: &Value| length(value) == Some(len)) as RuleFn)
        });
        v.register_builder("regexp", |arg| {
            let re = Regex::new(arg).ok()?;
            Some(Arc::new(move |value: &Value| value.as_str().is_some_and(|s| re.is_match(s))) as RuleFn)
        });
        v
    }

    pub fn register_rule<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.rules.insert(name.to_owned(), Arc::new(f));
    }

    pub fn register_builder<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&str) -> Option<RuleFn> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_owned(), Arc::new(f));
    }

    fn resolve(&self, rule: &str) -> Result<RuleFn> {
        if let Some(f) = self.rules.get(rule) {
            return Ok(Arc::clone(f));
        }
        let (name, arg) = rule.split_once(':').unwrap_or((rule, ""));
        let arg = arg.strip_prefix('{').and_then(|a| a.strip_suffix('}')).unwrap_or(arg);
        self.builders
            .get(name)
            .and_then(|b| b(arg))
            .ok_or_else(|| Error::Config(format!("unknown or invalid validation rule `{rule}`")))
    }

    /// Binds comma-separated `rules` to `field` of `T`. Rules are resolved
    /// now, so a typo fails here rather than on the first request.
    pub fn field_rules<T: Serialize + 'static>(&mut self, field: &str, rules: &str) -> Result<()> {
        let resolved = split_unbraced(rules, ',')
            .into_iter()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| self.resolve(r).map(|f| (r.to_owned(), f)))
            .collect::<Result<Vec<_>>>()?;
        let field = field.to_owned();
        let check: TypeCheck = Arc::new(move |value: &dyn Any| {
            let Some(value) = value.downcast_ref::<T>() else {
                return Ok(());
            };
            let json = serde_json::to_value(value).map_err(|e| Error::Validation(e.to_string()))?;
            let target = json.get(&field).unwrap_or(&Value::Null);
            for (text, rule) in &resolved {
                if !rule(target) {
                    return Err(Error::Validation(format!("field `{field}` failed rule `{text}`")));
                }
            }
            Ok(())
        });
        self.types.entry(TypeId::of::<T>()).or_default().push(check);
        Ok(())
    }

    /// Runs `T::validate` whenever a `T` is validated.
    pub fn register_type<T: Validate + 'static>(&mut self) {
        let check: TypeCheck = Arc::new(|value: &dyn Any| match value.downcast_ref::<T>() {
            Some(v) => v.validate(),
            None => Ok(()),
        });
        self.types.entry(TypeId::of::<T>()).or_default().push(check);
    }

    /// Runs every check bound to `T`. Types without checks pass.
    pub fn validate<T: Any>(&self, value: &T) -> Result<()> {
        match self.types.get(&TypeId::of::<T>()) {
            Some(checks) => checks.iter().try_for_each(|check| check(value)),
            None => Ok(()),
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Numbers compare by value, everything else by length.
fn measure(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        other => length(other).map(|l| l as f64),
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        _ => None,
    }
}
