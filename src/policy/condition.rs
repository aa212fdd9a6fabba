//! Statement conditions.
//!
//! A condition is built once, when its policy is stored, from the raw JSON
//! argument under its name, and evaluated against every request:
//!
//! ```json
//! "conditions": {
//!     "method":   ["GET", "HEAD"],
//!     "sourceip": ["10.0.0.0/8", "192.168.1.7"],
//!     "date":     {"after": "2024-01-01", "before": "2030-01-01"},
//!     "time":     {"after": "08:00", "before": "18:00"},
//!     "params":   {"tenant": ["acme", "globex"]},
//!     "or":       {"method": ["POST"], "sourceip": ["127.0.0.1"]}
//! }
//! ```
//!
//! Entries of a map are all required; `or` needs any one of its entries (or
//! any one of a list of maps). The process-wide registry returned by
//! [`ConditionRegistry::global`] is copied into each
//! [`PolicyStore`](super::PolicyStore) when it is created, so a store may add
//! its own conditions without affecting others.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::Error;
use crate::middleware::Cidr;

/// A compiled condition.
pub type ConditionFn = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Builds a condition from its raw argument. Nested maps go back through the
/// registry passed in.
pub type ConditionBuilder = Arc<dyn Fn(&Value, &ConditionRegistry) -> Result<ConditionFn, Error> + Send + Sync>;

/// Result of compiling a conditions map.
pub(crate) enum Compiled {
    Ready(ConditionFn),
    /// Names a condition nobody registered; the statement never matches.
    Unknown(String),
}

#[derive(Clone)]
pub struct ConditionRegistry {
    builders: HashMap<String, ConditionBuilder>,
}

static GLOBAL: LazyLock<RwLock<ConditionRegistry>> = LazyLock::new(|| RwLock::new(ConditionRegistry::builtin()));

impl ConditionRegistry {
    /// An empty registry. See [`builtin`](Self::builtin) for the defaults.
    pub fn new() -> Self {
        Self { builders: HashMap::new() }
    }

    /// `method`, `sourceip`, `date`, `time`, `params`, `and` and `or`.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        r.register("method", build_method);
        r.register("sourceip", build_sourceip);
        r.register("date", build_date);
        r.register("time", build_time);
        r.register("params", build_params);
        r.register("and", build_and);
        r.register("or", build_or);
        r
    }

    /// A copy of the process-wide registry.
    pub fn global() -> Self {
        GLOBAL.read().clone()
    }

    /// Adds to the process-wide registry; later stores will see it.
    pub fn register_global<F>(name: &str, builder: F)
    where
        F: Fn(&Value, &ConditionRegistry) -> Result<ConditionFn, Error> + Send + Sync + 'static,
    {
        GLOBAL.write().register(name, builder);
    }

    /// Re-registering a name replaces it.
    pub fn register<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&Value, &ConditionRegistry) -> Result<ConditionFn, Error> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_owned(), Arc::new(builder));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Compiles a map whose entries must all hold. An empty map always holds.
    pub(crate) fn compile(&self, map: &Map<String, Value>) -> Result<Compiled, Error> {
        if let Some(name) = self.first_unknown(map) {
            return Ok(Compiled::Unknown(name));
        }
        let mut all = Vec::with_capacity(map.len());
        for (name, arg) in map {
            all.push(self.build(name, arg)?);
        }
        Ok(Compiled::Ready(Arc::new(move |ctx: &Context| all.iter().all(|c| c(ctx)))))
    }

    fn build(&self, name: &str, arg: &Value) -> Result<ConditionFn, Error> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| Error::Policy(format!("unknown condition `{name}`")))?;
        builder(arg, self).map_err(|e| match e {
            Error::Policy(msg) => Error::Policy(format!("condition `{name}`: {msg}")),
            other => other,
        })
    }

    /// First unregistered name in `map`, searching `and`/`or` nests too.
    fn first_unknown(&self, map: &Map<String, Value>) -> Option<String> {
        for (name, arg) in map {
            if !self.contains(name) {
                return Some(name.clone());
            }
            if name == "and" || name == "or" {
                let nested = match arg {
                    Value::Object(m) => self.first_unknown(m),
                    Value::Array(items) => {
                        items.iter().filter_map(Value::as_object).find_map(|m| self.first_unknown(m))
                    }
                    _ => None,
                };
                if nested.is_some() {
                    return nested;
                }
            }
        }
        None
    }
}

impl Default for ConditionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Policy(msg.into())
}

fn string_list(arg: &Value) -> Result<Vec<String>, Error> {
    let items = match arg {
        Value::Array(items) => items.as_slice(),
        Value::String(_) => std::slice::from_ref(arg),
        _ => return Err(invalid("expected a list of strings")),
    };
    items
        .iter()
        .map(|v| match v {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(invalid("expected a list of strings")),
        })
        .collect()
}

fn build_method(arg: &Value, _: &ConditionRegistry) -> Result<ConditionFn, Error> {
    let methods = string_list(arg)?;
    Ok(Arc::new(move |ctx: &Context| methods.iter().any(|m| m.eq_ignore_ascii_case(ctx.method().as_str()))))
}

fn build_sourceip(arg: &Value, _: &ConditionRegistry) -> Result<ConditionFn, Error> {
    let blocks = string_list(arg)?
        .iter()
        .map(|s| s.parse::<Cidr>().map_err(|e| invalid(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Arc::new(move |ctx: &Context| {
        let ip = ctx.real_ip();
        blocks.iter().any(|b| b.contains_str(&ip))
    }))
}

/// `{before?, after?}` with bounds parsed by `parse`.
fn bounds<T>(arg: &Value, parse: fn(&str) -> Option<T>) -> Result<(Option<T>, Option<T>), Error> {
    let map = arg.as_object().ok_or_else(|| invalid("expected {\"before\"?, \"after\"?}"))?;
    let get = |key: &str| -> Result<Option<T>, Error> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => parse(s).map(Some).ok_or_else(|| invalid(format!("bad {key} `{s}`"))),
            Some(_) => Err(invalid(format!("{key} must be a string"))),
        }
    };
    Ok((get("before")?, get("after")?))
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?.and_hms_opt(0, 0, 0).map(|t| t.and_utc())
}

fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S").or_else(|_| NaiveTime::parse_from_str(s, "%H:%M")).ok()
}

fn build_date(arg: &Value, _: &ConditionRegistry) -> Result<ConditionFn, Error> {
    let (before, after) = bounds(arg, parse_instant)?;
    Ok(Arc::new(move |_: &Context| {
        let now = Utc::now();
        before.is_none_or(|b| now < b) && after.is_none_or(|a| now >= a)
    }))
}

/// An `after` later than `before` is a window across midnight.
fn build_time(arg: &Value, _: &ConditionRegistry) -> Result<ConditionFn, Error> {
    let (before, after) = bounds(arg, parse_time_of_day)?;
    Ok(Arc::new(move |_: &Context| in_window(Utc::now().time(), before, after)))
}

fn in_window(now: NaiveTime, before: Option<NaiveTime>, after: Option<NaiveTime>) -> bool {
    match (after, before) {
        (Some(a), Some(b)) if a > b => now >= a || now < b,
        (a, b) => a.is_none_or(|a| now >= a) && b.is_none_or(|b| now < b),
    }
}

fn build_params(arg: &Value, _: &ConditionRegistry) -> Result<ConditionFn, Error> {
    let map = arg.as_object().ok_or_else(|| invalid("expected {param: [values]}"))?;
    let rules = map
        .iter()
        .map(|(k, v)| Ok((k.clone(), string_list(v)?)))
        .collect::<Result<Vec<(String, Vec<String>)>, Error>>()?;
    Ok(Arc::new(move |ctx: &Context| {
        rules.iter().all(|(key, allowed)| ctx.get_param(key).is_some_and(|v| allowed.iter().any(|a| a == v)))
    }))
}

fn build_and(arg: &Value, registry: &ConditionRegistry) -> Result<ConditionFn, Error> {
    let map = arg.as_object().ok_or_else(|| invalid("expected a map of conditions"))?;
    match registry.compile(map)? {
        Compiled::Ready(c) => Ok(c),
        Compiled::Unknown(name) => Err(invalid(format!("unknown condition `{name}`"))),
    }
}

fn build_or(arg: &Value, registry: &ConditionRegistry) -> Result<ConditionFn, Error> {
    let any: Vec<ConditionFn> = match arg {
        Value::Object(map) => map.iter().map(|(name, arg)| registry.build(name, arg)).collect::<Result<_, _>>()?,
        Value::Array(items) => items
            .iter()
            .map(|item| build_and(item, registry))
            .collect::<Result<_, _>>()?,
        _ => return Err(invalid("expected a map or list of conditions")),
    };
    Ok(Arc::new(move |ctx: &Context| any.iter().any(|c| c(ctx))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    use crate::context::tests::context_for;

    fn ctx(method: &str, ip: &str) -> Context {
        let req = http::Request::builder()
            .method(method)
            .uri("/doc/1")
            .header("x-real-ip", ip)
            .body(Bytes::new())
            .unwrap();
        context_for(req).0
    }

    fn compile(arg: Value) -> ConditionFn {
        match ConditionRegistry::builtin().compile(arg.as_object().unwrap()).unwrap() {
            Compiled::Ready(c) => c,
            Compiled::Unknown(name) => panic!("unknown {name}"),
        }
    }

    #[test]
    fn method_and_sourceip() {
        let c = compile(json!({"method": ["get"], "sourceip": ["10.0.0.0/8"]}));
        assert!(c(&ctx("GET", "10.1.2.3")));
        assert!(!c(&ctx("POST", "10.1.2.3")));
        assert!(!c(&ctx("GET", "192.168.1.1")));
    }

    #[test]
    fn or_takes_any_branch() {
        let c = compile(json!({"or": {"method": ["POST"], "sourceip": ["127.0.0.1"]}}));
        assert!(c(&ctx("POST", "8.8.8.8")));
        assert!(c(&ctx("GET", "127.0.0.1")));
        assert!(!c(&ctx("GET", "8.8.8.8")));

        let c = compile(json!({"or": [{"method": ["PUT"]}, {"sourceip": ["1.1.1.1"]}]}));
        assert!(c(&ctx("PUT", "9.9.9.9")));
    }

    #[test]
    fn params_condition() {
        let c = compile(json!({"params": {"tenant": ["acme", 7]}}));
        let mut x = ctx("GET", "1.1.1.1");
        assert!(!c(&x));
        x.set_param("tenant", "7");
        assert!(c(&x));
    }

    #[test]
    fn date_bounds() {
        assert!(compile(json!({"date": {"after": "2000-01-01", "before": "2999-01-01"}}))(&ctx("GET", "1.1.1.1")));
        assert!(!compile(json!({"date": {"before": "2000-01-01T00:00:00Z"}}))(&ctx("GET", "1.1.1.1")));
    }

    #[test]
    fn time_windows_wrap_midnight() {
        let t = |s| parse_time_of_day(s).unwrap();
        assert!(in_window(t("12:00"), Some(t("18:00")), Some(t("08:00"))));
        assert!(!in_window(t("20:00"), Some(t("18:00")), Some(t("08:00"))));
        assert!(in_window(t("23:30"), Some(t("06:00")), Some(t("22:00"))));
        assert!(in_window(t("05:59:59"), Some(t("06:00")), Some(t("22:00"))));
        assert!(!in_window(t("12:00"), Some(t("06:00")), Some(t("22:00"))));
    }

    #[test]
    fn unknown_names_are_reported_not_failed() {
        let map = json!({"method": ["GET"], "or": {"moonphase": "full"}});
        assert!(matches!(
            ConditionRegistry::builtin().compile(map.as_object().unwrap()),
            Ok(Compiled::Unknown(name)) if name == "moonphase"
        ));
    }

    #[test]
    fn malformed_specs_are_errors() {
        let bad = json!({"sourceip": ["not-an-ip"]});
        assert!(ConditionRegistry::builtin().compile(bad.as_object().unwrap()).is_err());
        let bad = json!({"time": {"after": "25:99"}});
        assert!(ConditionRegistry::builtin().compile(bad.as_object().unwrap()).is_err());
    }

    #[test]
    fn scoped_registration() {
        let mut r = ConditionRegistry::builtin();
        r.register("never", |_, _| Ok(Arc::new(|_: &Context| false)));
        assert!(r.contains("never"));
        assert!(!ConditionRegistry::global().contains("never"));
    }
}
