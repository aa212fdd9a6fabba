use http::{HeaderName, HeaderValue};

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, Middleware};

/// Response header rewriting.
///
/// `set` rules are applied before the rest of the chain, so handlers may
/// still override them. `remove` rules are applied afterwards and only take
/// effect when the response has not been flushed.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// `nosniff`, `DENY` framing and the legacy XSS filter.
    pub fn security() -> Self {
        Self {
            set: vec![
                (HeaderName::from_static("x-content-type-options"), HeaderValue::from_static("nosniff")),
                (HeaderName::from_static("x-frame-options"), HeaderValue::from_static("DENY")),
                (HeaderName::from_static("x-xss-protection"), HeaderValue::from_static("1; mode=block")),
            ],
            remove: Vec::new(),
        }
    }

    pub fn set(mut self, name: &str, value: &str) -> Result<Self, Error> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::Config(format!("header `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value).map_err(|e| Error::Config(format!("header `{name}`: {e}")))?;
        self.set.retain(|(n, _)| *n != name);
        self.set.push((name, value));
        Ok(self)
    }

    pub fn remove(mut self, name: &str) -> Result<Self, Error> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::Config(format!("header `{name}`: {e}")))?;
        self.set.retain(|(n, _)| *n != name);
        self.remove.push(name);
        Ok(self)
    }
}

impl Middleware for Headers {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            let headers = ctx.response_mut().headers_mut();
            for (name, value) in &self.set {
                headers.insert(name.clone(), value.clone());
            }
            ctx.next().await;
            let headers = ctx.response_mut().headers_mut();
            for name in &self.remove {
                headers.remove(name);
            }
        })
    }
}
