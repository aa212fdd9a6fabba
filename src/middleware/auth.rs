use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, Middleware};
use crate::params::PARAM_USERID;

fn credentials<'c>(ctx: &'c Context, scheme: &str) -> Option<&'c str> {
    let value = ctx.header(AUTHORIZATION.as_str())?.trim();
    let (given, rest) = value.split_once(' ')?;
    given.eq_ignore_ascii_case(scheme).then(|| rest.trim())
}

fn unauthorized(ctx: &mut Context, challenge: &str, reason: &str) {
    ctx.set_header(WWW_AUTHENTICATE.as_str(), challenge);
    ctx.write_error(&Error::Auth(reason.to_owned()));
    ctx.end();
}

/// HTTP Basic authentication against a fixed user table. On success the
/// user name is stored as the `Userid` param.
#[derive(Clone, Debug)]
pub struct BasicAuth {
    users: HashMap<String, String>,
    realm: String,
}

impl BasicAuth {
    pub fn new<I, U, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            users: users.into_iter().map(|(u, p)| (u.into(), p.into())).collect(),
            realm: "restricted".into(),
        }
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    fn check(&self, encoded: &str) -> Option<String> {
        let decoded = STANDARD.decode(encoded).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        (self.users.get(user)? == password).then(|| user.to_owned())
    }
}

impl Middleware for BasicAuth {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            match credentials(ctx, "Basic").and_then(|c| self.check(c)) {
                Some(user) => {
                    ctx.set_param(PARAM_USERID, user);
                    ctx.next().await;
                }
                None => {
                    let challenge = format!("Basic realm=\"{}\"", self.realm);
                    unauthorized(ctx, &challenge, "invalid basic credentials");
                }
            }
        })
    }
}

type TokenFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Bearer token authentication. The verifier maps a token to a user id, which
/// is stored as the `Userid` param.
#[derive(Clone)]
pub struct BearerAuth {
    verify: TokenFn,
}

impl BearerAuth {
    pub fn new<F>(verify: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self { verify: Arc::new(verify) }
    }

    /// Accepts exactly the tokens in `tokens`, each mapped to a user id.
    pub fn from_tokens<I, T, U>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (T, U)>,
        T: Into<String>,
        U: Into<String>,
    {
        let table: HashMap<String, String> = tokens.into_iter().map(|(t, u)| (t.into(), u.into())).collect();
        Self::new(move |token| table.get(token).cloned())
    }
}

impl Middleware for BearerAuth {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            match credentials(ctx, "Bearer").and_then(|t| (self.verify)(t)) {
                Some(user) => {
                    ctx.set_param(PARAM_USERID, user);
                    ctx.next().await;
                }
                None => unauthorized(ctx, "Bearer", "invalid bearer token"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;

    use crate::handler::handler_fn;
    use crate::middleware::testing::run_request;

    fn whoami() -> crate::HandlerFunc {
        handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                let user = ctx.get_param(PARAM_USERID).unwrap_or_default().to_owned();
                ctx.write_string(&user);
            })
        })
    }

    fn with_auth(value: &str) -> http::Request<Bytes> {
        http::Request::get("/").header(AUTHORIZATION, value).body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn basic_accepts_known_users() {
        let auth = BasicAuth::new([("alice", "s3cret")]);
        let token = STANDARD.encode("alice:s3cret");
        let resp = run_request(with_auth(&format!("Basic {token}")), vec![crate::handler(auth.clone()), whoami()]).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(&resp.body[..], b"alice");

        let wrong = STANDARD.encode("alice:nope");
        let resp = run_request(with_auth(&format!("Basic {wrong}")), vec![crate::handler(auth), whoami()]).await;
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers[WWW_AUTHENTICATE], "Basic realm=\"restricted\"");
    }

    #[tokio::test]
    async fn bearer_maps_tokens_to_users() {
        let auth = BearerAuth::from_tokens([("t0k", "7")]);
        let resp = run_request(with_auth("Bearer t0k"), vec![crate::handler(auth.clone()), whoami()]).await;
        assert_eq!(&resp.body[..], b"7");

        let resp = run_request(with_auth("Basic t0k"), vec![crate::handler(auth), whoami()]).await;
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    }
}
