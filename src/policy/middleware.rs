use std::sync::Arc;

use http::header::AUTHORIZATION;

use super::{BearerSigner, CompiledPolicy, PolicyStore};
use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, Middleware};
use crate::params::{PARAM_ACTION, PARAM_RESOURCE, PARAM_ROUTE, PARAM_USERID};

/// Context value key holding the deciding statement's `data` on allow.
pub const VALUE_POLICY_DATA: &str = "policy.data";

/// Access control in front of a route.
///
/// The user comes from a signed bearer when a signer is configured and the
/// request carries one, otherwise from the `Userid` param set by an earlier
/// auth middleware, otherwise it is the guest (0). A bearer that fails
/// verification degrades to the guest with a warning. The action is the
/// `action` param, falling back to the route pattern. The resource is the
/// `resource` param, falling back to the request path without its leading
/// `/`, so `doc/*` covers `/doc/42`.
///
/// Register it as route middleware so that route params are available.
#[derive(Clone)]
pub struct Pbac {
    store: Arc<PolicyStore>,
    signer: Option<BearerSigner>,
}

impl Pbac {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store, signer: None }
    }

    pub fn with_signer(mut self, signer: BearerSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// User id and inline policy for this request.
    fn identify(&self, ctx: &Context) -> (u64, Option<CompiledPolicy>) {
        let bearer = ctx
            .header(AUTHORIZATION.as_str())
            .and_then(|v| v.trim().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim());
        if let (Some(signer), Some(token)) = (&self.signer, bearer) {
            let claims = signer.verify(token, chrono::Utc::now().timestamp()).and_then(|claims| {
                let inline = claims
                    .inline_policy()?
                    .map(|p| CompiledPolicy::compile(p, self.store.conditions()))
                    .transpose()?;
                Ok((claims.user_id, inline))
            });
            return match claims {
                Ok(identity) => identity,
                Err(e) => {
                    ctx.warning(format_args!("bearer rejected, continuing as guest: {e}"));
                    (0, None)
                }
            };
        }
        let user = ctx.get_param(PARAM_USERID).and_then(|u| u.parse().ok()).unwrap_or(0);
        (user, None)
    }
}

impl Middleware for Pbac {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            let (user, inline) = self.identify(ctx);
            let action = ctx
                .get_param(PARAM_ACTION)
                .filter(|a| !a.is_empty())
                .or_else(|| ctx.get_param(PARAM_ROUTE))
                .unwrap_or_default()
                .to_owned();
            let resource = ctx
                .get_param(PARAM_RESOURCE)
                .filter(|r| !r.is_empty())
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| ctx.path().trim_start_matches('/').to_owned());

            let decision = self.store.evaluate_with(user, inline.as_ref(), &action, &resource, ctx);
            if !decision.allow {
                ctx.debug(format_args!("pbac deny user={user} action={action} resource={resource}"));
                ctx.write_error(&Error::Forbidden("access denied".into()));
                ctx.end();
                return;
            }
            if user != 0 {
                ctx.set_param(PARAM_USERID, user.to_string());
            }
            if let Some(data) = decision.data {
                ctx.set_value_arc(VALUE_POLICY_DATA, data);
            }
            ctx.next().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;
    use serde_json::json;

    use crate::handler::handler_fn;
    use crate::middleware::testing::run_request;
    use crate::policy::{Claims, Member, Policy, StatementData};

    fn store() -> Arc<PolicyStore> {
        let store = PolicyStore::new();
        let policy: Policy = serde_json::from_value(json!({
            "policy_id": 1,
            "statement": [{
                "effect": true,
                "action": ["read:*"],
                "resource": ["doc/*"],
                "data": {"fields": ["title"]}
            }]
        }))
        .unwrap();
        store.set_policy(policy).unwrap();
        store.add_member(Member { user_id: 1, policy_id: 1, index: 0, expiration: 0 }).unwrap();
        Arc::new(store)
    }

    fn show() -> crate::HandlerFunc {
        handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                let fields = ctx.value::<StatementData>(VALUE_POLICY_DATA).map(|d| d["fields"].len()).unwrap_or(0);
                let user = ctx.get_param(PARAM_USERID).unwrap_or_default().to_owned();
                ctx.write_string(&format!("user={user} fields={fields}"));
            })
        })
    }

    fn request(auth: Option<String>) -> http::Request<Bytes> {
        request_to("/doc/42", auth)
    }

    fn request_to(path: &str, auth: Option<String>) -> http::Request<Bytes> {
        let mut b = http::Request::get(path);
        if let Some(auth) = auth {
            b = b.header(AUTHORIZATION, auth);
        }
        b.body(Bytes::new()).unwrap()
    }

    fn set_action() -> crate::HandlerFunc {
        handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                ctx.set_param(PARAM_ACTION, "read:doc");
                ctx.next().await;
            })
        })
    }

    #[tokio::test]
    async fn signed_bearer_user_is_allowed() {
        let signer = BearerSigner::new("k").unwrap();
        let token = signer.sign(&Claims::new(1)).unwrap();
        let pbac = crate::handler(Pbac::new(store()).with_signer(signer));
        let resp = run_request(request(Some(format!("Bearer {token}"))), vec![set_action(), pbac, show()]).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(&resp.body[..], b"user=1 fields=1");
    }

    #[tokio::test]
    async fn bad_bearer_degrades_to_guest_and_is_denied() {
        let pbac = crate::handler(Pbac::new(store()).with_signer(BearerSigner::new("k").unwrap()));
        let resp = run_request(request(Some("Bearer not.a.token".into())), vec![set_action(), pbac, show()]).await;
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["code"], "forbidden");
    }

    #[tokio::test]
    async fn inline_policy_grants_for_one_request() {
        let signer = BearerSigner::new("k").unwrap();
        let claims = Claims {
            user_id: 42,
            policy: Some(json!([{"effect": true, "action": ["read:doc"]}])),
            expiration: 0,
        };
        let token = signer.sign(&claims).unwrap();
        let pbac = crate::handler(Pbac::new(store()).with_signer(signer));
        let resp = run_request(request(Some(format!("Bearer {token}"))), vec![set_action(), pbac, show()]).await;
        assert_eq!(&resp.body[..], b"user=42 fields=0");
    }

    #[tokio::test]
    async fn userid_param_from_earlier_auth() {
        let auth = handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                ctx.set_param(PARAM_USERID, "1");
                ctx.next().await;
            })
        });
        let pbac = crate::handler(Pbac::new(store()));
        let resp = run_request(request(None), vec![set_action(), auth, pbac, show()]).await;
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn resource_param_overrides_the_path() {
        let as_doc = handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                ctx.set_param(PARAM_USERID, "1");
                ctx.set_param(PARAM_RESOURCE, "doc/1");
                ctx.next().await;
            })
        });
        let pbac = crate::handler(Pbac::new(store()));
        let resp = run_request(request_to("/other", None), vec![set_action(), as_doc, pbac.clone(), show()]).await;
        assert_eq!(resp.status, StatusCode::OK);

        let resp = run_request(request_to("/other", None), vec![set_action(), pbac, show()]).await;
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
    }
}
