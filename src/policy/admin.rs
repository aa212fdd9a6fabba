use std::sync::Arc;

use http::StatusCode;

use super::{Member, Policy, PolicyStore};
use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, HandlerFunc, handler_fn};
use crate::router::Router;

/// REST surface over a [`PolicyStore`]:
///
/// | method | path | |
/// |---|---|---|
/// | GET | `/policies` | all policies |
/// | POST | `/policies` | create or replace from the body |
/// | GET | `/policies/:id` | one policy |
/// | PUT | `/policies/:id` | replace, the path id wins |
/// | DELETE | `/policies/:id` | remove with its members |
/// | GET | `/members/:user` | a user's bindings in evaluation order |
/// | POST | `/members` | bind from the body |
/// | DELETE | `/members/:user/:policy` | unbind |
///
/// Every write is validated before the new snapshot is published.
#[derive(Clone)]
pub struct PolicyAdmin {
    store: Arc<PolicyStore>,
}

type AdminFn = for<'a> fn(&'a mut Context, Arc<PolicyStore>) -> BoxFuture<'a>;

impl PolicyAdmin {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    /// Registers the routes on `router`, typically a group such as
    /// `/admin/pbac`.
    pub fn mount(&self, router: &mut Router) {
        router
            .add_handler("GET", "/policies", self.bind(list_policies))
            .add_handler("POST", "/policies", self.bind(create_policy))
            .add_handler("GET", "/policies/:id|num", self.bind(get_policy))
            .add_handler("PUT", "/policies/:id|num", self.bind(put_policy))
            .add_handler("DELETE", "/policies/:id|num", self.bind(delete_policy))
            .add_handler("GET", "/members/:user|num", self.bind(list_members))
            .add_handler("POST", "/members", self.bind(add_member))
            .add_handler("DELETE", "/members/:user|num/:policy|num", self.bind(delete_member));
    }

    fn bind(&self, f: AdminFn) -> HandlerFunc {
        let store = Arc::clone(&self.store);
        handler_fn(move |ctx: &mut Context| f(ctx, Arc::clone(&store)))
    }
}

fn id_param(ctx: &Context, key: &str) -> Result<u64, Error> {
    ctx.get_param(key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Bind(format!("{key} must be a number")))
}

fn store_policy(ctx: &mut Context, store: &PolicyStore, policy: Policy, status: StatusCode) {
    match store.set_policy(policy) {
        Ok(stored) => {
            ctx.info(format_args!("policy {} stored", stored.policy_id));
            ctx.write_header(status);
            ctx.render(&*stored);
        }
        Err(e) => ctx.fatal(Error::Bind(e.to_string())),
    }
}

fn list_policies(ctx: &mut Context, store: Arc<PolicyStore>) -> BoxFuture<'_> {
    Box::pin(async move {
        let all: Vec<Policy> = store.policies().iter().map(|p| Policy::clone(p)).collect();
        ctx.render(&all);
    })
}

fn create_policy(ctx: &mut Context, store: Arc<PolicyStore>) -> BoxFuture<'_> {
    Box::pin(async move {
        match ctx.bind::<Policy>().await {
            Ok(policy) => store_policy(ctx, &store, policy, StatusCode::CREATED),
            Err(e) => ctx.fatal(e),
        }
    })
}

fn get_policy(ctx: &mut Context, store: Arc<PolicyStore>) -> BoxFuture<'_> {
    Box::pin(async move {
        match id_param(ctx, "id").map(|id| store.policy(id)) {
            Ok(Some(policy)) => ctx.render(&*policy),
            Ok(None) => ctx.write_error(&Error::NotFound),
            Err(e) => ctx.fatal(e),
        }
    })
}

fn put_policy(ctx: &mut Context, store: Arc<PolicyStore>) -> BoxFuture<'_> {
    Box::pin(async move {
        let id = match id_param(ctx, "id") {
            Ok(id) => id,
            Err(e) => return ctx.fatal(e),
        };
        match ctx.bind::<Policy>().await {
            Ok(policy) => store_policy(ctx, &store, Policy { policy_id: id, ..policy }, StatusCode::OK),
            Err(e) => ctx.fatal(e),
        }
    })
}

fn delete_policy(ctx: &mut Context, store: Arc<PolicyStore>) -> BoxFuture<'_> {
    Box::pin(async move {
        match id_param(ctx, "id").map(|id| store.remove_policy(id)) {
            Ok(true) => ctx.write_header(StatusCode::NO_CONTENT),
            Ok(false) => ctx.write_error(&Error::NotFound),
            Err(e) => ctx.fatal(e),
        }
    })
}

fn list_members(ctx: &mut Context, store: Arc<PolicyStore>) -> BoxFuture<'_> {
    Box::pin(async move {
        match id_param(ctx, "user") {
            Ok(user) => ctx.render(&store.members(user)),
            Err(e) => ctx.fatal(e),
        }
    })
}

fn add_member(ctx: &mut Context, store: Arc<PolicyStore>) -> BoxFuture<'_> {
    Box::pin(async move {
        let member = match ctx.bind::<Member>().await {
            Ok(member) => member,
            Err(e) => return ctx.fatal(e),
        };
        match store.add_member(member) {
            Ok(()) => {
                ctx.write_header(StatusCode::CREATED);
                ctx.render(&member);
            }
            Err(e) => ctx.fatal(Error::Bind(e.to_string())),
        }
    })
}

fn delete_member(ctx: &mut Context, store: Arc<PolicyStore>) -> BoxFuture<'_> {
    Box::pin(async move {
        let ids = id_param(ctx, "user").and_then(|u| Ok((u, id_param(ctx, "policy")?)));
        match ids.map(|(user, policy)| store.remove_member(user, policy)) {
            Ok(true) => ctx.write_header(StatusCode::NO_CONTENT),
            Ok(false) => ctx.write_error(&Error::NotFound),
            Err(e) => ctx.fatal(e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use serde_json::{Value, json};

    use crate::app::App;

    async fn call(app: &App, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = http::Request::builder().method(method).uri(uri);
        let bytes = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Bytes::from(v.to_string())
            }
            None => Bytes::new(),
        };
        let resp = app.handle(req.body(Full::new(bytes)).unwrap(), None).await;
        let status = resp.status();
        let raw = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&raw).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn crud_round() {
        let store = Arc::new(PolicyStore::new());
        let mut app = App::new();
        let mut group = app.router_mut().group("/admin/pbac");
        PolicyAdmin::new(Arc::clone(&store)).mount(&mut group);

        let policy = json!({"policy_id": 4, "name": "ops", "statement": [{"effect": true, "action": ["*"]}]});
        let (status, body) = call(&app, "POST", "/admin/pbac/policies", Some(policy)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "ops");

        let (status, _) = call(&app, "PUT", "/admin/pbac/policies/4", Some(json!({"name": "renamed", "statement": []}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(store.policy(4).unwrap().name, "renamed");

        let bad = json!({"policy_id": 5, "statement": [{"effect": true, "action": []}]});
        assert_eq!(call(&app, "POST", "/admin/pbac/policies", Some(bad)).await.0, StatusCode::BAD_REQUEST);

        let member = json!({"user_id": 8, "policy_id": 4});
        assert_eq!(call(&app, "POST", "/admin/pbac/members", Some(member)).await.0, StatusCode::CREATED);
        let (_, members) = call(&app, "GET", "/admin/pbac/members/8", None).await;
        assert_eq!(members[0]["policy_id"], 4);

        assert_eq!(call(&app, "DELETE", "/admin/pbac/members/8/4", None).await.0, StatusCode::NO_CONTENT);
        assert_eq!(call(&app, "DELETE", "/admin/pbac/members/8/4", None).await.0, StatusCode::NOT_FOUND);
        assert_eq!(call(&app, "DELETE", "/admin/pbac/policies/4", None).await.0, StatusCode::NO_CONTENT);
        assert_eq!(call(&app, "GET", "/admin/pbac/policies/4", None).await.0, StatusCode::NOT_FOUND);
        let (_, list) = call(&app, "GET", "/admin/pbac/policies", None).await;
        assert_eq!(list, json!([]));
    }
}
