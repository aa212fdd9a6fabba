//! Minimal keel example: JSON endpoints, an RPC route and access control.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:8080/users/42
//!   curl -X POST http://localhost:8080/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl -H 'authorization: Bearer demo' -H 'x-real-ip: 10.0.0.1' \
//!        http://localhost:8080/docs/readme
//!   curl http://localhost:8080/admin/pbac/policies

use std::sync::Arc;
use std::time::Duration;

use keel::middleware::{BearerAuth, Compress, Recover, RequestId, RequestLogger, Timeout};
use keel::policy::{Member, Policy, PolicyAdmin};
use keel::{App, Context, Error};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Deserialize)]
struct NewUser {
    name: String,
}

#[derive(Serialize)]
struct User {
    id: u64,
    name: String,
}

// GET /users/:id|num
async fn get_user(ctx: &mut Context) -> String {
    format!("user {}", ctx.get_param("id").unwrap_or_default())
}

// POST /users: the body is bound into NewUser, the result rendered as JSON.
async fn create_user(_ctx: &mut Context, req: NewUser) -> Result<User, Error> {
    if req.name.is_empty() {
        return Err(Error::Validation("name must not be empty".into()));
    }
    Ok(User { id: 99, name: req.name })
}

// GET /docs/*name behind PBAC
async fn read_doc(ctx: &mut Context) -> String {
    format!("contents of {}", ctx.get_param("name").unwrap_or_default())
}

#[tokio::main]
async fn main() -> keel::Result<()> {
    let mut app = App::new();

    let readers: Policy = serde_json::from_value(json!({
        "policy_id": 1,
        "name": "readers",
        "statement": [{
            "effect": true,
            "action": ["read:*"],
            "resource": ["docs/*"],
            "conditions": {"sourceip": ["10.0.0.0/8", "127.0.0.1"]}
        }]
    }))?;
    let store = Arc::clone(app.policy_store());
    store.set_policy(readers)?;
    store.add_member(Member { user_id: 1, policy_id: 1, index: 0, expiration: 0 })?;
    let pbac = app.pbac()?;

    let router = app.router_mut();
    router
        .use_global(RequestId)
        .use_global(RequestLogger)
        .use_global(Recover)
        .use_global(Compress::new())
        .use_middleware(Timeout::new(Duration::from_secs(5)));

    router.get("/users/:id|num", get_user).post("/users", create_user);

    let mut docs = router.group("/docs action=read:doc");
    docs.use_middleware(BearerAuth::from_tokens([("demo", "1")])).use_middleware(pbac);
    docs.get("/*name", read_doc);

    PolicyAdmin::new(store).mount(&mut router.group("/admin/pbac"));

    app.serve().await
}
