mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{call, echo, post_json, send};
use http::{Request, StatusCode};
use http_body_util::Full;
use keel::middleware::BearerAuth;
use keel::policy::{BearerSigner, Claims, Member, Policy, PolicyAdmin, PolicyStore, StatementData, VALUE_POLICY_DATA};
use keel::{App, AppConfig, Context, PolicyConfig, VALUE_POLICY, handler_fn};
use serde_json::json;

fn readers() -> Policy {
    serde_json::from_value(json!({
        "policy_id": 1,
        "name": "readers",
        "statement": [{
            "effect": true,
            "action": ["read:*"],
            "resource": ["doc/*"],
            "conditions": {"method": ["GET"], "sourceip": ["10.0.0.0/8"]},
            "data": {"fields": ["title", "body"]}
        }]
    }))
    .unwrap()
}

fn doc_request(ip: &str, auth: &str) -> Request<Full<Bytes>> {
    Request::get("/doc/42")
        .header("x-real-ip", ip)
        .header("authorization", auth)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn show_doc() -> keel::HandlerFunc {
    handler_fn(|ctx: &mut Context| {
        Box::pin(async move {
            let fields = ctx
                .value::<StatementData>(VALUE_POLICY_DATA)
                .map(|d| d["fields"].iter().filter_map(|f| f.as_str()).collect::<Vec<_>>().join(","))
                .unwrap_or_default();
            let body = format!("doc {} for {} [{fields}]", ctx.get_param("id").unwrap_or_default(), ctx.get_param("Userid").unwrap_or_default());
            ctx.write_string(&body);
        })
    })
}

#[tokio::test]
async fn member_policy_decides_by_source_ip() {
    let mut app = App::new();
    app.policy_store().set_policy(readers()).unwrap();
    app.policy_store().add_member(Member { user_id: 1, policy_id: 1, index: 0, expiration: 0 }).unwrap();

    let pbac = app.pbac().unwrap();
    let mut docs = app.router_mut().group("/doc action=read:doc");
    docs.use_middleware(BearerAuth::from_tokens([("t1", "1")]));
    docs.use_middleware(pbac);
    docs.get("/:id", show_doc());

    let allowed = send(&app, doc_request("10.1.2.3", "Bearer t1")).await;
    assert_eq!(allowed.status, StatusCode::OK);
    assert_eq!(allowed.text(), "doc 42 for 1 [title,body]");

    let denied = send(&app, doc_request("192.168.1.1", "Bearer t1")).await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);
    assert_eq!(denied.json()["code"], "forbidden");

    let anonymous = send(&app, doc_request("10.1.2.3", "Bearer nope")).await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signed_bearers_and_guest_policies_from_config() {
    let config = AppConfig {
        policy: PolicyConfig { secret: "top-secret".into(), guest_policies: vec![2] },
        ..AppConfig::default()
    };
    let mut app = App::from_config(config);
    let store = Arc::clone(app.policy_store());
    store.set_policy(readers()).unwrap();
    store
        .set_policy(serde_json::from_value(json!({
            "policy_id": 2,
            "statement": [{"effect": true, "action": ["read:public"]}]
        }))
        .unwrap())
        .unwrap();
    store.add_member(Member { user_id: 7, policy_id: 1, index: 0, expiration: 0 }).unwrap();

    let pbac = app.pbac().unwrap();
    let router = app.router_mut();
    router.add_handlers("GET", "/doc/:id action=read:doc", vec![keel::handler(pbac.clone()), show_doc()]);
    router.add_handlers("GET", "/public action=read:public", vec![keel::handler(pbac), echo("public", &[])]);

    let token = BearerSigner::new("top-secret").unwrap().sign(&Claims::new(7)).unwrap();
    let resp = send(&app, doc_request("10.9.9.9", &format!("Bearer {token}"))).await;
    assert_eq!(resp.text(), "doc 42 for 7 [title,body]");

    let forged = BearerSigner::new("guess").unwrap().sign(&Claims::new(7)).unwrap();
    let resp = send(&app, doc_request("10.9.9.9", &format!("Bearer {forged}"))).await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);

    assert_eq!(call(&app, "GET", "/public").await.text(), "public");
}

#[tokio::test]
async fn admin_writes_are_visible_to_the_next_request() {
    let mut app = App::new();
    let store = Arc::clone(app.policy_store());
    let pbac = app.pbac().unwrap();
    let router = app.router_mut();
    let mut admin = router.group("/admin/pbac");
    PolicyAdmin::new(Arc::clone(&store)).mount(&mut admin);
    router.add_handlers(
        "GET",
        "/doc/:id action=read:doc",
        vec![keel::handler(BearerAuth::from_tokens([("t5", "5")])), keel::handler(pbac), show_doc()],
    );

    let req = || doc_request("10.0.0.1", "Bearer t5");
    assert_eq!(send(&app, req()).await.status, StatusCode::FORBIDDEN);

    let created = post_json(&app, "/admin/pbac/policies", serde_json::to_value(readers()).unwrap()).await;
    assert_eq!(created.status, StatusCode::CREATED);
    let bound = post_json(&app, "/admin/pbac/members", json!({"user_id": 5, "policy_id": 1})).await;
    assert_eq!(bound.status, StatusCode::CREATED);
    assert_eq!(send(&app, req()).await.status, StatusCode::OK);

    assert_eq!(call(&app, "DELETE", "/admin/pbac/members/5/1").await.status, StatusCode::NO_CONTENT);
    assert_eq!(send(&app, req()).await.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn the_store_is_a_shared_value() {
    let mut app = App::new();
    app.router_mut().get(
        "/count",
        handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                let count = ctx.value::<PolicyStore>(VALUE_POLICY).map(|s| s.policies().len()).unwrap_or(99);
                ctx.write_string(&count.to_string());
            })
        }),
    );
    app.policy_store().set_policy(readers()).unwrap();
    assert_eq!(call(&app, "GET", "/count").await.text(), "1");
}
