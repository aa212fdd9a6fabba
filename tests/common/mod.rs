#![allow(dead_code)]

use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use keel::{App, Context, HandlerFunc, handler_fn};

pub struct Collected {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Collected {
    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub async fn send(app: &App, req: Request<Full<Bytes>>) -> Collected {
    let resp = app.handle(req, None).await;
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    Collected { status, headers, body }
}

pub async fn call(app: &App, method: &str, uri: &str) -> Collected {
    send(app, Request::builder().method(method).uri(uri).body(Full::new(Bytes::new())).unwrap()).await
}

pub async fn post_json(app: &App, uri: &str, body: serde_json::Value) -> Collected {
    let req = Request::post(uri)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();
    send(app, req).await
}

/// Writes `"<name>"` followed by ` key=value` for each requested param.
pub fn echo(name: &'static str, keys: &'static [&'static str]) -> HandlerFunc {
    handler_fn(move |ctx: &mut Context| {
        Box::pin(async move {
            let mut out = name.to_owned();
            for key in keys {
                out.push_str(&format!(" {key}={}", ctx.get_param(key).unwrap_or("-")));
            }
            ctx.write_string(&out);
        })
    })
}
