//! Response encoding with `Accept` negotiation.

use http::header::{ACCEPT, CONTENT_TYPE};
use serde::Serialize;

use super::Context;
use crate::config::VALUE_TEMPLATE;
use crate::error::{Error, Result};
use crate::params::PARAM_TEMPLATE;

/// Renders named HTML templates. The framework ships none; register one
/// under the `template` value.
pub trait TemplateRenderer: Send + Sync + 'static {
    fn render(&self, name: &str, data: &serde_json::Value) -> Result<String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encoding {
    Json,
    Xml,
    Text,
    Html,
}

/// Media ranges from an `Accept` header, best first. Ties keep header order.
fn accepted(header: &str) -> Vec<String> {
    let mut ranges: Vec<(String, f32)> = header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let media = pieces.next()?.trim().to_ascii_lowercase();
            if media.is_empty() {
                return None;
            }
            let q = pieces
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((media, q))
        })
        .filter(|(_, q)| *q > 0.0)
        .collect();
    ranges.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranges.into_iter().map(|(m, _)| m).collect()
}

impl Context {
    fn negotiate(&self) -> Encoding {
        let html_ready = self.get_param(PARAM_TEMPLATE).is_some_and(|t| !t.is_empty())
            && self.value::<Box<dyn TemplateRenderer>>(VALUE_TEMPLATE).is_some();
        for media in accepted(self.header(ACCEPT.as_str()).unwrap_or_default()) {
            match media.as_str() {
                "application/json" | "*/*" | "application/*" => return Encoding::Json,
                m if m.ends_with("+json") => return Encoding::Json,
                "application/xml" | "text/xml" => return Encoding::Xml,
                "text/html" if html_ready => return Encoding::Html,
                "text/plain" => return Encoding::Text,
                _ => {}
            }
        }
        Encoding::Json
    }

    /// Encodes `value` by `Accept` (JSON by default) and writes it. HTML is
    /// chosen only when the route names a `template` and a renderer is
    /// registered. Encoding failures go through [`fatal`](Self::fatal).
    pub fn render<T: Serialize + ?Sized>(&mut self, value: &T) {
        let encoded = match self.negotiate() {
            Encoding::Json => serde_json::to_vec(value)
                .map(|b| (b, "application/json"))
                .map_err(|e| Error::Encode(e.to_string())),
            Encoding::Xml => quick_xml::se::to_string(value)
                .map(|s| (s.into_bytes(), "application/xml"))
                .map_err(|e| Error::Encode(e.to_string())),
            Encoding::Text => serde_json::to_value(value)
                .map(|v| match v {
                    serde_json::Value::String(s) => s.into_bytes(),
                    other => other.to_string().into_bytes(),
                })
                .map(|b| (b, "text/plain; charset=utf-8"))
                .map_err(|e| Error::Encode(e.to_string())),
            Encoding::Html => self.render_template(value).map(|s| (s.into_bytes(), "text/html; charset=utf-8")),
        };
        match encoded {
            Ok((body, content_type)) => {
                self.default_content_type(content_type);
                self.write_bytes(&body);
            }
            Err(e) => self.fatal(e),
        }
    }

    fn render_template<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let name = self.get_param(PARAM_TEMPLATE).unwrap_or_default();
        let renderer = self
            .value::<Box<dyn TemplateRenderer>>(VALUE_TEMPLATE)
            .ok_or_else(|| Error::Encode("no template renderer registered".into()))?;
        let data = serde_json::to_value(value).map_err(|e| Error::Encode(e.to_string()))?;
        renderer.render(name, &data)
    }

    /// Encodes with `encode`, which returns the body and its content type.
    pub fn render_with<T, F>(&mut self, value: &T, encode: F)
    where
        T: ?Sized,
        F: FnOnce(&T) -> Result<(Vec<u8>, String)>,
    {
        match encode(value) {
            Ok((body, content_type)) => {
                if !self.response().headers().contains_key(CONTENT_TYPE) {
                    self.set_header(CONTENT_TYPE.as_str(), &content_type);
                }
                self.write_bytes(&body);
            }
            Err(e) => self.fatal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::BodyExt;

    use super::super::tests::context_for;
    use super::*;

    #[derive(Serialize)]
    struct Doc {
        id: u32,
    }

    struct Echo;

    impl TemplateRenderer for Echo {
        fn render(&self, name: &str, data: &serde_json::Value) -> Result<String> {
            Ok(format!("<{name}>{data}</{name}>"))
        }
    }

    async fn rendered(accept: &str, setup: impl FnOnce(&mut Context)) -> (String, Bytes) {
        let req = http::Request::get("/").header("accept", accept).body(Bytes::new()).unwrap();
        let (mut ctx, rx) = context_for(req);
        setup(&mut ctx);
        ctx.render(&Doc { id: 7 });
        ctx.take_response().finish().unwrap();
        let resp = rx.await.unwrap();
        let ct = resp.headers()[CONTENT_TYPE].to_str().unwrap().to_owned();
        (ct, resp.into_body().collect().await.unwrap().to_bytes())
    }

    #[test]
    fn accept_ordering() {
        assert_eq!(accepted("text/html;q=0.5, application/xml, */*;q=0"), ["application/xml", "text/html"]);
    }

    #[tokio::test]
    async fn json_is_default() {
        let (ct, body) = rendered("", |_| {}).await;
        assert_eq!(ct, "application/json");
        assert_eq!(&body[..], br#"{"id":7}"#);
    }

    #[tokio::test]
    async fn xml_on_request() {
        let (ct, body) = rendered("application/xml", |_| {}).await;
        assert_eq!(ct, "application/xml");
        assert_eq!(&body[..], b"<Doc><id>7</id></Doc>");
    }

    #[tokio::test]
    async fn html_needs_template_and_renderer() {
        let (ct, _) = rendered("text/html", |_| {}).await;
        assert_eq!(ct, "application/json");

        let (ct, body) = rendered("text/html", |ctx| {
            ctx.set_param(PARAM_TEMPLATE, "doc");
            ctx.set_value(VALUE_TEMPLATE, Box::new(Echo) as Box<dyn TemplateRenderer>);
        })
        .await;
        assert_eq!(ct, "text/html; charset=utf-8");
        assert_eq!(&body[..], br#"<doc>{"id":7}</doc>"#);
    }
}
