//! Request decoding: bind, validate and form access.

use std::any::Any;

use bytes::Bytes;
use http::Method;
use http::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;

use super::Context;
use crate::config::VALUE_VALIDATOR;
use crate::error::{Error, Result};
use crate::params::PARAM_VALID;
use crate::validator::Validator;

/// An uploaded multipart file.
#[derive(Clone, Debug)]
pub struct FormFile {
    pub field: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Parsed request body form (urlencoded or multipart).
#[derive(Clone, Debug, Default)]
pub struct FormData {
    pub values: Vec<(String, String)>,
    pub files: Vec<FormFile>,
}

impl Context {
    /// Decodes the request into `T`.
    ///
    /// | Request | Decoder |
    /// |---|---|
    /// | `GET` / `HEAD` | URL query |
    /// | `application/json`, `*+json` | JSON |
    /// | `application/x-www-form-urlencoded` | form |
    /// | `multipart/form-data` | multipart text fields |
    /// | `application/xml`, `text/xml` | XML |
    /// | no content type | query when the body is empty, JSON otherwise |
    ///
    /// Protobuf bodies go through [`bind_protobuf`](Self::bind_protobuf).
    /// When the route carries `valid=1` the value is also validated.
    pub async fn bind<T: DeserializeOwned + Any>(&mut self) -> Result<T> {
        let value = self.decode::<T>().await?;
        if self.params.get(PARAM_VALID) == Some("1") {
            self.validate(&value)?;
        }
        Ok(value)
    }

    async fn decode<T: DeserializeOwned>(&mut self) -> Result<T> {
        if matches!(*self.method(), Method::GET | Method::HEAD) {
            return Ok(serde_urlencoded::from_str(self.query_string())?);
        }
        let content_type = self.content_type();
        match content_type.as_str() {
            "application/json" => Ok(serde_json::from_slice(&self.body().await?)?),
            ct if ct.ends_with("+json") => Ok(serde_json::from_slice(&self.body().await?)?),
            "application/x-www-form-urlencoded" => Ok(serde_urlencoded::from_bytes(&self.body().await?)?),
            "multipart/form-data" => {
                let encoded = serde_urlencoded::to_string(&self.form_data().await?.values)
                    .map_err(|e| Error::Bind(e.to_string()))?;
                Ok(serde_urlencoded::from_str(&encoded)?)
            }
            "application/xml" | "text/xml" => {
                let body = self.body().await?;
                let text = std::str::from_utf8(&body).map_err(|e| Error::Bind(e.to_string()))?;
                quick_xml::de::from_str(text).map_err(|e| Error::Bind(e.to_string()))
            }
            "application/protobuf" | "application/x-protobuf" => Err(Error::UnsupportedMediaType(
                format!("{content_type} bodies bind through bind_protobuf"),
            )),
            "" => {
                let body = self.body().await?;
                if body.is_empty() {
                    Ok(serde_urlencoded::from_str(self.query_string())?)
                } else {
                    Ok(serde_json::from_slice(&body)?)
                }
            }
            other => Err(Error::UnsupportedMediaType(other.to_owned())),
        }
    }

    /// Decodes a protobuf body.
    pub async fn bind_protobuf<T: prost::Message + Default>(&mut self) -> Result<T> {
        let body = self.body().await?;
        T::decode(body).map_err(|e| Error::Bind(e.to_string()))
    }

    /// Runs the [`Validator`] registered under the `validator` value. Without
    /// one every value passes.
    pub fn validate<T: Any>(&self, value: &T) -> Result<()> {
        match self.value::<Validator>(VALUE_VALIDATOR) {
            Some(validator) => validator.validate(value),
            None => Ok(()),
        }
    }

    // ── Forms ────────────────────────────────────────────────────────────────

    /// Parses the body form once and caches it.
    pub async fn form_data(&mut self) -> Result<&FormData> {
        let form = match self.form.take() {
            Some(form) => form,
            None => self.parse_form().await?,
        };
        Ok(&*self.form.insert(form))
    }

    async fn parse_form(&mut self) -> Result<FormData> {
        let mut form = FormData::default();
        match self.content_type().as_str() {
            "application/x-www-form-urlencoded" => {
                form.values = serde_urlencoded::from_bytes(&self.body().await?)?;
            }
            "multipart/form-data" => {
                let header = self.header(CONTENT_TYPE.as_str()).unwrap_or_default().to_owned();
                let boundary = multer::parse_boundary(header)?;
                let body = self.body().await?;
                let stream = futures::stream::once(async move { Ok::<_, std::convert::Infallible>(body) });
                let mut multipart = multer::Multipart::new(stream, boundary);
                while let Some(field) = multipart.next_field().await? {
                    let name = field.name().unwrap_or_default().to_owned();
                    match field.file_name().map(str::to_owned) {
                        Some(filename) => {
                            let content_type = field.content_type().map(ToString::to_string);
                            let data = field.bytes().await?;
                            form.files.push(FormFile { field: name, filename, content_type, data });
                        }
                        None => {
                            let text = field.text().await?;
                            form.values.push((name, text));
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(form)
    }

    /// Body form values followed by query values.
    pub async fn form_values(&mut self) -> Result<Vec<(String, String)>> {
        let mut values = self.form_data().await?.values.clone();
        values.extend(self.querys());
        Ok(values)
    }

    /// First value for `key`, body before query.
    pub async fn form_value(&mut self, key: &str) -> Option<String> {
        let values = self.form_values().await.ok()?;
        values.into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub async fn form_file(&mut self, field: &str) -> Result<Option<FormFile>> {
        Ok(self.form_data().await?.files.iter().find(|f| f.field == field).cloned())
    }

    pub async fn form_files(&mut self) -> Result<Vec<FormFile>> {
        Ok(self.form_data().await?.files.clone())
    }
}
