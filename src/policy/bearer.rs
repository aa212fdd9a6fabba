//! Signed bearers.
//!
//! A bearer is `header.payload.signature`, each part base64url without
//! padding. The header names the algorithm (only `HS256` is accepted), the
//! payload carries [`Claims`] and the signature is HMAC-SHA256 over
//! `header + "." + payload`.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use super::{Policy, Statement};
use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    typ: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: u64,
    /// Inline statements: a JSON list, or a base64 string holding one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Value>,
    /// Unix seconds; 0 never expires.
    #[serde(default)]
    pub expiration: i64,
}

impl Claims {
    pub fn new(user_id: u64) -> Self {
        Self { user_id, policy: None, expiration: 0 }
    }

    /// The inline policy as policy 0, if the claims carry one.
    pub fn inline_policy(&self) -> Result<Option<Policy>, Error> {
        let statements: Vec<Statement> = match &self.policy {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(encoded)) => {
                let raw = STANDARD
                    .decode(encoded.trim())
                    .or_else(|_| URL_SAFE_NO_PAD.decode(encoded.trim()))
                    .map_err(|e| Error::Auth(format!("inline policy: {e}")))?;
                serde_json::from_slice(&raw).map_err(|e| Error::Auth(format!("inline policy: {e}")))?
            }
            Some(list) => {
                serde_json::from_value(list.clone()).map_err(|e| Error::Auth(format!("inline policy: {e}")))?
            }
        };
        Ok(Some(Policy { policy_id: 0, name: "inline".into(), description: String::new(), statement: statements }))
    }
}

/// Signs and verifies bearers with one shared secret.
#[derive(Clone)]
pub struct BearerSigner {
    keyed: HmacSha256,
}

impl BearerSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, Error> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(Error::Config("bearer secret must not be empty".into()));
        }
        let keyed = HmacSha256::new_from_slice(secret).map_err(|e| Error::Config(format!("bearer secret: {e}")))?;
        Ok(Self { keyed })
    }

    fn mac(&self) -> HmacSha256 {
        self.keyed.clone()
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, Error> {
        let header = serde_json::to_vec(&Header { alg: ALGORITHM.into(), typ: "JWT".into() })?;
        let payload = serde_json::to_vec(claims)?;
        let signing_input = format!("{}.{}", URL_SAFE_NO_PAD.encode(header), URL_SAFE_NO_PAD.encode(payload));
        let mut mac = self.mac();
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }

    /// Checks the signature and expiry and returns the claims.
    pub fn verify(&self, token: &str, now: i64) -> Result<Claims, Error> {
        let bad = |why: &str| Error::Auth(format!("bearer: {why}"));
        let mut parts = token.trim().split('.');
        let (Some(header), Some(payload), Some(signature), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad("expected three segments"));
        };

        let header_raw = URL_SAFE_NO_PAD.decode(header).map_err(|_| bad("header encoding"))?;
        let head: Header = serde_json::from_slice(&header_raw).map_err(|_| bad("header json"))?;
        if head.alg != ALGORITHM {
            return Err(bad("unsupported algorithm"));
        }

        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| bad("signature encoding"))?;
        let mut mac = self.mac();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).map_err(|_| bad("signature mismatch"))?;

        let payload = URL_SAFE_NO_PAD.decode(payload).map_err(|_| bad("payload encoding"))?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| bad("payload json"))?;
        if claims.expiration != 0 && claims.expiration <= now {
            return Err(bad("expired"));
        }
        Ok(claims)
    }
}
