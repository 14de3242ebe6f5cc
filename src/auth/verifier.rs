//! Identity token verification seam.
//!
//! Signature checking lives behind [`TokenVerifier`]; the runtime only
//! inspects the payload of a token the verifier has accepted.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::error::BoxError;

/// Checks a raw token's signature and returns its decoded payload.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<IdToken, BoxError>;
}

/// A token whose signature has been checked.
#[derive(Debug, Clone)]
pub struct IdToken {
    pub issuer: String,
    pub audience: Vec<String>,
    pub subject: String,
    pub expiry: Option<SystemTime>,
    pub issued_at: Option<SystemTime>,
    payload: Map<String, Value>,
}

impl IdToken {
    /// Build from a JSON claim set. `iss`, `aud`, `sub`, `exp` and `iat` are
    /// lifted into fields; `aud` may be a string or an array.
    pub fn from_payload(payload: Value) -> Result<Self, BoxError> {
        let Value::Object(payload) = payload else {
            return Err("token payload is not a JSON object".into());
        };

        let text = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let time = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_u64)
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
        };
        let audience = match payload.get("aud") {
            Some(Value::String(aud)) => vec![aud.clone()],
            Some(Value::Array(auds)) => auds
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            issuer: text("iss"),
            subject: text("sub"),
            audience,
            expiry: time("exp"),
            issued_at: time("iat"),
            payload,
        })
    }

    /// Decode the payload into `T`.
    pub fn claims<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(Value::Object(self.payload.clone()))
    }

    /// A single raw claim.
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}
