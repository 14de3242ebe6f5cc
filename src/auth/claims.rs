//! Standard OpenID Connect identity claims.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// Profile information carried by a verified identity token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Claims {
    #[serde(rename = "sub", skip_serializing_if = "String::is_empty")]
    pub subject: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub given_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub family_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub middle_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub nickname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub preferred_username: String,
    #[serde(rename = "profile", skip_serializing_if = "String::is_empty")]
    pub profile_url: String,
    #[serde(rename = "picture", skip_serializing_if = "String::is_empty")]
    pub picture_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub email_verified: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub locale: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    /// Deployment-specific claims decoded into a caller-chosen type.
    #[serde(skip)]
    pub(crate) additional: Option<Arc<dyn Any + Send + Sync>>,
}

impl Claims {
    /// The extension payload, if one was decoded and has type `T`.
    pub fn additional<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.additional.as_deref()?.downcast_ref::<T>()
    }

    pub fn has_additional(&self) -> bool {
        self.additional.is_some()
    }

    pub(crate) fn set_additional(&mut self, value: Arc<dyn Any + Send + Sync>) {
        self.additional = Some(value);
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}
