//! Service registration and the method registry.
//!
//! Services are declared with [`RpcService`], including the optional
//! resource/action pair each method is authorized against. The registry is
//! built once before serving and is read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use super::interceptor::{StreamHandler, UnaryHandler};

/// Call shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    Streaming,
}

/// The resource and action a method is authorized against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzRule {
    pub resource: String,
    pub action: String,
}

impl AuthzRule {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }
}

/// What interceptors know about the method being called.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    /// `/package.Service/Method`
    pub full_method: String,
    pub kind: MethodKind,
    pub authz: Option<AuthzRule>,
}

impl MethodInfo {
    pub fn new(full_method: impl Into<String>, kind: MethodKind, authz: Option<AuthzRule>) -> Self {
        Self {
            full_method: full_method.into(),
            kind,
            authz,
        }
    }

    /// Resource and action, empty when the method is not annotated.
    pub fn resource_action(&self) -> (&str, &str) {
        match &self.authz {
            Some(rule) => (rule.resource.as_str(), rule.action.as_str()),
            None => ("", ""),
        }
    }

    /// `package.Service` part of the method name.
    pub fn service(&self) -> &str {
        self.full_method
            .trim_start_matches('/')
            .split_once('/')
            .map(|(service, _)| service)
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub(crate) enum Handler {
    Unary(Arc<dyn UnaryHandler>),
    Streaming(Arc<dyn StreamHandler>),
}

/// Registry entry for one method.
#[derive(Clone)]
pub struct RegisteredMethod {
    pub(crate) info: Arc<MethodInfo>,
    pub(crate) handler: Handler,
}

impl RegisteredMethod {
    pub fn info(&self) -> &MethodInfo {
        &self.info
    }
}

/// Errors raised while building the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("method {0} registered twice")]
    Duplicate(String),
    #[error("authorization rule for unknown method {0}")]
    UnknownMethod(String),
    #[error("invalid service or method name {0:?}")]
    InvalidName(String),
}

struct PendingMethod {
    name: String,
    handler: Handler,
}

/// A named service and its methods.
pub struct RpcService {
    name: String,
    methods: Vec<PendingMethod>,
    rules: Vec<(String, AuthzRule)>,
}

impl RpcService {
    /// `name` is the fully qualified service name, e.g. `docs.v1.Documents`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn unary(mut self, method: impl Into<String>, handler: impl UnaryHandler + 'static) -> Self {
        self.methods.push(PendingMethod {
            name: method.into(),
            handler: Handler::Unary(Arc::new(handler)),
        });
        self
    }

    pub fn streaming(mut self, method: impl Into<String>, handler: impl StreamHandler + 'static) -> Self {
        self.methods.push(PendingMethod {
            name: method.into(),
            handler: Handler::Streaming(Arc::new(handler)),
        });
        self
    }

    /// Annotate `method` with the resource and action it is authorized against.
    pub fn authorize(
        mut self,
        method: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.rules.push((method.into(), AuthzRule::new(resource, action)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn valid_segment(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains(char::is_whitespace)
}

/// Full method name → handler and descriptor.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Arc<HashMap<String, RegisteredMethod>>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("MethodRegistry").field("methods", &names).finish()
    }
}

impl MethodRegistry {
    pub fn new(services: Vec<RpcService>) -> Result<Self, RegistryError> {
        let mut methods = HashMap::new();

        for service in services {
            if !valid_segment(&service.name) {
                return Err(RegistryError::InvalidName(service.name));
            }
            let mut rules: HashMap<String, AuthzRule> = HashMap::new();
            for (method, rule) in service.rules {
                if !service.methods.iter().any(|m| m.name == method) {
                    return Err(RegistryError::UnknownMethod(format!("/{}/{}", service.name, method)));
                }
                rules.insert(method, rule);
            }

            for pending in service.methods {
                if !valid_segment(&pending.name) {
                    return Err(RegistryError::InvalidName(pending.name));
                }
                let full_method = format!("/{}/{}", service.name, pending.name);
                let kind = match pending.handler {
                    Handler::Unary(_) => MethodKind::Unary,
                    Handler::Streaming(_) => MethodKind::Streaming,
                };
                let info = MethodInfo::new(full_method.clone(), kind, rules.remove(&pending.name));
                tracing::debug!(
                    method = %full_method,
                    kind = ?kind,
                    authz = ?info.authz,
                    "RPC method registered"
                );
                let entry = RegisteredMethod {
                    info: Arc::new(info),
                    handler: pending.handler,
                };
                if methods.insert(full_method.clone(), entry).is_some() {
                    return Err(RegistryError::Duplicate(full_method));
                }
            }
        }

        Ok(Self {
            methods: Arc::new(methods),
        })
    }

    pub fn get(&self, full_method: &str) -> Option<&RegisteredMethod> {
        self.methods.get(full_method)
    }

    /// Resource/action for a method, if it is annotated.
    pub fn authz(&self, full_method: &str) -> Option<&AuthzRule> {
        self.methods.get(full_method)?.info.authz.as_ref()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}
