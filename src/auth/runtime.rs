//! Token verification and authorization.
//!
//! # Verify
//! ```text
//! bearer token
//!     → TokenVerifier (signature)
//!     → issuer, audience, expiry, required claims
//!     → Claims (+ optional extension type)
//!     → RequestState with Authenticated { subject, claims }
//! ```
//!
//! # Authorize
//! ```text
//! admin group → admin role
//!     → resource id (ResourceIdentifier)
//!     → role bindings (RoleBindingResolver)
//!     → role set (sorted, deduplicated)
//!     → resource attributes (ResourceResolver)
//!     → AuthorizationRequest → Authorizer → result, returned verbatim
//! ```
//!
//! # Design Decisions
//! - No authorizer means deny
//! - Resolver failures abort with an internal error and are never retried
//! - Decisions are recomputed on every call
//! - Every external call races the request's cancellation token

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::claims::Claims;
use super::context::{Authenticated, Authorized, RequestState};
use super::error::{AuthError, BoxError};
use super::resolvers::{
    Authorizer, RawRequest, ResourceIdentifier, ResourceQuery, ResourceResolver,
    RoleBindingResolver,
};
use super::verifier::{IdToken, TokenVerifier};

/// Who wants to do what, with everything known about them.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub app: String,
    pub service: String,
    pub subject: String,
    pub resource: String,
    pub resource_id: String,
    pub action: String,
    pub claims: Arc<Claims>,
    pub data: AuthorizationData,
}

/// Facts already resolved for the decision function.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthorizationData {
    pub role_bindings: Vec<String>,
    pub resource: HashMap<String, String>,
}

/// The decision function's verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct AuthorizationResult {
    pub allowed: bool,
    pub resource_matched: bool,
}

impl AuthorizationResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            resource_matched: true,
        }
    }

    pub fn deny() -> Self {
        Self::default()
    }
}

/// The two operations the middleware consumes.
#[async_trait]
pub trait AuthRuntime: Send + Sync {
    /// Validate `token` and attach the resolved identity.
    async fn verify(
        &self,
        state: RequestState,
        token: &str,
    ) -> Result<(RequestState, Arc<Claims>), AuthError>;

    /// Decide whether the authenticated subject may perform `action` on
    /// `resource`.
    async fn authorize(
        &self,
        state: RequestState,
        claims: Arc<Claims>,
        resource: &str,
        action: &str,
        request: &RawRequest,
    ) -> Result<(RequestState, AuthorizationResult), AuthError>;
}

type IdResolver = Arc<dyn Fn(&Claims) -> String + Send + Sync>;
type ExtensionDecoder =
    Arc<dyn Fn(&IdToken) -> Result<Arc<dyn Any + Send + Sync>, serde_json::Error> + Send + Sync>;

/// Default [`AuthRuntime`] built by [`AuthServiceBuilder`].
#[derive(Clone)]
pub struct AuthService {
    app_name: String,
    service_name: String,
    issuer: String,
    audience: Option<String>,
    required_claims: HashMap<String, String>,
    leeway: Duration,
    verifier: Arc<dyn TokenVerifier>,
    authorizer: Option<Arc<dyn Authorizer>>,
    id_resolver: IdResolver,
    additional_claims: Option<ExtensionDecoder>,
    role_binding_resolver: Option<Arc<dyn RoleBindingResolver>>,
    resource_resolver: Option<Arc<dyn ResourceResolver>>,
    resource_identifier: Option<Arc<dyn ResourceIdentifier>>,
    admin_group: Option<(String, String)>,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("app_name", &self.app_name)
            .field("service_name", &self.service_name)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("authorizer", &self.authorizer.is_some())
            .finish_non_exhaustive()
    }
}

impl AuthService {
    pub fn builder() -> AuthServiceBuilder {
        AuthServiceBuilder::default()
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    fn check_token(&self, token: &IdToken) -> Result<(), AuthError> {
        if token.issuer != self.issuer {
            return Err(AuthError::unauthenticated(format!(
                "id token issued by a different provider, expected {:?} got {:?}",
                self.issuer, token.issuer
            )));
        }
        if let Some(aud) = &self.audience {
            if !token.audience.iter().any(|a| a == aud) {
                return Err(AuthError::unauthenticated(format!(
                    "expected audience {aud:?} got {:?}",
                    token.audience
                )));
            }
        }
        let Some(expiry) = token.expiry else {
            return Err(AuthError::unauthenticated("id token has no expiry"));
        };
        if SystemTime::now() > expiry + self.leeway {
            return Err(AuthError::unauthenticated("token is expired"));
        }
        for (name, expected) in &self.required_claims {
            let actual = token.claim(name).and_then(|v| v.as_str());
            if actual != Some(expected.as_str()) {
                return Err(AuthError::unauthenticated(format!(
                    "required claim {name:?} does not match"
                )));
            }
        }
        Ok(())
    }

    fn admin_role(&self, claims: &Claims) -> Option<&str> {
        let (group, role) = self.admin_group.as_ref()?;
        claims.in_group(group).then_some(role.as_str())
    }
}

/// Run `fut` unless the request is cancelled first.
async fn cancellable<F, T>(state: &RequestState, fut: F) -> Result<T, AuthError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = state.cancellation().cancelled() => Err(AuthError::Cancelled),
        out = fut => Ok(out),
    }
}

#[async_trait]
impl AuthRuntime for AuthService {
    async fn verify(
        &self,
        state: RequestState,
        token: &str,
    ) -> Result<(RequestState, Arc<Claims>), AuthError> {
        let outcome = async {
            let id_token = cancellable(&state, self.verifier.verify(token))
                .await?
                .map_err(|e| {
                    AuthError::unauthenticated(format!("id token verification failed: {e}"))
                })?;
            self.check_token(&id_token)?;

            let mut claims: Claims = id_token.claims().map_err(|e| {
                AuthError::unauthenticated(format!("error resolving claims in identity token: {e}"))
            })?;
            if let Some(decode) = &self.additional_claims {
                let extra = decode(&id_token).map_err(|e| {
                    AuthError::unauthenticated(format!("error resolving additional claims: {e}"))
                })?;
                claims.set_additional(extra);
            }
            Ok::<_, AuthError>(claims)
        }
        .await;

        let claims = match outcome {
            Ok(claims) => Arc::new(claims),
            Err(e) => {
                let label = if matches!(e, AuthError::Cancelled) { "cancelled" } else { "rejected" };
                metrics::counter!("auth_verifications_total", "outcome" => label).increment(1);
                tracing::debug!(error = %e, "Token verification failed");
                return Err(e);
            }
        };

        let subject = (self.id_resolver)(&claims);
        metrics::counter!("auth_verifications_total", "outcome" => "verified").increment(1);
        tracing::debug!(subject = %subject, "Token verified");

        let state = state.with_authenticated(Authenticated {
            subject,
            claims: claims.clone(),
        });
        Ok((state, claims))
    }

    async fn authorize(
        &self,
        state: RequestState,
        claims: Arc<Claims>,
        resource: &str,
        action: &str,
        request: &RawRequest,
    ) -> Result<(RequestState, AuthorizationResult), AuthError> {
        let Some(authorizer) = &self.authorizer else {
            tracing::debug!(resource, action, "No authorizer configured, denying");
            metrics::counter!("auth_decisions_total", "allowed" => "false").increment(1);
            return Ok((state, AuthorizationResult::deny()));
        };

        let mut roles = BTreeSet::new();
        if let Some(role) = self.admin_role(&claims) {
            roles.insert(role.to_string());
        }

        let mut resource_id = String::new();
        if let Some(identifier) = &self.resource_identifier {
            resource_id = cancellable(&state, identifier.identify(&state, request))
                .await?
                .map_err(|e| AuthError::resolver("resource identifier", e))?;
        }

        let subject = state.current_user().to_string();
        if let Some(resolver) = &self.role_binding_resolver {
            let bound = cancellable(&state, resolver.role_bindings(&state, &subject))
                .await?
                .map_err(|e| AuthError::resolver("role binding resolver", e))?;
            roles.extend(bound);
        }

        let mut attributes = HashMap::new();
        if let Some(resolver) = &self.resource_resolver {
            let query = ResourceQuery {
                subject: subject.clone(),
                resource: resource.to_string(),
                action: action.to_string(),
                resource_id: resource_id.clone(),
            };
            attributes = cancellable(&state, resolver.resolve(&state, &query))
                .await?
                .map_err(|e| AuthError::resolver("resource resolver", e))?;
        }

        let request = AuthorizationRequest {
            app: self.app_name.clone(),
            service: self.service_name.clone(),
            subject,
            resource: resource.to_string(),
            resource_id,
            action: action.to_string(),
            claims,
            data: AuthorizationData {
                role_bindings: roles.iter().cloned().collect(),
                resource: attributes,
            },
        };

        let result = cancellable(&state, authorizer.authorize(&state, &request))
            .await?
            .map_err(|e| AuthError::resolver("authorizer", e))?;

        metrics::counter!("auth_decisions_total", "allowed" => result.allowed.to_string())
            .increment(1);
        tracing::debug!(
            subject = %request.subject,
            resource = %request.resource,
            action = %request.action,
            allowed = result.allowed,
            "Authorization decided"
        );

        let state = if result.allowed {
            state.with_authorized(Authorized { roles })
        } else {
            state
        };
        Ok((state, result))
    }
}

/// Builder for [`AuthService`].
#[derive(Default)]
pub struct AuthServiceBuilder {
    app_name: String,
    service_name: String,
    issuer: String,
    audience: Option<String>,
    required_claims: HashMap<String, String>,
    leeway: Duration,
    verifier: Option<Arc<dyn TokenVerifier>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    id_resolver: Option<IdResolver>,
    additional_claims: Option<ExtensionDecoder>,
    role_binding_resolver: Option<Arc<dyn RoleBindingResolver>>,
    resource_resolver: Option<Arc<dyn ResourceResolver>>,
    resource_identifier: Option<Arc<dyn ResourceIdentifier>>,
    admin_group: Option<(String, String)>,
}

impl AuthServiceBuilder {
    /// Application name sent with every authorization request.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Service name sent with every authorization request.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Trusted token issuer. Required.
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Audience that must appear in every token. Unchecked when unset.
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Claims that must be present with exactly these string values.
    pub fn required_claims(mut self, claims: HashMap<String, String>) -> Self {
        self.required_claims = claims;
        self
    }

    /// Clock skew tolerated when checking expiry.
    pub fn leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Signature verifier. Required.
    pub fn verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// How the current user is named. Defaults to the email claim.
    pub fn id_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Claims) -> String + Send + Sync + 'static,
    {
        self.id_resolver = Some(Arc::new(resolver));
        self
    }

    /// Also decode every token into `T`, reachable via [`Claims::additional`].
    pub fn additional_claims<T>(mut self) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.additional_claims = Some(Arc::new(
            |token: &IdToken| -> Result<Arc<dyn Any + Send + Sync>, serde_json::Error> {
                let value: T = token.claims()?;
                Ok(Arc::new(value))
            },
        ));
        self
    }

    pub fn role_binding_resolver(mut self, resolver: impl RoleBindingResolver + 'static) -> Self {
        self.role_binding_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn resource_resolver(mut self, resolver: impl ResourceResolver + 'static) -> Self {
        self.resource_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn resource_identifier(mut self, identifier: impl ResourceIdentifier + 'static) -> Self {
        self.resource_identifier = Some(Arc::new(identifier));
        self
    }

    /// Grant `role` to subjects whose groups contain `group`.
    pub fn admin_group_role(mut self, group: impl Into<String>, role: impl Into<String>) -> Self {
        self.admin_group = Some((group.into(), role.into()));
        self
    }

    pub fn build(self) -> Result<AuthService, AuthError> {
        if self.issuer.is_empty() {
            return Err(AuthError::Config("token issuer url is empty".into()));
        }
        let verifier = self
            .verifier
            .ok_or_else(|| AuthError::Config("no token verifier configured".into()))?;
        if let Some((group, role)) = &self.admin_group {
            if group.is_empty() || role.is_empty() {
                return Err(AuthError::Config("admin group and role must both be set".into()));
            }
        }

        tracing::info!(
            token_issuer = %self.issuer,
            audience = ?self.audience,
            authorizer = self.authorizer.is_some(),
            "Auth runtime initialized"
        );

        Ok(AuthService {
            app_name: self.app_name,
            service_name: self.service_name,
            issuer: self.issuer,
            audience: self.audience,
            required_claims: self.required_claims,
            leeway: self.leeway,
            verifier,
            authorizer: self.authorizer,
            id_resolver: self
                .id_resolver
                .unwrap_or_else(|| Arc::new(|claims: &Claims| claims.email.clone())),
            additional_claims: self.additional_claims,
            role_binding_resolver: self.role_binding_resolver,
            resource_resolver: self.resource_resolver,
            resource_identifier: self.resource_identifier,
            admin_group: self.admin_group,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Accepts any token whose text is a JSON payload.
    struct JsonVerifier;

    #[async_trait]
    impl TokenVerifier for JsonVerifier {
        async fn verify(&self, token: &str) -> Result<IdToken, BoxError> {
            IdToken::from_payload(serde_json::from_str(token)?)
        }
    }

    /// Never answers.
    struct HangingVerifier;

    #[async_trait]
    impl TokenVerifier for HangingVerifier {
        async fn verify(&self, _token: &str) -> Result<IdToken, BoxError> {
            std::future::pending().await
        }
    }

    fn token(exp_offset: i64, extra: serde_json::Value) -> String {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let mut payload = serde_json::json!({
            "iss": "https://issuer.example",
            "aud": "my-service",
            "sub": "u-1",
            "email": "alice@example.com",
            "exp": now + exp_offset,
        });
        if let (Some(obj), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
            obj.extend(extra);
        }
        payload.to_string()
    }

    fn builder() -> AuthServiceBuilder {
        AuthService::builder()
            .app_name("app")
            .service_name("svc")
            .issuer("https://issuer.example")
            .audience("my-service")
            .verifier(Arc::new(JsonVerifier))
    }

    async fn allow_read(req: AuthorizationRequest) -> Result<AuthorizationResult, BoxError> {
        Ok(if req.action == "read" {
            AuthorizationResult::allow()
        } else {
            AuthorizationResult::deny()
        })
    }

    #[tokio::test]
    async fn verify_attaches_identity() {
        let auth = builder().build().unwrap();
        let (state, claims) = auth
            .verify(RequestState::default(), &token(60, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(state.current_user(), "alice@example.com");
        assert_eq!(claims.subject, "u-1");
    }

    #[tokio::test]
    async fn verify_rejects_expired_token() {
        let auth = builder().build().unwrap();
        let err = auth
            .verify(RequestState::default(), &token(-60, serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn leeway_tolerates_small_skew() {
        let auth = builder().leeway(Duration::from_secs(120)).build().unwrap();
        assert!(auth
            .verify(RequestState::default(), &token(-60, serde_json::json!({})))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn verify_checks_issuer_audience_and_required_claims() {
        let auth = builder()
            .required_claims([("hd".to_string(), "example.com".to_string())].into())
            .build()
            .unwrap();
        let state = RequestState::default();

        let wrong_iss = token(60, serde_json::json!({"iss": "https://evil.example", "hd": "example.com"}));
        assert!(auth.verify(state.clone(), &wrong_iss).await.is_err());

        let wrong_aud = token(60, serde_json::json!({"aud": "other", "hd": "example.com"}));
        assert!(auth.verify(state.clone(), &wrong_aud).await.is_err());

        let missing_claim = token(60, serde_json::json!({}));
        assert!(auth.verify(state.clone(), &missing_claim).await.is_err());

        let good = token(60, serde_json::json!({"hd": "example.com"}));
        assert!(auth.verify(state, &good).await.is_ok());
    }

    #[tokio::test]
    async fn additional_claims_are_decoded() {
        #[derive(Debug, Deserialize)]
        struct Tenant {
            tenant: String,
        }
        let auth = builder().additional_claims::<Tenant>().build().unwrap();
        let (_, claims) = auth
            .verify(RequestState::default(), &token(60, serde_json::json!({"tenant": "acme"})))
            .await
            .unwrap();
        assert_eq!(claims.additional::<Tenant>().unwrap().tenant, "acme");
    }

    #[tokio::test]
    async fn custom_id_resolver() {
        let auth = builder().id_resolver(|c| c.subject.clone()).build().unwrap();
        let (state, _) = auth
            .verify(RequestState::default(), &token(60, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(state.current_user(), "u-1");
    }

    #[tokio::test]
    async fn verify_observes_cancellation() {
        let auth = builder().verifier(Arc::new(HangingVerifier)).build().unwrap();
        let cancel = CancellationToken::new();
        let state = RequestState::default().with_cancellation(cancel.clone());
        cancel.cancel();
        let err = auth.verify(state, "anything").await.unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
    }

    #[tokio::test]
    async fn no_authorizer_denies() {
        let auth = builder().build().unwrap();
        let claims = Arc::new(Claims {
            groups: vec!["admins".into()],
            ..Claims::default()
        });
        let (state, result) = auth
            .authorize(RequestState::default(), claims, "doc", "read", &RawRequest::rpc("/x", None))
            .await
            .unwrap();
        assert!(!result.allowed);
        assert!(state.authorized().is_none());
    }

    #[tokio::test]
    async fn decision_is_returned_verbatim() {
        let auth = builder().authorizer(allow_read).build().unwrap();
        let req = RawRequest::rpc("/docs.Docs/Get", None);
        let claims = Arc::new(Claims::default());

        let (state, read) = auth
            .authorize(RequestState::default(), claims.clone(), "doc", "read", &req)
            .await
            .unwrap();
        assert!(read.allowed);
        assert!(state.authorized().is_some());

        let (state, write) = auth
            .authorize(RequestState::default(), claims, "doc", "write", &req)
            .await
            .unwrap();
        assert!(!write.allowed);
        assert!(state.authorized().is_none());
    }

    #[tokio::test]
    async fn admin_group_grants_admin_role() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = seen.clone();
        let auth = builder()
            .admin_group_role("admins", "admin")
            .role_binding_resolver(|_subject: String| async { Ok::<Vec<String>, BoxError>(Vec::new()) })
            .authorizer(move |req: AuthorizationRequest| {
                let captured = captured.clone();
                async move {
                    if let Ok(mut seen) = captured.lock() {
                        *seen = req.data.role_bindings.clone();
                    }
                    Ok::<_, BoxError>(AuthorizationResult::allow())
                }
            })
            .build()
            .unwrap();
        let claims = Arc::new(Claims {
            groups: vec!["eng".into(), "admins".into()],
            ..Claims::default()
        });

        let (state, _) = auth
            .authorize(RequestState::default(), claims, "doc", "delete", &RawRequest::rpc("/x", None))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["admin".to_string()]);
        assert!(state.has_role("admin"));
    }

    #[tokio::test]
    async fn roles_are_deduplicated_and_resolvers_see_request() {
        let auth = builder()
            .admin_group_role("admins", "admin")
            .role_binding_resolver(|subject: String| async move {
                assert_eq!(subject, "alice@example.com");
                Ok::<_, BoxError>(vec!["viewer".to_string(), "admin".to_string()])
            })
            .resource_identifier(|req: RawRequest| async move {
                match req {
                    RawRequest::Rpc { method, .. } => Ok::<_, BoxError>(format!("{method}#42")),
                    RawRequest::Http { .. } => Ok("http".to_string()),
                }
            })
            .resource_resolver(|query: ResourceQuery| async move {
                assert_eq!(query.resource_id, "/docs.Docs/Get#42");
                Ok::<_, BoxError>(HashMap::from([("owner".to_string(), query.subject)]))
            })
            .authorizer(|req: AuthorizationRequest| async move {
                let ok = req.data.role_bindings == ["admin", "viewer"]
                    && req.data.resource.get("owner").map(String::as_str) == Some("alice@example.com")
                    && req.app == "app"
                    && req.service == "svc";
                Ok::<_, BoxError>(AuthorizationResult {
                    allowed: ok,
                    resource_matched: ok,
                })
            })
            .build()
            .unwrap();

        let (state, _) = auth
            .verify(RequestState::default(), &token(60, serde_json::json!({"groups": ["admins"]})))
            .await
            .unwrap();
        let claims = state.claims().cloned().unwrap();
        let (_, result) = auth
            .authorize(state, claims, "doc", "read", &RawRequest::rpc("/docs.Docs/Get", None))
            .await
            .unwrap();
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn resolver_error_aborts_without_calling_authorizer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let auth = builder()
            .role_binding_resolver(|_s: String| async { Err::<Vec<String>, BoxError>("lookup failed".into()) })
            .authorizer(move |_req: AuthorizationRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, BoxError>(AuthorizationResult::allow()) }
            })
            .build()
            .unwrap();

        let err = auth
            .authorize(
                RequestState::default(),
                Arc::new(Claims::default()),
                "doc",
                "read",
                &RawRequest::rpc("/x", None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Resolver { stage: "role binding resolver", .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn build_requires_issuer_and_verifier() {
        assert!(AuthService::builder().verifier(Arc::new(JsonVerifier)).build().is_err());
        assert!(AuthService::builder().issuer("https://issuer.example").build().is_err());
    }
}
