//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that addresses parse and paired settings come together
//! - Validate value ranges (timeouts > 0, limits > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function of the parsed config

use std::net::SocketAddr;

use crate::config::schema::RuntimeConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("listener.tls: cert_path and key_path must both be set")]
    IncompleteTls,

    #[error("auth.issuer must be an absolute URL, got {0:?}")]
    InvalidIssuer(String),

    #[error("auth.admin_group and auth.admin_role must be set together")]
    IncompleteAdminMapping,

    #[error("no protocol server enabled on the listener")]
    NothingToServe,
}

/// Check `config`, returning every problem found.
pub fn validate_config(config: &RuntimeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    check_address(&mut errors, "health.bind_address", &config.health.bind_address);
    if config.http.enabled {
        check_address(&mut errors, "http.bind_address", &config.http.bind_address);
    }
    if config.debug.enabled {
        check_address(&mut errors, "debug.bind_address", &config.debug.bind_address);
    }
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() || tls.key_path.is_empty() {
            errors.push(ValidationError::IncompleteTls);
        }
    }

    if !config.rpc.enabled && !config.gateway.enabled && !config.http.enabled {
        errors.push(ValidationError::NothingToServe);
    }

    let positive: [(&'static str, u64); 9] = [
        ("listener.max_connections", config.listener.max_connections as u64),
        ("mux.peek_timeout_ms", config.mux.peek_timeout_ms),
        ("mux.max_peek_bytes", config.mux.max_peek_bytes as u64),
        ("mux.accept_queue", config.mux.accept_queue as u64),
        ("rpc.max_message_size", config.rpc.max_message_size as u64),
        ("rpc.keepalive_timeout_secs", config.rpc.keepalive_timeout_secs),
        ("timeouts.request_secs", config.timeouts.request_secs),
        ("timeouts.shutdown_phase_secs", config.timeouts.shutdown_phase_secs),
        ("health.success_interval_secs", config.health.success_interval_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::NotPositive(field));
        }
    }
    if config.health.failure_interval_secs == 0 {
        errors.push(ValidationError::NotPositive("health.failure_interval_secs"));
    }
    if config.health.probe_timeout_secs == 0 {
        errors.push(ValidationError::NotPositive("health.probe_timeout_secs"));
    }

    if config.auth.enabled {
        let absolute = url::Url::parse(&config.auth.issuer)
            .map(|u| u.has_host())
            .unwrap_or(false);
        if !absolute {
            errors.push(ValidationError::InvalidIssuer(config.auth.issuer.clone()));
        }
        if config.auth.admin_group.is_some() != config.auth.admin_role.is_some() {
            errors.push(ValidationError::IncompleteAdminMapping);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&RuntimeConfig::default()).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut config = RuntimeConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.listener.tls = Some(TlsConfig {
            cert_path: "cert.pem".into(),
            ..TlsConfig::default()
        });
        config.mux.accept_queue = 0;
        config.auth.enabled = true;
        config.auth.issuer = "issuer.example".into();
        config.auth.admin_group = Some("ops".into());

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: "nowhere".into(),
        }));
        assert!(errors.contains(&ValidationError::IncompleteTls));
        assert!(errors.contains(&ValidationError::NotPositive("mux.accept_queue")));
        assert!(errors.contains(&ValidationError::InvalidIssuer("issuer.example".into())));
        assert!(errors.contains(&ValidationError::IncompleteAdminMapping));
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn keepalive_pings_may_be_disabled_but_need_an_ack_timeout() {
        let mut config = RuntimeConfig::default();
        config.rpc.keepalive_interval_secs = 0;
        assert!(validate_config(&config).is_ok());

        config.rpc.keepalive_timeout_secs = 0;
        assert_eq!(
            validate_config(&config),
            Err(vec![ValidationError::NotPositive("rpc.keepalive_timeout_secs")])
        );
    }

    #[test]
    fn disabled_sections_are_not_checked() {
        let mut config = RuntimeConfig::default();
        config.debug.bind_address = "bogus".into();
        config.auth.issuer = "bogus".into();
        assert!(validate_config(&config).is_ok());

        config.rpc.enabled = false;
        assert_eq!(validate_config(&config), Err(vec![ValidationError::NothingToServe]));
    }
}
