//! Process configuration, read from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use dialtone_infra::{HttpGatewayConfig, OrchestratorConfig, SweeperConfig};

const DEV_JWT_SECRET: &str = "dev-secret";
const DEV_WEBHOOK_SECRET: &str = "dev-webhook-secret";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is not valid: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("{set} is set but {missing} is not")]
    Incomplete {
        set: &'static str,
        missing: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub webhook_secret: String,
    /// Postgres document store; in-memory when absent.
    pub database_url: Option<String>,
    /// Upstream compliance API; the sandbox gateway when absent.
    pub gateway: Option<HttpGatewayConfig>,
    pub orchestrator: OrchestratorConfig,
    pub sweeper: SweeperConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bind_addr = match var("BIND_ADDR") {
            Some(raw) => raw.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
                name: "BIND_ADDR",
                reason: e.to_string(),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let jwt_secret = var("JWT_SECRET").unwrap_or_else(|| {
            tracing::warn!("JWT_SECRET not set; using insecure dev default");
            DEV_JWT_SECRET.to_string()
        });
        let webhook_secret = var("WEBHOOK_SECRET").unwrap_or_else(|| {
            tracing::warn!("WEBHOOK_SECRET not set; using insecure dev default");
            DEV_WEBHOOK_SECRET.to_string()
        });

        let api_timeout = secs(&var, "COMPLIANCE_API_TIMEOUT_SECS", 30)?;
        let gateway = match (var("COMPLIANCE_API_URL"), var("COMPLIANCE_API_KEY")) {
            (Some(base_url), Some(api_key)) => Some(HttpGatewayConfig {
                base_url,
                api_key,
                timeout: api_timeout,
            }),
            (Some(_), None) => {
                return Err(ConfigError::Incomplete {
                    set: "COMPLIANCE_API_URL",
                    missing: "COMPLIANCE_API_KEY",
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::Incomplete {
                    set: "COMPLIANCE_API_KEY",
                    missing: "COMPLIANCE_API_URL",
                });
            }
            (None, None) => {
                tracing::warn!("COMPLIANCE_API_URL not set; upstream calls go to the sandbox gateway");
                None
            }
        };

        let orchestrator = OrchestratorConfig::default()
            .with_reconciliation_timeout(secs(&var, "RECONCILIATION_TIMEOUT_SECS", 900)?);
        let sweeper = SweeperConfig::default()
            .with_interval(secs(&var, "SWEEP_INTERVAL_SECS", 60)?)
            .with_poll_interval(secs(&var, "SWEEP_POLL_INTERVAL_SECS", 900)?);

        Ok(Self {
            bind_addr,
            jwt_secret,
            webhook_secret,
            database_url: var("DATABASE_URL"),
            gateway,
            orchestrator,
            sweeper,
        })
    }
}

fn secs(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let Some(raw) = var(name) else {
        return Ok(Duration::from_secs(default));
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".into(),
        }),
        Ok(n) => Ok(Duration::from_secs(n)),
        Err(e) => Err(ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}
