use secrecy::Secret;
use service_core::config::{self as core_config, get_env, get_env_parsed};
use service_core::error::AppError;

#[derive(Debug)]
pub struct MembershipConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub mongodb: MongoConfig,
    pub gateway: GatewayConfig,
    pub webhook: WebhookConfig,
    pub suspension_days_per_year: u32,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

/// Payment processor connection settings.
#[derive(Debug)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Secret<String>,
    pub timeout_secs: u64,
    /// Status polls after a card-present payment is handed to a reader.
    pub terminal_poll_attempts: u32,
    pub terminal_poll_interval_ms: u64,
    /// Drive the processor's test reader helper instead of waiting for a card.
    pub simulate_terminal: bool,
}

#[derive(Debug)]
pub struct WebhookConfig {
    pub secret: Secret<String>,
    pub tolerance_secs: i64,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
}

impl MembershipConfig {
    pub fn load() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = common.is_production();

        Ok(MembershipConfig {
            service_name: get_env("SERVICE_NAME", Some("membership-service"), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: std::env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            mongodb: MongoConfig {
                uri: get_env("MONGODB_URI", Some("mongodb://localhost:27017"), is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("membership_db"), is_prod)?,
            },
            gateway: GatewayConfig {
                base_url: get_env("BILLING_GATEWAY_URL", Some("https://api.stripe.com"), is_prod)?,
                api_key: Secret::new(get_env("BILLING_GATEWAY_API_KEY", Some(""), is_prod)?),
                timeout_secs: get_env_parsed("BILLING_GATEWAY_TIMEOUT_SECS", 30)?,
                terminal_poll_attempts: get_env_parsed("BILLING_TERMINAL_POLL_ATTEMPTS", 20)?,
                terminal_poll_interval_ms: get_env_parsed("BILLING_TERMINAL_POLL_INTERVAL_MS", 1500)?,
                simulate_terminal: get_env_parsed("BILLING_TERMINAL_SIMULATE", !is_prod)?,
            },
            webhook: WebhookConfig {
                secret: Secret::new(get_env("BILLING_WEBHOOK_SECRET", Some(""), is_prod)?),
                tolerance_secs: get_env_parsed("BILLING_WEBHOOK_TOLERANCE_SECS", 300)?,
            },
            suspension_days_per_year: get_env_parsed("MEMBERSHIP_SUSPENSION_DAYS_PER_YEAR", 60)?,
            smtp: SmtpConfig {
                enabled: get_env_parsed("SMTP_ENABLED", false)?,
                host: get_env("SMTP_HOST", Some("smtp.gmail.com"), false)?,
                port: get_env_parsed("SMTP_PORT", 587)?,
                user: get_env("SMTP_USER", Some(""), false)?,
                password: get_env("SMTP_PASSWORD", Some(""), false)?,
                from_email: get_env("SMTP_FROM_EMAIL", Some("noreply@example.com"), false)?,
                from_name: get_env("SMTP_FROM_NAME", Some("Membership Billing"), false)?,
            },
            common,
        })
    }
}
