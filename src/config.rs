//! Runtime configuration read from the process environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use secrecy::Secret;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.to_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(anyhow::anyhow!(
                "{} is not a supported environment. Use either `development` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub secret_token: Secret<String>,
    pub token_ttl_days: i64,
    pub cookie_domain: Option<String>,
    pub environment: Environment,
    pub media_root: PathBuf,
    pub db_timeout: Duration,
    /// Account granted staff rights at startup and on registration.
    pub admin_email: Option<String>,
}

impl Settings {
    #[tracing::instrument(name = "Load settings from environment")]
    pub fn from_env() -> anyhow::Result<Self> {
        let secret_token = std::env::var("SECRET_TOKEN").context("SECRET_TOKEN must be set")?;
        if secret_token.trim().is_empty() {
            anyhow::bail!("SECRET_TOKEN must not be empty");
        }

        let environment = Environment::parse(
            &std::env::var("ENVIRONMENT").unwrap_or_else(|_| "production".to_string()),
        )?;

        let settings = Settings {
            host: std::env::var("LMS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_var("PORT", 3001)?,
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://lms.db".to_string()),
            secret_token: Secret::new(secret_token),
            token_ttl_days: parse_var("TOKEN_TTL_DAYS", 90)?,
            cookie_domain: std::env::var("COOKIE_DOMAIN")
                .ok()
                .filter(|domain| !domain.trim().is_empty()),
            environment,
            media_root: std::env::var("MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("media")),
            db_timeout: Duration::from_millis(parse_var("DB_TIMEOUT_MS", 10_000)?),
            admin_email: std::env::var("LMS_ADMIN_EMAIL")
                .ok()
                .map(|email| email.trim().to_lowercase())
                .filter(|email| !email.is_empty()),
        };

        tracing::info!(
            host = %settings.host,
            port = settings.port,
            environment = ?settings.environment,
            media_root = %settings.media_root.display(),
            admin_email = ?settings.admin_email,
            "Settings loaded"
        );
        Ok(settings)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Settings {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: "sqlite::memory:".to_string(),
            secret_token: Secret::new("test-secret-token".to_string()),
            token_ttl_days: 1,
            cookie_domain: None,
            environment: Environment::Development,
            media_root: std::env::temp_dir().join(format!("lms-media-{}", uuid::Uuid::new_v4())),
            db_timeout: Duration::from_secs(5),
            admin_email: None,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parsing_is_case_insensitive() {
        assert_eq!(Environment::parse("Development").unwrap(), Environment::Development);
        assert_eq!(Environment::parse("PROD").unwrap(), Environment::Production);
        assert!(Environment::parse("staging").is_err());
    }

    #[test]
    fn address_joins_host_and_port() {
        let mut settings = Settings::for_tests();
        settings.port = 8080;
        assert_eq!(settings.address(), "127.0.0.1:8080");
    }
}
