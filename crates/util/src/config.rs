use std::{env, fmt, net::SocketAddr, path::PathBuf};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://tenancy.db?mode=rwc";
pub const DEFAULT_PARTITION_DIR: &str = "partitions";
pub const DEFAULT_BASE_DOMAIN: &str = "localhost:5173";
pub const DEFAULT_PUBLIC_HOSTS: &str = "localhost";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    /// Connection string of the registry database holding tenants and domains.
    pub database_url: String,
    /// Directory under which every tenant partition is created.
    pub partition_dir: PathBuf,
    /// Suffix appended to identifiers to build primary hostnames.
    pub base_domain: String,
    /// Hostnames routed to the bootstrap `public` tenant.
    pub public_hosts: Vec<String>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        if database_url.trim().is_empty() {
            return Err(ConfigError::MissingValue("DATABASE_URL"));
        }

        let partition_dir = env::var("PARTITION_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_PARTITION_DIR));

        let base_domain = parse_base_domain(
            &env::var("BASE_DOMAIN").unwrap_or_else(|_| DEFAULT_BASE_DOMAIN.to_string()),
        )?;

        let public_hosts = parse_host_list(
            &env::var("PUBLIC_HOSTS").unwrap_or_else(|_| DEFAULT_PUBLIC_HOSTS.to_string()),
        );

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            partition_dir,
            base_domain,
            public_hosts,
        })
    }
}

fn parse_base_domain(raw: &str) -> Result<String, ConfigError> {
    let value = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if value.is_empty() {
        return Err(ConfigError::MissingValue("BASE_DOMAIN"));
    }
    if value.contains("://") || value.contains('/') || value.starts_with('.') {
        return Err(ConfigError::InvalidBaseDomain(raw.to_string()));
    }
    Ok(value)
}

fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().trim_end_matches('.').to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingValue(&'static str),
    InvalidBaseDomain(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingValue(name) => write!(f, "{name} must not be empty"),
            Self::InvalidBaseDomain(value) => write!(
                f,
                "BASE_DOMAIN must be a bare host such as 'example.com' (got {value})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_BIND_ADDR, ENV_GUARD};

    fn clear_env() {
        for key in [
            "APP_ENV",
            "APP_BIND_ADDR",
            "DATABASE_URL",
            "PARTITION_DIR",
            "BASE_DOMAIN",
            "PUBLIC_HOSTS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.partition_dir, PathBuf::from(DEFAULT_PARTITION_DIR));
        assert_eq!(config.base_domain, DEFAULT_BASE_DOMAIN);
        assert_eq!(config.public_hosts, vec!["localhost".to_string()]);
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        env::remove_var("APP_ENV");
    }

    #[test]
    fn parses_production_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("BASE_DOMAIN", "Example.COM.");
        env::set_var("PUBLIC_HOSTS", " admin.example.com , ,Example.com");
        env::set_var("PARTITION_DIR", "/var/lib/tenancy");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.base_domain, "example.com");
        assert_eq!(
            config.public_hosts,
            vec!["admin.example.com".to_string(), "example.com".to_string()]
        );
        assert_eq!(config.partition_dir, PathBuf::from("/var/lib/tenancy"));

        clear_env();
    }

    #[test]
    fn rejects_base_domain_with_scheme() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("BASE_DOMAIN", "https://example.com");

        let err = AppConfig::from_env().expect_err("scheme should be rejected");
        assert!(matches!(err, ConfigError::InvalidBaseDomain(_)));

        clear_env();
    }
}
