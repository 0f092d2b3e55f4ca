use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

const DEFAULT_PORT: u16 = 8160;
const DEFAULT_ORIGIN: &str = "http://localhost:3000";
const DEFAULT_PROGRAMS_FILE: &str = "programs.json";
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX_ATTEMPTS: u32 = 10;

/// Environment-driven server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub admin_user: String,
    pub admin_password: String,
    pub allowed_origins: Vec<String>,
    pub programs_file: PathBuf,
    pub rate_limit_window: Duration,
    pub rate_limit_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a key lookup, so parsing is testable without touching the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = match lookup("TTYHUB_HOST") {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid TTYHUB_HOST: {value}"))?,
            None => IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        let port = match lookup("TTYHUB_PORT") {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid TTYHUB_PORT: {value}"))?,
            None => DEFAULT_PORT,
        };

        let Some(admin_user) = lookup("TTYHUB_ADMIN_USER") else {
            bail!("TTYHUB_ADMIN_USER must be set");
        };
        let Some(admin_password) = lookup("TTYHUB_ADMIN_PASSWORD") else {
            bail!("TTYHUB_ADMIN_PASSWORD must be set");
        };
        if admin_user.is_empty() || admin_password.is_empty() {
            bail!("admin credentials must not be empty");
        }

        let allowed_origins = match lookup("TTYHUB_ALLOWED_ORIGINS") {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec![DEFAULT_ORIGIN.to_string()],
        };

        let programs_file = lookup("TTYHUB_PROGRAMS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRAMS_FILE));

        let window_secs = match lookup("TTYHUB_RATE_LIMIT_WINDOW_SECS") {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid TTYHUB_RATE_LIMIT_WINDOW_SECS: {value}"))?,
            None => DEFAULT_RATE_LIMIT_WINDOW_SECS,
        };
        let rate_limit_max_attempts = match lookup("TTYHUB_RATE_LIMIT_MAX_ATTEMPTS") {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid TTYHUB_RATE_LIMIT_MAX_ATTEMPTS: {value}"))?,
            None => DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
        };

        Ok(Self {
            host,
            port,
            admin_user,
            admin_password,
            allowed_origins,
            programs_file,
            rate_limit_window: Duration::from_secs(window_secs),
            rate_limit_max_attempts,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_lookup(lookup_from(&[
            ("TTYHUB_ADMIN_USER", "admin"),
            ("TTYHUB_ADMIN_PASSWORD", "secret"),
        ]))
        .expect("config");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.allowed_origins, vec![DEFAULT_ORIGIN.to_string()]);
        assert_eq!(config.rate_limit_max_attempts, 10);
    }

    #[test]
    fn missing_credentials_is_an_error() {
        assert!(Config::from_lookup(|_| None).is_err());
        assert!(
            Config::from_lookup(lookup_from(&[("TTYHUB_ADMIN_USER", "admin")])).is_err()
        );
    }

    #[test]
    fn origins_are_split_and_trimmed() {
        let config = Config::from_lookup(lookup_from(&[
            ("TTYHUB_ADMIN_USER", "admin"),
            ("TTYHUB_ADMIN_PASSWORD", "secret"),
            (
                "TTYHUB_ALLOWED_ORIGINS",
                "https://a.example, https://b.example ,",
            ),
        ]))
        .expect("config");
        assert_eq!(
            config.allowed_origins,
            vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ]
        );
    }

    #[test]
    fn bad_port_is_an_error() {
        let result = Config::from_lookup(lookup_from(&[
            ("TTYHUB_ADMIN_USER", "admin"),
            ("TTYHUB_ADMIN_PASSWORD", "secret"),
            ("TTYHUB_PORT", "notaport"),
        ]));
        assert!(result.is_err());
    }
}
