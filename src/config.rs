use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::RetryPolicy;
use crate::manager::AuthSettings;

/// Toolkit credential manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the credential SQLite database
    #[arg(short = 'd', long, env = "TOOLKIT_DB_FILE")]
    pub db_file: Option<String>,

    /// Override the OIDC token endpoint (defaults to https://oidc.{region}.amazonaws.com/token)
    #[arg(long, env = "OIDC_ENDPOINT")]
    pub oidc_endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Refresh access tokens this many seconds before they expire
    #[arg(long, env = "TOKEN_REFRESH_THRESHOLD", default_value = "300")]
    pub token_refresh_threshold: u64,

    /// Retries for refreshes that fail with a network error
    #[arg(long, env = "REFRESH_MAX_RETRIES", default_value = "3")]
    pub refresh_max_retries: u32,

    /// Base delay of the refresh backoff in milliseconds
    #[arg(long, env = "REFRESH_BASE_DELAY_MS", default_value = "1000")]
    pub refresh_base_delay_ms: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub http_connect_timeout: u64,

    /// Never open an interactive login prompt
    #[arg(long, env = "NON_INTERACTIVE")]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List connections with their state
    List,

    /// Show the active connection of a feature
    Status { feature: String },

    /// Add an SSO (bearer token) connection
    AddSso {
        id: String,
        #[arg(long)]
        label: String,
        #[arg(long)]
        start_url: String,
        #[arg(long, default_value = "us-east-1")]
        region: String,
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },

    /// Add a static-credential (profile) connection
    AddStatic {
        id: String,
        #[arg(long)]
        label: String,
        #[arg(long)]
        profile: String,
        #[arg(long, default_value = "us-east-1")]
        region: String,
    },

    /// Bind a feature to a connection
    Bind { feature: String, connection: String },

    /// Sign in to a connection, prompting if needed
    Login { connection: String },

    /// Refresh the access token of a connection
    Refresh { connection: String },

    /// Sign out of a connection
    Logout { connection: String },

    /// Forget a connection entirely
    Remove { connection: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub db_file: PathBuf,
    pub oidc_endpoint: Option<String>,

    // Token lifecycle
    pub token_refresh_threshold: u64,
    pub refresh_max_retries: u32,
    pub refresh_base_delay_ms: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    pub log_level: String,
    pub interactive: bool,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        dotenvy::dotenv().ok();
        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args)?, command))
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let db_file = match args.db_file {
            Some(path) => expand_tilde(&path),
            None => default_db_file().context(
                "Could not determine a data directory (use -d or set TOOLKIT_DB_FILE)",
            )?,
        };

        Ok(Config {
            db_file,
            oidc_endpoint: args.oidc_endpoint,

            token_refresh_threshold: args.token_refresh_threshold,
            refresh_max_retries: args.refresh_max_retries,
            refresh_base_delay_ms: args.refresh_base_delay_ms,

            http_connect_timeout: args.http_connect_timeout,
            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
            interactive: !args.non_interactive,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }
        if self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP_CONNECT_TIMEOUT must be greater than zero");
        }
        if self.refresh_max_retries > 10 {
            anyhow::bail!(
                "REFRESH_MAX_RETRIES must be at most 10, got {}",
                self.refresh_max_retries
            );
        }
        if let Some(endpoint) = &self.oidc_endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                anyhow::bail!("OIDC_ENDPOINT must be an http(s) URL: {}", endpoint);
            }
        }
        if let Some(parent) = self.db_file.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        Ok(())
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            refresh_threshold: self.token_refresh_threshold,
            retry: RetryPolicy::new(self.refresh_max_retries, self.refresh_base_delay_ms),
        }
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.http_connect_timeout))
            .timeout(Duration::from_secs(self.http_request_timeout))
            .build()
            .context("Failed to create HTTP client")
    }
}

fn default_db_file() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("toolkit-credentials").join("credentials.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let mut argv = vec!["toolkit-credentials"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_parse_add_sso() {
        let args = parse(&[
            "-d",
            "/tmp/creds.sqlite3",
            "add-sso",
            "c1",
            "--label",
            "Builder ID",
            "--start-url",
            "https://view.awsapps.com/start",
            "--scope",
            "codecatalyst:read_write",
            "--scope",
            "sso:account:access",
        ]);
        assert_eq!(
            args.command,
            Command::AddSso {
                id: "c1".to_string(),
                label: "Builder ID".to_string(),
                start_url: "https://view.awsapps.com/start".to_string(),
                region: "us-east-1".to_string(),
                scopes: vec!["codecatalyst:read_write".to_string(), "sso:account:access".to_string()],
            }
        );

        let config = Config::from_args(args).unwrap();
        assert_eq!(config.db_file, PathBuf::from("/tmp/creds.sqlite3"));
        assert!(config.interactive);
    }

    #[test]
    fn test_auth_settings_from_args() {
        let args = parse(&[
            "-d",
            "/tmp/creds.sqlite3",
            "--token-refresh-threshold",
            "120",
            "--refresh-max-retries",
            "5",
            "--refresh-base-delay-ms",
            "250",
            "--non-interactive",
            "list",
        ]);
        let config = Config::from_args(args).unwrap();
        let settings = config.auth_settings();
        assert_eq!(settings.refresh_threshold, 120);
        assert_eq!(settings.retry, RetryPolicy::new(5, 250));
        assert!(!config.interactive);
    }

    #[test]
    fn test_http_timeouts_from_args() {
        let config = Config::from_args(parse(&["-d", "creds.sqlite3", "list"])).unwrap();
        assert_eq!(config.http_connect_timeout, 10);
        assert_eq!(config.http_request_timeout, 30);

        let config = Config::from_args(parse(&[
            "-d",
            "creds.sqlite3",
            "--http-connect-timeout",
            "3",
            "--http-timeout",
            "15",
            "list",
        ]))
        .unwrap();
        assert_eq!(config.http_connect_timeout, 3);
        assert_eq!(config.http_request_timeout, 15);

        assert!(CliArgs::try_parse_from(["toolkit-credentials", "--http-connect-timeout", "soon", "list"]).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::from_args(parse(&["-d", "creds.sqlite3", "list"])).unwrap();
        assert!(config.validate().is_ok());

        config.oidc_endpoint = Some("ftp://example.com".to_string());
        assert!(config.validate().is_err());

        config.oidc_endpoint = None;
        config.refresh_max_retries = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_subcommand_is_error() {
        assert!(CliArgs::try_parse_from(["toolkit-credentials"]).is_err());
    }
}
