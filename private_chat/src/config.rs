use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use serde::Deserialize;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory holding the database and uploaded files.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory for the database and uploaded files.
    pub data_dir: PathBuf,
    /// Maximum upload size in megabytes.
    pub max_upload_mb: u64,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// Token signing secret. Generated and persisted when absent.
    pub jwt_secret: Option<String>,
    /// Lifetime of issued tokens.
    pub token_ttl_minutes: i64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("data_dir", &self.data_dir)
            .field("max_upload_mb", &self.max_upload_mb)
            .field("logging_enabled", &self.logging_enabled)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("token_ttl_minutes", &self.token_ttl_minutes)
            .finish()
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    auth: FileAuth,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FileAuth {
    #[serde(default)]
    jwt_secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    token_ttl_minutes: i64,
}

fn default_port() -> u16 {
    3000
}

fn default_logging() -> bool {
    true
}

fn default_token_ttl() -> i64 {
    60
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileAuth {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_minutes: default_token_ttl(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // built-in defaults
        let mut port = default_port();
        let mut logging = default_logging();
        let mut jwt_secret = None;
        let mut token_ttl_minutes = default_token_ttl();

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("PRIVATE_CHAT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/private_chat.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            port = file_cfg.server.port;
            logging = file_cfg.logging.enabled;
            jwt_secret = file_cfg.auth.jwt_secret;
            token_ttl_minutes = file_cfg.auth.token_ttl_minutes;
        }

        // environment overrides
        if let Ok(p) = std::env::var("PRIVATE_CHAT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("PRIVATE_CHAT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(s) = std::env::var("PRIVATE_CHAT_JWT_SECRET") {
            if !s.is_empty() {
                jwt_secret = Some(s);
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if token_ttl_minutes <= 0 {
            anyhow::bail!("invalid_token_ttl");
        }

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var("DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir);
        let max_upload_mb = std::env::var("MAX_UPLOAD_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            bind,
            data_dir,
            max_upload_mb,
            logging_enabled: logging,
            jwt_secret,
            token_ttl_minutes,
        })
    }

    /// Helper to return the upload limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }
}

/// Determine the default data directory for the server.
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("org", "private_chat", "private_chat")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./private_chat_data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn clear_env() {
        for key in [
            "PRIVATE_CHAT_PORT",
            "PRIVATE_CHAT_LOGGING",
            "PRIVATE_CHAT_JWT_SECRET",
            "PRIVATE_CHAT_CONFIG",
            "BIND",
        ] {
            std::env::remove_var(key);
        }
    }

    fn cli_with(contents: &str) -> (tempfile::TempDir, Cli) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, contents).unwrap();
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        (dir, cli)
    }

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let (_dir, cli) = cli_with(
            "[server]\nport=5555\n[logging]\nenabled=false\n[auth]\njwt_secret=\"s3cret\"\ntoken_ttl_minutes=5\n",
        );
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert!(!cfg.logging_enabled);
        assert_eq!(cfg.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(cfg.token_ttl_minutes, 5);
        assert!(!format!("{:?}", cfg).contains("s3cret"));
    }

    #[test]
    #[serial]
    fn invalid_values_fail() {
        clear_env();
        let (_dir, cli) = cli_with("[server]\nport=80\n");
        assert!(Config::load(&cli).is_err());
        let (_dir, cli) = cli_with("[auth]\ntoken_ttl_minutes=0\n");
        assert!(Config::load(&cli).is_err());
        let (_dir, cli) = cli_with("[server\n");
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    #[serial]
    fn missing_keys_defaults() {
        clear_env();
        let (_dir, cli) = cli_with("");
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3000");
        assert!(cfg.logging_enabled);
        assert!(cfg.jwt_secret.is_none());
        assert_eq!(cfg.token_ttl_minutes, 60);
        assert_eq!(cfg.max_upload_bytes(), 5 * 1024 * 1024);
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        let (_dir, mut cli) = cli_with("[server]\nport=1111\n[auth]\njwt_secret=\"file\"\n");
        std::env::set_var("PRIVATE_CHAT_PORT", "2222");
        std::env::set_var("PRIVATE_CHAT_JWT_SECRET", "env");
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:2222");
        assert_eq!(cfg.jwt_secret.as_deref(), Some("env"));
        cli.port = Some(3333);
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");
        cli.bind = Some("0.0.0.0:4000".into());
        assert_eq!(Config::load(&cli).unwrap().bind, "0.0.0.0:4000");
        clear_env();
    }

    #[test]
    #[serial]
    fn data_dir_from_cli() {
        clear_env();
        let (dir, mut cli) = cli_with("");
        cli.data_dir = Some(dir.path().join("data"));
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.data_dir, dir.path().join("data"));
    }
}
