use anyhow::{Context, Result};
use std::{env, path::PathBuf};

/// Process-wide configuration, loaded once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub tls_port: u16,
    pub http_port: u16,
    pub tls_cert_file: PathBuf,
    pub tls_key_file: PathBuf,
    pub static_dir: PathBuf,
    pub streams_dir: PathBuf,
    pub log_level: String,
    pub dev_mode: bool,
    pub ytdlp_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let tls_port = env_u16("PORT", 8443)?;
        let http_port = env_u16("HTTP_PORT", 8080)?;

        Ok(Self {
            tls_port,
            http_port,
            tls_cert_file: env_path("TLS_CERT_FILE", "./certs/server.crt"),
            tls_key_file: env_path("TLS_KEY_FILE", "./certs/server.key"),
            static_dir: env_path("STATIC_DIR", "./web"),
            streams_dir: env_path("STREAMS_DIR", "./data/streams"),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dev_mode: env_bool("DEV_MODE", false),
            ytdlp_path: env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),
        })
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env::var(key).unwrap_or_else(|_| default.to_string()))
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> Result<u16> {
    match env::var(key) {
        Ok(v) => v.parse::<u16>().with_context(|| format!("invalid {key}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_used_when_env_unset() {
        for key in [
            "PORT",
            "HTTP_PORT",
            "TLS_CERT_FILE",
            "TLS_KEY_FILE",
            "STATIC_DIR",
            "STREAMS_DIR",
            "LOG_LEVEL",
            "DEV_MODE",
            "YTDLP_PATH",
        ] {
            env::remove_var(key);
        }
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.tls_port, 8443);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.dev_mode);
        assert_eq!(cfg.ytdlp_path, "yt-dlp");
    }
}
