use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::engine::EngineKind;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_chunk() -> usize {
    4096
}

fn default_timeout() -> u64 {
    60
}

fn default_keep_alive_timeout() -> u64 {
    15
}

fn default_max_clients() -> usize {
    10
}

fn default_max_keep_alive_requests() -> usize {
    10
}

fn default_x_forwarded_for() -> bool {
    true
}

fn default_engine() -> EngineKind {
    EngineKind::ForkPerConn
}

fn default_logmask() -> String {
    "NONE".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_start_servers() -> usize {
    4
}

fn default_min_spare_servers() -> usize {
    1
}

fn default_max_spare_servers() -> usize {
    12
}

fn default_max_requests_per_child() -> usize {
    250
}

fn default_verify_delay() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_chunk")]
    pub chunk: usize,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout: u64,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default)]
    pub max_connections: u64,
    #[serde(default = "default_max_keep_alive_requests")]
    pub max_keep_alive_requests: usize,
    /// Via token; unset means "<hostname> (weir/<version>)", empty disables Via.
    #[serde(default)]
    pub via: Option<String>,
    #[serde(default = "default_x_forwarded_for")]
    pub x_forwarded_for: bool,
    #[serde(default = "default_engine")]
    pub engine: EngineKind,
    #[serde(default = "default_logmask")]
    pub logmask: String,
    #[serde(default)]
    pub logfile: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_start_servers")]
    pub start_servers: usize,
    #[serde(default = "default_min_spare_servers")]
    pub min_spare_servers: usize,
    #[serde(default = "default_max_spare_servers")]
    pub max_spare_servers: usize,
    #[serde(default = "default_max_requests_per_child")]
    pub max_requests_per_child: usize,
    #[serde(default = "default_verify_delay")]
    pub verify_delay: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            chunk: default_chunk(),
            timeout: default_timeout(),
            keep_alive_timeout: default_keep_alive_timeout(),
            max_clients: default_max_clients(),
            max_connections: 0,
            max_keep_alive_requests: default_max_keep_alive_requests(),
            via: None,
            x_forwarded_for: default_x_forwarded_for(),
            engine: default_engine(),
            logmask: default_logmask(),
            logfile: None,
            log: default_log_format(),
            max_header_size: default_max_header_size(),
            max_request_body_size: default_max_request_body_size(),
            start_servers: default_start_servers(),
            min_spare_servers: default_min_spare_servers(),
            max_spare_servers: default_max_spare_servers(),
            max_requests_per_child: default_max_requests_per_child(),
            verify_delay: default_verify_delay(),
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = cli.config.as_deref() {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        } else if let Some(path) = default_config_candidate() {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("WEIR")
                .separator("__")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("host", cli.host.clone())
            .map_err(to_anyhow)?
            .set_override_option("port", cli.port.map(i64::from))
            .map_err(to_anyhow)?
            .set_override_option("engine", cli.engine.map(|e| e.as_config_str()))
            .map_err(to_anyhow)?
            .set_override_option("logmask", cli.logmask.clone())
            .map_err(to_anyhow)?;

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_secs(self.verify_delay)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunk > 0, "chunk must be greater than 0");
        ensure!(
            self.timeout > 0,
            "timeout must be greater than 0 seconds (got {})",
            self.timeout
        );
        ensure!(
            self.keep_alive_timeout > 0,
            "keep_alive_timeout must be greater than 0 seconds (got {})",
            self.keep_alive_timeout
        );
        ensure!(
            self.max_keep_alive_requests > 0,
            "max_keep_alive_requests must be at least 1 (got {})",
            self.max_keep_alive_requests
        );
        ensure!(self.max_clients > 0, "max_clients must be at least 1");
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0"
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0"
        );
        if matches!(self.engine, EngineKind::Scoreboard) {
            ensure!(
                self.start_servers > 0,
                "start_servers must be at least 1 for the scoreboard engine"
            );
            ensure!(
                self.max_requests_per_child > 0,
                "max_requests_per_child must be at least 1"
            );
            ensure!(
                self.min_spare_servers <= self.max_spare_servers,
                "min_spare_servers ({}) must not exceed max_spare_servers ({})",
                self.min_spare_servers,
                self.max_spare_servers
            );
            if self.start_servers > self.max_clients {
                bail!(
                    "start_servers ({}) must not exceed max_clients ({})",
                    self.start_servers,
                    self.max_clients
                );
            }
            ensure!(self.verify_delay > 0, "verify_delay must be at least 1 second");
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn default_config_candidate() -> Option<PathBuf> {
    let candidate = Path::new("weir.toml");
    candidate.exists().then(|| candidate.to_path_buf())
}
