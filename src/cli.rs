use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::engine::EngineKind;

#[derive(Debug, Clone, Parser)]
#[command(name = "weir", about = "Intercepting HTTP/1.x filter proxy")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./weir.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind interface, overriding the configuration file.
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port, overriding the configuration file. 0 picks a free port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Concurrency engine, overriding the configuration file.
    #[arg(long, value_enum)]
    pub engine: Option<EngineKind>,

    /// Log mask, e.g. "STATUS|FILTER" or "all".
    #[arg(long)]
    pub logmask: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
