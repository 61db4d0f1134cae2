use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use karfunkel::config::{Config, LogFormat, LogLevel};
use karfunkel::{logging, Karfunkel};
use log::{error, info};

/// Command line arguments. Flags override the configuration file.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// JSON configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Server IP address to bind to
    #[clap(short = 'H', long)]
    host: Option<String>,
    /// Server port to listen on
    #[clap(short, long)]
    port: Option<u16>,
    /// Log verbosity
    #[clap(short, long, value_enum)]
    log_level: Option<LogLevel>,
    /// Log line format
    #[clap(long, value_enum)]
    log_format: Option<LogFormat>,
    /// Plugin to load after core, may be repeated
    #[clap(long = "plugin")]
    plugins: Vec<String>,
}

impl Args {
    fn into_config(self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if !self.plugins.is_empty() {
            config.plugins = self.plugins;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config()?;
    logging::init(config.log_level, config.log_format)?;

    let server = Arc::new(Karfunkel::new(config)?);
    let mut running = tokio::spawn(Arc::clone(&server).start());

    tokio::select! {
        result = &mut running => {
            return match result {
                Ok(result) => result.map_err(Into::into),
                Err(e) => {
                    error!("Server task panicked: {}", e);
                    Err(e.into())
                }
            };
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            server.stop_immediately();
        }
    }

    running.await??;
    Ok(())
}
