use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use appshade::config::{Config, ServerConfig};
use appshade::server;

#[derive(Parser, Debug)]
#[command(name = "appshade")]
#[command(about = "Multi-tenant support ticket service")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/appshade/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the HTTP API server
  Serve {
    /// Listen address override, e.g. 0.0.0.0:3000
    #[arg(short, long)]
    addr: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Serve { addr } => {
      if let Some(addr) = addr {
        config.server.addr = addr;
      }

      let _guard = init_tracing(&config.server)?;
      server::serve(&config.server).await
    }
  }
}

/// Console logging, plus a non-blocking file layer when configured.
/// The returned guard must live for the duration of the process.
fn init_tracing(config: &ServerConfig) -> Result<Option<WorkerGuard>> {
  match &config.log_file {
    Some(log_file) => {
      let directory = log_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = log_file
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", log_file.display()))?;

      let appender = tracing_appender::rolling::never(directory, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(writer)
        .with_ansi(false)
        .init();

      Ok(Some(guard))
    }
    None => {
      fmt().with_env_filter(EnvFilter::from_default_env()).init();
      Ok(None)
    }
  }
}
