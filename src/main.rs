//! CLI entry point: parses arguments, loads configuration, wires up
//! `tracing`, and hands off to `cdpfgl_server::server::run`.

use clap::Parser;
use cdpfgl_server::config::Config;
use cdpfgl_server::server;

/// Continuous data protection backup server.
#[derive(Parser, Debug)]
#[command(name = "cdpfglserver", version, about)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Overrides the listening port.
    #[arg(long)]
    port: Option<u16>,

    /// Overrides the block/journal storage root.
    #[arg(long = "file-directory")]
    file_directory: Option<String>,

    /// Overrides the fan-out directory depth (2..4).
    #[arg(long = "dir-level")]
    dir_level: Option<usize>,

    /// Enables debug-level logging.
    #[arg(long)]
    debug: bool,
}

fn load_config(args: &Args) -> Config {
    let mut config = match &args.config {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(contents) => match Config::from_toml_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("failed to parse config file {path}: {e}");
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("failed to read config file {path}: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = &args.file_directory {
        config.file_backend.file_directory = dir.clone();
    }
    if let Some(level) = args.dir_level {
        config.file_backend.dir_level = level;
    }

    config
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = load_config(&args);
    let build_date = option_env!("CDPFGL_BUILD_DATE").unwrap_or("unknown").to_string();

    if let Err(e) = server::run(config, build_date).await {
        tracing::error!(error = %e, "server exited with an error");
        std::process::exit(1);
    }
}
