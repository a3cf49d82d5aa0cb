use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use triggerd::config::AppConfig;

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config_path = PathBuf::from("config.toml");

    // Handle CLI arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("triggerd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("triggerd {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: triggerd [CONFIG]\n");
                println!("Arguments:");
                println!("  [CONFIG]         Path to the TOML config file (default: config.toml)");
                println!("\nOptions:");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                return Ok(());
            }
            path => config_path = PathBuf::from(path),
        }
    }

    // A missing config file means defaults; a broken one is an error.
    let config = if config_path.exists() {
        AppConfig::load(&config_path)?
    } else {
        info!(path = %config_path.display(), "No config file found, using defaults");
        let config = AppConfig::default();
        config.validate()?;
        config
    };

    // Run async
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(triggerd::core::run(config))
}
