mod admin;
mod config;
mod instruments;
mod metrics;
mod pool;
mod processor;
mod server;
mod state;

use tracing::error;
use tracing_subscriber::EnvFilter;

const BANNER: &str = r#"
  ╔══════════════════════════════════════════════════╗
  ║               S T R E S S - A P P                ║
  ║     Synthetic load for your monitoring stack     ║
  ╚══════════════════════════════════════════════════╝
"#;

#[tokio::main]
async fn main() {
    let config = match config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(2);
        }
    };

    // Set up tracing with the configured log level
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    eprintln!("{BANNER}");

    if let Err(e) = server::run(config).await {
        error!(error = %e, "fatal");
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
