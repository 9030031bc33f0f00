use noctis::run_everything_from_env;
use noctis::settings::{get_config, LogSettings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log: LogSettings = get_config().extract_inner("log").unwrap_or_default();
    init_tracing(&log);
    run_everything_from_env(None).await
}

fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log.level.clone()));
    if log.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
