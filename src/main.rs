use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dentarad::config::{Cli, Config};
use dentarad::error::Error;
use dentarad::inference::InferenceClient;
use dentarad::reporting::ChatClient;
use dentarad::web::{self, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("{}", snafu::Report::from_error(err));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let config = Arc::new(Config::from_cli(cli)?);

    let detector = Arc::new(InferenceClient::new(
        &config.inference,
        config.request_timeout,
    )?);
    let reporter = Arc::new(ChatClient::new(&config.llm, config.request_timeout)?);

    let state = AppState {
        config: config.clone(),
        detector,
        reporter,
    };

    let (addr, server) =
        warp::serve(web::routes(state)).bind_with_graceful_shutdown(config.bind, async {
            tokio::signal::ctrl_c().await.ok();
        });
    info!("listening on {}", addr);
    server.await;
    info!("shutting down");
    Ok(())
}
