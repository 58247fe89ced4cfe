use clap::Parser;
use filemesh::{Config, Controller};
use tracing::{error, info};

/// filemesh version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("filemesh=info".parse().unwrap()),
        )
        .init();

    let config = Config::parse();

    info!("filemesh v{VERSION} starting, data dir {:?}", config.data_dir);

    let controller = match Controller::new(config) {
        Ok(c) => c,
        Err(e) => {
            error!("fatal: could not load local state: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = controller.start().await {
        error!("fatal: could not start: {e}");
        std::process::exit(1);
    }

    let shell_controller = controller.clone();
    let shell = tokio::spawn(async move {
        filemesh::shell::run(shell_controller).await;
    });

    tokio::select! {
        _ = shell => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            controller.stop();
        }
    }
}
