use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tessera::{TesseraConfig, TesseraNode};

#[derive(Debug, Parser)]
#[command(name = "tessera", about = "Transactional resource host")]
struct Args {
    /// JSON configuration file; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    setup_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match TesseraConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!(error = %err, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => TesseraConfig::default(),
    };
    info!("starting tessera node with config {:?}", config);

    let node = match TesseraNode::new(config).await {
        Ok(node) => node,
        Err(err) => {
            error!(error = %err, "failed to start node");
            std::process::exit(1);
        }
    };
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };
    if let Err(err) = node.serve(shutdown).await {
        error!(error = %err, "node stopped with an error");
    }
    node.shutdown().await;
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
