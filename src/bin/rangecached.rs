use clap::Parser;
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::signal;
use tracing::info;

use rangecache::{get, Config};

/// Register a URL with the proxy and print the local URL that serves it.
#[derive(Parser)]
struct Args {
    /// Origin URL to proxy.
    url: String,

    /// Extra request header as `key=value`; may be repeated.
    #[arg(long = "header", value_name = "KEY=VALUE")]
    headers: Vec<String>,

    /// Cache directory root; defaults to a system temp subdirectory.
    #[arg(long)]
    cache_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = Config::default();
    if let Some(dir) = args.cache_dir {
        config.cache_dir = dir;
    }

    let proxy = get(config);
    proxy.start().await?;

    let mut headers = HeaderMap::new();
    for raw in &args.headers {
        if let Some((k, v)) = raw.split_once('=') {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(k), HeaderValue::from_str(v)) {
                headers.insert(name, value);
            }
        }
    }

    let local_url = proxy.proxify(&args.url, headers).await;
    println!("{local_url}");
    info!(%local_url, "proxy ready");

    shutdown_signal().await;
    proxy.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
