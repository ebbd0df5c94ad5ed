use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wiresql::{create_router, serve, Session, SqliteEngine};

#[derive(Parser, Debug)]
#[command(name = "wiresql")]
#[command(about = "Expose a SQLite database to remote driver clients", long_about = None)]
struct Args {
    /// Address for the driver protocol listener
    #[arg(long, default_value = "0.0.0.0:6750")]
    listen: String,

    /// Address for the read-only status HTTP listener (disabled when absent)
    #[arg(long)]
    status_listen: Option<String>,

    /// SQLite database path
    #[arg(long, default_value = "./wiresql.db")]
    db: String,

    /// Idle handle expiry in seconds; 0 disables expiry
    #[arg(long, default_value_t = 60)]
    expiry_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wiresql=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine = SqliteEngine::open(&args.db)?;
    tracing::info!(db = %args.db, "engine ready");

    let expiry = (args.expiry_secs > 0).then(|| Duration::from_secs(args.expiry_secs));
    let session = Session::new(engine, expiry);
    session.spawn_expiry();

    if let Some(addr) = &args.status_listen {
        let router = create_router(Arc::clone(&session));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("status listening on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("status server error: {}", e);
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!("driver listening on {}", args.listen);

    tokio::select! {
        result = serve(listener, session) => result?,
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
