use anyhow::Context;
use clap::Parser;
use liftdesk_deploy::executor::ShellExecutor;
use liftdesk_deploy::{routes, AppState, DeployConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[command(
    name = "liftdesk-deploy",
    about = "Redeploy the liftdesk web panel on GitHub pushes"
)]
struct Args {
    /// Shared secret for X-Hub-Signature-256
    #[arg(long, env = "WEBHOOK_SECRET", default_value = "bomboclat", hide_env_values = true)]
    secret: String,

    /// Repository to pull
    #[arg(long, env = "REPO_PATH", default_value = "/app")]
    repo_path: PathBuf,

    /// Container to restart after pulling
    #[arg(long, env = "NGINX_SERVICE_NAME", default_value = "nginx")]
    service: String,

    /// Only pushes to this ref deploy
    #[arg(long, env = "DEPLOY_BRANCH_REF", default_value = "refs/heads/main")]
    branch_ref: String,

    /// Only pushes that add or modify this file deploy
    #[arg(long, env = "DEPLOY_TRACKED_FILE", default_value = "index.html")]
    tracked_file: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "9000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    let config = DeployConfig {
        secret: args.secret,
        repo_path: args.repo_path,
        service: args.service,
        branch_ref: args.branch_ref,
        tracked_file: args.tracked_file,
    };

    log::info!("[deploy] monitoring repository at {}", config.repo_path.display());
    log::info!(
        "[deploy] will restart {} when {} changes",
        config.service,
        config.tracked_file
    );

    let state = Arc::new(AppState::new(config, Arc::new(ShellExecutor)));
    let app = routes(state);

    let addr: std::net::SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .unwrap_or_else(|_| std::net::SocketAddr::from(([0, 0, 0, 0], args.port)));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    log::info!("[deploy] webhook server running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("[deploy] failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("[deploy] failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("[deploy] shutting down");
}
