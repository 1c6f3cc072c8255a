#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::time::Duration;

use dotenv::dotenv;
use poem::{EndpointExt, Server, listener::TcpListener, middleware::Tracing};
use tracing::info;

use ssh_gateway::gateway::{GatewayConfig, GatewayContext, janitor, server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = GatewayConfig::from_env();
    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let ctx = GatewayContext::new(config);

    janitor::spawn(ctx.clone());

    info!("Starting SSH gateway on {}", addr);
    info!("WebSocket endpoint at /ws, health endpoint at /health");

    let app = server::build_app(ctx.clone()).with(Tracing);
    let shutdown_ctx = ctx.clone();

    Server::new(TcpListener::bind(addr))
        .name("SSH Gateway")
        .run_with_graceful_shutdown(
            app,
            async move {
                wait_for_signal().await;
                janitor::shutdown(&shutdown_ctx).await;
            },
            Some(Duration::from_secs(5)),
        )
        .await?;

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("signal handler installed");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
