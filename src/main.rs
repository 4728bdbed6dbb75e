mod admin;
mod audit;
mod auth;
mod authz;
mod client_manager;
mod cli;
mod config;
mod conflict;
mod error;
mod filter;
#[cfg(test)]
mod gateway_scenarios;
mod health;
mod middleware;
mod registry;
mod reload;
mod routing;
mod server;
mod session;
mod session_tracker;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::audit::AuditRecorder;
use crate::auth::AuthProvider;
use crate::authz::Authorizer;
use crate::client_manager::ClientManager;
use crate::config::Config;
use crate::health::HealthChecker;
use crate::middleware::GatewayChain;
use crate::registry::RouteRegistry;
use crate::reload::ReloadCoordinator;
use crate::routing::Router;
use crate::server::GatewayServer;
use crate::session_tracker::SessionTracker;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = Config::load(&cli.config)?;

    if cli.check_config {
        println!("configuration at {} is valid", cli.config.display());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(
        config_path = %cli.config.display(),
        backends = config.backends.len(),
        "aggregation gateway starting"
    );

    let backends = ClientManager::new();
    backends.start_all(&config).await;

    let auth = Arc::new(AuthProvider::from_config(&config.incoming_auth)?);
    let authz = Arc::new(Authorizer::compile(&config.authorization)?);
    let audit = AuditRecorder::new(config.audit.clone());
    let audit_writer = audit.spawn_writer();

    let registry = RouteRegistry::new();
    let reload = ReloadCoordinator::new(config.clone(), Arc::clone(&backends), Arc::clone(&registry), audit.clone());
    reload.republish(&config).await?;

    let health_checker = HealthChecker::spawn(Arc::clone(&backends), config.health.clone(), Arc::clone(&reload));

    let sessions = SessionTracker::new(&config.session);
    let sweeper = sessions.spawn_sweeper(config.session.sweep_interval);

    let router = Arc::new(Router::new(Arc::clone(&registry), Arc::clone(&backends)));
    let chain = Arc::new(GatewayChain::new(auth, authz, audit.clone(), router));
    let gateway = GatewayServer::new(Arc::clone(&chain), Arc::clone(&registry));

    #[cfg(feature = "admin")]
    if config.admin.enabled {
        let app = admin::router(Arc::clone(&backends), Arc::clone(&registry), Arc::clone(&reload), audit.clone());
        let admin_config = config.admin.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(&admin_config, app).await {
                tracing::error!(error = %e, "admin API failed");
            }
        });
    }

    info!("serving MCP over stdio");
    let service = gateway.serve(stdio()).await?;

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = service.waiting() => {
                if let Err(e) = result {
                    warn!(error = %e, "MCP service exited with error");
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        service.waiting().await?;
    }

    info!("shutting down");
    sweeper.abort();
    health_checker.stop();
    if let Some(handle) = audit_writer {
        handle.abort();
    }
    backends.stop_all().await;

    Ok(())
}
