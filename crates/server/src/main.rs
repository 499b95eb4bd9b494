use std::{future::IntoFuture, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use client_core::{
    AntiDelete, ConnectionSupervisor, GatewayConnector, Handlers, MessageStore, SupervisorExit,
};
use storage::{load_or_init, CredentialStore, StateSaver, Storage};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

mod api;
mod config;
mod handlers;

use api::{build_router, AppState};
use config::load_settings;
use handlers::InboundLog;

#[derive(Debug, Parser)]
#[command(name = "bot_server", about = "Messaging bot connection supervisor")]
struct Args {
    /// Configuration file; defaults to ./bot.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = load_settings(args.config.as_deref())?;
    let storage = Storage::new(&settings.database_url).await.map_err(|error| {
        error!(
            database_url = %settings.database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = load_or_init(&storage).await?.into_shared();
    let saver = StateSaver::new(
        Arc::new(storage.clone()),
        state.clone(),
        settings.save_retry_delay(),
    );
    let save_loop = saver.spawn(settings.save_interval());

    let store = Arc::new(MessageStore::new(settings.messages_per_chat));
    let handlers = Handlers {
        messages: Arc::new(InboundLog),
        updates: Arc::new(AntiDelete::new(state.clone(), store.clone())),
        credentials: Arc::new(storage.clone()),
        store,
    };
    let gateway_url = Url::parse(&settings.gateway_url)
        .with_context(|| format!("invalid gateway url '{}'", settings.gateway_url))?;
    let supervisor = ConnectionSupervisor::new(
        Arc::new(GatewayConnector::new(gateway_url)),
        handlers,
        settings.supervisor_config(),
    );

    let app = build_router(Arc::new(AppState {
        bot_name: settings.bot_name.clone(),
        supervisor: supervisor.clone(),
        storage: storage.clone(),
    }));
    let addr = settings.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, bot = %settings.bot_name, "server listening");

    let outcome = tokio::select! {
        exit = supervisor.run() => Some(exit),
        served = axum::serve(listener, app).into_future() => {
            served.context("http server stopped")?;
            None
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            None
        }
    };

    if let Some(SupervisorExit::LoggedOut) = outcome {
        warn!("device logged out; clearing stored credentials, pair again through /pair");
        if let Err(err) = storage.clear_credentials().await {
            error!(error = %format!("{err:#}"), "failed to clear session credentials");
        }
    }

    saver.shutdown(save_loop).await;
    Ok(())
}
