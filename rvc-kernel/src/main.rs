/**
 * RVC KERNEL - Point d'entrée du pont Matter pour robot aspirateur
 *
 * RÔLE : Orchestration : config, lien amont (session + superviseur), store,
 * hub d'abonnés, API HTTP et relais /ws.
 *
 * ARCHITECTURE : un seul DeviceLink construit ici puis injecté dans Axum.
 * Arrêt propre sur Ctrl-C : le serveur HTTP s'arrête, puis le lien amont.
 */

use anyhow::Context;
use rvc_kernel::config::load_config;
use rvc_kernel::http::{build_router, AppState};
use rvc_kernel::state::new_state;
use rvc_kernel::DeviceLink;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = load_config().await;
    let addr = cfg.http_addr.clone();
    info!(upstream = %cfg.matter_server_url, "[kernel] configuration loaded");

    // lien amont + tasks de fond
    let link = DeviceLink::new(new_state(cfg));
    link.start();

    // HTTP + relais
    let app = build_router(AppState { link: link.clone() });
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("[kernel] listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    link.shutdown().await;
    info!("[kernel] bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("[kernel] cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("[kernel] shutdown requested");
}
