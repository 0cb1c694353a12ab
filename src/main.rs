use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use lavalink_manager::{EventReceiver, Manager, ManagerEvent, ManagerOptions};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lavalink_manager=debug".parse()?),
        )
        .init();

    info!("🎵 Iniciando lavalink-manager v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let options = ManagerOptions::from_env()?;
    info!("{}", options.summary());

    let client_id = options
        .client_id
        .clone()
        .context("LAVALINK_CLIENT_ID must be set")?;

    // Sin gateway real: los payloads de voz solo se registran
    let (manager, mut events) = Manager::new(options, |guild_id: &str, payload: Value| {
        debug!("📤 Gateway [{}]: {}", guild_id, payload);
    })?;
    manager.init(client_id)?;

    if std::env::args().any(|arg| arg == "--health-check") {
        let result = health_check(&mut events).await;
        manager.shutdown();
        return result;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️ Señal de shutdown recibida, cerrando...");
                break;
            }
        }
    }

    manager.shutdown();
    Ok(())
}

/// Waits until one node connects, or fails if every node gives up first.
async fn health_check(events: &mut EventReceiver) -> Result<()> {
    let connected = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            log_event(&event);
            match event {
                ManagerEvent::NodeConnect { node } => return Ok(node),
                ManagerEvent::NodeDisconnect { node, terminal: true, .. } => {
                    bail!("Node '{}' could not be reached", node)
                }
                _ => {}
            }
        }
        bail!("Event channel closed")
    })
    .await
    .context("No node connected in time")??;

    info!("✅ Health check OK: nodo '{}' conectado", connected);
    Ok(())
}

fn log_event(event: &ManagerEvent) {
    match event {
        ManagerEvent::NodeCreate { node } => info!("➕ Nodo creado: {}", node),
        ManagerEvent::NodeDestroy { node } => warn!("🗑️ Nodo destruido: {}", node),
        ManagerEvent::NodeConnect { node } => info!("✅ Nodo conectado: {}", node),
        ManagerEvent::NodeReconnect { node, attempt } => {
            info!("🔄 Nodo '{}' reconectando (intento {})", node, attempt)
        }
        ManagerEvent::NodeDisconnect {
            node, code, reason, ..
        } => warn!("⚠️ Nodo '{}' desconectado ({:?}): {}", node, code, reason),
        ManagerEvent::NodeError { node, error } => error!("❌ Error en nodo '{}': {}", node, error),
        ManagerEvent::NodeRaw { node, payload } => trace!("[{}] {}", node, payload),
        ManagerEvent::TrackStart { guild_id, track } => info!(
            "▶️ [{}] {}",
            guild_id,
            track.as_ref().map_or("?", |t| t.title.as_str())
        ),
        ManagerEvent::QueueEnd { guild_id, .. } => info!("📭 [{}] Cola terminada", guild_id),
        ManagerEvent::TrackError { guild_id, error, .. } => {
            warn!("❌ [{}] Error de reproducción: {}", guild_id, error)
        }
        other => debug!("{:?}", other),
    }
}
