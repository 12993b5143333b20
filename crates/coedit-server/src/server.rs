use std::sync::Arc;

use tokio::net::UnixListener;
use tracing::{error, info};

use libcoedit::{ChangeBus, EntityRegistry, LockRegistry, MemoryStore};

use crate::config::ServerConfig;
use crate::connection;

/// Process-wide singletons shared by every client connection.
#[derive(Clone)]
pub struct SharedState {
    pub registry: Arc<EntityRegistry>,
    pub locks: Arc<LockRegistry>,
    pub bus: Arc<ChangeBus>,
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // Clean up stale socket
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }

    // Ensure parent directory exists
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write PID file
    let pid_path = ServerConfig::pid_file_path();
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let state = build_state(&config).await;
    for kind in state.registry.kinds() {
        info!(entity = %kind, "entity registered");
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    info!(socket = %config.socket_path.display(), pid = std::process::id(), "coedit server started");

    // Handle shutdown signals
    let socket_path = config.socket_path.clone();
    let pid_path_clone = pid_path.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
        // Cleanup
        let _ = std::fs::remove_file(&socket_path);
        let _ = std::fs::remove_file(&pid_path_clone);
        std::process::exit(0);
    });

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    connection::handle_client(stream, state).await;
                });
            }
            Err(e) => {
                error!("accept error: {e}");
            }
        }
    }
}

/// Build the shared lock registry, bus, and one seeded store per declared
/// entity kind.
async fn build_state(config: &ServerConfig) -> SharedState {
    let locks = Arc::new(LockRegistry::new());
    let bus = Arc::new(ChangeBus::new());

    let mut registry = EntityRegistry::new();
    for decl in &config.entities {
        let entity_config = Arc::new(decl.config.clone());
        let store = Arc::new(MemoryStore::new(
            Arc::clone(&entity_config),
            Arc::clone(&bus),
        ));
        store.seed_rows(decl.seed.clone()).await;
        registry.register(entity_config, store);
    }

    SharedState {
        registry: Arc::new(registry),
        locks,
        bus,
    }
}
