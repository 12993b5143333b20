use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use coedit_protocol::{
    Command, ErrorCode, Notification, Response, SessionId, entity_for_topic, topic_for,
};
use libcoedit::{CoeditError, SessionCoordinator, release_session};

use crate::server::SharedState;

/// Handle a single client connection: one session id for its lifetime, one
/// lazily-created coordinator per entity kind it touches.
pub async fn handle_client(stream: UnixStream, state: SharedState) {
    let session_id: SessionId = uuid::Uuid::new_v4().to_string();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let mut coordinators: HashMap<String, SessionCoordinator> = HashMap::new();
    let mut subscriptions: HashSet<String> = HashSet::new();
    // Forwarding tasks funnel bus events here so this loop stays the only
    // writer on the stream.
    let (notify_tx, mut notify_rx) = mpsc::channel::<Notification>(64);

    debug!(session_id = %session_id, "client connected");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!(session_id = %session_id, "client disconnected");
                        break;
                    }
                    Err(e) => {
                        error!(session_id = %session_id, "read error: {e}");
                        break;
                    }
                };

                let response = match serde_json::from_str::<Command>(&line) {
                    Ok(command) => {
                        match dispatch(
                            command,
                            &state,
                            &session_id,
                            &mut coordinators,
                            &mut subscriptions,
                            &notify_tx,
                        )
                        .await
                        {
                            Ok(response) => response,
                            Err(e) => {
                                let (code, message) = e.to_error_code();
                                Response::Error { message, code }
                            }
                        }
                    }
                    Err(e) => Response::Error {
                        message: format!("invalid command: {e}"),
                        code: ErrorCode::InvalidRequest,
                    },
                };

                if let Err(e) = write_response(&mut writer, &response).await {
                    error!(session_id = %session_id, "write error: {e}");
                    break;
                }
            }

            Some(notification) = notify_rx.recv() => {
                // Re-derive this session's visible state, then let the
                // client know something changed.
                if let Some(entity) = entity_for_topic(&notification.topic)
                    && let Some(coordinator) = coordinators.get_mut(entity)
                {
                    coordinator.handle_notification(&notification).await;
                }
                if let Err(e) = write_response(&mut writer, &Response::Event(notification)).await {
                    error!(session_id = %session_id, "write error: {e}");
                    break;
                }
            }
        }
    }

    // Cleanup: every lock this session still holds is reclaimed and
    // announced. The only path that frees locks of a vanished client.
    release_session(&state.locks, &state.bus, &session_id).await;
}

async fn dispatch(
    command: Command,
    state: &SharedState,
    session_id: &str,
    coordinators: &mut HashMap<String, SessionCoordinator>,
    subscriptions: &mut HashSet<String>,
    notify_tx: &mpsc::Sender<Notification>,
) -> Result<Response, CoeditError> {
    match command {
        Command::Snapshot { entity } => {
            let coordinator = coordinator_for(coordinators, state, session_id, &entity).await?;
            coordinator.refresh().await;
            Ok(Response::Ok {
                data: serde_json::to_value(coordinator.snapshot()).ok(),
            })
        }

        Command::Subscribe { entity } => {
            // Validates the entity kind and primes the coordinator.
            coordinator_for(coordinators, state, session_id, &entity).await?;
            let topic = topic_for(&entity);
            if subscriptions.insert(topic.clone()) {
                let rx = state.bus.subscribe(&topic).await;
                tokio::spawn(forward_events(rx, notify_tx.clone(), topic));
            }
            Ok(Response::Ok { data: None })
        }

        Command::StartEdit {
            entity,
            row_id,
            field,
        } => {
            let coordinator = coordinator_for(coordinators, state, session_id, &entity).await?;
            let acquired = coordinator.start_edit(&row_id, &field).await?;
            Ok(Response::Ok {
                data: Some(serde_json::json!({ "acquired": acquired })),
            })
        }

        Command::UpdateDraft {
            entity,
            row_id,
            field,
            value,
        } => {
            let coordinator = coordinator_for(coordinators, state, session_id, &entity).await?;
            let updated = coordinator.update_draft(&row_id, &field, value);
            Ok(Response::Ok {
                data: Some(serde_json::json!({ "updated": updated })),
            })
        }

        Command::SaveEdit {
            entity,
            row_id,
            field,
        } => {
            let coordinator = coordinator_for(coordinators, state, session_id, &entity).await?;
            let saved = coordinator.save_edit(&row_id, &field).await?;
            Ok(Response::Ok {
                data: Some(serde_json::json!({ "saved": saved })),
            })
        }

        Command::CancelEdit {
            entity,
            row_id,
            field,
        } => {
            let coordinator = coordinator_for(coordinators, state, session_id, &entity).await?;
            coordinator.cancel_edit(&row_id, &field).await;
            Ok(Response::Ok { data: None })
        }

        Command::CreateItem { entity, values } => {
            let coordinator = coordinator_for(coordinators, state, session_id, &entity).await?;
            let row_id = coordinator.create_item(values).await?;
            Ok(Response::Ok {
                data: Some(serde_json::json!({ "row_id": row_id })),
            })
        }

        Command::DeleteItem { entity, row_id } => {
            let coordinator = coordinator_for(coordinators, state, session_id, &entity).await?;
            coordinator.delete_item(&row_id).await?;
            Ok(Response::Ok { data: None })
        }

        Command::MoveItem {
            entity,
            row_id,
            direction,
        } => {
            let coordinator = coordinator_for(coordinators, state, session_id, &entity).await?;
            let moved = coordinator.move_item(&row_id, direction).await;
            Ok(Response::Ok {
                data: Some(serde_json::json!({ "moved": moved })),
            })
        }

        Command::MoveToPosition {
            entity,
            row_id,
            position,
        } => {
            let coordinator = coordinator_for(coordinators, state, session_id, &entity).await?;
            let moved = coordinator.move_to_position(&row_id, position).await;
            Ok(Response::Ok {
                data: Some(serde_json::json!({ "moved": moved })),
            })
        }
    }
}

/// Get or lazily create this connection's coordinator for an entity kind.
async fn coordinator_for<'a>(
    coordinators: &'a mut HashMap<String, SessionCoordinator>,
    state: &SharedState,
    session_id: &str,
    entity: &str,
) -> Result<&'a mut SessionCoordinator, CoeditError> {
    if !coordinators.contains_key(entity) {
        let entry = state.registry.get(entity)?;
        let mut coordinator = SessionCoordinator::new(
            session_id,
            Arc::clone(&entry.config),
            Arc::clone(&entry.store),
            Arc::clone(&state.locks),
            Arc::clone(&state.bus),
        );
        coordinator.refresh().await;
        coordinators.insert(entity.to_string(), coordinator);
    }
    match coordinators.get_mut(entity) {
        Some(coordinator) => Ok(coordinator),
        None => Err(CoeditError::EntityNotFound(entity.to_string())),
    }
}

/// Forward broadcast notifications into the connection's funnel.
async fn forward_events(
    mut rx: broadcast::Receiver<Notification>,
    tx: mpsc::Sender<Notification>,
    topic: String,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if tx.send(notification).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(topic = %topic, skipped = n, "subscriber lagged");
                // Continue - the client reconciles with a full snapshot
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(topic = %topic, "broadcast channel closed");
                break;
            }
        }
    }
}

async fn write_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> Result<(), std::io::Error> {
    let json = serde_json::to_string(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
