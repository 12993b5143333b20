use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use coedit_protocol::{LockKey, NotifyEvent, RowId};

use crate::bus::ChangeBus;
use crate::error::CoeditError;
use crate::schema::EntityConfig;

/// One stored row: opaque id plus field-name to string-value map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: RowId,
    pub values: BTreeMap<String, String>,
}

impl Row {
    pub fn value(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }
}

/// Data-access collaborator contract.
///
/// Implementations must guarantee commit-then-notify: by the time the
/// change notification for a mutation is published, a fresh fetch already
/// reflects the new value. Suspending here blocks only the calling
/// session's coordinator; other sessions keep running.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn list_rows(&self) -> Vec<Row>;
    async fn fetch_row(&self, row_id: &str) -> Option<Row>;
    async fn fetch_field(&self, row_id: &str, field: &str) -> Option<String>;
    async fn write_field(&self, row_id: &str, field: &str, value: &str)
    -> Result<(), CoeditError>;
    async fn create_row(&self, values: BTreeMap<String, String>) -> Result<Row, CoeditError>;
    async fn delete_row(&self, row_id: &str) -> Result<(), CoeditError>;
    /// Move a row up (negative) or down (positive) by `direction` slots.
    /// Returns false when the move falls off either end.
    async fn move_row(&self, row_id: &str, direction: i64) -> bool;
    /// Move a row to an absolute position, clamped to the table. Returns
    /// false when nothing moved.
    async fn move_to_position(&self, row_id: &str, position: usize) -> bool;
}

/// In-memory, ordered row table validating writes against the entity
/// schema and publishing on the entity topic after each committed
/// mutation.
pub struct MemoryStore {
    config: Arc<EntityConfig>,
    bus: Arc<ChangeBus>,
    rows: RwLock<Vec<Row>>,
}

impl MemoryStore {
    pub fn new(config: Arc<EntityConfig>, bus: Arc<ChangeBus>) -> Self {
        Self {
            config,
            bus,
            rows: RwLock::new(Vec::new()),
        }
    }

    /// Insert starting rows without notifying anyone. Startup/test only.
    pub async fn seed_rows(&self, seeds: Vec<BTreeMap<String, String>>) {
        let mut rows = self.rows.write().await;
        for values in seeds {
            rows.push(Row {
                id: uuid::Uuid::new_v4().to_string(),
                values: self.filled(values),
            });
        }
    }

    /// Supplied values plus schema defaults for every missing field.
    fn filled(&self, mut values: BTreeMap<String, String>) -> BTreeMap<String, String> {
        for spec in &self.config.fields {
            values
                .entry(spec.name.clone())
                .or_insert_with(|| spec.kind.default_value());
        }
        values
    }

    fn validate(&self, row_id: &str, field: &str, value: &str) -> Result<(), CoeditError> {
        let key = LockKey::new(&self.config.kind, row_id, field);
        let spec = self
            .config
            .field(field)
            .ok_or_else(|| CoeditError::WriteRejected {
                key: key.clone(),
                reason: format!("no such field on {}", self.config.kind),
            })?;
        if spec.required && value.is_empty() {
            return Err(CoeditError::WriteRejected {
                key,
                reason: "value is required".to_string(),
            });
        }
        spec.kind
            .validate(value)
            .map_err(|reason| CoeditError::WriteRejected { key, reason })
    }

    fn position_of(rows: &[Row], row_id: &str) -> Option<usize> {
        rows.iter().position(|row| row.id == row_id)
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn list_rows(&self) -> Vec<Row> {
        self.rows.read().await.clone()
    }

    async fn fetch_row(&self, row_id: &str) -> Option<Row> {
        self.rows
            .read()
            .await
            .iter()
            .find(|row| row.id == row_id)
            .cloned()
    }

    async fn fetch_field(&self, row_id: &str, field: &str) -> Option<String> {
        self.fetch_row(row_id)
            .await
            .and_then(|row| row.values.get(field).cloned())
    }

    async fn write_field(
        &self,
        row_id: &str,
        field: &str,
        value: &str,
    ) -> Result<(), CoeditError> {
        self.validate(row_id, field, value)?;
        {
            let mut rows = self.rows.write().await;
            let row = rows
                .iter_mut()
                .find(|row| row.id == row_id)
                .ok_or_else(|| CoeditError::RowNotFound(row_id.to_string()))?;
            row.values.insert(field.to_string(), value.to_string());
        }
        // Write guard dropped: the mutation is visible before anyone is
        // told to refresh.
        self.bus
            .publish(
                &self.config.topic(),
                NotifyEvent::StateChanged {
                    row_id: Some(row_id.to_string()),
                },
            )
            .await;
        Ok(())
    }

    async fn create_row(&self, values: BTreeMap<String, String>) -> Result<Row, CoeditError> {
        for (field, value) in &values {
            self.validate("new", field, value)?;
        }
        let row = Row {
            id: uuid::Uuid::new_v4().to_string(),
            values: self.filled(values),
        };
        self.rows.write().await.push(row.clone());
        info!(entity = %self.config.kind, row_id = %row.id, "row created");
        self.bus
            .publish(
                &self.config.topic(),
                NotifyEvent::ItemCreated {
                    row_id: row.id.clone(),
                },
            )
            .await;
        Ok(row)
    }

    async fn delete_row(&self, row_id: &str) -> Result<(), CoeditError> {
        {
            let mut rows = self.rows.write().await;
            let position = Self::position_of(&rows, row_id)
                .ok_or_else(|| CoeditError::RowNotFound(row_id.to_string()))?;
            rows.remove(position);
        }
        info!(entity = %self.config.kind, row_id = %row_id, "row deleted");
        self.bus
            .publish(
                &self.config.topic(),
                NotifyEvent::ItemDeleted {
                    row_id: row_id.to_string(),
                },
            )
            .await;
        Ok(())
    }

    async fn move_row(&self, row_id: &str, direction: i64) -> bool {
        let moved = {
            let mut rows = self.rows.write().await;
            let Some(from) = Self::position_of(&rows, row_id) else {
                return false;
            };
            let to = from as i64 + direction;
            if to < 0 || to as usize >= rows.len() {
                false
            } else {
                rows.swap(from, to as usize);
                true
            }
        };
        if moved {
            self.bus
                .publish(&self.config.topic(), NotifyEvent::StateChanged { row_id: None })
                .await;
        }
        moved
    }

    async fn move_to_position(&self, row_id: &str, position: usize) -> bool {
        let moved = {
            let mut rows = self.rows.write().await;
            let Some(from) = Self::position_of(&rows, row_id) else {
                return false;
            };
            let to = position.min(rows.len().saturating_sub(1));
            if from == to {
                false
            } else {
                let row = rows.remove(from);
                rows.insert(to, row);
                true
            }
        };
        if moved {
            self.bus
                .publish(&self.config.topic(), NotifyEvent::StateChanged { row_id: None })
                .await;
        }
        moved
    }
}
