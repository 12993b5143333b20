use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use coedit_protocol::{FieldView, LockKey, Notification, NotifyEvent, RowId, RowView, SessionId};

use crate::bus::ChangeBus;
use crate::error::CoeditError;
use crate::locks::LockRegistry;
use crate::schema::EntityConfig;
use crate::store::{DataStore, Row};

/// Per-connection state machine for one entity kind.
///
/// Owns this session's draft buffer and cached row snapshot, and mediates
/// between the shared lock registry, the change bus, and the data store.
/// Each field is conceptually in one of three states for this session:
/// idle, editing-local (we hold the lock and a draft), or locked-remote
/// (someone else holds the lock and the view renders it read-only).
///
/// Every operation degrades to a safe re-render rather than raising: a
/// failed acquire is an expected outcome, not an error. The exception is a
/// rejected write, which is reported to this session alone.
pub struct SessionCoordinator {
    session_id: SessionId,
    config: Arc<EntityConfig>,
    store: Arc<dyn DataStore>,
    locks: Arc<LockRegistry>,
    bus: Arc<ChangeBus>,
    drafts: HashMap<LockKey, String>,
    snapshot: Vec<RowView>,
}

impl SessionCoordinator {
    pub fn new(
        session_id: impl Into<SessionId>,
        config: Arc<EntityConfig>,
        store: Arc<dyn DataStore>,
        locks: Arc<LockRegistry>,
        bus: Arc<ChangeBus>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            store,
            locks,
            bus,
            drafts: HashMap::new(),
            snapshot: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The last rebuilt row snapshot. Derived state: call
    /// [`SessionCoordinator::refresh`] to pick up committed changes.
    pub fn snapshot(&self) -> &[RowView] {
        &self.snapshot
    }

    pub fn draft(&self, row_id: &str, field: &str) -> Option<&str> {
        self.drafts.get(&self.key(row_id, field)).map(String::as_str)
    }

    fn key(&self, row_id: &str, field: &str) -> LockKey {
        LockKey::new(&self.config.kind, row_id, field)
    }

    /// Rebuild the full visible snapshot from the store. Drafts this
    /// session owns are preserved; everything else reflects the latest
    /// committed data.
    pub async fn refresh(&mut self) {
        let rows = self.store.list_rows().await;
        self.snapshot = rows.iter().map(|row| self.build_row_view(row)).collect();
    }

    fn build_row_view(&self, row: &Row) -> RowView {
        let mut fields = BTreeMap::new();
        for spec in &self.config.fields {
            let key = self.key(&row.id, &spec.name);
            let holder = self.locks.holder(&key);
            let draft = self.drafts.get(&key);
            fields.insert(
                spec.name.clone(),
                FieldView {
                    value: row.value(&spec.name).unwrap_or_default().to_string(),
                    is_editing: draft.is_some(),
                    draft_value: draft.cloned().unwrap_or_default(),
                    is_locked_by_other: holder.is_some_and(|h| h != self.session_id),
                },
            );
        }
        let title = self
            .config
            .title_field()
            .and_then(|name| row.value(name))
            .unwrap_or_default()
            .to_string();
        RowView {
            id: row.id.clone(),
            title,
            fields,
        }
    }

    /// Begin editing a field. On a won lock the committed value becomes the
    /// draft and other sessions are told to re-render their lock
    /// indicators; on contention the view just refreshes to show who holds
    /// it. Returns whether the lock was acquired.
    pub async fn start_edit(&mut self, row_id: &str, field: &str) -> Result<bool, CoeditError> {
        if !self.config.is_editable(field) {
            return Err(CoeditError::FieldNotEditable {
                entity: self.config.kind.clone(),
                field: field.to_string(),
            });
        }

        let key = self.key(row_id, field);
        if !self.locks.acquire(&key, &self.session_id) {
            debug!(key = %key, session_id = %self.session_id, "lock contention on start_edit");
            self.refresh().await;
            return Ok(false);
        }

        let Some(value) = self.store.fetch_field(row_id, field).await else {
            // The row vanished between render and click. Give the lock
            // straight back so it cannot leak.
            self.locks.release(&key, &self.session_id);
            return Err(CoeditError::RowNotFound(row_id.to_string()));
        };

        self.drafts.insert(key, value);
        self.refresh().await;
        self.bus
            .publish(
                &self.config.topic(),
                NotifyEvent::StateChanged {
                    row_id: Some(row_id.to_string()),
                },
            )
            .await;
        Ok(true)
    }

    /// Overwrite the in-progress draft. Local-only and high-frequency: no
    /// lock re-check, no broadcast. Ignored unless this session is
    /// actually editing the field. Returns whether a draft was updated.
    pub fn update_draft(&mut self, row_id: &str, field: &str, value: impl Into<String>) -> bool {
        match self.drafts.get_mut(&self.key(row_id, field)) {
            Some(draft) => {
                *draft = value.into();
                true
            }
            None => false,
        }
    }

    /// Commit the draft. The lock is re-verified immediately before the
    /// write: if it was force-released in the meantime the draft is
    /// silently discarded and nothing is written, so a revoked session can
    /// never clobber someone else's in-progress edit. Returns whether the
    /// value was written.
    pub async fn save_edit(&mut self, row_id: &str, field: &str) -> Result<bool, CoeditError> {
        let key = self.key(row_id, field);

        if self.locks.holder(&key).as_deref() != Some(self.session_id.as_str()) {
            warn!(key = %key, session_id = %self.session_id, "stale lock on save, discarding draft");
            self.drafts.remove(&key);
            self.refresh().await;
            return Ok(false);
        }

        let Some(value) = self.drafts.get(&key).cloned() else {
            self.refresh().await;
            return Ok(false);
        };

        // A rejected write keeps the draft and the lock so the user can
        // correct the value; the error reaches only this session.
        self.store.write_field(row_id, field, &value).await?;

        self.locks.release(&key, &self.session_id);
        self.drafts.remove(&key);
        self.refresh().await;
        self.bus
            .publish(
                &self.config.topic(),
                NotifyEvent::StateChanged {
                    row_id: Some(row_id.to_string()),
                },
            )
            .await;
        Ok(true)
    }

    /// Abandon the draft without writing. Releases the lock (no-op if not
    /// held) and tells other sessions so their lock indicators clear.
    pub async fn cancel_edit(&mut self, row_id: &str, field: &str) {
        let key = self.key(row_id, field);
        self.locks.release(&key, &self.session_id);
        self.drafts.remove(&key);
        self.refresh().await;
        self.bus
            .publish(
                &self.config.topic(),
                NotifyEvent::StateChanged {
                    row_id: Some(row_id.to_string()),
                },
            )
            .await;
    }

    /// React to a bus event for this entity's topic. Any recognized change
    /// action triggers a full snapshot rebuild; a conflict naming a key we
    /// are editing force-cancels that one draft first. Unrecognized
    /// actions are ignored.
    pub async fn handle_notification(&mut self, notification: &Notification) {
        if notification.topic != self.config.topic() {
            return;
        }
        match &notification.event {
            NotifyEvent::StateChanged { .. }
            | NotifyEvent::ItemCreated { .. }
            | NotifyEvent::ItemDeleted { .. }
            | NotifyEvent::LocksReleased { .. } => {
                self.refresh().await;
            }
            NotifyEvent::Conflict { key } => {
                if self.drafts.remove(key).is_some() {
                    debug!(key = %key, session_id = %self.session_id, "draft force-cancelled");
                    self.locks.release(key, &self.session_id);
                }
                self.refresh().await;
            }
            NotifyEvent::Unknown => {}
        }
    }

    /// Create a row from the supplied values; schema defaults fill the
    /// rest. The store notifies subscribers once the row is committed.
    pub async fn create_item(
        &mut self,
        values: BTreeMap<String, String>,
    ) -> Result<RowId, CoeditError> {
        let row = self.store.create_row(values).await?;
        self.refresh().await;
        Ok(row.id)
    }

    /// Delete a row. Any in-progress edits on it, ours or anyone's, are
    /// force-cancelled: their locks are evicted and a conflict is
    /// published per key so owning sessions drop their drafts.
    pub async fn delete_item(&mut self, row_id: &str) -> Result<(), CoeditError> {
        self.store.delete_row(row_id).await?;

        let orphaned = self.locks.locks_for_row(&self.config.kind, row_id);
        for key in orphaned {
            self.locks.force_release(&key);
            self.drafts.remove(&key);
            self.bus
                .publish(&self.config.topic(), NotifyEvent::Conflict { key })
                .await;
        }
        self.refresh().await;
        Ok(())
    }

    pub async fn move_item(&mut self, row_id: &str, direction: i64) -> bool {
        let moved = self.store.move_row(row_id, direction).await;
        self.refresh().await;
        moved
    }

    pub async fn move_to_position(&mut self, row_id: &str, position: usize) -> bool {
        let moved = self.store.move_to_position(row_id, position).await;
        self.refresh().await;
        moved
    }

    /// Session teardown. Releases everything this session holds and clears
    /// the draft buffer. The only cleanup path for abandoned locks; there
    /// is no idle timeout.
    pub async fn disconnect(&mut self) {
        self.drafts.clear();
        release_session(&self.locks, &self.bus, &self.session_id).await;
    }
}

/// Release every lock a session holds and broadcast `locks_released` on
/// each affected entity's topic so remote lock indicators clear
/// immediately. Call exactly once per connection teardown; a connection
/// with coordinators for several entity kinds shares one session id, so
/// the released keys are grouped per kind.
pub async fn release_session(locks: &LockRegistry, bus: &ChangeBus, session_id: &str) {
    let released = locks.release_all(session_id);
    if released.is_empty() {
        return;
    }

    let mut by_entity: BTreeMap<String, Vec<LockKey>> = BTreeMap::new();
    for key in released {
        by_entity.entry(key.entity.clone()).or_default().push(key);
    }
    for (entity, keys) in by_entity {
        bus.publish(
            &coedit_protocol::topic_for(&entity),
            NotifyEvent::LocksReleased { keys },
        )
        .await;
    }
}
