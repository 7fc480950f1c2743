//! Durable storage for queued commands.

use super::command::Command;
use crate::db::{self, Database, EventuallyRow};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use mooring_engine::{ClassName, EnqueueStamp, LocalId, OperationSetId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Prefix of command files in the legacy queue directory.
pub const COMMAND_FILE_PREFIX: &str = "CommandCache_";

/// What a queued command does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PinCommand {
    /// Save the target. `body` is the save body at enqueue time, used if the
    /// target's operation set can no longer be found.
    Save { class_name: ClassName, body: Value },
    /// Delete the target.
    Delete { class_name: ClassName },
    /// Send a prepared command.
    Raw { command: Command },
}

impl PinCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            PinCommand::Save { .. } => "save",
            PinCommand::Delete { .. } => "delete",
            PinCommand::Raw { .. } => "raw",
        }
    }
}

/// A queued command, persisted until it is acknowledged or dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventuallyPin {
    pub uuid: String,
    /// Object the command acts on
    #[serde(default)]
    pub target_uuid: Option<LocalId>,
    /// Operation set a save sends
    #[serde(default)]
    pub operation_set_uuid: Option<OperationSetId>,
    #[serde(default)]
    pub session_token: Option<String>,
    /// Replay position
    pub stamp: EnqueueStamp,
    pub command: PinCommand,
}

impl EventuallyPin {
    pub fn new(stamp: EnqueueStamp, command: PinCommand) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            target_uuid: None,
            operation_set_uuid: None,
            session_token: None,
            stamp,
            command,
        }
    }

    pub(crate) fn to_row(&self) -> Result<EventuallyRow> {
        Ok(EventuallyRow {
            uuid: self.uuid.clone(),
            kind: self.command.kind().to_string(),
            target_uuid: self.target_uuid.clone(),
            operation_set_uuid: self.operation_set_uuid.clone(),
            session_token: self.session_token.clone(),
            created_at: self.stamp.millis,
            seq: i64::from(self.stamp.counter),
            command: serde_json::to_string(&self.command)?,
        })
    }

    fn from_row(row: EventuallyRow) -> Result<Self> {
        let counter = u32::try_from(row.seq)
            .map_err(|_| StoreError::Corrupt(format!("queued command {}: bad seq {}", row.uuid, row.seq)))?;
        Ok(Self {
            command: serde_json::from_str(&row.command)?,
            uuid: row.uuid,
            target_uuid: row.target_uuid,
            operation_set_uuid: row.operation_set_uuid,
            session_token: row.session_token,
            stamp: EnqueueStamp::new(row.created_at, counter),
        })
    }

    /// File name in the legacy queue directory; sorts lexically in replay
    /// order.
    pub fn file_name(&self) -> String {
        format!("{COMMAND_FILE_PREFIX}{}_{}", self.stamp.to_hex(), self.uuid)
    }
}

/// Persistent FIFO of queued commands.
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn push(&self, pin: &EventuallyPin) -> Result<()>;

    /// Every queued command in replay order.
    async fn load_all(&self) -> Result<Vec<EventuallyPin>>;

    async fn first(&self) -> Result<Option<EventuallyPin>>;

    /// Remove a command. Returns false if it was not queued.
    async fn remove(&self, uuid: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    /// Number of queued commands acting on `target_uuid`.
    async fn count_for_target(&self, target_uuid: &str) -> Result<usize>;

    /// The object database, if commands are stored in it. Commands pushed to
    /// such a store are written in the same transaction as their target.
    fn database(&self) -> Option<&Arc<Database>> {
        None
    }
}

/// Commands stored in the `eventually_pins` table of the object database.
#[derive(Debug, Clone)]
pub struct SqlCommandStore {
    db: Arc<Database>,
}

impl SqlCommandStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CommandStore for SqlCommandStore {
    async fn push(&self, pin: &EventuallyPin) -> Result<()> {
        let row = pin.to_row()?;
        let mut session = self.db.session().await?;
        db::insert_eventually(&mut session, &row).await
    }

    async fn load_all(&self) -> Result<Vec<EventuallyPin>> {
        let rows = {
            let mut session = self.db.session().await?;
            db::load_eventually(&mut session).await?
        };
        Ok(decode_rows(rows))
    }

    async fn first(&self) -> Result<Option<EventuallyPin>> {
        let row = {
            let mut session = self.db.session().await?;
            db::first_eventually(&mut session).await?
        };
        row.map(EventuallyPin::from_row).transpose()
    }

    async fn remove(&self, uuid: &str) -> Result<bool> {
        let mut session = self.db.session().await?;
        db::delete_eventually(&mut session, uuid).await
    }

    async fn clear(&self) -> Result<()> {
        let mut session = self.db.session().await?;
        db::delete_all_eventually(&mut session).await
    }

    async fn count(&self) -> Result<usize> {
        let mut session = self.db.session().await?;
        let count = db::count_eventually(&mut session).await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn count_for_target(&self, target_uuid: &str) -> Result<usize> {
        let mut session = self.db.session().await?;
        let count = db::count_eventually_for(&mut session, target_uuid).await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn database(&self) -> Option<&Arc<Database>> {
        Some(&self.db)
    }
}

/// Rows that fail to decode are skipped so one bad row cannot wedge the
/// queue.
fn decode_rows(rows: Vec<EventuallyRow>) -> Vec<EventuallyPin> {
    rows.into_iter()
        .filter_map(|row| {
            let uuid = row.uuid.clone();
            match EventuallyPin::from_row(row) {
                Ok(pin) => Some(pin),
                Err(err) => {
                    tracing::warn!(uuid = %uuid, error = %err, "Skipping unreadable queued command");
                    None
                }
            }
        })
        .collect()
}

/// Legacy layout: one JSON file per command in a directory.
#[derive(Debug, Clone)]
pub struct FileCommandStore {
    dir: PathBuf,
}

impl FileCommandStore {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::info!(dir = %dir.display(), "Using file command store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Command file names, sorted.
    async fn file_names(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(COMMAND_FILE_PREFIX) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read(&self, name: &str) -> Option<EventuallyPin> {
        let path = self.dir.join(name);
        let parsed = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<EventuallyPin>(&bytes).map_err(StoreError::from),
            Err(err) => Err(err.into()),
        };
        match parsed {
            Ok(pin) => Some(pin),
            Err(err) => {
                tracing::warn!(file = %path.display(), error = %err, "Skipping unreadable command file");
                None
            }
        }
    }
}

#[async_trait]
impl CommandStore for FileCommandStore {
    async fn push(&self, pin: &EventuallyPin) -> Result<()> {
        let bytes = serde_json::to_vec(pin)?;
        let path = self.dir.join(pin.file_name());
        // Written under a temporary name first so a crash never leaves a
        // truncated command file.
        let partial = self.dir.join(format!(".{}.tmp", pin.uuid));
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<EventuallyPin>> {
        let mut pins = Vec::new();
        for name in self.file_names().await? {
            if let Some(pin) = self.read(&name).await {
                pins.push(pin);
            }
        }
        Ok(pins)
    }

    async fn first(&self) -> Result<Option<EventuallyPin>> {
        for name in self.file_names().await? {
            if let Some(pin) = self.read(&name).await {
                return Ok(Some(pin));
            }
        }
        Ok(None)
    }

    async fn remove(&self, uuid: &str) -> Result<bool> {
        let suffix = format!("_{uuid}");
        for name in self.file_names().await? {
            if name.ends_with(&suffix) {
                tokio::fs::remove_file(self.dir.join(&name)).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn clear(&self) -> Result<()> {
        for name in self.file_names().await? {
            tokio::fs::remove_file(self.dir.join(&name)).await?;
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.file_names().await?.len())
    }

    async fn count_for_target(&self, target_uuid: &str) -> Result<usize> {
        Ok(self
            .load_all()
            .await?
            .iter()
            .filter(|pin| pin.target_uuid.as_deref() == Some(target_uuid))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(path: &str) -> PinCommand {
        PinCommand::Raw {
            command: Command::Raw {
                method: "POST".into(),
                path: path.into(),
                body: None,
            },
        }
    }

    async fn exercise(store: &dyn CommandStore) {
        let late = EventuallyPin::new(EnqueueStamp::new(2_000, 0), raw("/late"));
        let mut early = EventuallyPin::new(EnqueueStamp::new(1_000, 7), raw("/early"));
        early.target_uuid = Some("obj-1".into());
        let tie = EventuallyPin::new(EnqueueStamp::new(1_000, 8), raw("/tie"));

        store.push(&late).await.unwrap();
        store.push(&tie).await.unwrap();
        store.push(&early).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded, vec![early.clone(), tie.clone(), late.clone()]);
        assert_eq!(store.first().await.unwrap(), Some(early.clone()));
        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(store.count_for_target("obj-1").await.unwrap(), 1);

        assert!(store.remove(&early.uuid).await.unwrap());
        assert!(!store.remove(&early.uuid).await.unwrap());
        assert_eq!(store.first().await.unwrap(), Some(tie));

        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sql_store_orders_by_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(dir.path().join("queue.sqlite")));
        db.open().await.unwrap();
        exercise(&SqlCommandStore::new(db)).await;
    }

    #[tokio::test]
    async fn file_store_orders_by_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCommandStore::open(dir.path().join("queue")).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn file_store_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCommandStore::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("CommandCache_junk"), b"{").await.unwrap();
        tokio::fs::write(dir.path().join("unrelated.txt"), b"x").await.unwrap();
        let pin = EventuallyPin::new(
            EnqueueStamp::new(5, 0),
            PinCommand::Save {
                class_name: "Post".into(),
                body: json!({"title": "x"}),
            },
        );
        store.push(&pin).await.unwrap();
        assert_eq!(store.load_all().await.unwrap(), vec![pin]);
    }
}
