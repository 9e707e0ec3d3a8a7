//! Repository seams for items and moderation tasks.
//!
//! The worker only reads items and only terminates (or bumps the retry counter
//! of) tasks that are still `pending`. Postgres is the production backend
//! (see `db::queries`); [`InMemoryStore`] backs tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::item::Item;
use crate::models::task::{ModerationTask, TaskStatus, TaskUpdate};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),
}

#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn get_item(&self, item_id: i64) -> Result<Option<Item>, StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Pending task with the highest id for `item_id`.
    async fn get_latest_pending(&self, item_id: i64)
        -> Result<Option<ModerationTask>, StoreError>;

    async fn get_task(&self, task_id: i64) -> Result<Option<ModerationTask>, StoreError>;

    /// Bump the retry counter of a pending task. `None` if the task is unknown
    /// or no longer pending.
    async fn increment_retry_count(&self, task_id: i64) -> Result<Option<i32>, StoreError>;

    /// Apply a terminal write. No-op for unknown or already-terminal tasks.
    async fn update_task(&self, task_id: i64, update: &TaskUpdate) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    items: HashMap<i64, Item>,
    tasks: BTreeMap<i64, ModerationTask>,
    next_task_id: i64,
    unavailable: bool,
    writes_unavailable: bool,
    write_count: usize,
}

impl MemoryState {
    fn check_read(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.check_read()?;
        if self.writes_unavailable {
            return Err(StoreError::Unavailable("in-memory store rejecting writes".into()));
        }
        Ok(())
    }
}

/// Mutex-guarded store with the same single-row semantics as the Postgres one.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store poisoned".into()))
    }

    pub fn insert_item(&self, item: Item) {
        if let Ok(mut state) = self.lock() {
            state.items.insert(item.id, item);
        }
    }

    /// Create a pending task the way the request layer does. Returns its id.
    pub fn create_task(&self, item_id: i64) -> i64 {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        state.next_task_id += 1;
        let id = state.next_task_id;
        state.tasks.insert(
            id,
            ModerationTask {
                id,
                item_id,
                status: TaskStatus::Pending,
                is_violation: None,
                probability: None,
                error_message: None,
                retry_count: 0,
                created_at: Utc::now(),
                processed_at: None,
            },
        );
        id
    }

    pub fn task(&self, task_id: i64) -> Option<ModerationTask> {
        self.lock().ok()?.tasks.get(&task_id).cloned()
    }

    /// Fail every read and write while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Fail writes only while set; reads keep working.
    pub fn set_writes_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.lock() {
            state.writes_unavailable = unavailable;
        }
    }

    /// Number of successful task writes so far.
    pub fn write_count(&self) -> usize {
        self.lock().map(|s| s.write_count).unwrap_or(0)
    }
}

#[async_trait]
impl ItemRepository for InMemoryStore {
    async fn get_item(&self, item_id: i64) -> Result<Option<Item>, StoreError> {
        let state = self.lock()?;
        state.check_read()?;
        Ok(state.items.get(&item_id).cloned())
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn get_latest_pending(
        &self,
        item_id: i64,
    ) -> Result<Option<ModerationTask>, StoreError> {
        let state = self.lock()?;
        state.check_read()?;
        Ok(state
            .tasks
            .values()
            .rev()
            .find(|t| t.item_id == item_id && t.status == TaskStatus::Pending)
            .cloned())
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<ModerationTask>, StoreError> {
        let state = self.lock()?;
        state.check_read()?;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn increment_retry_count(&self, task_id: i64) -> Result<Option<i32>, StoreError> {
        let mut state = self.lock()?;
        state.check_write()?;
        let Some(task) = state
            .tasks
            .get_mut(&task_id)
            .filter(|t| t.status == TaskStatus::Pending)
        else {
            return Ok(None);
        };
        task.retry_count += 1;
        task.processed_at = Some(Utc::now());
        let count = task.retry_count;
        state.write_count += 1;
        Ok(Some(count))
    }

    async fn update_task(&self, task_id: i64, update: &TaskUpdate) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.check_write()?;
        let Some(task) = state
            .tasks
            .get_mut(&task_id)
            .filter(|t| t.status == TaskStatus::Pending)
        else {
            return Ok(());
        };
        task.status = update.status;
        task.is_violation = update.is_violation;
        task.probability = update.probability;
        task.error_message = update.error_message.clone();
        if let Some(count) = update.retry_count {
            task.retry_count = task.retry_count.max(count);
        }
        task.processed_at = Some(Utc::now());
        state.write_count += 1;
        Ok(())
    }
}
