//! Persistence of machine records.
//!
//! A machine is always read and written as a whole record; there is no
//! per-service storage. Read-modify-write cycles go through
//! [`MachineStore::modify_machine`], which a store runs as one step.

pub mod json_store;
pub mod memory_store;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Machine;

pub use json_store::JsonFileStore;
pub use memory_store::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed machine data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Machine not found: {0}")]
    MachineNotFound(String),
}

/// Edit applied to a freshly loaded machine. Returns whether the result should
/// be written back.
pub type MachineEdit<'a> = Box<dyn FnOnce(&mut Machine) -> bool + Send + 'a>;

#[async_trait]
pub trait MachineStore: Send + Sync {
    /// Loads the current record, or `None` when no machine has that id.
    async fn get_machine(&self, id: &str) -> Result<Option<Machine>, StoreError>;

    /// Replaces the record stored under `owner/name`. Returns `false` when no
    /// such record exists; nothing is created in that case.
    async fn update_machine(
        &self,
        owner: &str,
        name: &str,
        machine: &Machine,
    ) -> Result<bool, StoreError>;

    /// Loads `id`, applies `edit` and persists the result when the edit asks
    /// for it. No other writer of the same backing storage can interleave, in
    /// this process or another. Returns the machine as edited, or `None` when
    /// no machine has that id.
    async fn modify_machine(
        &self,
        id: &str,
        edit: MachineEdit<'_>,
    ) -> Result<Option<Machine>, StoreError>;

    async fn list_machine_ids(&self) -> Result<Vec<String>, StoreError>;
}
