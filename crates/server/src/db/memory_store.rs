use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{MachineEdit, MachineStore, StoreError};
use crate::model::Machine;

/// Keeps machines in process memory. Used by tests and one-shot tooling.
#[derive(Debug, Default)]
pub struct MemoryStore {
    machines: RwLock<BTreeMap<String, Machine>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_machine(&self, machine: Machine) {
        self.machines.write().await.insert(machine.id(), machine);
    }
}

#[async_trait]
impl MachineStore for MemoryStore {
    async fn get_machine(&self, id: &str) -> Result<Option<Machine>, StoreError> {
        Ok(self.machines.read().await.get(id).cloned())
    }

    async fn update_machine(
        &self,
        owner: &str,
        name: &str,
        machine: &Machine,
    ) -> Result<bool, StoreError> {
        let id = format!("{owner}/{name}");
        let mut machines = self.machines.write().await;
        match machines.get_mut(&id) {
            Some(existing) => {
                *existing = machine.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn modify_machine(
        &self,
        id: &str,
        edit: MachineEdit<'_>,
    ) -> Result<Option<Machine>, StoreError> {
        let mut machines = self.machines.write().await;
        let Some(stored) = machines.get_mut(id) else {
            return Ok(None);
        };
        let mut edited = stored.clone();
        if edit(&mut edited) {
            *stored = edited.clone();
        }
        Ok(Some(edited))
    }

    async fn list_machine_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.machines.read().await.keys().cloned().collect())
    }
}
