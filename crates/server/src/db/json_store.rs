use async_trait::async_trait;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{MachineEdit, MachineStore, StoreError};
use crate::model::Machine;

pub const MACHINES_FILE: &str = "machines.json";

/// All machines in one JSON document, keyed by machine id.
///
/// Reads always go to disk so a pass sees what the last writer left. Writes
/// replace the file through a temp file in the same directory, so readers
/// never observe a half-written document.
///
/// Writers take an advisory lock on `<file>.lock`, so a daemon and one-shot
/// commands sharing the file take turns as well.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // The file holds every machine, so writers for different machines must
    // still take turns.
    write_lock: Mutex<()>,
}

/// Held for the whole of a read-modify-write of the machine file.
struct WriteLock<'a> {
    file: File,
    _local: MutexGuard<'a, ()>,
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        // Closing the file releases the lock as well.
        let _ = FileExt::unlock(&self.file);
    }
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at `<data_dir>/machines.json`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(MACHINES_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".lock");
        path.into()
    }

    async fn lock_for_write(&self) -> Result<WriteLock<'_>, StoreError> {
        let local = self.write_lock.lock().await;
        let lock_path = self.lock_path();
        let file = tokio::task::spawn_blocking(move || -> Result<File, StoreError> {
            if let Some(dir) = lock_path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        debug!(path = ?self.path, "Machine file locked for writing.");
        Ok(WriteLock {
            file,
            _local: local,
        })
    }

    /// Adds or replaces a machine record.
    pub async fn insert_machine(&self, machine: Machine) -> Result<(), StoreError> {
        let _lock = self.lock_for_write().await?;
        let mut machines = self.read_all().await?;
        machines.insert(machine.id(), machine);
        self.write_all(&machines).await
    }

    async fn read_all(&self) -> Result<BTreeMap<String, Machine>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "Machine file does not exist yet.");
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, machines: &BTreeMap<String, Machine>) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(machines)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&contents)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        info!(path = ?self.path, count = machines.len(), "Saved machine file.");
        Ok(())
    }
}

#[async_trait]
impl MachineStore for JsonFileStore {
    async fn get_machine(&self, id: &str) -> Result<Option<Machine>, StoreError> {
        let mut machines = self.read_all().await?;
        Ok(machines.remove(id))
    }

    async fn update_machine(
        &self,
        owner: &str,
        name: &str,
        machine: &Machine,
    ) -> Result<bool, StoreError> {
        let id = format!("{owner}/{name}");
        let _lock = self.lock_for_write().await?;
        let mut machines = self.read_all().await?;
        match machines.get_mut(&id) {
            Some(existing) => *existing = machine.clone(),
            None => return Ok(false),
        }
        self.write_all(&machines).await?;
        Ok(true)
    }

    async fn modify_machine(
        &self,
        id: &str,
        edit: MachineEdit<'_>,
    ) -> Result<Option<Machine>, StoreError> {
        let _lock = self.lock_for_write().await?;
        let mut machines = self.read_all().await?;
        let Some(machine) = machines.get_mut(id) else {
            return Ok(None);
        };
        let persist = edit(machine);
        let edited = machine.clone();
        if persist {
            self.write_all(&machines).await?;
        }
        Ok(Some(edited))
    }

    async fn list_machine_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.read_all().await?.into_keys().collect())
    }
}
