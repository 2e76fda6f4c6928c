//! Test doubles for the remote executor and storage.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::{MachineEdit, MachineStore, MemoryStore, StoreError};
use crate::model::{ExpectedStatus, Machine, Service};
use crate::server::executor::{ExecError, RemoteExecutor, Target};
use crate::server::phases::CommandLayout;
use crate::server::reconciler::Reconciler;

struct Rule {
    needle: String,
    // The last response repeats once the queue is down to one entry.
    responses: VecDeque<Result<String, ExecError>>,
}

/// Answers commands by the first rule whose needle the command contains.
/// Unmatched commands print nothing. Clones share rules and the call log.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    rules: Arc<Mutex<Vec<Rule>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, needle: &str, responses: Vec<Result<String, ExecError>>) {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            responses: responses.into(),
        });
    }

    pub fn respond(&self, needle: &str, output: &str) {
        self.push(needle, vec![Ok(output.to_string())]);
    }

    /// Successive matching commands get successive outputs.
    pub fn respond_sequence<const N: usize>(&self, needle: &str, outputs: [&str; N]) {
        self.push(needle, outputs.iter().map(|o| Ok(o.to_string())).collect());
    }

    /// Matching commands fail as if the host were unreachable.
    pub fn fail(&self, needle: &str) {
        self.push(
            needle,
            vec![Err(ExecError::Connection {
                host: "10.0.0.5".to_string(),
                code: 255,
                stderr: "ssh: connect to host 10.0.0.5 port 22: Connection refused".to_string(),
            })],
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, _target: &Target, command: &str) -> Result<String, ExecError> {
        self.calls.lock().unwrap().push(command.to_string());
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| command.contains(&r.needle)) else {
            return Ok(String::new());
        };
        if rule.responses.len() > 1 {
            rule.responses.pop_front().unwrap()
        } else {
            rule.responses.front().cloned().unwrap_or_else(|| Ok(String::new()))
        }
    }
}

/// Delays every load, and stalls every read-modify-write between load and
/// save, so unguarded cycles would interleave.
pub struct SlowStore {
    inner: Arc<dyn MachineStore>,
    delay: Duration,
}

impl SlowStore {
    pub fn new(inner: Arc<dyn MachineStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl MachineStore for SlowStore {
    async fn get_machine(&self, id: &str) -> Result<Option<Machine>, StoreError> {
        let machine = self.inner.get_machine(id).await;
        tokio::time::sleep(self.delay).await;
        machine
    }

    async fn update_machine(
        &self,
        owner: &str,
        name: &str,
        machine: &Machine,
    ) -> Result<bool, StoreError> {
        self.inner.update_machine(owner, name, machine).await
    }

    async fn modify_machine(
        &self,
        id: &str,
        edit: MachineEdit<'_>,
    ) -> Result<Option<Machine>, StoreError> {
        let delay = self.delay;
        self.inner
            .modify_machine(
                id,
                Box::new(move |machine: &mut Machine| {
                    std::thread::sleep(delay);
                    edit(machine)
                }),
            )
            .await
    }

    async fn list_machine_ids(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_machine_ids().await
    }
}

/// `admin/win-01` with `casnode` (no 1, expected running) and `casdoor`
/// (no 2, expected stopped), both never observed.
pub fn fixture_machine() -> Machine {
    let mut machine = Machine::new("admin", "win-01", "10.0.0.5", "Administrator", "pw");
    machine.put_service(Service::new(1, "casnode", ExpectedStatus::Running));
    machine.put_service(Service::new(2, "casdoor", ExpectedStatus::Stopped));
    machine
}

pub async fn reconciler_with(
    machine: Machine,
    executor: ScriptedExecutor,
) -> (Reconciler, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.insert_machine(machine).await;
    let reconciler = Reconciler::new(store.clone(), Arc::new(executor), CommandLayout::default());
    (reconciler, store)
}
