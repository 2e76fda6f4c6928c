//! Reconciliation of a machine's recorded service state with what is actually
//! running on it.
//!
//! All writes to a machine record go through [`Reconciler::mutate_service`] or
//! [`Reconciler::sync_observed_state`]; both hold the machine's guard and hand
//! their change to [`MachineStore::modify_machine`], which reloads, applies and
//! persists it in one step.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::{MachineStore, StoreError};
use crate::model::{
    split_machine_id, Machine, Service, ServiceStatus, SubStatus, PROCESS_ID_NOT_RUNNING,
};
use crate::server::census::{parse_census, Census, CENSUS_COMMAND};
use crate::server::dispatcher::ActionOutcome;
use crate::server::executor::{ExecError, RemoteExecutor, Target};
use crate::server::guard::MachineLocks;
use crate::server::phases::{CommandLayout, Phase};

/// Failure of a single phase on a single service.
#[derive(Error, Debug)]
pub enum PhaseError {
    /// The remote command could not be run. The service keeps the state it had
    /// before the phase started.
    #[error("Remote command failed: {0}")]
    Transport(#[from] ExecError),
    /// The command ran but its output did not look like success. The output is
    /// also stored as the service's message.
    #[error("{phase} did not succeed: {output}")]
    Mismatch { phase: Phase, output: String },
    #[error("Service {no} not found on machine {machine}")]
    ServiceNotFound { machine: String, no: i32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Machine not found: {0}")]
    MachineNotFound(String),
    #[error("Process census failed: {0}")]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The actions of a pass ran and persisted their results, but the closing
    /// census did not.
    #[error("Closing census failed after {} action(s): {source}", .actions.len())]
    CycleIncomplete {
        actions: Vec<ActionOutcome>,
        source: Box<ReconcileError>,
    },
}

/// Result of one reconciliation pass.
#[derive(Debug)]
pub struct CycleReport {
    pub actions: Vec<ActionOutcome>,
    /// Machine as recorded after the closing census.
    pub machine: Machine,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn MachineStore>,
    executor: Arc<dyn RemoteExecutor>,
    locks: MachineLocks,
    layout: CommandLayout,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn MachineStore>,
        executor: Arc<dyn RemoteExecutor>,
        layout: CommandLayout,
    ) -> Self {
        Self {
            store,
            executor,
            locks: MachineLocks::new(),
            layout,
        }
    }

    pub fn layout(&self) -> &CommandLayout {
        &self.layout
    }

    pub(crate) async fn run_command(
        &self,
        machine: &Machine,
        command: &str,
    ) -> Result<String, ExecError> {
        self.executor.execute(&Target::from(machine), command).await
    }

    pub async fn load_machine(&self, machine_id: &str) -> Result<Machine, ReconcileError> {
        self.store
            .get_machine(machine_id)
            .await?
            .ok_or_else(|| ReconcileError::MachineNotFound(machine_id.to_string()))
    }

    /// Runs the process census on `machine` and parses it.
    pub async fn observe(&self, machine: &Machine) -> Result<Census, ExecError> {
        let output = self.run_command(machine, CENSUS_COMMAND).await?;
        let census = parse_census(&output);
        debug!(machine = %machine.id(), running = census.len(), "Process census taken.");
        Ok(census)
    }

    /// Applies a census to every service of `machine`. A service whose script is
    /// running becomes `Running` with the observed pid; every other service
    /// becomes `Stopped` with the not-running sentinel. Returns whether any
    /// service changed.
    pub fn apply_census(machine: &mut Machine, census: &Census) -> bool {
        let mut affected = false;
        for service in machine.services.values_mut() {
            let (status, process_id) = match census.get(&service.name) {
                Some(&pid) => (ServiceStatus::Running, pid),
                None => (ServiceStatus::Stopped, PROCESS_ID_NOT_RUNNING),
            };
            if service.status != status || service.process_id != process_id {
                debug!(
                    service = %service.name,
                    no = service.no,
                    from = %service.status,
                    to = %status,
                    pid = process_id,
                    "Observed state differs from record."
                );
                affected = true;
                service.status = status;
                service.process_id = process_id;
            }
        }
        affected
    }

    /// Refreshes the recorded process state of one machine from a fresh census
    /// and persists it if anything changed.
    ///
    /// The census runs without the machine guard; the record is reloaded under
    /// the guard before the result is applied. A census that cannot be run
    /// leaves the record untouched.
    pub async fn sync_observed_state(&self, machine_id: &str) -> Result<Machine, ReconcileError> {
        let machine = self.load_machine(machine_id).await?;
        let census = self.observe(&machine).await?;

        let _guard = self.locks.lock(machine_id).await;
        let mut changed = false;
        let machine = self
            .store
            .modify_machine(
                machine_id,
                Box::new(|machine: &mut Machine| {
                    changed = Self::apply_census(machine, &census);
                    changed
                }),
            )
            .await?
            .ok_or_else(|| ReconcileError::MachineNotFound(machine_id.to_string()))?;
        if changed {
            info!(machine = %machine_id, "Recorded process state updated.");
        }
        Ok(machine)
    }

    /// One reconciliation pass: start or stop services whose recorded state
    /// differs from the expected one, then re-observe the machine.
    pub async fn run_one_cycle(&self, machine: &Machine) -> Result<CycleReport, ReconcileError> {
        let actions = self.dispatch_actions(machine).await;
        match self.sync_observed_state(&machine.id()).await {
            Ok(machine) => Ok(CycleReport { actions, machine }),
            Err(e) => {
                warn!(machine = %machine.id(), actions = actions.len(), error = %e, "Closing census failed.");
                Err(ReconcileError::CycleIncomplete {
                    actions,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Loads `machine_id` fresh, applies `mutate` to service `no` and persists
    /// the machine, all under the machine guard. The guard is released on
    /// every return path.
    ///
    /// Returns the service as it was before and after the change. A service
    /// left in any status other than `Running` always gets the not-running pid.
    pub async fn mutate_service<F>(
        &self,
        machine_id: &str,
        no: i32,
        mutate: F,
    ) -> Result<(Service, Service), PhaseError>
    where
        F: FnOnce(&mut Service) + Send,
    {
        let _guard = self.locks.lock(machine_id).await;

        let mut change = None;
        self.store
            .modify_machine(
                machine_id,
                Box::new(|machine: &mut Machine| {
                    let Some(service) = machine.service_mut(no) else {
                        return false;
                    };
                    let before = service.clone();
                    mutate(service);
                    if service.status != ServiceStatus::Running {
                        service.process_id = PROCESS_ID_NOT_RUNNING;
                    }
                    change = Some((before, service.clone()));
                    true
                }),
            )
            .await?
            .ok_or_else(|| StoreError::MachineNotFound(machine_id.to_string()))?;

        change.ok_or_else(|| PhaseError::ServiceNotFound {
            machine: machine_id.to_string(),
            no,
        })
    }

    /// Sets status, sub-status and message of one service together.
    pub async fn update_service_status(
        &self,
        machine_id: &str,
        no: i32,
        status: ServiceStatus,
        sub_status: SubStatus,
        message: impl Into<String>,
    ) -> Result<Service, PhaseError> {
        let message = message.into();
        let (_, after) = self
            .mutate_service(machine_id, no, |service| {
                service.status = status;
                service.sub_status = sub_status;
                service.message = message;
            })
            .await?;
        Ok(after)
    }

    /// Puts back the status fields captured before a phase started. Status and
    /// pid recorded since the phase `marked` the service came from a newer
    /// census than `prior` and are kept.
    pub(crate) async fn restore_service_status(
        &self,
        machine_id: &str,
        prior: &Service,
        marked: &Service,
    ) {
        let mut observed_kept = false;
        let result = self
            .mutate_service(machine_id, prior.no, |service| {
                if service.sub_status != marked.sub_status {
                    return;
                }
                service.sub_status = prior.sub_status;
                service.message = prior.message.clone();
                if service.status == marked.status && service.process_id == marked.process_id {
                    service.status = prior.status;
                    service.process_id = prior.process_id;
                } else {
                    observed_kept = true;
                }
            })
            .await;
        match result {
            Ok(_) if observed_kept => {
                info!(machine = %machine_id, no = prior.no, "Keeping process state observed during the phase.")
            }
            Ok(_) => {}
            Err(e) => {
                warn!(machine = %machine_id, no = prior.no, error = %e, "Failed to restore service status.")
            }
        }
    }
}

/// Parses `owner/name`, reporting the id itself when it is malformed.
pub fn parse_machine_id(id: &str) -> Result<(&str, &str), ReconcileError> {
    split_machine_id(id).ok_or_else(|| ReconcileError::MachineNotFound(id.to_string()))
}
