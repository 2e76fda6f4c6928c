//! The five service phases. Each one marks the service `In Progress`, runs its
//! remote commands, and records `Done` or `Error` from the command output.
//!
//! If a remote command cannot be run at all the service goes back to the state
//! it had before the phase started and the transport error is returned.

use tracing::{info, warn};

use crate::model::{Machine, Service, SubStatus, PROCESS_ID_NOT_RUNNING};
use crate::server::phases::{
    OutputRule, Phase, BUILD_STEP_SUCCEEDED, DEPLOY_NEEDS_TIDY, DEPLOY_SUCCEEDED, PULL_SUCCEEDED,
    START_SUCCEEDED, TIDY_FAILED,
};
use crate::server::reconciler::{PhaseError, Reconciler};

/// A service as it was before a phase began and as the phase marked it.
struct Started {
    prior: Service,
    marked: Service,
}

impl Reconciler {
    pub async fn run_phase(
        &self,
        phase: Phase,
        machine: &Machine,
        service: &Service,
    ) -> Result<(), PhaseError> {
        match phase {
            Phase::Pull => self.pull(machine, service).await,
            Phase::Build => self.build(machine, service).await,
            Phase::Deploy => self.deploy(machine, service).await,
            Phase::Start => self.start(machine, service).await,
            Phase::Stop => self.stop(machine, service).await,
        }
    }

    /// `git pull --rebase --autostash` in the service's checkout.
    pub async fn pull(&self, machine: &Machine, service: &Service) -> Result<(), PhaseError> {
        let started = self.begin(machine, service, Phase::Pull).await?;
        let output = self
            .remote(machine, &started, &self.layout().pull_command(&service.name))
            .await?;
        self.finish(machine, service, Phase::Pull, &PULL_SUCCEEDED, output)
            .await
    }

    /// `yarn install` then `yarn build`. A failed install ends the phase.
    pub async fn build(&self, machine: &Machine, service: &Service) -> Result<(), PhaseError> {
        let started = self.begin(machine, service, Phase::Build).await?;

        let install = self
            .remote(machine, &started, &self.layout().install_command(&service.name))
            .await?;
        if !BUILD_STEP_SUCCEEDED.matches(&install) {
            return self.fail(machine, service, Phase::Build, install).await;
        }

        let output = self
            .remote(machine, &started, &self.layout().build_command(&service.name))
            .await?;
        self.finish(machine, service, Phase::Build, &BUILD_STEP_SUCCEEDED, output)
            .await
    }

    /// `go test`, running `go mod tidy` and retrying once when the module graph
    /// is missing a package.
    pub async fn deploy(&self, machine: &Machine, service: &Service) -> Result<(), PhaseError> {
        let started = self.begin(machine, service, Phase::Deploy).await?;
        let test_command = self.layout().test_command(&service.name);

        let mut output = self.remote(machine, &started, &test_command).await?;
        if DEPLOY_NEEDS_TIDY.matches(&output) {
            info!(machine = %machine.id(), service = %service.name, "Tidying modules before retrying tests.");
            let tidy = self
                .remote(machine, &started, &self.layout().tidy_command(&service.name))
                .await?;
            if TIDY_FAILED.matches(&tidy) {
                return self.fail(machine, service, Phase::Deploy, tidy).await;
            }
            output = self.remote(machine, &started, &test_command).await?;
        }

        self.finish(machine, service, Phase::Deploy, &DEPLOY_SUCCEEDED, output)
            .await
    }

    /// Launches the service's startup shortcut through a one-off scheduled task.
    pub async fn start(&self, machine: &Machine, service: &Service) -> Result<(), PhaseError> {
        let started = self.begin(machine, service, Phase::Start).await?;
        let output = self
            .remote(machine, &started, &self.layout().start_command(&service.name))
            .await?;
        self.finish(machine, service, Phase::Start, &START_SUCCEEDED, output)
            .await
    }

    /// Kills the service's process tree. There is no failure outcome: a pid
    /// that no longer exists counts as stopped.
    pub async fn stop(&self, machine: &Machine, service: &Service) -> Result<(), PhaseError> {
        let started = self.begin(machine, service, Phase::Stop).await?;

        let pid = started.prior.process_id;
        if pid == PROCESS_ID_NOT_RUNNING {
            info!(machine = %machine.id(), service = %service.name, "No recorded pid, nothing to kill.");
        } else {
            let output = self
                .remote(machine, &started, &self.layout().stop_command(pid))
                .await?;
            info!(
                machine = %machine.id(),
                service = %service.name,
                pid,
                output = %output.trim(),
                "Kill issued."
            );
        }

        self.mark(machine, service, Phase::Stop, SubStatus::Done, String::new())
            .await
    }

    /// Marks the phase in progress.
    async fn begin(
        &self,
        machine: &Machine,
        service: &Service,
        phase: Phase,
    ) -> Result<Started, PhaseError> {
        info!(machine = %machine.id(), service = %service.name, no = service.no, %phase, "Phase started.");
        let (prior, marked) = self
            .mutate_service(&machine.id(), service.no, |s| {
                s.status = phase.status();
                s.sub_status = SubStatus::InProgress;
                s.message.clear();
            })
            .await?;
        Ok(Started { prior, marked })
    }

    /// Runs one remote command of a phase, rolling the service back to the
    /// state it had before the phase if the command could not be run.
    async fn remote(
        &self,
        machine: &Machine,
        started: &Started,
        command: &str,
    ) -> Result<String, PhaseError> {
        match self.run_command(machine, command).await {
            Ok(output) => Ok(output),
            Err(e) => {
                warn!(machine = %machine.id(), service = %started.prior.name, error = %e, "Remote command could not run; restoring previous status.");
                self.restore_service_status(&machine.id(), &started.prior, &started.marked)
                    .await;
                Err(e.into())
            }
        }
    }

    async fn finish(
        &self,
        machine: &Machine,
        service: &Service,
        phase: Phase,
        rule: &OutputRule,
        output: String,
    ) -> Result<(), PhaseError> {
        if rule.matches(&output) {
            self.mark(machine, service, phase, SubStatus::Done, String::new())
                .await
        } else {
            self.fail(machine, service, phase, output).await
        }
    }

    async fn fail(
        &self,
        machine: &Machine,
        service: &Service,
        phase: Phase,
        output: String,
    ) -> Result<(), PhaseError> {
        warn!(machine = %machine.id(), service = %service.name, %phase, "Phase output did not indicate success.");
        self.update_service_status(
            &machine.id(),
            service.no,
            phase.status(),
            SubStatus::Error,
            output.clone(),
        )
        .await?;
        Err(PhaseError::Mismatch { phase, output })
    }

    async fn mark(
        &self,
        machine: &Machine,
        service: &Service,
        phase: Phase,
        sub_status: SubStatus,
        message: String,
    ) -> Result<(), PhaseError> {
        self.update_service_status(&machine.id(), service.no, phase.status(), sub_status, message)
            .await?;
        info!(machine = %machine.id(), service = %service.name, %phase, sub_status = %sub_status, "Phase finished.");
        Ok(())
    }
}
