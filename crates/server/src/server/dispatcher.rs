use tracing::{debug, error, info};

use crate::model::{ExpectedStatus, Machine, Service, ServiceStatus};
use crate::server::phases::Phase;
use crate::server::reconciler::{PhaseError, Reconciler};

/// What the automatic loop may do to a service. Pull, build and deploy are
/// only ever run on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
}

impl Action {
    pub fn phase(&self) -> Phase {
        match self {
            Action::Start => Phase::Start,
            Action::Stop => Phase::Stop,
        }
    }
}

#[derive(Debug)]
pub struct ActionOutcome {
    pub no: i32,
    pub service: String,
    pub action: Action,
    pub result: Result<(), PhaseError>,
}

/// Decides which action, if any, moves `service` toward its expected state.
///
/// Sub-status is not consulted: a service whose last start failed is still
/// `Running`/`Error` and is not retried until a census records it `Stopped`.
pub fn plan_action(service: &Service) -> Option<Action> {
    match (service.expected_status, service.status) {
        (ExpectedStatus::Running, ServiceStatus::Stopped) => Some(Action::Start),
        (ExpectedStatus::Stopped, ServiceStatus::Running) => Some(Action::Stop),
        _ => None,
    }
}

impl Reconciler {
    /// Runs the planned action for every service of `machine`, one after the
    /// other. Each action persists its own status changes; a failing action
    /// does not prevent the others.
    pub async fn dispatch_actions(&self, machine: &Machine) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::new();
        for service in machine.services.values() {
            let Some(action) = plan_action(service) else {
                debug!(machine = %machine.id(), service = %service.name, "Service already converged.");
                continue;
            };

            info!(machine = %machine.id(), service = %service.name, ?action, "Dispatching action.");
            let result = self.run_phase(action.phase(), machine, service).await;
            if let Err(e) = &result {
                error!(machine = %machine.id(), service = %service.name, ?action, error = %e, "Action failed.");
            }
            outcomes.push(ActionOutcome {
                no: service.no,
                service: service.name.clone(),
                action,
                result,
            });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MachineStore;
    use crate::model::{SubStatus, PROCESS_ID_NOT_RUNNING};
    use crate::testing::{fixture_machine, reconciler_with, ScriptedExecutor};

    fn service(expected: ExpectedStatus, status: ServiceStatus) -> Service {
        let mut service = Service::new(1, "casnode", expected);
        service.status = status;
        service
    }

    #[test]
    fn plans_follow_expected_state() {
        use ExpectedStatus as E;
        use ServiceStatus as S;
        assert_eq!(plan_action(&service(E::Running, S::Stopped)), Some(Action::Start));
        assert_eq!(plan_action(&service(E::Stopped, S::Running)), Some(Action::Stop));
        assert_eq!(plan_action(&service(E::Running, S::Running)), None);
        assert_eq!(plan_action(&service(E::Stopped, S::Stopped)), None);
        for status in [S::Unset, S::Pull, S::Build, S::Deploy] {
            assert_eq!(plan_action(&service(E::Running, status)), None);
            assert_eq!(plan_action(&service(E::Stopped, status)), None);
        }
    }

    #[tokio::test]
    async fn cycle_starts_and_stops_then_reobserves() {
        let executor = ScriptedExecutor::new();
        executor.respond(
            "SCHTASKS",
            "成功: 成功创建计划任务。\r\n成功: 尝试运行。\r\n成功: 被成功删除。\r\n",
        );
        executor.respond("taskkill", "成功: 已终止 PID 为 5236 的进程。\r\n");
        executor.respond(
            "wmic",
            "C:\\Windows\\system32\\cmd.exe /c \"\"C:\\Users\\Administrator\\Desktop\\casnode.bat\" \"   7001\r\n",
        );

        let mut machine = fixture_machine();
        {
            // casnode should run but is stopped; casdoor should be stopped but runs.
            let casnode = machine.service_mut(1).unwrap();
            casnode.status = ServiceStatus::Stopped;
            let casdoor = machine.service_mut(2).unwrap();
            casdoor.status = ServiceStatus::Running;
            casdoor.process_id = 5236;
        }
        let (reconciler, store) = reconciler_with(machine.clone(), executor.clone()).await;

        let report = reconciler.run_one_cycle(&machine).await.unwrap();
        assert_eq!(report.actions.len(), 2);
        assert!(report.actions.iter().all(|a| a.result.is_ok()));
        assert_eq!(report.actions[0].action, Action::Start);
        assert_eq!(report.actions[1].action, Action::Stop);

        let casnode = report.machine.service(1).unwrap();
        assert_eq!(casnode.status, ServiceStatus::Running);
        assert_eq!(casnode.sub_status, SubStatus::Done);
        assert_eq!(casnode.process_id, 7001);
        let casdoor = report.machine.service(2).unwrap();
        assert_eq!(casdoor.status, ServiceStatus::Stopped);
        assert_eq!(casdoor.process_id, PROCESS_ID_NOT_RUNNING);

        let stored = store.get_machine("admin/win-01").await.unwrap().unwrap();
        assert_eq!(stored, report.machine);
        assert!(executor.calls().last().unwrap().starts_with("wmic"));
    }

    #[tokio::test]
    async fn failed_start_does_not_block_other_services() {
        let executor = ScriptedExecutor::new();
        executor.respond("SCHTASKS", "错误: 拒绝访问。\r\n");
        executor.respond("taskkill", "");
        executor.respond("wmic", "");

        let mut machine = fixture_machine();
        {
            machine.service_mut(1).unwrap().status = ServiceStatus::Stopped;
            let casdoor = machine.service_mut(2).unwrap();
            casdoor.status = ServiceStatus::Running;
            casdoor.process_id = 5236;
        }
        let (reconciler, _store) = reconciler_with(machine.clone(), executor).await;

        let report = reconciler.run_one_cycle(&machine).await.unwrap();
        assert!(report.actions[0].result.is_err());
        assert!(report.actions[1].result.is_ok());

        let casnode = report.machine.service(1).unwrap();
        assert_eq!(casnode.sub_status, SubStatus::Error);
        assert!(casnode.message.contains("拒绝访问"));
        // The census found nothing running, so the phase status reflects reality again.
        assert_eq!(casnode.status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn converged_machine_only_runs_census() {
        let executor = ScriptedExecutor::new();
        executor.respond("wmic", "");
        let mut machine = fixture_machine();
        machine.service_mut(1).unwrap().expected_status = ExpectedStatus::Stopped;
        machine.service_mut(1).unwrap().status = ServiceStatus::Stopped;
        machine.service_mut(2).unwrap().status = ServiceStatus::Stopped;
        let (reconciler, _store) = reconciler_with(machine.clone(), executor.clone()).await;

        let report = reconciler.run_one_cycle(&machine).await.unwrap();
        assert!(report.actions.is_empty());
        assert_eq!(executor.calls().len(), 1);
    }
}
