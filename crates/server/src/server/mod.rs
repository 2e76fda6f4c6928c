pub mod census;
pub mod config;
pub mod dispatcher;
pub mod encoding;
pub mod executor;
pub mod guard;
pub mod phases;
pub mod reconciler;
pub mod transitions;

pub use dispatcher::{plan_action, Action, ActionOutcome};
pub use executor::{ExecError, RemoteExecutor, SshExecutor, Target};
pub use phases::{CommandLayout, Phase};
pub use reconciler::{CycleReport, PhaseError, ReconcileError, Reconciler};
