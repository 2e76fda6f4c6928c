//! Machine and service records shared by the reconciler, its storage backends
//! and the command line front end.
//!
//! Status values serialize as the exact strings stored by earlier deployments
//! ("Pull", "In Progress", ...), so persisted records stay readable by both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

/// Process id recorded for a service that is not observed running.
pub const PROCESS_ID_NOT_RUNNING: i32 = -1;

/// Coarse lifecycle phase of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServiceStatus {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pull,
    Build,
    Deploy,
    Running,
    Stopped,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Unset => "",
            ServiceStatus::Pull => "Pull",
            ServiceStatus::Build => "Build",
            ServiceStatus::Deploy => "Deploy",
            ServiceStatus::Running => "Running",
            ServiceStatus::Stopped => "Stopped",
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(ServiceStatus::Unset),
            "Pull" => Ok(ServiceStatus::Pull),
            "Build" => Ok(ServiceStatus::Build),
            "Deploy" => Ok(ServiceStatus::Deploy),
            "Running" => Ok(ServiceStatus::Running),
            "Stopped" => Ok(ServiceStatus::Stopped),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress within the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SubStatus {
    #[default]
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "In Progress")]
    InProgress,
    Done,
    Error,
}

impl SubStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubStatus::Unset => "",
            SubStatus::InProgress => "In Progress",
            SubStatus::Done => "Done",
            SubStatus::Error => "Error",
        }
    }
}

impl FromStr for SubStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(SubStatus::Unset),
            "In Progress" => Ok(SubStatus::InProgress),
            "Done" => Ok(SubStatus::Done),
            "Error" => Ok(SubStatus::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-declared steady state that drives automatic reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExpectedStatus {
    Running,
    #[default]
    Stopped,
}

impl FromStr for ExpectedStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(ExpectedStatus::Running),
            "Stopped" => Ok(ExpectedStatus::Stopped),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ExpectedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Stable key of the service within its machine. Never reused.
    pub no: i32,
    /// Script name on the remote host and the repository directory name.
    pub name: String,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub sub_status: SubStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub expected_status: ExpectedStatus,
    #[serde(default = "default_process_id")]
    pub process_id: i32,
}

fn default_process_id() -> i32 {
    PROCESS_ID_NOT_RUNNING
}

impl Service {
    pub fn new(no: i32, name: impl Into<String>, expected_status: ExpectedStatus) -> Self {
        Self {
            no,
            name: name.into(),
            status: ServiceStatus::Unset,
            sub_status: SubStatus::Unset,
            message: String::new(),
            expected_status,
            process_id: PROCESS_ID_NOT_RUNNING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub owner: String,
    pub name: String,
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    pub ip: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub services: BTreeMap<i32, Service>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Machine {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        ip: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            created_time: Utc::now(),
            description: String::new(),
            ip: ip.into(),
            port: default_ssh_port(),
            username: username.into(),
            password: password.into(),
            services: BTreeMap::new(),
        }
    }

    /// `owner/name`, the key machines are stored and locked under.
    pub fn id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn service(&self, no: i32) -> Option<&Service> {
        self.services.get(&no)
    }

    pub fn service_mut(&mut self, no: i32) -> Option<&mut Service> {
        self.services.get_mut(&no)
    }

    /// Adds or replaces the service stored under its `no`.
    pub fn put_service(&mut self, service: Service) {
        self.services.insert(service.no, service);
    }
}

/// Splits a machine id of the form `owner/name`.
pub fn split_machine_id(id: &str) -> Option<(&str, &str)> {
    let (owner, name) = id.split_once('/')?;
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_stored_values() {
        assert_eq!(SubStatus::InProgress.to_string(), "In Progress");
        assert_eq!("In Progress".parse::<SubStatus>(), Ok(SubStatus::InProgress));
        assert_eq!("Running".parse::<ServiceStatus>(), Ok(ServiceStatus::Running));
        assert_eq!("".parse::<ServiceStatus>(), Ok(ServiceStatus::Unset));
        assert!("running".parse::<ServiceStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&SubStatus::InProgress).unwrap(),
            "\"In Progress\""
        );
        assert_eq!(serde_json::to_string(&ServiceStatus::Unset).unwrap(), "\"\"");
    }

    #[test]
    fn machine_id_round_trip() {
        let machine = Machine::new("admin", "win-01", "10.0.0.5", "Administrator", "pw");
        assert_eq!(machine.id(), "admin/win-01");
        assert_eq!(split_machine_id(&machine.id()), Some(("admin", "win-01")));
        assert_eq!(split_machine_id("no-slash"), None);
        assert_eq!(split_machine_id("/name"), None);
    }

    #[test]
    fn service_record_defaults_when_fields_missing() {
        let json = r#"{"no": 3, "name": "casnode"}"#;
        let service: Service = serde_json::from_str(json).unwrap();
        assert_eq!(service.status, ServiceStatus::Unset);
        assert_eq!(service.sub_status, SubStatus::Unset);
        assert_eq!(service.expected_status, ExpectedStatus::Stopped);
        assert_eq!(service.process_id, PROCESS_ID_NOT_RUNNING);
    }

    #[test]
    fn services_are_keyed_by_no() {
        let mut machine = Machine::new("admin", "win-01", "10.0.0.5", "Administrator", "pw");
        machine.put_service(Service::new(2, "casdoor", ExpectedStatus::Running));
        machine.put_service(Service::new(1, "casnode", ExpectedStatus::Stopped));

        let json = serde_json::to_string(&machine).unwrap();
        let back: Machine = serde_json::from_str(&json).unwrap();
        assert_eq!(back.service(2).map(|s| s.name.as_str()), Some("casdoor"));
        assert_eq!(back.services.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }
}
