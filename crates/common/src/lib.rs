pub mod model;

pub use model::{
    split_machine_id, ExpectedStatus, Machine, Service, ServiceStatus, SubStatus,
    PROCESS_ID_NOT_RUNNING,
};
