pub mod db;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use machine_sync_common as model;
