// Object store access: opendal-backed operator and its backend configuration

pub mod storage;
pub mod storage_config;

pub use storage::{CloudStore, CloudWriter};
pub use storage_config::{BackendConfig, CloudBackend, LocalBackend};
