// Object store backends: opendal operator construction plus the `ObjectStore` adapter

pub mod storage;
pub mod storage_config;

pub use storage::CloudStore;
pub use storage_config::{BackendConfig, CloudBackend, LocalBackend};
