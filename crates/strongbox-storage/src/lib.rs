pub mod factory;
pub mod local;
pub mod provider;
pub mod s3;

pub use factory::create_backend;
pub use provider::{RemoteEntry, SetupOutcome, StorageBackend};
