pub mod backup;
pub mod recovery;

pub use backup::{BackupCoordinator, BackupSettings, RunOutcome, Trigger, TriggerOutcome};
pub use recovery::{RecoveryCoordinator, RecoverySettings};
