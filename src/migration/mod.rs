//! Chunk migration machinery.
//!
//! The donor side lives in [`donor`], the recipient side in
//! [`recipient`], and the crash-recovery coordinator in [`coordinator`].
//! Durable migration decisions are recorded through [`recovery`], and
//! the donor/recipient wire surface is defined in [`transport`].

pub mod coordinator;
pub mod donor;
pub mod recipient;
pub mod recovery;
pub mod transport;

pub use coordinator::{MigrationCoordinator, RecoverySummary};
pub use donor::{ActiveMigrationRegistry, DonorDeps, DonorState, MigrationSourceManager};
pub use recipient::{DestinationState, MigrationDestinationManager};
pub use recovery::{
    FileRecoveryStore, InMemoryRecoveryStore, MigrationDecision, MigrationRecoveryDocument,
    RecoveryStore,
};
pub use transport::{CloneBatch, LocalRecipientRpc, RecipientRpc, StartRecipientRequest};
