pub mod cache;
pub mod cascade;
pub mod coordinator;
pub mod fingerprint;
pub mod keyed_mutex;
pub mod reconcile;
pub mod saga;
pub mod subscription;

pub use cascade::{CascadeDeleter, CascadeReport, FamilyReport};
pub use coordinator::{
    AccountListing, Contribution, DualWriteCoordinator, EntryOwnership, KeyListing, RemoveOutcome,
};
pub use reconcile::ReconcileReport;
