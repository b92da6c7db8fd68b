//! Offline-first sync: per-domain engines, merge rules, scheduling and events.

mod coordinator;
mod domain;
mod engine;
mod events;
mod resolver;
mod scheduler;

#[cfg(test)]
mod tests;

pub use coordinator::{RemoteBackends, SyncCoordinator};
pub use domain::SyncDomain;
pub use engine::{
    ConflictChoice, IdentityChange, Mutation, MutationContext, SkipReason, SyncEngine, SyncOutcome,
};
pub use events::{DomainKind, SyncEvent, SyncReport};
pub use resolver::{
    apply_unit, merge_collection, merge_singleton, resolve_unit, MergeReport, Resolution,
};
pub use scheduler::Debouncer;
