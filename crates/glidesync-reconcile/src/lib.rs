//! Glidesync Reconcile - Declarative state reconciliation
//!
//! Reconcilers diff a caller-declared desired state against the remote
//! instance and either report a pending plan or commit it:
//!
//! - `TableReconciler` - Table shape (and the column sub-reconciler)
//! - `ChoiceReconciler` - Choice lists per column
//! - `PolicyReconciler` - The managed data policy and its per-column rules
//! - `RelationshipReconciler` - CI relationships between row sets
//! - `DeltaMerge` - Bulk row reconciliation under a primary-key function

mod choice;
mod column;
mod delta;
mod plan;
mod policy;
mod relationship;
mod rows;
mod table;

pub use choice::ChoiceReconciler;
pub use delta::{DELETED_FLAG, DeltaMerge, DeltaMergeOpts, DeltaOutcome, PrimaryKey};
pub use plan::{ActionKind, PendingAction, Plan};
pub use policy::{PolicyReconciler, PolicyToggleGuard};
pub use relationship::{RelationshipOutcome, RelationshipReconciler};
pub use table::{SyncCounts, TableReconciler};

use glidesync_client::Client;

/// Root aggregate bundling every reconciler over one client.
///
/// Each sub-reconciler holds a cheap clone of the client handle rather
/// than a back-reference, so there are no cycles.
pub struct Reconciler {
    pub tables: TableReconciler,
    pub choices: ChoiceReconciler,
    pub policies: PolicyReconciler,
    pub relationships: RelationshipReconciler,
    pub delta: DeltaMerge,
}

impl Reconciler {
    pub fn new(client: Client) -> Self {
        Self {
            tables: TableReconciler::new(client.clone()),
            choices: ChoiceReconciler::new(client.clone()),
            policies: PolicyReconciler::new(client.clone()),
            relationships: RelationshipReconciler::new(client.clone()),
            delta: DeltaMerge::new(client),
        }
    }
}
