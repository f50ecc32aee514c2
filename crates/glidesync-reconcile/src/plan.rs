//! Pending actions and plans
//!
//! A reconciler's planning phase produces `PendingAction`s; nothing
//! touches the wire until `commit`. Error actions carry no commit and
//! poison the whole plan: a plan with any error refuses to commit, so
//! problems are reported collectively before the first write.

use glidesync_core::{GlideError, Result};
use std::future::Future;
use std::pin::Pin;

type CommitFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Error,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// One planned change, with its deferred commit.
pub struct PendingAction {
    /// What the action is about (table or column name).
    pub name: String,
    pub kind: ActionKind,
    pub description: String,
    commit: Option<CommitFuture>,
}

impl PendingAction {
    fn with_commit(
        kind: ActionKind,
        name: impl Into<String>,
        description: impl Into<String>,
        commit: impl Future<Output = Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            commit: Some(Box::pin(commit)),
        }
    }

    pub fn create(
        name: impl Into<String>,
        description: impl Into<String>,
        commit: impl Future<Output = Result<()>> + Send + 'static,
    ) -> Self {
        Self::with_commit(ActionKind::Create, name, description, commit)
    }

    pub fn update(
        name: impl Into<String>,
        description: impl Into<String>,
        commit: impl Future<Output = Result<()>> + Send + 'static,
    ) -> Self {
        Self::with_commit(ActionKind::Update, name, description, commit)
    }

    pub fn delete(
        name: impl Into<String>,
        description: impl Into<String>,
        commit: impl Future<Output = Result<()>> + Send + 'static,
    ) -> Self {
        Self::with_commit(ActionKind::Delete, name, description, commit)
    }

    /// A blocked change; carries no commit.
    pub fn error(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ActionKind::Error,
            description: description.into(),
            commit: None,
        }
    }

    /// Execute the deferred change.
    pub async fn commit(self) -> Result<()> {
        match self.commit {
            Some(commit) => {
                tracing::info!(name = %self.name, kind = %self.kind, "committing: {}", self.description);
                commit.await
            }
            None => Err(GlideError::Plan(self.description)),
        }
    }
}

impl std::fmt::Debug for PendingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAction")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Ordered set of pending actions for one table.
#[derive(Debug, Default)]
pub struct Plan {
    pub table: String,
    actions: Vec<PendingAction>,
    /// Set when the first action creates the table itself.
    pub(crate) creates_table: bool,
}

impl Plan {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            actions: Vec::new(),
            creates_table: false,
        }
    }

    pub fn push(&mut self, action: PendingAction) {
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[PendingAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn creates_table(&self) -> bool {
        self.creates_table
    }

    pub fn has_errors(&self) -> bool {
        self.actions.iter().any(|a| a.kind == ActionKind::Error)
    }

    /// All error descriptions joined for a collective report.
    pub fn error_summary(&self) -> String {
        self.actions
            .iter()
            .filter(|a| a.kind == ActionKind::Error)
            .map(|a| format!("{}: {}", a.name, a.description))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Counts of (creates, updates, deletes, errors).
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for action in &self.actions {
            match action.kind {
                ActionKind::Create => counts.0 += 1,
                ActionKind::Update => counts.1 += 1,
                ActionKind::Delete => counts.2 += 1,
                ActionKind::Error => counts.3 += 1,
            }
        }
        counts
    }

    pub(crate) fn into_actions(self) -> Vec<PendingAction> {
        self.actions
    }

    /// Commit every action in order. Refuses to start when the plan
    /// carries any error action.
    pub async fn commit(self) -> Result<()> {
        if self.has_errors() {
            return Err(GlideError::Plan(self.error_summary()));
        }
        for action in self.actions {
            action.commit().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_commit_runs_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut plan = Plan::new("u_dm_host");
        for name in ["first", "second", "third"] {
            let order = order.clone();
            plan.push(PendingAction::create(name, format!("create {name}"), async move {
                order.lock().push(name);
                Ok(())
            }));
        }

        plan.commit().await.expect("commit");
        assert_eq!(order.lock().as_slice(), ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_errors_block_commit() {
        let committed = Arc::new(AtomicUsize::new(0));
        let mut plan = Plan::new("u_dm_host");
        {
            let committed = committed.clone();
            plan.push(PendingAction::create("u_name", "create u_name", async move {
                committed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        plan.push(PendingAction::error("u_count", "type cannot change"));

        let error = plan.commit().await.expect_err("blocked");
        assert!(matches!(error, GlideError::Plan(_)));
        assert!(error.to_string().contains("type cannot change"));
        assert_eq!(committed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_counts() {
        let mut plan = Plan::new("u_dm_host");
        plan.push(PendingAction::create("a", "create", async { Ok(()) }));
        plan.push(PendingAction::update("b", "update", async { Ok(()) }));
        plan.push(PendingAction::error("c", "blocked"));
        assert_eq!(plan.counts(), (1, 1, 0, 1));
        assert!(plan.has_errors());
    }
}
