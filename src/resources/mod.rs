//! Resource handlers — the convergence contract and its File/Exec variants.
//!
//! Each resource:
//! 1. Identifies itself as `Kind::name`
//! 2. Converges the host toward its spec in `apply` (check → act → verify)
//! 3. Records exactly one terminal state via `done`, `fail` or `skip`

pub mod content;
pub mod exec;
pub mod file;
pub mod identity;

use crate::core::error::{Error, Result};
use crate::core::types::{identity_key, Metadata, ResourceState};
use async_trait::async_trait;
use identity::IdentityResolver;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a resource sees while applying: the run's cancellation scope and
/// the identity database used for owner lookups.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    pub cancel: CancellationToken,
    pub identities: Arc<IdentityResolver>,
}

impl ApplyContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            identities: Arc::new(IdentityResolver::default()),
        }
    }

    pub fn with_identities(mut self, identities: IdentityResolver) -> Self {
        self.identities = Arc::new(identities);
        self
    }
}

/// Convergence contract implemented by every resource variant.
///
/// `apply` must be idempotent and re-verify after any mutation. The
/// terminal-state methods are called by the apply engine only, once per run.
#[async_trait]
pub trait Resource: Send + Sync + fmt::Debug {
    /// Free-form schema tag, not interpreted.
    fn api(&self) -> &str;

    /// Kind as declared in the catalog ("file", "exec").
    fn kind(&self) -> &str;

    fn metadata(&self) -> &Metadata;

    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// `Titlecase(kind)::name`, the graph index key.
    fn identity_key(&self) -> String {
        identity_key(self.kind(), self.name())
    }

    /// Converge the host toward the desired state.
    async fn apply(&self, ctx: &ApplyContext) -> Result<()>;

    /// Record failure. Returns the error to forward, or `None` if absorbed.
    fn fail(&self, err: Error) -> Option<Error> {
        self.metadata().state.mark(ResourceState::Failed);
        Some(err)
    }

    /// Record successful convergence.
    fn done(&self) {
        self.metadata().state.mark(ResourceState::Completed);
    }

    /// Record that the resource will not run because its ordering
    /// constraints can no longer be met without a failure.
    fn skip(&self) {
        self.metadata().state.mark(ResourceState::Skipped);
    }

    fn state(&self) -> ResourceState {
        self.metadata().state.get()
    }
}

/// Shared handle to a type-erased resource.
pub type SharedResource = Arc<dyn Resource>;
