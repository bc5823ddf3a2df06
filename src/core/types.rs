//! KL-001: Declarative data model for catalog resources.
//!
//! Field names follow the catalog's camelCase JSON shape. The terminal-state
//! cell is runtime-only and never (de)serialized.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Identity
// ============================================================================

/// Index key of a resource: `Titlecase(kind) + "::" + name`.
pub fn identity_key(kind: &str, name: &str) -> String {
    format!("{}::{}", titlecase(kind), name)
}

fn titlecase(s: &str) -> String {
    let lower = s.to_ascii_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

// ============================================================================
// Metadata & ordering
// ============================================================================

/// Shared metadata block carried by every resource.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Unique per kind within a graph
    pub name: String,

    /// Free text
    #[serde(default)]
    pub description: String,

    /// Opaque to the engine
    #[serde(default)]
    pub annotations: IndexMap<String, String>,

    /// Predecessor constraints
    #[serde(default)]
    pub ordering: Ordering,

    /// Terminal state, written once by the owning task
    #[serde(skip)]
    pub state: StateCell,
}

/// Predecessor keys (`Kind::name`) this resource waits on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ordering {
    /// Start only after each of these Completed
    #[serde(default)]
    pub after_ok: Vec<String>,

    /// Start only after each of these Failed
    #[serde(default)]
    pub after_fail: Vec<String>,
}

impl Ordering {
    /// Every predecessor key, afterOk first.
    pub fn predecessors(&self) -> impl Iterator<Item = &String> {
        self.after_ok.iter().chain(self.after_fail.iter())
    }
}

// ============================================================================
// Terminal state
// ============================================================================

/// Lifecycle of a resource within one run. Transitions are one-way out of `Pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    #[default]
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl ResourceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Single-writer state cell. The owning task marks it once; dependents
/// subscribe and are woken on the transition.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ResourceState>,
}

impl Default for StateCell {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(ResourceState::Pending);
        Self { tx }
    }
}

impl StateCell {
    /// Current snapshot.
    pub fn get(&self) -> ResourceState {
        *self.tx.borrow()
    }

    pub fn is_completed(&self) -> bool {
        self.get() == ResourceState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.get() == ResourceState::Failed
    }

    /// Move out of `Pending`. Returns false (and changes nothing) if a
    /// terminal state was already recorded.
    pub fn mark(&self, next: ResourceState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || !next.is_terminal() {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Block until the cell is terminal. Returns `None` when `cancel` fires first.
    pub async fn wait_terminal(&self, cancel: &CancellationToken) -> Option<ResourceState> {
        let mut rx = self.tx.subscribe();
        let terminal = async move { rx.wait_for(|s| s.is_terminal()).await.map(|s| *s).ok() };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            state = terminal => state,
        }
    }
}

// ============================================================================
// Content & identity specs
// ============================================================================

/// Where a blob of bytes comes from. `type` selects the source, case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSpec {
    #[serde(rename = "type", default)]
    pub source_type: String,

    /// Inline content for `type: string`
    #[serde(default)]
    pub string: String,

    /// Host path for `type: localSource`
    #[serde(default)]
    pub local_source: String,

    /// Reserved
    #[serde(default)]
    pub secret: Option<serde_json::Value>,

    /// Reserved
    #[serde(default)]
    pub http_source: Option<serde_json::Value>,
}

impl ContentSpec {
    /// Inline string content.
    pub fn inline(s: impl Into<String>) -> Self {
        Self {
            source_type: "string".to_string(),
            string: s.into(),
            ..Self::default()
        }
    }
}

/// Desired owner. A non-empty name wins over the numeric id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentifierSpec {
    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub uid: Option<u32>,

    #[serde(default)]
    pub group: String,

    #[serde(default)]
    pub gid: Option<u32>,
}

impl UserIdentifierSpec {
    /// Numeric owner, no lookup required.
    pub fn numeric(uid: u32, gid: u32) -> Self {
        Self {
            uid: Some(uid),
            gid: Some(gid),
            ..Self::default()
        }
    }
}

// ============================================================================
// File
// ============================================================================

/// Desired kind of filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    Absent,
    Directory,
    Present,
    Link,
}

impl fmt::Display for Ensure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Directory => write!(f, "directory"),
            Self::Present => write!(f, "present"),
            Self::Link => write!(f, "link"),
        }
    }
}

/// Desired state of one filesystem path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    pub ensure: Ensure,

    pub path: PathBuf,

    #[serde(rename = "userID", default)]
    pub user_id: UserIdentifierSpec,

    /// Octal permission string (e.g., "0644"); "0600" when unset
    #[serde(default)]
    pub mode: Option<String>,

    /// Link destination, `ensure: link` only
    #[serde(default)]
    pub target: Option<PathBuf>,

    /// Consulted for `ensure: present` only
    #[serde(default)]
    pub content: Option<ContentSpec>,
}

// ============================================================================
// Exec
// ============================================================================

/// One environment variable for an exec child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvSpec {
    pub name: String,
    pub value: ContentSpec,
}

/// Desired process execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSpec {
    pub path: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Order preserved
    #[serde(default)]
    pub env: Vec<EnvSpec>,

    /// Working directory; inherited when empty
    #[serde(default)]
    pub dir: String,

    #[serde(rename = "userID", default)]
    pub user_id: UserIdentifierSpec,

    /// Duration string such as "10ms" or "1h30m"
    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default)]
    pub exit_code: i32,

    /// Treat a failed convergence as completion
    #[serde(default)]
    pub fail_ok: bool,
}

// ============================================================================
// Tests
// ============================================================================
