//! Samples flowing through a collection round

use serde::Serialize;
use std::sync::Arc;

use crate::domain::Pid;
use crate::sd::Target;

/// One frame as produced by a sampler or unwinder
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RawFrame {
    /// User-space instruction pointer
    User(u64),
    /// Kernel instruction pointer
    Kernel(u64),
    /// Frame already named by an interpreter unwinder
    Resolved(Arc<str>),
}

/// One sampled stack, leaf first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStack {
    pub pid: Pid,
    pub frames: Vec<RawFrame>,
    /// Number of times this stack was observed
    pub weight: u64,
}

/// Process lifecycle change reported by the sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Image replaced: memory layout is stale
    Exec(Pid),
    Exit(Pid),
    /// First sample of a pid the sampler has no decision for
    Unknown(Pid),
}

/// Everything a sampler produced since the previous drain
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Drained {
    pub stacks: Vec<RawStack>,
    pub events: Vec<ProcessEvent>,
}

/// A resolved, attributed stack emitted to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSample {
    pub target: Arc<Target>,
    pub pid: Pid,
    /// Root first; the root frame is the process name
    pub stack: Vec<Arc<str>>,
    pub weight: u64,
}

impl ProfileSample {
    /// Leaf frame
    #[must_use]
    pub fn leaf(&self) -> Option<&str> {
        self.stack.last().map(AsRef::as_ref)
    }

    /// `root;...;leaf`, the folded-stack form
    #[must_use]
    pub fn folded(&self) -> String {
        let frames: Vec<&str> = self.stack.iter().map(AsRef::as_ref).collect();
        frames.join(";")
    }
}
