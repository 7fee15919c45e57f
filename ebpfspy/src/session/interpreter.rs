//! Interpreter unwinder collaborator
//!
//! Interpreted runtimes need their own unwinder to name frames; a native
//! stack of a Python process is mostly `_PyEval_EvalFrameDefault`. When an
//! unwinder claims a pid, its pre-resolved stacks replace the native ones.

use std::fmt;

use crate::domain::Pid;

use super::sample::RawStack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterpreterKind {
    Python,
}

impl fmt::Display for InterpreterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpreterKind::Python => f.write_str("python"),
        }
    }
}

pub trait InterpreterUnwinder: Send {
    fn kind(&self) -> InterpreterKind;

    /// Whether this unwinder produces the stacks of `pid`
    fn claims(&self, pid: Pid) -> bool;

    /// Stacks collected since the previous drain, frames leaf first and
    /// typically [`super::RawFrame::Resolved`]
    fn drain(&mut self) -> Vec<RawStack>;
}
