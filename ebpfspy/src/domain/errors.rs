//! Structured error types for ebpfspy
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Only configuration, lifecycle and collection-round failures are errors;
//! per-sample resolution failures degrade to placeholder frames instead.

use thiserror::Error;

/// Rejected at construction; no session is created
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid sample rate {rate} Hz (expected {min}..={max})")]
    InvalidSampleRate { rate: u32, min: u32, max: u32 },

    #[error("Invalid {tier} cache options: size must be greater than zero")]
    ZeroCacheSize { tier: &'static str },

    #[error("Nothing to collect: both user and kernel stacks are disabled")]
    NothingToCollect,
}

/// Failure reported by the kernel sampling collaborator
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Kernel sampling interface unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to attach {program}: {error}")]
    AttachFailed { program: String, error: String },

    #[error("Failed to read samples: {0}")]
    ReadFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ebpf(#[from] aya::EbpfError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),
}

/// Lifecycle and collection errors of a profiling session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session not started")]
    NotStarted,

    #[error("Session stopped")]
    Stopped,

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// True when the caller lacks privileges (the usual reason `start` fails)
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, SessionError::Sampler(SamplerError::PermissionDenied(_)))
    }
}
