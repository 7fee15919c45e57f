//! Kernel sampling collaborator

use crate::domain::{Pid, SamplerError};

use super::sample::Drained;

/// What the sampler should capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    /// Per-CPU sampling frequency in Hz
    pub sample_rate: u32,
    pub collect_user: bool,
    pub collect_kernel: bool,
}

/// Whether samples of a pid are wanted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidConfig {
    Profile,
    Ignore,
}

/// Source of raw stack samples
///
/// Implementations own kernel resources between `attach` and `detach`.
pub trait SampleSource: Send {
    /// Start sampling
    ///
    /// # Errors
    /// Returns [`SamplerError::PermissionDenied`] without privileges and
    /// [`SamplerError::Unavailable`] when the kernel interface is missing.
    fn attach(&mut self, config: &SamplerConfig) -> Result<(), SamplerError>;

    /// Take every sample and process event accumulated since the last drain
    ///
    /// # Errors
    /// Returns [`SamplerError::ReadFailed`] if the sample buffers cannot be read
    fn drain(&mut self) -> Result<Drained, SamplerError>;

    /// Stop sampling and release kernel resources
    fn detach(&mut self);

    /// Record whether `pid` should be sampled
    ///
    /// Samplers that cannot filter by pid accept and ignore the decision; the
    /// session still drops stacks of pids without a target.
    ///
    /// # Errors
    /// Returns [`SamplerError::Map`] if the decision cannot be stored
    fn set_pid_config(&mut self, _pid: Pid, _config: PidConfig) -> Result<(), SamplerError> {
        Ok(())
    }

    /// Forget the decision about `pid` (it exited)
    fn remove_pid(&mut self, _pid: Pid) {}
}
