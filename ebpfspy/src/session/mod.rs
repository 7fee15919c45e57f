//! Profiling session
//!
//! - [`Session`] - lifecycle and collection rounds
//! - [`SampleSource`] - kernel sampling collaborator, implemented by
//!   [`EbpfSampler`]
//! - [`InterpreterUnwinder`] - interpreter stack collaborator
//! - [`spawn_collection_loop`] - periodic tokio driver

pub mod cpu_utils;
pub mod driver;
pub mod ebpf_sampler;
pub mod interpreter;
pub mod lifecycle;
pub mod options;
pub mod preflight;
pub mod sample;
pub mod sampler;

pub use driver::spawn_collection_loop;
pub use ebpf_sampler::{BpfObject, EbpfSampler, BPF_OBJECT_ENV};
pub use interpreter::{InterpreterKind, InterpreterUnwinder};
pub use lifecycle::{Session, SessionDebugInfo, SessionState};
pub use options::{SessionOptions, DEFAULT_SAMPLE_RATE, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
pub use sample::{Drained, ProcessEvent, ProfileSample, RawFrame, RawStack};
pub use sampler::{PidConfig, SampleSource, SamplerConfig};
