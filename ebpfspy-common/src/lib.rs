//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Types and constants shared between the kernel-side sampler and the
//! userspace session. All types use `#[repr(C)]` for consistent memory layout
//! across the kernel/userspace boundary.
//!
//! ## Maps
//!
//! - `COUNTS` - [`SampleKey`] → sample count, aggregated in the kernel and
//!   drained once per collection round
//! - `STACKS` - stack id → instruction pointers (`bpf_get_stackid`)
//! - `EVENTS` - ring buffer of [`ProcessEvent`]s (exec / exit / unknown pid)
//! - `CONFIG` - runtime configuration keyed by the `CONFIG_*` constants
//! - `PIDS` - pid → `PID_*` decision; only `PID_PROFILE` pids are sampled

#![no_std]

// ============================================================================
// Process Event Constants
// ============================================================================

/// A process replaced its image (`sched_process_exec`)
///
/// Userspace discards the pid's memory map and rebuilds it on next use.
pub const PROCESS_EVENT_EXEC: u32 = 1;

/// A process exited (`sched_process_exit` for the thread group leader)
pub const PROCESS_EVENT_EXIT: u32 = 2;

/// A pid with no `PIDS` entry was sampled
///
/// Sent once per pid: the kernel records `PID_PENDING` first, so later
/// samples are dropped quietly until userspace decides.
pub const PROCESS_EVENT_UNKNOWN: u32 = 3;

// ============================================================================
// Pid Decisions (`PIDS` map)
// ============================================================================

/// Reported to userspace, no decision yet
pub const PID_PENDING: u32 = 0;

/// The pid belongs to a target: sample it
pub const PID_PROFILE: u32 = 1;

/// The pid matches no target: drop its samples in the kernel
pub const PID_IGNORE: u32 = 2;

/// Maximum number of pids with a decision
pub const MAX_PIDS: u32 = 16384;

// ============================================================================
// Configuration Keys (`CONFIG` map)
// ============================================================================

/// Non-zero when user-space stacks should be captured
pub const CONFIG_COLLECT_USER: u32 = 0;

/// Non-zero when kernel stacks should be captured
pub const CONFIG_COLLECT_KERNEL: u32 = 1;

/// Maximum number of distinct (pid, stacks) keys aggregated per round
pub const MAX_SAMPLE_KEYS: u32 = 10240;

/// Maximum number of unique stacks stored between two collection rounds
pub const MAX_STACKS: u32 = 16384;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Aggregation key of the `COUNTS` map
///
/// One entry per distinct (process, kernel stack, user stack) combination
/// observed since the last drain. Stack ids are negative when the stack was
/// not captured (collection disabled or unwinding failed).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SampleKey {
    /// Process ID (TGID in Linux terms)
    pub pid: u32,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,

    /// Kernel stack id in `STACKS`, or a negative error code
    pub kern_stack: i64,

    /// User stack id in `STACKS`, or a negative error code
    pub user_stack: i64,
}

/// Process lifecycle event sent through the `EVENTS` ring buffer
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessEvent {
    /// One of the `PROCESS_EVENT_*` constants
    pub op: u32,

    /// Process ID (TGID)
    pub pid: u32,
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for SampleKey {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ProcessEvent {}
