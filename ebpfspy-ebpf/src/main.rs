//! # eBPF Kernel-Side Sampler
//!
//! eBPF programs that run inside the Linux kernel and feed the userspace
//! profiling session.
//!
//! ## Programs
//!
//! - **Perf Event**: `do_perf_event` - CPU sampling at the session's sample rate,
//!   aggregates (pid, kernel stack, user stack) → count in `COUNTS` for pids
//!   userspace marked `PID_PROFILE` in `PIDS`; a pid seen for the first time
//!   is reported on `EVENTS` instead
//! - **Tracepoint**: `on_process_exec` - reports exec so userspace can rebuild
//!   the process memory map
//! - **Tracepoint**: `on_process_exit` - reports thread group exits
//!
//! ## Build
//!
//! Always compiled in release mode (debug includes incompatible formatting code):
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::bpf_get_current_pid_tgid,
    macros::{map, perf_event, tracepoint},
    maps::{HashMap, RingBuf, StackTrace},
    programs::{PerfEventContext, TracePointContext},
};
use aya_log_ebpf::warn;
use ebpfspy_common::{
    ProcessEvent, SampleKey, CONFIG_COLLECT_KERNEL, CONFIG_COLLECT_USER, MAX_PIDS,
    MAX_SAMPLE_KEYS, MAX_STACKS, PID_PENDING, PID_PROFILE, PROCESS_EVENT_EXEC,
    PROCESS_EVENT_EXIT, PROCESS_EVENT_UNKNOWN,
};

// ============================================================================
// Constants
// ============================================================================

/// Stack capture flags for user stacks:
///
/// - BPF_F_USER_STACK (0x100): Capture user-space stack (not kernel)
/// - BPF_F_FAST_STACK_CMP (0x200): Use stack hash for deduplication
/// - BPF_F_REUSE_STACKID (0x400): Overwrite existing entry on hash collision
const USER_STACK_FLAGS: u64 = 0x100 | 0x200 | 0x400;

/// Stack capture flags for kernel stacks (same dedup behavior, kernel side)
const KERNEL_STACK_FLAGS: u64 = 0x200 | 0x400;

/// Returned in place of a stack id when collection is disabled
const STACK_NOT_COLLECTED: i64 = -1;

/// BPF_NOEXIST: only create, never overwrite
const BPF_NOEXIST: u64 = 1;

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Aggregated samples: (pid, kernel stack, user stack) → count
///
/// Userspace reads and deletes every entry once per collection round.
#[map]
static COUNTS: HashMap<SampleKey, u64> = HashMap::with_max_entries(MAX_SAMPLE_KEYS, 0);

/// Deduplicated stack traces by id
///
/// Ids are hash buckets; with `BPF_F_REUSE_STACKID` a colliding stack
/// replaces the previous occupant instead of failing.
#[map]
static STACKS: StackTrace = StackTrace::with_max_entries(MAX_STACKS, 0);

/// Ring buffer for process lifecycle events (256KB)
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

/// Map: Config key → Config value
///
/// - **Key 0**: collect user stacks (non-zero = yes)
/// - **Key 1**: collect kernel stacks (non-zero = yes)
#[map]
static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(16, 0);

/// Map: pid → `PID_PENDING` / `PID_PROFILE` / `PID_IGNORE`
///
/// Written by userspace as targets are discovered; the perf program only
/// adds `PID_PENDING` entries.
#[map]
static PIDS: HashMap<u32, u32> = HashMap::with_max_entries(MAX_PIDS, 0);

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// CPU sampling profiler
#[perf_event]
pub fn do_perf_event(ctx: PerfEventContext) -> u32 {
    match try_perf_event(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_perf_event(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;

    // Idle task
    if pid == 0 {
        return Ok(());
    }

    match unsafe { PIDS.get(&pid).copied() } {
        Some(PID_PROFILE) => {}
        Some(_) => return Ok(()),
        None => {
            // First sighting: ask userspace once, drop samples until it answers
            if unsafe { PIDS.insert(&pid, &PID_PENDING, BPF_NOEXIST) }.is_ok() {
                report(PROCESS_EVENT_UNKNOWN, pid)?;
            }
            return Ok(());
        }
    }

    let user_stack = if config_enabled(CONFIG_COLLECT_USER) {
        unsafe { STACKS.get_stackid(ctx, USER_STACK_FLAGS).unwrap_or_else(|e| e) }
    } else {
        STACK_NOT_COLLECTED
    };

    let kern_stack = if config_enabled(CONFIG_COLLECT_KERNEL) {
        unsafe { STACKS.get_stackid(ctx, KERNEL_STACK_FLAGS).unwrap_or_else(|e| e) }
    } else {
        STACK_NOT_COLLECTED
    };

    let key = SampleKey { pid, _padding: 0, kern_stack, user_stack };

    let current = unsafe { COUNTS.get(&key).copied().unwrap_or(0) };
    if let Err(e) = unsafe { COUNTS.insert(&key, &(current + 1), 0) } {
        warn!(ctx, "COUNTS full, dropping sample of pid {}", pid);
        return Err(e);
    }

    Ok(())
}

/// Hook: sched/sched_process_exec
#[tracepoint]
pub fn on_process_exec(_ctx: TracePointContext) -> u32 {
    let pid = unsafe { (bpf_get_current_pid_tgid() >> 32) as u32 };
    match report(PROCESS_EVENT_EXEC, pid) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Hook: sched/sched_process_exit
///
/// Fires for every exiting thread; only the thread group leader is reported.
#[tracepoint]
pub fn on_process_exit(_ctx: TracePointContext) -> u32 {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;
    if pid != tid {
        return 0;
    }
    match report(PROCESS_EVENT_EXIT, pid) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn report(op: u32, pid: u32) -> Result<(), i64> {
    let event = ProcessEvent { op, pid };
    unsafe {
        EVENTS.output(&event, 0).map_err(|_| 1i64)?;
    }
    Ok(())
}

fn config_enabled(key: u32) -> bool {
    unsafe { CONFIG.get(&key).copied().unwrap_or(0) != 0 }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
