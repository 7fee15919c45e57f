//! # ebpfspy - eBPF Continuous Profiling Session
//!
//! ebpfspy samples on-CPU stacks of every process with a perf-event eBPF
//! program, turns raw instruction pointers into function names through a set
//! of generationally cached symbol tables, and attributes every stack to a
//! discovery [`sd::Target`] (a labelled workload: a pid, a container or a
//! service).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • Perf Events: CPU clock sampling on every online CPU          │
//! │  • Tracepoints: sched_process_exec, sched_process_exit          │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ COUNTS / STACKS maps, EVENTS ring buffer
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     ebpfspy (This Crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Sampler    │──▶│   Session    │──▶│  callback    │         │
//! │  │ (SampleSrc)  │   │   (round)    │   │ ProfileSample│         │
//! │  └──────────────┘   └──────┬───────┘   └──────────────┘         │
//! │                            │                                    │
//! │              ┌─────────────┼──────────────┐                     │
//! │              ▼             ▼              ▼                     │
//! │     ┌──────────────┐ ┌──────────────┐ ┌──────────────┐          │
//! │     │   symtab     │ │      sd      │ │   metrics    │          │
//! │     │ pid → maps   │ │ pid → Target │ │  hit/miss    │          │
//! │     │ file → id    │ │ (cgroup, pid │ │  failures    │          │
//! │     │ id → symbols │ │   labels)    │ │              │          │
//! │     └──────────────┘ └──────────────┘ └──────────────┘          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`session`]: lifecycle (`new` → `start` → `collect_profiles` → `stop`),
//!   the eBPF sampler and the periodic tokio driver
//! - [`symtab`]: address resolution
//!   - `process_map`: per-pid executable mappings, rebuilt on exec or on a
//!     lookup miss
//!   - `file_identity`: one identity (build id or content hash) per mapped file
//!   - `store`: symbol tables shared by every process mapping the same binary
//!   - `gcache`: the size and age bounded cache behind all three tiers
//! - [`sd`]: service discovery, pid to target
//! - [`metrics`]: cache and resolution-failure counters
//! - [`domain`]: newtypes and error types
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ebpfspy::sd::{ProcTargetFinder, TargetsOptions};
//! use ebpfspy::session::{BpfObject, EbpfSampler, Session, SessionOptions};
//!
//! # fn main() -> anyhow::Result<()> {
//! let finder = Arc::new(ProcTargetFinder::new(&TargetsOptions::default()));
//! let sampler = EbpfSampler::new(BpfObject::Path("target/bpfel-unknown-none/release/ebpfspy".into()));
//! let session = Session::new(SessionOptions::default(), finder, Box::new(sampler))?;
//!
//! session.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(10));
//! session.collect_profiles(|sample| println!("{} {}", sample.folded(), sample.weight))?;
//! session.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Requirements
//!
//! - Linux kernel 5.8+ (BPF ring buffer)
//! - Root privileges for loading the eBPF programs

pub mod domain;
pub mod metrics;
pub mod sd;
pub mod session;
pub mod symtab;

pub use domain::{ConfigError, FileKey, Pid, SamplerError, SessionError, StackId};
pub use metrics::{MetricsSink, SharedMetrics, SymtabMetrics};
pub use session::{ProfileSample, Session, SessionOptions, SessionState};
