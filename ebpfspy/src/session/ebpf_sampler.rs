//! # eBPF Sampler
//!
//! [`SampleSource`] backed by the `ebpfspy-ebpf` programs.
//!
//! ## Attachment Points
//!
//! - **Perf Event**: `do_perf_event` on every online CPU at the session's
//!   sample rate (`PERF_COUNT_SW_CPU_CLOCK`)
//! - **Tracepoint**: `sched/sched_process_exec` (layout changes)
//! - **Tracepoint**: `sched/sched_process_exit` (early cleanup)
//!
//! ## Drain
//!
//! Every round reads and deletes all `COUNTS` entries, looks up both stack
//! ids in `STACKS` and turns them into leaf-first [`RawStack`]s (kernel frames
//! above user frames), then empties the `EVENTS` ring buffer.
//!
//! ## Pid Filter
//!
//! The perf program only aggregates pids marked `PID_PROFILE` in `PIDS`. The
//! first sample of any other pid arrives as [`ProcessEvent::Unknown`]; the
//! session answers through [`SampleSource::set_pid_config`].

use anyhow::Context;
use aya::{
    maps::{HashMap as AyaHashMap, MapData, RingBuf, StackTraceMap},
    programs::{perf_event, PerfEvent, TracePoint},
    Ebpf,
};
use aya_log::EbpfLogger;
use ebpfspy_common::{
    SampleKey, CONFIG_COLLECT_KERNEL, CONFIG_COLLECT_USER, PID_IGNORE, PID_PROFILE,
    PROCESS_EVENT_EXEC, PROCESS_EVENT_EXIT, PROCESS_EVENT_UNKNOWN,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;

use super::cpu_utils::online_cpus;
use super::preflight::run_preflight_checks;
use super::sample::{Drained, ProcessEvent, RawFrame, RawStack};
use super::sampler::{PidConfig, SampleSource, SamplerConfig};
use crate::domain::{Pid, SamplerError, StackId};

/// Environment variable naming a compiled `ebpfspy-ebpf` object
pub const BPF_OBJECT_ENV: &str = "EBPFSPY_BPF_OBJECT";

const PERF_PROGRAM: &str = "do_perf_event";

/// Where the compiled eBPF object comes from
#[derive(Debug, Clone)]
pub enum BpfObject {
    /// Object file built with `cargo xtask build-ebpf`
    Path(PathBuf),
    /// Object compiled into this binary
    #[cfg(feature = "embedded-bpf")]
    Embedded,
}

impl BpfObject {
    /// Object named by `EBPFSPY_BPF_OBJECT`
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var_os(BPF_OBJECT_ENV).map(|path| BpfObject::Path(path.into()))
    }

    fn load(&self) -> Result<Ebpf, SamplerError> {
        match self {
            BpfObject::Path(path) => {
                debug!("Loading eBPF object from {}", path.display());
                Ok(Ebpf::load_file(path)?)
            }
            #[cfg(feature = "embedded-bpf")]
            BpfObject::Embedded => Ok(Ebpf::load(aya::include_bytes_aligned!(
                "../../../target/bpfel-unknown-none/release/ebpfspy"
            ))?),
        }
    }
}

struct Attached {
    counts: AyaHashMap<MapData, SampleKey, u64>,
    stacks: StackTraceMap<MapData>,
    events: RingBuf<MapData>,
    pids: AyaHashMap<MapData, u32, u32>,
    config: SamplerConfig,
    // Owns the programs and their links; dropped last
    _ebpf: Ebpf,
}

pub struct EbpfSampler {
    object: BpfObject,
    attached: Option<Attached>,
}

impl EbpfSampler {
    #[must_use]
    pub fn new(object: BpfObject) -> Self {
        Self { object, attached: None }
    }

    #[cfg(feature = "embedded-bpf")]
    #[must_use]
    pub fn embedded() -> Self {
        Self::new(BpfObject::Embedded)
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }
}

impl SampleSource for EbpfSampler {
    fn attach(&mut self, config: &SamplerConfig) -> Result<(), SamplerError> {
        if self.attached.is_some() {
            return Ok(());
        }
        run_preflight_checks()?;

        let mut bpf = self.object.load()?;
        init_ebpf_logger(&mut bpf);

        write_config(&mut bpf, config)?;
        attach_sampler(&mut bpf, config.sample_rate)?;
        attach_process_events(&mut bpf);

        let counts = AyaHashMap::try_from(take_map(&mut bpf, "COUNTS")?)?;
        let stacks = StackTraceMap::try_from(take_map(&mut bpf, "STACKS")?)?;
        let events = RingBuf::try_from(take_map(&mut bpf, "EVENTS")?)?;
        let pids = AyaHashMap::try_from(take_map(&mut bpf, "PIDS")?)?;

        self.attached =
            Some(Attached { counts, stacks, events, pids, config: *config, _ebpf: bpf });
        Ok(())
    }

    fn drain(&mut self) -> Result<Drained, SamplerError> {
        let attached = self
            .attached
            .as_mut()
            .ok_or_else(|| SamplerError::ReadFailed("sampler not attached".to_string()))?;

        let mut events = Vec::new();
        while let Some(item) = attached.events.next() {
            match parse_event(&item) {
                Some(event) => events.push(event),
                None => warn!("Received malformed process event ({} bytes)", item.len()),
            }
        }

        let entries: Vec<(SampleKey, u64)> = attached
            .counts
            .iter()
            .collect::<Result<_, _>>()
            .map_err(|e| SamplerError::ReadFailed(format!("COUNTS: {e}")))?;
        for (key, _) in &entries {
            if let Err(e) = attached.counts.remove(key) {
                debug!("Failed to delete sample key for pid {}: {e}", key.pid);
            }
        }

        let mut traces: HashMap<u32, Vec<u64>> = HashMap::new();
        let mut stacks = Vec::with_capacity(entries.len());
        for (key, count) in entries {
            let mut frames = Vec::new();
            if attached.config.collect_kernel {
                let ips = stack_ips(&attached.stacks, &mut traces, StackId(key.kern_stack));
                frames.extend(ips.iter().map(|&ip| RawFrame::Kernel(ip)));
            }
            if attached.config.collect_user {
                let ips = stack_ips(&attached.stacks, &mut traces, StackId(key.user_stack));
                frames.extend(ips.iter().map(|&ip| RawFrame::User(ip)));
            }
            if frames.is_empty() {
                continue;
            }
            stacks.push(RawStack { pid: Pid(key.pid), frames, weight: count });
        }

        Ok(Drained { stacks, events })
    }

    fn detach(&mut self) {
        if self.attached.take().is_some() {
            info!("Detached eBPF sampler");
        }
    }

    fn set_pid_config(&mut self, pid: Pid, config: PidConfig) -> Result<(), SamplerError> {
        let Some(attached) = self.attached.as_mut() else {
            return Ok(());
        };
        let value = match config {
            PidConfig::Profile => PID_PROFILE,
            PidConfig::Ignore => PID_IGNORE,
        };
        attached.pids.insert(pid.0, value, 0)?;
        debug!("{pid}: {config:?}");
        Ok(())
    }

    fn remove_pid(&mut self, pid: Pid) {
        if let Some(attached) = self.attached.as_mut() {
            // Absent when the pid was never sampled
            let _ = attached.pids.remove(&pid.0);
        }
    }
}

/// Initialize eBPF logger
///
/// aya-log forwards kernel-side messages from tokio tasks, so it needs a
/// runtime.
fn init_ebpf_logger(bpf: &mut Ebpf) {
    if tokio::runtime::Handle::try_current().is_err() {
        debug!("No tokio runtime, eBPF log messages are discarded");
        return;
    }
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

fn write_config(bpf: &mut Ebpf, config: &SamplerConfig) -> Result<(), SamplerError> {
    let map = bpf
        .map_mut("CONFIG")
        .ok_or_else(|| SamplerError::Unavailable("CONFIG map not found".to_string()))?;
    let mut config_map: AyaHashMap<_, u32, u64> = AyaHashMap::try_from(map)?;
    config_map.insert(CONFIG_COLLECT_USER, u64::from(config.collect_user), 0)?;
    config_map.insert(CONFIG_COLLECT_KERNEL, u64::from(config.collect_kernel), 0)?;
    Ok(())
}

fn attach_sampler(bpf: &mut Ebpf, sample_rate: u32) -> Result<(), SamplerError> {
    let program: &mut PerfEvent = bpf
        .program_mut(PERF_PROGRAM)
        .ok_or_else(|| SamplerError::Unavailable(format!("{PERF_PROGRAM} program not found")))?
        .try_into()?;
    program.load()?;

    let cpus = online_cpus()
        .context("Failed to list online CPUs")
        .map_err(|e| SamplerError::Unavailable(format!("{e:#}")))?;
    for &cpu in &cpus {
        program
            .attach(
                perf_event::PerfTypeId::Software,
                perf_event::perf_sw_ids::PERF_COUNT_SW_CPU_CLOCK as u64,
                perf_event::PerfEventScope::AllProcessesOneCpu { cpu },
                perf_event::SamplePolicy::Frequency(u64::from(sample_rate)),
                false,
            )
            .map_err(|e| SamplerError::AttachFailed {
                program: format!("{PERF_PROGRAM} (cpu {cpu})"),
                error: e.to_string(),
            })?;
    }
    info!("✓ Attached perf_event sampler to {} CPUs at {sample_rate} Hz", cpus.len());
    Ok(())
}

/// Exec/exit tracepoints only speed up cleanup; the session still works
/// without them
fn attach_process_events(bpf: &mut Ebpf) {
    for (program_name, tracepoint) in
        [("on_process_exec", "sched_process_exec"), ("on_process_exit", "sched_process_exit")]
    {
        let result = (|| -> Result<(), SamplerError> {
            let program: &mut TracePoint = bpf
                .program_mut(program_name)
                .ok_or_else(|| SamplerError::Unavailable(format!("{program_name} not found")))?
                .try_into()?;
            program.load()?;
            program.attach("sched", tracepoint)?;
            Ok(())
        })();
        match result {
            Ok(()) => info!("✓ Attached tracepoint: sched/{tracepoint}"),
            Err(e) => warn!("⚠️  Could not attach {program_name}: {e}"),
        }
    }
}

fn take_map(bpf: &mut Ebpf, name: &str) -> Result<aya::maps::Map, SamplerError> {
    bpf.take_map(name).ok_or_else(|| SamplerError::Unavailable(format!("{name} map not found")))
}

/// Instruction pointers of a captured stack, leaf first
///
/// Invalid ids and lookup failures yield an empty stack. Each id is read from
/// the kernel once per drain.
fn stack_ips<'a>(
    stacks: &StackTraceMap<MapData>,
    traces: &'a mut HashMap<u32, Vec<u64>>,
    stack_id: StackId,
) -> &'a [u64] {
    let Some(id) = stack_id.as_map_key() else {
        return &[];
    };
    traces.entry(id).or_insert_with(|| match stacks.get(&id, 0) {
        Ok(trace) => trace.frames().iter().map(|frame| frame.ip).take_while(|&ip| ip != 0).collect(),
        Err(e) => {
            debug!("Failed to read stack {id}: {e}");
            Vec::new()
        }
    })
}

fn parse_event(bytes: &[u8]) -> Option<ProcessEvent> {
    let op = u32::from_ne_bytes(bytes.get(0..4)?.try_into().ok()?);
    let pid = Pid(u32::from_ne_bytes(bytes.get(4..8)?.try_into().ok()?));
    match op {
        PROCESS_EVENT_EXEC => Some(ProcessEvent::Exec(pid)),
        PROCESS_EVENT_EXIT => Some(ProcessEvent::Exit(pid)),
        PROCESS_EVENT_UNKNOWN => Some(ProcessEvent::Unknown(pid)),
        _ => None,
    }
}
