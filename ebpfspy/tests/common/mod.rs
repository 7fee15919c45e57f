//! Shared fixtures for the integration tests
#![allow(dead_code)]

use anyhow::Result;
use prometheus::Registry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ebpfspy::domain::{FileKey, Pid, SamplerError};
use ebpfspy::metrics::SymtabMetrics;
use ebpfspy::sd::{DiscoveryTarget, ProcTargetFinder, TargetsOptions, LABEL_PID, LABEL_SERVICE_NAME};
use ebpfspy::session::{
    Drained, PidConfig, ProcessEvent, RawFrame, RawStack, SampleSource, SamplerConfig,
};
use ebpfspy::symtab::{MapsProvider, MemoryMapping, ProcFs};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Prometheus-backed metrics on a private registry
pub fn symtab_metrics() -> Arc<SymtabMetrics> {
    Arc::new(SymtabMetrics::new(&Registry::new()).expect("fresh registry"))
}

#[derive(Default)]
struct FakeState {
    pending: Drained,
    fail_next_drain: bool,
    drain_delay: Duration,
    attached: bool,
    attaches: usize,
    detaches: usize,
    drains: usize,
    pid_configs: HashMap<Pid, PidConfig>,
    removed_pids: Vec<Pid>,
}

/// Sampler fed by the test through a [`FakeSamplerHandle`]
pub struct FakeSampler {
    state: Arc<Mutex<FakeState>>,
}

/// Test-side end of a [`FakeSampler`]
#[derive(Clone)]
pub struct FakeSamplerHandle {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSampler {
    pub fn new() -> (Self, FakeSamplerHandle) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (Self { state: state.clone() }, FakeSamplerHandle { state })
    }
}

impl SampleSource for FakeSampler {
    fn attach(&mut self, _config: &SamplerConfig) -> Result<(), SamplerError> {
        let mut state = self.state.lock().unwrap();
        state.attached = true;
        state.attaches += 1;
        Ok(())
    }

    fn drain(&mut self) -> Result<Drained, SamplerError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.drains += 1;
            if state.fail_next_drain {
                state.fail_next_drain = false;
                return Err(SamplerError::ReadFailed("injected failure".to_string()));
            }
            state.drain_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(std::mem::take(&mut self.state.lock().unwrap().pending))
    }

    fn detach(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.attached = false;
        state.detaches += 1;
    }

    fn set_pid_config(&mut self, pid: Pid, config: PidConfig) -> Result<(), SamplerError> {
        self.state.lock().unwrap().pid_configs.insert(pid, config);
        Ok(())
    }

    fn remove_pid(&mut self, pid: Pid) {
        let mut state = self.state.lock().unwrap();
        state.pid_configs.remove(&pid);
        state.removed_pids.push(pid);
    }
}

impl FakeSamplerHandle {
    /// Queue a user-space stack, leaf first
    pub fn push_user_stack(&self, pid: u32, leaf_first: &[u64], weight: u64) {
        self.push_stack(RawStack {
            pid: Pid(pid),
            frames: leaf_first.iter().map(|&ip| RawFrame::User(ip)).collect(),
            weight,
        });
    }

    pub fn push_stack(&self, stack: RawStack) {
        self.state.lock().unwrap().pending.stacks.push(stack);
    }

    pub fn push_event(&self, event: ProcessEvent) {
        self.state.lock().unwrap().pending.events.push(event);
    }

    pub fn fail_next_drain(&self) {
        self.state.lock().unwrap().fail_next_drain = true;
    }

    pub fn set_drain_delay(&self, delay: Duration) {
        self.state.lock().unwrap().drain_delay = delay;
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().unwrap().attached
    }

    pub fn attaches(&self) -> usize {
        self.state.lock().unwrap().attaches
    }

    pub fn detaches(&self) -> usize {
        self.state.lock().unwrap().detaches
    }

    pub fn drains(&self) -> usize {
        self.state.lock().unwrap().drains
    }

    /// Decision the session handed down for `pid`
    pub fn pid_config(&self, pid: u32) -> Option<PidConfig> {
        self.state.lock().unwrap().pid_configs.get(&Pid(pid)).copied()
    }

    pub fn removed_pids(&self) -> Vec<Pid> {
        self.state.lock().unwrap().removed_pids.clone()
    }
}

/// Maps provider with per-pid layouts that tests can swap at will
#[derive(Default)]
pub struct FakeMaps {
    layouts: Mutex<HashMap<Pid, Vec<MemoryMapping>>>,
    roots: Mutex<HashMap<Pid, PathBuf>>,
    kallsyms: Mutex<Option<String>>,
    reads: AtomicUsize,
}

impl FakeMaps {
    pub fn set_layout(&self, pid: u32, mappings: Vec<MemoryMapping>) {
        self.layouts.lock().unwrap().insert(Pid(pid), mappings);
    }

    /// Mount namespace root of `pid` (`/` unless set)
    pub fn set_root(&self, pid: u32, root: impl Into<PathBuf>) {
        self.roots.lock().unwrap().insert(Pid(pid), root.into());
    }

    pub fn set_kallsyms(&self, text: &str) {
        *self.kallsyms.lock().unwrap() = Some(text.to_string());
    }

    pub fn remove(&self, pid: u32) {
        self.layouts.lock().unwrap().remove(&Pid(pid));
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl MapsProvider for FakeMaps {
    fn read_maps(&self, pid: Pid) -> Result<Vec<MemoryMapping>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.layouts
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such process: {pid}"))
    }

    fn read_comm(&self, pid: Pid) -> Result<String> {
        Ok(format!("proc-{}", pid.0))
    }

    fn process_root(&self, pid: Pid) -> PathBuf {
        self.roots.lock().unwrap().get(&pid).cloned().unwrap_or_else(|| PathBuf::from("/"))
    }

    fn read_kallsyms(&self) -> Result<String> {
        self.kallsyms
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("kallsyms not available in tests"))
    }
}

/// Executable mappings of this test process, as the kernel reports them
pub fn own_mappings() -> Vec<MemoryMapping> {
    ProcFs::default().read_maps(Pid(std::process::id())).expect("Failed to read own maps")
}

/// Mapping of this test process containing `addr`
pub fn own_mapping_for(addr: u64) -> MemoryMapping {
    own_mappings()
        .into_iter()
        .find(|m| m.contains(addr))
        .unwrap_or_else(|| panic!("no mapping contains 0x{addr:x}"))
}

/// Same mapping, registered under a different (device, inode)
pub fn with_file_key(mapping: &MemoryMapping, inode: u64) -> MemoryMapping {
    MemoryMapping { file: FileKey { dev: 0xfeed, inode }, ..mapping.clone() }
}

/// Same mapping, as seen through `path` inside a process's own root
pub fn with_path(mapping: &MemoryMapping, path: &str) -> MemoryMapping {
    MemoryMapping { path: Some(Arc::from(path)), ..mapping.clone() }
}

pub fn missing_binary_mapping(start: u64, end: u64) -> MemoryMapping {
    MemoryMapping {
        start,
        end,
        offset: 0,
        file: FileKey { dev: 0xdead, inode: 1 },
        path: Some(Arc::from("/nonexistent/libmissing.so")),
    }
}

pub fn pid_target(pid: u32, service: &str) -> DiscoveryTarget {
    [(LABEL_PID, pid.to_string()), (LABEL_SERVICE_NAME, service.to_string())]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Finder matching only the given pids
pub fn finder_for(pids: &[(u32, &str)]) -> Arc<ProcTargetFinder> {
    Arc::new(ProcTargetFinder::new(&TargetsOptions {
        targets: pids.iter().map(|&(pid, service)| pid_target(pid, service)).collect(),
        targets_only: true,
        ..TargetsOptions::default()
    }))
}
