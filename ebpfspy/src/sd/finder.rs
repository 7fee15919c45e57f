//! Pid → target lookup

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::cgroup::container_id_from_cgroup;
use super::target::{DiscoveryTarget, Target, LABEL_CONTAINER_ID, LABEL_PID};
use crate::domain::Pid;
use crate::symtab::{GCache, GCacheOptions};

/// Maps sampled pids to the workload they belong to
pub trait TargetFinder: Send + Sync {
    /// Target of `pid`, or `None` if the pid should not be profiled
    fn find_target(&self, pid: Pid) -> Option<Arc<Target>>;

    /// Forget everything cached about `pid`
    fn remove_dead_pid(&self, pid: Pid);

    /// Replace the target list
    ///
    /// Answers given before the update may be stale; callers re-ask for the
    /// pids they track.
    fn update(&self, options: &TargetsOptions);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsOptions {
    /// Each target selects processes with `__process_pid__` or
    /// `__container_id__`
    pub targets: Vec<DiscoveryTarget>,
    /// Drop samples of processes that match no target
    pub targets_only: bool,
    /// Labels of the target for unmatched processes when `targets_only` is off
    pub default_target: Option<DiscoveryTarget>,
    /// Maximum number of cached pid → container id entries
    pub container_cache_size: usize,
}

impl Default for TargetsOptions {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            targets_only: false,
            default_target: None,
            container_cache_size: 1024,
        }
    }
}

#[derive(Default)]
struct TargetIndex {
    by_pid: HashMap<Pid, Arc<Target>>,
    by_container: HashMap<String, Arc<Target>>,
    default: Option<Arc<Target>>,
}

impl TargetIndex {
    fn build(options: &TargetsOptions) -> Self {
        let mut index = TargetIndex::default();

        for discovery in &options.targets {
            let target = Arc::new(Target::new(discovery));
            if let Some(pid) = discovery.get(LABEL_PID) {
                match pid.parse::<u32>() {
                    Ok(pid) => {
                        index.by_pid.insert(Pid(pid), target);
                    }
                    Err(_) => warn!("Ignoring target {target}: invalid {LABEL_PID} {pid:?}"),
                }
            } else if let Some(container_id) = discovery.get(LABEL_CONTAINER_ID) {
                index.by_container.insert(normalize_container_id(container_id), target);
            } else {
                warn!("Ignoring target {target}: neither {LABEL_PID} nor {LABEL_CONTAINER_ID}");
            }
        }

        if !options.targets_only {
            let labels = options.default_target.clone().unwrap_or_default();
            index.default = Some(Arc::new(Target::new(&labels)));
        }
        index
    }
}

/// Accepts `docker://<id>` and `containerd://<id>` forms as used by
/// Kubernetes
fn normalize_container_id(id: &str) -> String {
    id.rsplit_once("://").map_or(id, |(_, id)| id).to_string()
}

/// [`TargetFinder`] matching processes by pid or by container
pub struct ProcTargetFinder {
    index: RwLock<TargetIndex>,
    /// pid → container id (`None` for host processes)
    containers: Mutex<GCache<Pid, Option<Arc<str>>>>,
    proc_root: PathBuf,
}

impl ProcTargetFinder {
    #[must_use]
    pub fn new(options: &TargetsOptions) -> Self {
        Self::with_proc_root(options, "/proc")
    }

    #[must_use]
    pub fn with_proc_root(options: &TargetsOptions, proc_root: impl Into<PathBuf>) -> Self {
        let cache = GCacheOptions { size: options.container_cache_size.max(1), keep_rounds: u64::MAX };
        Self {
            index: RwLock::new(TargetIndex::build(options)),
            containers: Mutex::new(GCache::new(cache)),
            proc_root: proc_root.into(),
        }
    }

    fn container_id(&self, pid: Pid) -> Option<Arc<str>> {
        let mut containers = self.containers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = containers.get(&pid) {
            return cached;
        }

        let path = self.proc_root.join(pid.0.to_string()).join("cgroup");
        let id = match fs::read_to_string(&path) {
            Ok(cgroup) => container_id_from_cgroup(&cgroup).map(Arc::from),
            Err(e) => {
                // Not cached: the process may be gone, or not yet visible
                debug!("Cannot read {}: {e}", path.display());
                return None;
            }
        };
        containers.put(pid, id.clone());
        id
    }
}

impl TargetFinder for ProcTargetFinder {
    fn find_target(&self, pid: Pid) -> Option<Arc<Target>> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(target) = index.by_pid.get(&pid) {
            return Some(target.clone());
        }
        if !index.by_container.is_empty() {
            if let Some(target) =
                self.container_id(pid).and_then(|id| index.by_container.get(&*id).cloned())
            {
                return Some(target);
            }
        }
        index.default.clone()
    }

    fn remove_dead_pid(&self, pid: Pid) {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner).remove(&pid);
    }

    /// Cached container ids stay valid across updates
    fn update(&self, options: &TargetsOptions) {
        let index = TargetIndex::build(options);
        debug!(
            "Targets updated: {} by pid, {} by container",
            index.by_pid.len(),
            index.by_container.len()
        );
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
    }
}
