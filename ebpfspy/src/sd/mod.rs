//! Service discovery: which workload a sampled pid belongs to

pub mod cgroup;
pub mod finder;
pub mod target;

pub use finder::{ProcTargetFinder, TargetFinder, TargetsOptions};
pub use target::{DiscoveryTarget, Target, LABEL_CONTAINER_ID, LABEL_PID, LABEL_SERVICE_NAME};
