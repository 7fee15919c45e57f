//! Container id extraction from `/proc/<pid>/cgroup`
//!
//! ```text
//! 0::/system.slice/docker-4f1d...c2.scope                     (docker, systemd driver)
//! 12:pids:/docker/4f1d...c2                                    (docker, cgroupfs driver)
//! 0::/kubepods/burstable/pod7e2f.../cri-containerd-4f1d...c2.scope
//! ```
//!
//! A container id is a 64 character lowercase hex string, possibly wrapped in
//! a runtime prefix (`docker-`, `cri-containerd-`, `crio-`, `libpod-`) and a
//! `.scope` suffix.

const CONTAINER_ID_LEN: usize = 64;

/// First container id found in cgroup file contents
#[must_use]
pub fn container_id_from_cgroup(cgroup: &str) -> Option<String> {
    cgroup.lines().find_map(|line| {
        let path = line.splitn(3, ':').nth(2)?;
        path.split('/').find_map(container_id_from_segment)
    })
}

fn container_id_from_segment(segment: &str) -> Option<String> {
    let segment = segment.strip_suffix(".scope").unwrap_or(segment);
    let candidate = segment.rsplit('-').next().unwrap_or(segment);
    is_container_id(candidate).then(|| candidate.to_string())
}

fn is_container_id(s: &str) -> bool {
    s.len() == CONTAINER_ID_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
