mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{
    finder_for, init_logging, pid_target, symtab_metrics, FakeSampler, FakeSamplerHandle,
};
use ebpfspy::domain::{Pid, SamplerError, SessionError};
use ebpfspy::metrics::{ResolutionFailure, SharedMetrics};
use ebpfspy::sd::{TargetFinder, TargetsOptions};
use ebpfspy::session::{
    InterpreterKind, InterpreterUnwinder, PidConfig, ProcessEvent, ProfileSample, RawFrame,
    RawStack, Session, SessionOptions, SessionState,
};

#[no_mangle]
#[inline(never)]
pub extern "C" fn ebpfspy_e2e_alpha() -> u64 {
    std::hint::black_box(11)
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn ebpfspy_e2e_bravo() -> u64 {
    std::hint::black_box(22)
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn ebpfspy_e2e_charlie() -> u64 {
    std::hint::black_box(33)
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn ebpfspy_e2e_delta() -> u64 {
    std::hint::black_box(44)
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn ebpfspy_e2e_echo() -> u64 {
    std::hint::black_box(55)
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn ebpfspy_e2e_caller() -> u64 {
    ebpfspy_e2e_alpha()
        + ebpfspy_e2e_bravo()
        + ebpfspy_e2e_charlie()
        + ebpfspy_e2e_delta()
        + ebpfspy_e2e_echo()
}

fn own_pid() -> u32 {
    std::process::id()
}

fn session_for(
    options: SessionOptions,
    finder: Arc<dyn TargetFinder>,
) -> (Arc<Session>, FakeSamplerHandle) {
    init_logging();
    let (sampler, handle) = FakeSampler::new();
    let session = Session::new(options, finder, Box::new(sampler)).expect("valid options");
    (Arc::new(session), handle)
}

fn collect(session: &Session) -> Vec<ProfileSample> {
    let mut samples = Vec::new();
    session.collect_profiles(|sample| samples.push(sample)).expect("collection round");
    samples
}

fn resolved_stack(pid: u32, frames: &[&str], weight: u64) -> RawStack {
    RawStack {
        pid: Pid(pid),
        frames: frames.iter().map(|f| RawFrame::Resolved(Arc::from(*f))).collect(),
        weight,
    }
}

#[test]
fn test_lifecycle_attaches_and_detaches_once() {
    let (session, handle) = session_for(SessionOptions::default(), finder_for(&[]));

    assert!(matches!(session.stop(), Err(SessionError::NotStarted)));
    session.start().unwrap();
    assert!(handle.is_attached());
    assert!(matches!(session.start(), Err(SessionError::AlreadyStarted)));

    session.stop().unwrap();
    session.stop().unwrap();
    assert!(!handle.is_attached());
    assert_eq!(handle.attaches(), 1);
    assert_eq!(handle.detaches(), 1);
    assert!(matches!(session.collect_profiles(|_| {}), Err(SessionError::Stopped)));
}

#[test]
fn test_drop_detaches_started_session() {
    let (session, handle) = session_for(SessionOptions::default(), finder_for(&[]));
    session.start().unwrap();
    drop(session);
    assert_eq!(handle.detaches(), 1);
}

#[test]
fn test_end_to_end_resolves_own_functions() {
    let pid = own_pid();
    let metrics = symtab_metrics();
    let options =
        SessionOptions { metrics: SharedMetrics::new(metrics.clone()), ..Default::default() };
    let (session, handle) = session_for(options, finder_for(&[(pid, "e2e")]));
    session.start().unwrap();

    assert_eq!(ebpfspy_e2e_caller(), 165);
    let caller = ebpfspy_e2e_caller as usize as u64;
    let leaves = [
        ("ebpfspy_e2e_alpha", ebpfspy_e2e_alpha as usize as u64),
        ("ebpfspy_e2e_bravo", ebpfspy_e2e_bravo as usize as u64),
        ("ebpfspy_e2e_charlie", ebpfspy_e2e_charlie as usize as u64),
        ("ebpfspy_e2e_delta", ebpfspy_e2e_delta as usize as u64),
        ("ebpfspy_e2e_echo", ebpfspy_e2e_echo as usize as u64),
    ];
    for _ in 0..2 {
        for &(_, leaf) in &leaves {
            handle.push_user_stack(pid, &[leaf, caller], 1);
        }
    }
    // pid 1 matches no target
    handle.push_user_stack(1, &[leaves[0].1], 3);

    let samples = collect(&session);
    println!("Collected {} samples", samples.len());
    for sample in &samples {
        println!("  {} {}", sample.folded(), sample.weight);
    }

    assert_eq!(samples.len(), leaves.len());
    assert!(samples.iter().all(|s| s.pid == Pid(pid)));
    assert!(samples.iter().all(|s| s.weight == 2));
    assert!(samples.iter().all(|s| s.target.service_name() == "e2e"));

    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).unwrap();
    for (sample, &(name, _)) in samples.iter().zip(&leaves) {
        assert_eq!(sample.stack.len(), 3);
        assert_eq!(&*sample.stack[0], comm.trim_end());
        assert_eq!(&*sample.stack[1], "ebpfspy_e2e_caller");
        assert_eq!(sample.leaf(), Some(name));
    }

    assert_eq!(metrics.failures(ResolutionFailure::MissingTarget), 1);
    assert_eq!(metrics.symbols_of("e2e"), (20, 0));
    assert_eq!(metrics.snapshot().rounds, 1);
    assert_eq!(session.debug_info().symbol_tables_parsed, 1);
    session.stop().unwrap();
}

#[test]
fn test_samples_aggregate_in_first_seen_order() {
    let pid = own_pid();
    let (session, handle) = session_for(SessionOptions::default(), finder_for(&[(pid, "agg")]));
    session.start().unwrap();

    handle.push_stack(resolved_stack(pid, &["b", "main"], 1));
    handle.push_stack(resolved_stack(pid, &["a", "main"], 4));
    handle.push_stack(resolved_stack(pid, &["b", "main"], 2));
    handle.push_stack(resolved_stack(pid, &["zero", "main"], 0));

    let samples = collect(&session);
    let summary: Vec<(&str, u64)> =
        samples.iter().map(|s| (s.leaf().unwrap(), s.weight)).collect();
    assert_eq!(summary, vec![("b", 3), ("a", 4)]);
    assert!(samples.iter().all(|s| &*s.stack[1] == "main"));

    // Nothing left over for the next round
    assert!(collect(&session).is_empty());
}

#[test]
fn test_read_error_leaves_round_untouched() {
    let pid = own_pid();
    let (session, handle) = session_for(SessionOptions::default(), finder_for(&[(pid, "svc")]));
    session.start().unwrap();

    handle.push_stack(resolved_stack(pid, &["work"], 1));
    handle.fail_next_drain();
    let err = session.collect_profiles(|_| panic!("no samples expected")).unwrap_err();
    assert!(matches!(err, SessionError::Sampler(SamplerError::ReadFailed(_))));
    assert_eq!(session.debug_info().caches.pid.round, 0);
    assert_eq!(session.state(), SessionState::Started);

    let samples = collect(&session);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].leaf(), Some("work"));
    assert_eq!(session.debug_info().caches.pid.round, 1);
}

#[test]
fn test_stop_waits_for_in_flight_round() {
    let pid = own_pid();
    let (session, handle) = session_for(SessionOptions::default(), finder_for(&[(pid, "svc")]));
    session.start().unwrap();
    handle.set_drain_delay(Duration::from_millis(100));
    handle.push_stack(resolved_stack(pid, &["slow"], 1));

    let collector = {
        let session = session.clone();
        thread::spawn(move || {
            let mut emitted = 0;
            let result = session.collect_profiles(|_| emitted += 1);
            (result, emitted)
        })
    };
    thread::sleep(Duration::from_millis(20));
    session.stop().unwrap();

    let (result, emitted) = collector.join().unwrap();
    // Either the round won the race or it never started
    match result {
        Ok(()) => assert_eq!(emitted, 1),
        Err(e) => assert!(matches!(e, SessionError::Stopped)),
    }
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(handle.detaches(), 1);
    assert!(matches!(session.collect_profiles(|_| {}), Err(SessionError::Stopped)));
}

#[test]
fn test_callback_may_stop_the_session() {
    let pid = own_pid();
    let (session, handle) = session_for(SessionOptions::default(), finder_for(&[(pid, "svc")]));
    session.start().unwrap();
    handle.push_stack(resolved_stack(pid, &["one"], 1));
    handle.push_stack(resolved_stack(pid, &["two"], 1));

    let mut seen = Vec::new();
    session
        .collect_profiles(|sample| {
            seen.push(sample.leaf().unwrap().to_string());
            session.stop().unwrap();
        })
        .unwrap();

    assert_eq!(seen, vec!["one", "two"]);
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn test_concurrent_collectors_do_not_lose_samples() {
    let pid = own_pid();
    let (session, handle) = session_for(SessionOptions::default(), finder_for(&[(pid, "svc")]));
    session.start().unwrap();
    for _ in 0..50 {
        handle.push_stack(resolved_stack(pid, &["hot"], 1));
    }

    let total = Arc::new(Mutex::new(0u64));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let session = session.clone();
            let total = total.clone();
            thread::spawn(move || {
                session.collect_profiles(|s| *total.lock().unwrap() += s.weight).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(*total.lock().unwrap(), 50);
    assert_eq!(handle.drains(), 4);
    assert_eq!(session.debug_info().caches.pid.round, 4);
}

#[test]
fn test_unknown_pids_are_decided_by_target() {
    let pid = own_pid();
    let parent = std::os::unix::process::parent_id();
    let vanished = u32::MAX - 1;
    let (session, handle) = session_for(SessionOptions::default(), finder_for(&[(pid, "svc")]));
    session.start().unwrap();

    for unknown in [pid, parent, vanished] {
        handle.push_event(ProcessEvent::Unknown(Pid(unknown)));
    }
    assert!(collect(&session).is_empty());
    assert_eq!(handle.pid_config(pid), Some(PidConfig::Profile));
    assert_eq!(handle.pid_config(parent), Some(PidConfig::Ignore));
    assert_eq!(handle.pid_config(vanished), Some(PidConfig::Ignore));

    // The parent gains a target; the vanished pid's exit was never seen
    session.update_targets(&TargetsOptions {
        targets: vec![pid_target(pid, "svc"), pid_target(parent, "runner")],
        targets_only: true,
        ..TargetsOptions::default()
    });
    assert_eq!(handle.pid_config(parent), Some(PidConfig::Profile));
    assert_eq!(session.pid_config(Pid(parent)), Some(PidConfig::Profile));
    assert_eq!(handle.pid_config(vanished), None);
    assert_eq!(handle.removed_pids(), vec![Pid(vanished)]);

    handle.push_stack(resolved_stack(parent, &["test_main"], 2));
    let samples = collect(&session);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].target.service_name(), "runner");

    // Losing the target stops sampling again
    session.update_targets(&TargetsOptions {
        targets: vec![pid_target(pid, "svc")],
        targets_only: true,
        ..TargetsOptions::default()
    });
    assert_eq!(handle.pid_config(parent), Some(PidConfig::Ignore));
    assert_eq!(handle.pid_config(pid), Some(PidConfig::Profile));
}

#[test]
fn test_exit_forgets_pid_decision() {
    let pid = own_pid();
    let (session, handle) = session_for(SessionOptions::default(), finder_for(&[(pid, "svc")]));
    session.start().unwrap();

    handle.push_event(ProcessEvent::Unknown(Pid(pid)));
    collect(&session);
    assert_eq!(handle.pid_config(pid), Some(PidConfig::Profile));

    handle.push_event(ProcessEvent::Exit(Pid(pid)));
    collect(&session);
    assert_eq!(handle.pid_config(pid), None);
    assert_eq!(session.pid_config(Pid(pid)), None);
    assert_eq!(handle.removed_pids(), vec![Pid(pid)]);

    // An exit for a pid never decided leaves the sampler alone
    handle.push_event(ProcessEvent::Exit(Pid(pid + 1)));
    collect(&session);
    assert_eq!(handle.removed_pids(), vec![Pid(pid)]);
}

struct FakePython {
    pid: Pid,
    pending: Vec<RawStack>,
}

impl InterpreterUnwinder for FakePython {
    fn kind(&self) -> InterpreterKind {
        InterpreterKind::Python
    }

    fn claims(&self, pid: Pid) -> bool {
        pid == self.pid
    }

    fn drain(&mut self) -> Vec<RawStack> {
        std::mem::take(&mut self.pending)
    }
}

fn python_session(python_enabled: bool) -> (Session, FakeSamplerHandle) {
    init_logging();
    let pid = own_pid();
    let (sampler, handle) = FakeSampler::new();
    let options = SessionOptions { python_enabled, ..Default::default() };
    let unwinder = FakePython {
        pid: Pid(pid),
        pending: vec![resolved_stack(pid, &["handle_request (app.py)", "<module> (app.py)"], 2)],
    };
    let session = Session::new(options, finder_for(&[(pid, "py")]), Box::new(sampler))
        .unwrap()
        .with_interpreter(Box::new(unwinder));
    session.start().unwrap();
    handle.push_stack(resolved_stack(pid, &["_PyEval_EvalFrameDefault", "main"], 5));
    (session, handle)
}

#[test]
fn test_enabled_interpreter_replaces_native_stacks() {
    let (session, _handle) = python_session(true);
    let samples = collect(&session);

    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].leaf(), Some("handle_request (app.py)"));
    assert_eq!(&*samples[0].stack[1], "<module> (app.py)");
    assert_eq!(samples[0].weight, 2);
}

#[test]
fn test_disabled_interpreter_keeps_native_stacks() {
    let (session, _handle) = python_session(false);
    let samples = collect(&session);

    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].leaf(), Some("_PyEval_EvalFrameDefault"));
    assert_eq!(samples[0].weight, 5);
}
