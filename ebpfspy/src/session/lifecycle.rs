//! Profiling session lifecycle and collection rounds
//!
//! ```text
//!  Created ──start()──► Started ──stop()──► Stopped
//!     │                    │
//!     └──stop() → NotStarted    collect_profiles() once per round
//! ```
//!
//! One collection round:
//!
//! 1. drain the sampler (and enabled interpreter unwinders)
//! 2. advance every cache tier's round
//! 3. apply exec/exit events and decide newly seen pids
//! 4. resolve, attribute and aggregate each stack
//! 5. emit one [`ProfileSample`] per distinct (target, pid, stack)
//!
//! Every pid the sampler reports as unknown gets a [`PidConfig`]: profiled
//! when the finder has a target for it, ignored otherwise. Decisions are
//! revisited by [`Session::update_targets`].

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::interpreter::{InterpreterKind, InterpreterUnwinder};
use super::options::SessionOptions;
use super::sample::{ProcessEvent, ProfileSample, RawFrame, RawStack};
use super::sampler::{PidConfig, SampleSource, SamplerConfig};
use crate::domain::{Pid, SessionError};
use crate::metrics::{MetricsSink, ResolutionFailure};
use crate::sd::{Target, TargetFinder, TargetsOptions};
use crate::symtab::{AddressResolver, MapsProvider, ProcFs, ResolverDebugInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Started,
    Stopped,
}

/// Diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    pub state: SessionState,
    pub caches: ResolverDebugInfo,
    pub symbol_tables_parsed: u64,
}

struct Inner {
    state: SessionState,
    sampler: Box<dyn SampleSource>,
    unwinders: Vec<Box<dyn InterpreterUnwinder>>,
    /// Decisions handed to the sampler, by pid
    pids: HashMap<Pid, PidConfig>,
}

/// A continuous profiling session
///
/// All methods take `&self`; the sampler lives behind a mutex that also
/// serializes collection rounds, so `stop` waits for an in-flight round.
pub struct Session {
    options: SessionOptions,
    inner: Mutex<Inner>,
    finder: Arc<dyn TargetFinder>,
    resolver: AddressResolver,
    metrics: Arc<dyn MetricsSink>,
}

#[derive(PartialEq, Eq, Hash)]
struct AggregationKey {
    target: Arc<str>,
    pid: Pid,
    stack: Vec<Arc<str>>,
}

impl Session {
    /// Create a session reading process layouts from `/proc`
    ///
    /// # Errors
    /// Returns [`SessionError::Config`] if `options` are invalid
    pub fn new(
        options: SessionOptions,
        finder: Arc<dyn TargetFinder>,
        sampler: Box<dyn SampleSource>,
    ) -> Result<Self, SessionError> {
        Self::with_maps_provider(options, finder, sampler, Arc::new(ProcFs::default()))
    }

    /// # Errors
    /// Returns [`SessionError::Config`] if `options` are invalid
    pub fn with_maps_provider(
        options: SessionOptions,
        finder: Arc<dyn TargetFinder>,
        sampler: Box<dyn SampleSource>,
        provider: Arc<dyn MapsProvider>,
    ) -> Result<Self, SessionError> {
        options.validate()?;
        let metrics = options.metrics.0.clone();
        let resolver = AddressResolver::new(
            options.cache_options,
            options.placeholders(),
            provider,
            metrics.clone(),
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                sampler,
                unwinders: Vec::new(),
                pids: HashMap::new(),
            }),
            options,
            finder,
            resolver,
            metrics,
        })
    }

    /// Register an interpreter unwinder
    ///
    /// Its stacks are merged only while the matching `*_enabled` option is on.
    #[must_use]
    pub fn with_interpreter(mut self, unwinder: Box<dyn InterpreterUnwinder>) -> Self {
        self.inner.get_mut().unwrap_or_else(PoisonError::into_inner).unwinders.push(unwinder);
        self
    }

    /// Attach the sampler
    ///
    /// # Errors
    /// - [`SessionError::AlreadyStarted`] / [`SessionError::Stopped`] in the
    ///   wrong state, without side effects
    /// - [`SessionError::Sampler`] if attaching fails; the session stays
    ///   `Created` and `start` may be retried
    pub fn start(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Started => return Err(SessionError::AlreadyStarted),
            SessionState::Stopped => return Err(SessionError::Stopped),
            SessionState::Created => {}
        }

        let config = SamplerConfig {
            sample_rate: self.options.sample_rate,
            collect_user: self.options.collect_user,
            collect_kernel: self.options.collect_kernel,
        };
        inner.sampler.attach(&config)?;
        inner.state = SessionState::Started;
        info!(
            "Session started: {} Hz, user stacks: {}, kernel stacks: {}",
            config.sample_rate, config.collect_user, config.collect_kernel
        );
        Ok(())
    }

    /// Detach the sampler and release kernel resources
    ///
    /// Idempotent once started. Blocks until an in-flight collection round
    /// finishes.
    ///
    /// # Errors
    /// Returns [`SessionError::NotStarted`] if the session was never started
    pub fn stop(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Created => Err(SessionError::NotStarted),
            SessionState::Stopped => Ok(()),
            SessionState::Started => {
                inner.sampler.detach();
                inner.state = SessionState::Stopped;
                info!("Session stopped");
                Ok(())
            }
        }
    }

    /// Run one collection round, calling `callback` once per distinct stack
    ///
    /// Samples are emitted in first-seen order with their weights summed.
    ///
    /// # Errors
    /// - [`SessionError::NotStarted`] / [`SessionError::Stopped`] outside the
    ///   `Started` state
    /// - [`SessionError::Sampler`] if the sampler cannot be drained; caches are
    ///   left untouched and the next round proceeds normally
    pub fn collect_profiles<F>(&self, mut callback: F) -> Result<(), SessionError>
    where
        F: FnMut(ProfileSample),
    {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Created => return Err(SessionError::NotStarted),
            SessionState::Stopped => return Err(SessionError::Stopped),
            SessionState::Started => {}
        }

        let round_start = Instant::now();
        let drained = inner.sampler.drain()?;
        let evicted = self.resolver.next_round();
        if evicted > 0 {
            debug!("Evicted {evicted} cache entries");
        }

        for event in &drained.events {
            match *event {
                ProcessEvent::Exec(pid) => {
                    self.resolver.invalidate(pid);
                    if inner.pids.contains_key(&pid) {
                        self.decide_pid(&mut inner, pid);
                    }
                }
                ProcessEvent::Exit(pid) => self.forget_pid(&mut inner, pid),
                ProcessEvent::Unknown(pid) => {
                    self.decide_pid(&mut inner, pid);
                }
            }
        }

        let interpreted = self.drain_interpreters(&mut inner.unwinders);
        let mut claimed: HashMap<Pid, bool> = HashMap::new();
        let native: Vec<RawStack> = drained
            .stacks
            .into_iter()
            .filter(|stack| {
                !*claimed
                    .entry(stack.pid)
                    .or_insert_with(|| self.claimed_by_interpreter(&inner.unwinders, stack.pid))
            })
            .collect();

        let mut samples: Vec<ProfileSample> = Vec::new();
        let mut index: HashMap<AggregationKey, usize> = HashMap::new();
        let mut comms: HashMap<Pid, Arc<str>> = HashMap::new();
        let mut targets: HashMap<Pid, Option<Arc<Target>>> = HashMap::new();

        for raw in native.into_iter().chain(interpreted) {
            if raw.weight == 0 {
                continue;
            }
            let target = targets
                .entry(raw.pid)
                .or_insert_with(|| self.finder.find_target(raw.pid))
                .clone();
            let Some(target) = target else {
                self.metrics.resolution_failure(ResolutionFailure::MissingTarget);
                continue;
            };

            let comm = comms
                .entry(raw.pid)
                .or_insert_with(|| {
                    self.resolver
                        .process_name(raw.pid)
                        .unwrap_or_else(|| Arc::from(raw.pid.0.to_string()))
                })
                .clone();
            let (stack, known, unknown) = self.resolve_stack(comm, &raw);
            self.metrics.symbols_resolved(target.service_name(), known, unknown);

            let key = AggregationKey {
                target: Arc::from(target.id()),
                pid: raw.pid,
                stack: stack.clone(),
            };
            if let Some(&i) = index.get(&key) {
                samples[i].weight += raw.weight;
            } else {
                index.insert(key, samples.len());
                samples.push(ProfileSample { target, pid: raw.pid, stack, weight: raw.weight });
            }
        }

        // Callbacks run unlocked so they may call back into the session
        drop(inner);
        let emitted = samples.len();
        for sample in samples {
            callback(sample);
        }
        self.metrics.round_completed(round_start.elapsed(), emitted);
        debug!("Collection round: {emitted} stacks in {:?}", round_start.elapsed());
        Ok(())
    }

    fn drain_interpreters(&self, unwinders: &mut [Box<dyn InterpreterUnwinder>]) -> Vec<RawStack> {
        let mut stacks = Vec::new();
        for unwinder in unwinders.iter_mut() {
            if self.interpreter_enabled(unwinder.kind()) {
                stacks.extend(unwinder.drain());
            } else {
                // Keep the unwinder's buffers bounded while disabled
                let dropped = unwinder.drain().len();
                if dropped > 0 {
                    debug!("Dropped {dropped} {} stacks: unwinder disabled", unwinder.kind());
                }
            }
        }
        stacks
    }

    fn claimed_by_interpreter(&self, unwinders: &[Box<dyn InterpreterUnwinder>], pid: Pid) -> bool {
        unwinders.iter().any(|u| self.interpreter_enabled(u.kind()) && u.claims(pid))
    }

    fn interpreter_enabled(&self, kind: InterpreterKind) -> bool {
        match kind {
            InterpreterKind::Python => self.options.python_enabled,
        }
    }

    /// Resolve a leaf-first raw stack into a root-first named stack, with the
    /// number of frames that got a symbol name and a placeholder
    fn resolve_stack(&self, comm: Arc<str>, raw: &RawStack) -> (Vec<Arc<str>>, u64, u64) {
        let mut stack = Vec::with_capacity(raw.frames.len() + 1);
        let (mut known, mut unknown) = (0, 0);
        stack.push(comm);
        for frame in raw.frames.iter().rev() {
            let resolved = match frame {
                RawFrame::User(addr) => self.resolver.resolve_frame(raw.pid, *addr),
                RawFrame::Kernel(addr) => self.resolver.resolve_kernel_frame(*addr),
                RawFrame::Resolved(name) => {
                    stack.push(name.clone());
                    known += 1;
                    continue;
                }
            };
            if resolved.known {
                known += 1;
            } else {
                unknown += 1;
            }
            stack.push(resolved.name);
        }
        (stack, known, unknown)
    }

    /// Replace the target list and revisit every pid decision
    ///
    /// Pids that gained a target start being sampled, pids that lost theirs
    /// stop. Pids whose exit was missed are forgotten.
    pub fn update_targets(&self, options: &TargetsOptions) {
        self.finder.update(options);

        let mut inner = self.lock();
        let tracked: Vec<Pid> = inner.pids.keys().copied().collect();
        let mut changed = 0;
        let mut stale = 0;
        for pid in tracked {
            if !self.resolver.process_alive(pid) {
                self.forget_pid(&mut inner, pid);
                stale += 1;
            } else if self.decide_pid(&mut inner, pid) {
                changed += 1;
            }
        }
        info!("Targets updated: {changed} pid decisions changed, {stale} stale pids dropped");
    }

    /// Profile `pid` if it has a target, ignore it otherwise; true when the
    /// decision changed
    fn decide_pid(&self, inner: &mut Inner, pid: Pid) -> bool {
        let config = if self.finder.find_target(pid).is_some() {
            PidConfig::Profile
        } else {
            PidConfig::Ignore
        };
        if let Err(e) = inner.sampler.set_pid_config(pid, config) {
            warn!("Cannot record decision for {pid}: {e}");
            return false;
        }
        inner.pids.insert(pid, config) != Some(config)
    }

    fn forget_pid(&self, inner: &mut Inner, pid: Pid) {
        self.resolver.invalidate(pid);
        self.finder.remove_dead_pid(pid);
        if inner.pids.remove(&pid).is_some() {
            inner.sampler.remove_pid(pid);
        }
    }

    /// Current decision about `pid`, if it has been seen
    #[must_use]
    pub fn pid_config(&self, pid: Pid) -> Option<PidConfig> {
        self.lock().pids.get(&pid).copied()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    #[must_use]
    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    #[must_use]
    pub fn debug_info(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            state: self.state(),
            caches: self.resolver.debug_info(),
            symbol_tables_parsed: self.resolver.parse_count(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.state == SessionState::Started {
            inner.sampler.detach();
            inner.state = SessionState::Stopped;
        }
    }
}
