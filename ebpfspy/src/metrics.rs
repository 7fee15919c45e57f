//! Metrics collaborator
//!
//! The core reports cache efficiency, resolution failures and round timing
//! through [`MetricsSink`] but keeps no metric storage of its own. Hosts plug
//! in their telemetry; [`NoopMetrics`] discards everything and is the default.
//! [`SymtabMetrics`] exports the same events as Prometheus collectors
//! registered on a caller-provided [`Registry`].

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cache tier a hit or miss belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    FileIdentity,
    SymbolTable,
    ProcessMap,
}

impl CacheTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CacheTier::FileIdentity => "same-file",
            CacheTier::SymbolTable => "build-id",
            CacheTier::ProcessMap => "pid",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a frame degraded to a placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionFailure {
    /// Process maps could not be read (process gone, permissions)
    ProcessGone,
    /// Address outside every mapping, even after a rebuild
    UnmappedAddress,
    /// Mapped file could not be opened
    UnreadableBinary,
    /// Binary could not be parsed into a symbol table
    SymbolTableParse,
    /// No symbol covers the address
    UnknownSymbol,
    /// Sampled pid has no target
    MissingTarget,
}

impl ResolutionFailure {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionFailure::ProcessGone => "process_gone",
            ResolutionFailure::UnmappedAddress => "unmapped_address",
            ResolutionFailure::UnreadableBinary => "unreadable_binary",
            ResolutionFailure::SymbolTableParse => "symbol_table_parse",
            ResolutionFailure::UnknownSymbol => "unknown_symbol",
            ResolutionFailure::MissingTarget => "missing_target",
        }
    }
}

/// Sink for counters and gauges emitted by the core
pub trait MetricsSink: Send + Sync {
    fn cache_access(&self, tier: CacheTier, hit: bool);

    fn resolution_failure(&self, kind: ResolutionFailure);

    /// Frames of one stack of `service_name` that got a symbol name
    /// (`known`) or a placeholder (`unknown`)
    fn symbols_resolved(&self, service_name: &str, known: u64, unknown: u64);

    fn round_completed(&self, duration: Duration, samples: usize);
}

/// Discards every metric
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn cache_access(&self, _tier: CacheTier, _hit: bool) {}

    fn resolution_failure(&self, _kind: ResolutionFailure) {}

    fn symbols_resolved(&self, _service_name: &str, _known: u64, _unknown: u64) {}

    fn round_completed(&self, _duration: Duration, _samples: usize) {}
}

/// Cloneable handle to a sink, [`NoopMetrics`] by default
#[derive(Clone)]
pub struct SharedMetrics(pub Arc<dyn MetricsSink>);

impl SharedMetrics {
    #[must_use]
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self(sink)
    }
}

impl Default for SharedMetrics {
    fn default() -> Self {
        Self(Arc::new(NoopMetrics))
    }
}

impl fmt::Debug for SharedMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedMetrics")
    }
}

/// Prometheus collectors for symbolization and collection rounds
#[derive(Clone)]
pub struct SymtabMetrics {
    cache_hits: IntCounterVec,
    cache_misses: IntCounterVec,
    failures: IntCounterVec,
    known_symbols: IntCounterVec,
    unknown_symbols: IntCounterVec,
    unknown_stacks: IntCounterVec,
    samples: IntCounter,
    round_duration: Histogram,
}

/// Point-in-time totals of [`SymtabMetrics`], summed over every label
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// (hits, misses)
    pub file_identity: (u64, u64),
    pub symbol_table: (u64, u64),
    pub process_map: (u64, u64),
    pub unmapped_addresses: u64,
    pub unreadable_binaries: u64,
    pub missing_targets: u64,
    pub known_symbols: u64,
    pub unknown_symbols: u64,
    pub rounds: u64,
    pub samples: u64,
}

impl SymtabMetrics {
    /// Create the collectors and register them on `registry`
    ///
    /// # Errors
    /// Returns an error if a collector with the same name is already
    /// registered
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let counter_vec = |name: &str, help: &str, label: &str| -> prometheus::Result<_> {
            let vec = IntCounterVec::new(Opts::new(name, help).namespace("ebpfspy"), &[label])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let samples = IntCounter::with_opts(
            Opts::new("samples_total", "Distinct stacks emitted by collection rounds")
                .namespace("ebpfspy"),
        )?;
        registry.register(Box::new(samples.clone()))?;

        let round_duration = Histogram::with_opts(
            HistogramOpts::new("round_duration_seconds", "Duration of a collection round")
                .namespace("ebpfspy")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(round_duration.clone()))?;

        Ok(Self {
            cache_hits: counter_vec("symtab_cache_hits_total", "Cache hits by tier", "tier")?,
            cache_misses: counter_vec("symtab_cache_misses_total", "Cache misses by tier", "tier")?,
            failures: counter_vec(
                "symtab_resolution_failures_total",
                "Frames degraded to a placeholder, by cause",
                "kind",
            )?,
            known_symbols: counter_vec(
                "symtab_known_symbols_total",
                "Frames resolved to a symbol name",
                "service_name",
            )?,
            unknown_symbols: counter_vec(
                "symtab_unknown_symbols_total",
                "Frames rendered as a placeholder",
                "service_name",
            )?,
            unknown_stacks: counter_vec(
                "symtab_unknown_stacks_total",
                "Stacks with more placeholders than symbol names",
                "service_name",
            )?,
            samples,
            round_duration,
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let tier = |tier: CacheTier| {
            (
                self.cache_hits.with_label_values(&[tier.as_str()]).get(),
                self.cache_misses.with_label_values(&[tier.as_str()]).get(),
            )
        };
        MetricsSnapshot {
            file_identity: tier(CacheTier::FileIdentity),
            symbol_table: tier(CacheTier::SymbolTable),
            process_map: tier(CacheTier::ProcessMap),
            unmapped_addresses: self.failures(ResolutionFailure::UnmappedAddress),
            unreadable_binaries: self.failures(ResolutionFailure::UnreadableBinary),
            missing_targets: self.failures(ResolutionFailure::MissingTarget),
            known_symbols: total(&self.known_symbols),
            unknown_symbols: total(&self.unknown_symbols),
            rounds: self.round_duration.get_sample_count(),
            samples: self.samples.get(),
        }
    }

    /// Count of failures of `kind` so far
    #[must_use]
    pub fn failures(&self, kind: ResolutionFailure) -> u64 {
        self.failures.with_label_values(&[kind.as_str()]).get()
    }

    /// (known, unknown) frames attributed to `service_name`
    #[must_use]
    pub fn symbols_of(&self, service_name: &str) -> (u64, u64) {
        (
            self.known_symbols.with_label_values(&[service_name]).get(),
            self.unknown_symbols.with_label_values(&[service_name]).get(),
        )
    }

    #[must_use]
    pub fn unknown_stacks_of(&self, service_name: &str) -> u64 {
        self.unknown_stacks.with_label_values(&[service_name]).get()
    }

    /// Summed duration of every round so far
    #[must_use]
    pub fn round_time(&self) -> Duration {
        Duration::from_secs_f64(self.round_duration.get_sample_sum())
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn total(vec: &IntCounterVec) -> u64 {
    use prometheus::core::Collector;
    vec.collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum()
}

impl MetricsSink for SymtabMetrics {
    fn cache_access(&self, tier: CacheTier, hit: bool) {
        let vec = if hit { &self.cache_hits } else { &self.cache_misses };
        vec.with_label_values(&[tier.as_str()]).inc();
    }

    fn resolution_failure(&self, kind: ResolutionFailure) {
        self.failures.with_label_values(&[kind.as_str()]).inc();
    }

    fn symbols_resolved(&self, service_name: &str, known: u64, unknown: u64) {
        self.known_symbols.with_label_values(&[service_name]).inc_by(known);
        self.unknown_symbols.with_label_values(&[service_name]).inc_by(unknown);
        if known + unknown > 1 && unknown > known {
            self.unknown_stacks.with_label_values(&[service_name]).inc();
        }
    }

    fn round_completed(&self, duration: Duration, samples: usize) {
        self.round_duration.observe(duration.as_secs_f64());
        self.samples.inc_by(samples as u64);
    }
}

/// Metrics on a private registry, for unit tests
#[cfg(test)]
pub(crate) fn test_metrics() -> Arc<SymtabMetrics> {
    Arc::new(SymtabMetrics::new(&Registry::new()).expect("fresh registry"))
}
