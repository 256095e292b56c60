use prometheus::{
    Counter, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

use crate::error::Result;
use crate::types::RunStatus;

const STEP_LATENCY_BUCKETS_MS: &[f64] = &[
    10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 5_000.0, 30_000.0, 120_000.0,
];

const GATE_WAIT_BUCKETS_SECS: &[f64] = &[
    60.0, 300.0, 900.0, 3_600.0, 14_400.0, 43_200.0, 86_400.0,
];

/// Prometheus registry scraped through the pull endpoint.
pub struct Metrics {
    registry: Registry,
    executor_invocations: IntCounter,
    checkpoint_cache: IntCounterVec,
    step_latency_ms: HistogramVec,
    gate_wait_secs: Histogram,
    cost_total: Counter,
    runs_finished: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let executor_invocations = IntCounter::new(
            "phasegate_executor_invocations_total",
            "Executor calls started by node workers",
        )?;
        let checkpoint_cache = IntCounterVec::new(
            Opts::new(
                "phasegate_checkpoint_cache_lookups_total",
                "Latest-checkpoint lookups by cache result",
            ),
            &["result"],
        )?;
        let step_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                "phasegate_step_latency_ms",
                "Wall time of one node attempt in milliseconds",
            )
            .buckets(STEP_LATENCY_BUCKETS_MS.to_vec()),
            &["node"],
        )?;
        let gate_wait_secs = Histogram::with_opts(
            HistogramOpts::new(
                "phasegate_gate_wait_seconds",
                "Time from gate creation to resolution",
            )
            .buckets(GATE_WAIT_BUCKETS_SECS.to_vec()),
        )?;
        let cost_total = Counter::new("phasegate_cost_total", "Cost reported by executors")?;
        let runs_finished = IntCounterVec::new(
            Opts::new("phasegate_runs_finished_total", "Runs reaching a terminal status"),
            &["status"],
        )?;

        registry.register(Box::new(executor_invocations.clone()))?;
        registry.register(Box::new(checkpoint_cache.clone()))?;
        registry.register(Box::new(step_latency_ms.clone()))?;
        registry.register(Box::new(gate_wait_secs.clone()))?;
        registry.register(Box::new(cost_total.clone()))?;
        registry.register(Box::new(runs_finished.clone()))?;

        Ok(Self {
            registry,
            executor_invocations,
            checkpoint_cache,
            step_latency_ms,
            gate_wait_secs,
            cost_total,
            runs_finished,
        })
    }

    pub fn record_invocation(&self) {
        self.executor_invocations.inc();
    }

    pub fn record_step_latency(&self, node_id: &str, elapsed_ms: u64) {
        self.step_latency_ms
            .with_label_values(&[node_id])
            .observe(elapsed_ms as f64);
    }

    /// Negative or non-finite costs are not counted; counters only go up.
    pub fn record_cost(&self, cost: f64) {
        if cost.is_finite() && cost > 0.0 {
            self.cost_total.inc_by(cost);
        }
    }

    pub fn record_gate_wait(&self, secs: u64) {
        self.gate_wait_secs.observe(secs as f64);
    }

    pub fn record_cache(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.checkpoint_cache.with_label_values(&[result]).inc();
    }

    pub fn record_run_finished(&self, status: RunStatus) {
        self.runs_finished
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    pub fn executor_invocations(&self) -> u64 {
        self.executor_invocations.get()
    }

    pub fn cost_total(&self) -> f64 {
        self.cost_total.get()
    }

    /// Checkpoint cache hit ratio in `[0, 1]`, or `None` before any lookup.
    pub fn cache_hit_rate(&self) -> Option<f64> {
        let hits = self.checkpoint_cache.with_label_values(&["hit"]).get();
        let misses = self.checkpoint_cache.with_label_values(&["miss"]).get();
        let total = hits + misses;
        (total > 0).then(|| hits as f64 / total as f64)
    }

    /// Render in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_recorded_signals() {
        let m = Metrics::new().unwrap();
        m.record_invocation();
        m.record_invocation();
        m.record_step_latency("ingest", 120);
        m.record_cost(3.5);
        m.record_gate_wait(60);
        m.record_cache(true);
        m.record_cache(false);
        m.record_run_finished(RunStatus::Completed);

        let text = m.render().unwrap();
        assert!(text.contains("# TYPE phasegate_step_latency_ms histogram"));
        assert!(text.contains("phasegate_executor_invocations_total 2"));
        assert!(text.contains("phasegate_step_latency_ms_count{node=\"ingest\"} 1"));
        assert!(text.contains("phasegate_step_latency_ms_bucket{node=\"ingest\",le=\"250\"} 1"));
        assert!(text.contains("phasegate_cost_total 3.5"));
        assert!(text.contains("phasegate_gate_wait_seconds_sum 60"));
        assert!(text.contains("phasegate_runs_finished_total{status=\"completed\"} 1"));
        assert!(text.contains("phasegate_checkpoint_cache_lookups_total{result=\"miss\"} 1"));
        assert_eq!(m.cache_hit_rate(), Some(0.5));
    }

    #[test]
    fn hit_rate_undefined_before_lookups() {
        assert_eq!(Metrics::new().unwrap().cache_hit_rate(), None);
    }

    #[test]
    fn negative_cost_is_not_counted() {
        let m = Metrics::new().unwrap();
        m.record_cost(2.0);
        m.record_cost(-5.0);
        m.record_cost(f64::NAN);
        assert_eq!(m.cost_total(), 2.0);
    }

    #[test]
    fn updates_survive_a_panicking_recorder() {
        let m = std::sync::Arc::new(Metrics::new().unwrap());
        let shared = m.clone();
        let _ = std::thread::spawn(move || {
            shared.record_invocation();
            panic!("worker died mid-update");
        })
        .join();
        m.record_invocation();
        assert_eq!(m.executor_invocations(), 2);
        assert!(m.render().unwrap().contains("phasegate_executor_invocations_total 2"));
    }
}
