use anyhow::Result;
use nb_core::{Action, Decision, Target, TargetState};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metrics collector for the network blocker
pub struct MetricsCollector {
    registry: Registry,

    apply_success: IntCounterVec,
    apply_failure: IntCounterVec,
    active_rules: IntGauge,
    cleanup_warnings: IntCounter,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let apply_success = IntCounterVec::new(
            Opts::new("netblock_apply_total", "Total successful apply operations"),
            &["action", "target"],
        )?;
        registry.register(Box::new(apply_success.clone()))?;

        let apply_failure = IntCounterVec::new(
            Opts::new(
                "netblock_apply_failure_total",
                "Total failed apply operations",
            ),
            &["action", "target", "state"],
        )?;
        registry.register(Box::new(apply_failure.clone()))?;

        let active_rules = IntGauge::new(
            "netblock_active_rules",
            "Admission decisions present in the private chain at the last listing",
        )?;
        registry.register(Box::new(active_rules.clone()))?;

        let cleanup_warnings = IntCounter::new(
            "netblock_cleanup_warnings_total",
            "Cleanup steps that failed",
        )?;
        registry.register(Box::new(cleanup_warnings.clone()))?;

        Ok(Self {
            registry,
            apply_success,
            apply_failure,
            active_rules,
            cleanup_warnings,
        })
    }

    pub fn record_apply_success(&self, target: &Target, action: Action) {
        self.apply_success
            .with_label_values(&[action.as_str(), target.kind()])
            .inc();
    }

    /// `state` is `None` when the failure did not come from the rule engine
    pub fn record_apply_failure(&self, target: &Target, action: Action, state: Option<TargetState>) {
        let state = match state {
            Some(TargetState::Unchanged) => "unchanged",
            Some(TargetState::Accepting) => "accepting",
            None => "unknown",
        };
        self.apply_failure
            .with_label_values(&[action.as_str(), target.kind(), state])
            .inc();
    }

    /// Update the gauge from a fresh listing
    pub fn update_active_rules(&self, decisions: &[Decision]) {
        self.active_rules.set(decisions.len() as i64);
    }

    pub fn record_cleanup_warnings(&self, count: usize) {
        self.cleanup_warnings.inc_by(count as u64);
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
