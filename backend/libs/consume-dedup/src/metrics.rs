use prometheus::{IntCounter, IntCounterVec, Opts};
use tracing::warn;

use crate::guard::{Decision, Outcome};

#[derive(Clone)]
pub struct DedupMetrics {
    pub decisions: IntCounterVec,
    pub outcomes: IntCounterVec,
    pub backend_errors: IntCounter,
}

impl DedupMetrics {
    pub fn new(application: &str) -> Self {
        let registry = prometheus::default_registry();

        let decisions = IntCounterVec::new(
            Opts::new(
                "dedup_decisions_total",
                "Dedup decisions by result (accept, accept_later, skip)",
            )
            .const_label("application", application.to_string()),
            &["decision"],
        )
        .expect("valid metric opts for dedup_decisions_total");

        let outcomes = IntCounterVec::new(
            Opts::new(
                "dedup_outcomes_total",
                "Processing outcomes recorded by the dedup guard",
            )
            .const_label("application", application.to_string()),
            &["outcome"],
        )
        .expect("valid metric opts for dedup_outcomes_total");

        let backend_errors = IntCounter::with_opts(
            Opts::new(
                "dedup_backend_errors_total",
                "Dedup backend calls that failed or timed out",
            )
            .const_label("application", application.to_string()),
        )
        .expect("valid metric opts for dedup_backend_errors_total");

        for metric in [
            Box::new(decisions.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(outcomes.clone()),
            Box::new(backend_errors.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register dedup metric: {}", e);
            }
        }

        Self {
            decisions,
            outcomes,
            backend_errors,
        }
    }

    pub fn record_decision(&self, decision: Decision) {
        self.decisions
            .with_label_values(&[decision.as_label()])
            .inc();
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        self.outcomes.with_label_values(&[outcome.as_label()]).inc();
    }
}
