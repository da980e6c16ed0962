use metrics::{counter, histogram};
use tracing::trace;

// Recorded through the `metrics` facade; `/metrics` renders them via the
// Prometheus recorder installed in main.

pub fn inc_requests(route: &'static str) {
    counter!("promo_requests_total", "route" => route).increment(1);
    trace!(
        target = "promo.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    histogram!("promo_stage_duration_ms", "stage" => stage).record(elapsed_ms as f64);
    trace!(
        target = "promo.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

/// One per product in a generation run; `outcome` is `ok` or an error code.
pub fn generation_finished(outcome: &'static str) {
    counter!("promo_generations_total", "outcome" => outcome).increment(1);
}
