use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Database Metrics
    pub static ref DB_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "db_operations_total",
        "Total number of database operations",
        &["operation", "collection", "status"]
    )
    .unwrap();

    pub static ref DB_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "db_operation_duration_seconds",
        "Database operation duration in seconds",
        &["operation", "collection"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();

    // Business Metrics
    pub static ref ATTEMPTS_STARTED_TOTAL: IntCounter = register_int_counter!(
        "attempts_started_total",
        "Total number of question attempts started"
    )
    .unwrap();

    pub static ref ATTEMPT_STEPS_RECORDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempt_steps_recorded_total",
        "Total number of steps written to attempt logs",
        &["kind"]
    )
    .unwrap();

    pub static ref AUTOSAVE_OUTCOMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "autosave_outcomes_total",
        "Autosave requests by reconciliation outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref STEP_CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "step_conflicts_total",
        "Step writes rejected because the log changed concurrently",
        &["operation"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track database operation with metrics
pub async fn track_db_operation<F, T, E>(operation: &str, collection: &str, future: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    DB_OPERATIONS_TOTAL
        .with_label_values(&[operation, collection, status])
        .inc();

    DB_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation, collection])
        .observe(duration);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let _ = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/health", "200"])
            .get();
        let _ = AUTOSAVE_OUTCOMES_TOTAL.with_label_values(&["replaced"]).get();
    }

    #[test]
    fn test_render_metrics() {
        ATTEMPT_STEPS_RECORDED_TOTAL
            .with_label_values(&["autosave"])
            .inc();

        let output = render_metrics().unwrap();
        assert!(output.contains("attempt_steps_recorded_total"));
    }

    #[tokio::test]
    async fn test_track_db_operation_counts_errors() {
        let before = DB_OPERATIONS_TOTAL
            .with_label_values(&["probe", "test_collection", "error"])
            .get();

        let result: Result<(), &str> =
            track_db_operation("probe", "test_collection", async { Err("boom") }).await;

        assert!(result.is_err());
        assert_eq!(
            DB_OPERATIONS_TOTAL
                .with_label_values(&["probe", "test_collection", "error"])
                .get(),
            before + 1
        );
    }
}
