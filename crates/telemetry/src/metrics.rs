use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref STREAMS_ACTIVE: IntGauge = {
        let metric = IntGauge::new("streams_active", "Number of streams not in a terminal state")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref STREAMS_CREATED_TOTAL: IntCounter = {
        let metric = IntCounter::new("streams_created_total", "Total number of streams created")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref STREAMS_EXPIRED_TOTAL: IntCounter = {
        let metric = IntCounter::new(
            "streams_expired_total",
            "Total number of streams reaped for inactivity",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref STREAMS_COMPLETED_TOTAL: IntCounter = {
        let metric = IntCounter::new(
            "streams_completed_total",
            "Total number of streams that finished with at least one usable quality tier",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref STREAMS_FAILED_TOTAL: IntCounter = {
        let metric = IntCounter::new(
            "streams_failed_total",
            "Total number of streams that ended in the error state",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Render the registry in Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("failed to convert metrics to utf-8: {e}")))
}
