//! Prometheus-compatible metrics for the gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global metrics registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    http_requests_total: AtomicU64,
    http_errors_total: AtomicU64,
    chat_streams_total: AtomicU64,
    llm_input_tokens_total: AtomicU64,
    llm_output_tokens_total: AtomicU64,
    /// Estimated cost in micro-dollars (USD * 1_000_000).
    cost_microdollars_total: AtomicU64,
    rate_limit_rejections_total: AtomicU64,
    overflow_recoveries_total: AtomicU64,
    kill_switch_total: AtomicU64,
    request_duration_ms_total: AtomicU64,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                http_errors_total: AtomicU64::new(0),
                chat_streams_total: AtomicU64::new(0),
                llm_input_tokens_total: AtomicU64::new(0),
                llm_output_tokens_total: AtomicU64::new(0),
                cost_microdollars_total: AtomicU64::new(0),
                rate_limit_rejections_total: AtomicU64::new(0),
                overflow_recoveries_total: AtomicU64::new(0),
                kill_switch_total: AtomicU64::new(0),
                request_duration_ms_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.inner.http_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chat_streams(&self) {
        self.inner.chat_streams_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limit_rejections(&self) {
        self.inner
            .rate_limit_rejections_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_kill_switch(&self) {
        self.inner.kill_switch_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Per-request usage: wall-clock duration and observed token counts.
    pub fn record_usage(&self, duration_ms: u64, tokens_in: u64, tokens_out: u64, cost_usd: f64) {
        let m = &self.inner;
        m.request_duration_ms_total
            .fetch_add(duration_ms, Ordering::Relaxed);
        m.llm_input_tokens_total
            .fetch_add(tokens_in, Ordering::Relaxed);
        m.llm_output_tokens_total
            .fetch_add(tokens_out, Ordering::Relaxed);
        m.cost_microdollars_total
            .fetch_add((cost_usd * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let m = &self.inner;
        let cost_usd = m.cost_microdollars_total.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        format!(
            r#"# HELP baton_uptime_seconds Time since the gateway started.
# TYPE baton_uptime_seconds gauge
baton_uptime_seconds {}

# HELP baton_http_requests_total Total HTTP requests served.
# TYPE baton_http_requests_total counter
baton_http_requests_total {}

# HELP baton_http_errors_total Total HTTP errors (4xx/5xx).
# TYPE baton_http_errors_total counter
baton_http_errors_total {}

# HELP baton_chat_streams_total Total chat streams opened.
# TYPE baton_chat_streams_total counter
baton_chat_streams_total {}

# HELP baton_llm_input_tokens_total Total LLM input tokens.
# TYPE baton_llm_input_tokens_total counter
baton_llm_input_tokens_total {}

# HELP baton_llm_output_tokens_total Total LLM output tokens.
# TYPE baton_llm_output_tokens_total counter
baton_llm_output_tokens_total {}

# HELP baton_cost_usd_total Total estimated cost in USD.
# TYPE baton_cost_usd_total counter
baton_cost_usd_total {:.6}

# HELP baton_rate_limit_rejections_total Total rate limit rejections (429).
# TYPE baton_rate_limit_rejections_total counter
baton_rate_limit_rejections_total {}

# HELP baton_kill_switch_total Total kill-switch activations.
# TYPE baton_kill_switch_total counter
baton_kill_switch_total {}

# HELP baton_request_duration_ms_total Summed request durations in ms.
# TYPE baton_request_duration_ms_total counter
baton_request_duration_ms_total {}
"#,
            m.started_at.elapsed().as_secs(),
            m.http_requests_total.load(Ordering::Relaxed),
            m.http_errors_total.load(Ordering::Relaxed),
            m.chat_streams_total.load(Ordering::Relaxed),
            m.llm_input_tokens_total.load(Ordering::Relaxed),
            m.llm_output_tokens_total.load(Ordering::Relaxed),
            cost_usd,
            m.rate_limit_rejections_total.load(Ordering::Relaxed),
            m.kill_switch_total.load(Ordering::Relaxed),
            m.request_duration_ms_total.load(Ordering::Relaxed),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let m = Metrics::new();
        m.inc_http_requests();
        m.inc_http_requests();
        m.inc_chat_streams();
        m.record_usage(120, 300, 150, 0.004);
        let out = m.render_prometheus();
        assert!(out.contains("baton_http_requests_total 2"));
        assert!(out.contains("baton_chat_streams_total 1"));
        assert!(out.contains("baton_llm_input_tokens_total 300"));
        assert!(out.contains("baton_llm_output_tokens_total 150"));
        assert!(out.contains("baton_cost_usd_total 0.004"));
    }

    #[test]
    fn test_prometheus_format() {
        let out = Metrics::new().render_prometheus();
        assert!(out.contains("# HELP baton_uptime_seconds"));
        assert!(out.contains("# TYPE baton_http_requests_total counter"));
    }
}
