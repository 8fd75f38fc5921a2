//! ## streamtap-telemetry::metrics
//! **Prometheus counters for capture and decoding**

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub frames_captured: IntCounter,
    pub messages_decoded: IntCounterVec,
    pub frames_dropped: IntCounter,
    pub socket_rebinds: IntCounter,
    pub tracked_connections: IntGauge,
    pub capture_pool: IntGaugeVec,
}

impl MetricsRecorder {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let frames_captured =
            IntCounter::new("streamtap_frames_captured_total", "Raw frames delivered by capture")?;
        let messages_decoded = IntCounterVec::new(
            Opts::new("streamtap_messages_decoded_total", "Messages decoded"),
            &["direction"],
        )?;
        let frames_dropped = IntCounter::new(
            "streamtap_frames_dropped_total",
            "Protocol frames dropped as corrupt or undecodable",
        )?;
        let socket_rebinds =
            IntCounter::new("streamtap_socket_rebinds_total", "Capture socket rebinds")?;
        let tracked_connections = IntGauge::new(
            "streamtap_tracked_connections",
            "Connections tracked in the last refresh",
        )?;

        registry.register(Box::new(frames_captured.clone()))?;
        registry.register(Box::new(messages_decoded.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(socket_rebinds.clone()))?;
        let capture_pool = IntGaugeVec::new(
            Opts::new("streamtap_capture_pool", "Capture buffer pool counters"),
            &["stat"],
        )?;

        registry.register(Box::new(tracked_connections.clone()))?;
        registry.register(Box::new(capture_pool.clone()))?;

        Ok(Self {
            registry,
            frames_captured,
            messages_decoded,
            frames_dropped,
            socket_rebinds,
            tracked_connections,
            capture_pool,
        })
    }

    pub fn inc_message(&self, direction: &str) {
        self.messages_decoded.with_label_values(&[direction]).inc();
    }

    /// Publishes the current capture pool counters.
    pub fn record_pool(&self, acquisitions: usize, releases: usize, grown: usize, waits: usize) {
        let outstanding = acquisitions.saturating_sub(releases);
        for (stat, value) in [
            ("acquisitions", acquisitions),
            ("releases", releases),
            ("grown", grown),
            ("waits", waits),
            ("outstanding", outstanding),
        ] {
            self.capture_pool
                .with_label_values(&[stat])
                .set(i64::try_from(value).unwrap_or(i64::MAX));
        }
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::<u8>::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_export_contains_counters() {
        let metrics = MetricsRecorder::new().unwrap();
        metrics.frames_captured.inc_by(3);
        metrics.inc_message("sent");
        metrics.inc_message("received");
        metrics.inc_message("received");

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("streamtap_frames_captured_total 3"));
        assert!(text.contains("streamtap_messages_decoded_total{direction=\"received\"} 2"));
    }

    #[test]
    fn pool_counters_are_exported() {
        let metrics = MetricsRecorder::new().unwrap();
        metrics.record_pool(7, 5, 1, 2);
        metrics.record_pool(9, 9, 1, 2);

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("streamtap_capture_pool{stat=\"acquisitions\"} 9"));
        assert!(text.contains("streamtap_capture_pool{stat=\"outstanding\"} 0"));
        assert!(text.contains("streamtap_capture_pool{stat=\"waits\"} 2"));
    }
}
