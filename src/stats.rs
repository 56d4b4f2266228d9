use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tracing::trace;

use crate::config::Server;

#[cfg(feature = "metrics")]
lazy_static::lazy_static! {
    static ref IO_BYTES_INBOUND: prometheus::IntCounterVec = prometheus::register_int_counter_vec!(
        "relay_inbound_bytes",
        "Number of bytes received from tunnel servers.",
        &["server"]
    )
    .unwrap();
    static ref IO_BYTES_OUTBOUND: prometheus::IntCounterVec = prometheus::register_int_counter_vec!(
        "relay_outbound_bytes",
        "Number of bytes sent to tunnel servers.",
        &["server"]
    )
    .unwrap();
    static ref CONNECT_LATENCY: prometheus::HistogramVec = prometheus::register_histogram_vec!(
        "relay_connect_latency_seconds",
        "Time from proxy connected to tunnel server connected.",
        &["server"]
    )
    .unwrap();
}

/// Receives byte counts and connect latencies from every handler.
pub trait TrafficSink: Send + Sync {
    fn update_inbound(&self, server: &Server, n: u64);
    fn update_outbound(&self, server: &Server, n: u64);
    fn update_latency(&self, server: &Server, latency: Duration);
}

#[derive(Debug, Default)]
pub struct TrafficCounters {
    inbound: AtomicU64,
    outbound: AtomicU64,
    connects: AtomicU64,
}

impl TrafficCounters {
    pub fn inbound(&self) -> u64 {
        self.inbound.load(Ordering::Relaxed)
    }

    pub fn outbound(&self) -> u64 {
        self.outbound.load(Ordering::Relaxed)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

impl TrafficSink for TrafficCounters {
    fn update_inbound(&self, _server: &Server, n: u64) {
        self.inbound.fetch_add(n, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        IO_BYTES_INBOUND
            .with_label_values(&[_server.friendly_name().as_str()])
            .inc_by(n);
    }

    fn update_outbound(&self, _server: &Server, n: u64) {
        self.outbound.fetch_add(n, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        IO_BYTES_OUTBOUND
            .with_label_values(&[_server.friendly_name().as_str()])
            .inc_by(n);
    }

    fn update_latency(&self, server: &Server, latency: Duration) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        trace!("{} connected in {:?}", server.friendly_name(), latency);
        #[cfg(feature = "metrics")]
        CONNECT_LATENCY
            .with_label_values(&[server.friendly_name().as_str()])
            .observe(latency.as_secs_f64());
    }
}
