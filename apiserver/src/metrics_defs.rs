//! Metrics definitions for the API server.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "apiserver.requests",
    metric_type: MetricType::Counter,
    description: "API requests handled. Tagged with operation and status code.",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "apiserver.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent handling an API request in seconds. Tagged with operation.",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUESTS, REQUEST_DURATION];
