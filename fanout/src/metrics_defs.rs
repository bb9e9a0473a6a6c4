//! Metrics definitions for the fan-out controller.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RECONCILE_OUTCOMES: MetricDef = MetricDef {
    name: "fanout.reconcile.outcomes",
    metric_type: MetricType::Counter,
    description: "Per-target reconcile results. Tagged with outcome (ok, error).",
};

pub const RECONCILE_DURATION: MetricDef = MetricDef {
    name: "fanout.reconcile.duration",
    metric_type: MetricType::Histogram,
    description: "Time to reconcile one (multiclusterapp, target) pair in seconds",
};

pub const QUEUE_DEPTH: MetricDef = MetricDef {
    name: "fanout.queue.depth",
    metric_type: MetricType::Gauge,
    description: "Number of keys waiting in the work queue",
};

pub const BINDINGS_CREATED: MetricDef = MetricDef {
    name: "fanout.bindings.created",
    metric_type: MetricType::Counter,
    description: "Role bindings materialized for multiclusterapp roles",
};

pub const RESYNCS: MetricDef = MetricDef {
    name: "fanout.resyncs",
    metric_type: MetricType::Counter,
    description: "Completed full resyncs of all multiclusterapps",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RECONCILE_OUTCOMES,
    RECONCILE_DURATION,
    QUEUE_DEPTH,
    BINDINGS_CREATED,
    RESYNCS,
];
