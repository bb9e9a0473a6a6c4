//! Metrics definitions for authorization.

use shared::metrics_defs::{MetricDef, MetricType};

pub const VALIDATION_DECISIONS: MetricDef = MetricDef {
    name: "authz.validation.decisions",
    metric_type: MetricType::Counter,
    description: "Role validation outcomes. Tagged with outcome (allowed, forbidden, admin).",
};

pub const ALL_METRICS: &[MetricDef] = &[VALIDATION_DECISIONS];
