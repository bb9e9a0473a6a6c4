//! Fan-out of multi-cluster apps into per-target apps and role bindings.

pub mod catalog;
pub mod config;
pub mod controller;
pub mod errors;
pub mod metrics_defs;
pub mod reconciler;
pub mod work_queue;

pub use catalog::{CatalogResolver, StaticCatalog};
pub use config::ControllerConfig;
pub use controller::Controller;
pub use errors::{ControllerError, FanoutError};
pub use reconciler::{TargetKey, TargetReconciler};
