//! Resource model and object store for multi-cluster apps, their per-target
//! apps and role bindings.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod memory;
pub mod types;

use types::{App, AppFilter, BindingFilter, MultiClusterApp, RoleBinding};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("{kind} {id} was modified: expected resource version {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} {id} is invalid: {reason}")]
    Invalid {
        kind: &'static str,
        id: String,
        reason: &'static str,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A resource as seen on the watch stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    MultiClusterApp(MultiClusterApp),
    App(App),
    RoleBinding(RoleBinding),
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    Added(Object),
    Modified { old: Object, new: Object },
    Deleted(Object),
}

/// CRUD + watch over the three resource kinds.
///
/// Updates carry the resource version they were read at and fail with
/// `StoreError::Conflict` if the stored object changed in between.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_mcapp(&self, id: &str) -> StoreResult<MultiClusterApp>;
    async fn list_mcapps(&self) -> StoreResult<Vec<MultiClusterApp>>;
    async fn create_mcapp(&self, mcapp: MultiClusterApp) -> StoreResult<MultiClusterApp>;
    async fn update_mcapp(&self, mcapp: MultiClusterApp) -> StoreResult<MultiClusterApp>;
    async fn delete_mcapp(&self, id: &str) -> StoreResult<MultiClusterApp>;

    async fn get_app(&self, name: &str) -> StoreResult<App>;
    async fn list_apps(&self, filter: &AppFilter) -> StoreResult<Vec<App>>;
    async fn create_app(&self, app: App) -> StoreResult<App>;
    async fn update_app(&self, app: App) -> StoreResult<App>;
    async fn delete_app(&self, name: &str) -> StoreResult<App>;

    async fn get_binding(&self, id: &str) -> StoreResult<RoleBinding>;
    async fn list_bindings(&self, filter: &BindingFilter) -> StoreResult<Vec<RoleBinding>>;
    /// Fails with `AlreadyExists` (carrying the existing id) when an
    /// equivalent binding is already stored.
    async fn create_binding(&self, binding: RoleBinding) -> StoreResult<RoleBinding>;
    async fn update_binding(&self, binding: RoleBinding) -> StoreResult<RoleBinding>;
    async fn delete_binding(&self, id: &str) -> StoreResult<RoleBinding>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

pub type SharedStore = Arc<dyn ObjectStore>;
