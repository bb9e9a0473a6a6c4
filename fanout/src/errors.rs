use crate::catalog::CatalogError;
use authz::principal::DirectoryError;
use store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum FanoutError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("principal directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("role template {0} not found")]
    UnknownRole(String),

    #[error("app {app} already exists and belongs to {owner}")]
    AppNameTaken { app: String, owner: String },

    #[error("role binding {role} for user {user} in {scope} is not visible yet")]
    BindingNotVisible {
        role: String,
        user: String,
        scope: String,
    },

    #[error("gave up updating status of {0} after repeated conflicts")]
    StatusConflict(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("controller is not running")]
    Stopped,

    #[error(transparent)]
    Fanout(#[from] FanoutError),
}
