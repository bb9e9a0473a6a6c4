//! Authorization for multi-cluster apps: who holds which roles where, whether
//! a principal may declare a role set on a set of targets, and who may read
//! or modify an app.

pub mod errors;
pub mod membership;
pub mod metrics_defs;
pub mod principal;
pub mod role_index;
pub mod role_templates;
pub mod validator;

pub use errors::{AuthzError, ForbiddenReason};
pub use principal::{Actor, PrincipalDirectory, PrincipalId, User};
pub use role_index::PrincipalRoleIndex;
pub use role_templates::{RoleContext, RoleTemplate, RoleTemplates};
pub use validator::RoleRequirementValidator;
