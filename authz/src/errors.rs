use crate::principal::DirectoryError;
use std::fmt;
use store::StoreError;
use store::types::{ProjectId, RoleName, UserId};

/// Canonical reasons for a 403. Callers match on the rendered text, so the
/// templates below must stay stable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForbiddenReason {
    NoRolesInProject {
        user: UserId,
        project: ProjectId,
    },
    MissingClusterRoles {
        user: UserId,
        cluster: String,
        roles: Vec<RoleName>,
    },
    MissingProjectRoles {
        user: UserId,
        project: ProjectId,
        roles: Vec<RoleName>,
    },
    NoAccess {
        user: UserId,
        mcapp: String,
    },
    NoUpdateAccess {
        user: UserId,
        mcapp: String,
    },
    CannotManageBindings {
        user: UserId,
    },
}

impl fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForbiddenReason::NoRolesInProject { user, project } => {
                write!(f, "user {user} has no roles in target project {project}")
            }
            ForbiddenReason::MissingClusterRoles {
                user,
                cluster,
                roles,
            } => write!(
                f,
                "user {user} does not have following roles in cluster {cluster}: {}",
                roles.join(", ")
            ),
            ForbiddenReason::MissingProjectRoles {
                user,
                project,
                roles,
            } => write!(
                f,
                "user {user} does not have following roles in project {project}: {}",
                roles.join(", ")
            ),
            ForbiddenReason::NoAccess { user, mcapp } => {
                write!(f, "user {user} does not have access to multiclusterapp {mcapp}")
            }
            ForbiddenReason::NoUpdateAccess { user, mcapp } => write!(
                f,
                "user {user} does not have access to update multiclusterapp {mcapp}"
            ),
            ForbiddenReason::CannotManageBindings { user } => {
                write!(f, "user {user} is not allowed to manage role bindings")
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AuthzError {
    #[error("{0}")]
    Forbidden(ForbiddenReason),

    #[error("{0}")]
    Invalid(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("principal directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl From<ForbiddenReason> for AuthzError {
    fn from(reason: ForbiddenReason) -> Self {
        AuthzError::Forbidden(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_templates() {
        let project = ProjectId::new("local", "p-1");
        assert_eq!(
            ForbiddenReason::NoRolesInProject {
                user: "u-1".into(),
                project: project.clone(),
            }
            .to_string(),
            "user u-1 has no roles in target project local:p-1"
        );
        assert_eq!(
            ForbiddenReason::MissingClusterRoles {
                user: "u-1".into(),
                cluster: "local".into(),
                roles: vec!["cluster-owner".into(), "cluster-member".into()],
            }
            .to_string(),
            "user u-1 does not have following roles in cluster local: cluster-owner, cluster-member"
        );
        assert_eq!(
            ForbiddenReason::MissingProjectRoles {
                user: "u-1".into(),
                project,
                roles: vec!["project-member".into()],
            }
            .to_string(),
            "user u-1 does not have following roles in project local:p-1: project-member"
        );
    }
}
