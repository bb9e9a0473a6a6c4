//! Access to the MCApp resource itself, derived from its member list.
//! Independent of cluster RBAC on the targets.

use crate::errors::{AuthzError, ForbiddenReason};
use crate::principal::{Actor, PrincipalId};
use store::types::{AccessType, MultiClusterApp};

fn access_of(actor: &Actor, mcapp: &MultiClusterApp) -> Option<AccessType> {
    if actor.is_global_admin() || mcapp.metadata.creator_id == actor.id() {
        return Some(AccessType::Owner);
    }

    mcapp
        .spec
        .members
        .iter()
        .filter(|m| {
            m.user_principal_id
                .parse::<PrincipalId>()
                .is_ok_and(|p| actor.user.has_principal(&p))
        })
        .map(|m| m.access_type)
        // An owner entry wins over a read-only one for the same user.
        .max_by_key(|a| matches!(a, AccessType::Owner))
}

pub fn can_read(actor: &Actor, mcapp: &MultiClusterApp) -> bool {
    access_of(actor, mcapp).is_some()
}

pub fn can_write(actor: &Actor, mcapp: &MultiClusterApp) -> bool {
    access_of(actor, mcapp) == Some(AccessType::Owner)
}

pub fn authorize_read(actor: &Actor, mcapp: &MultiClusterApp) -> Result<(), AuthzError> {
    if can_read(actor, mcapp) {
        return Ok(());
    }
    Err(hidden(actor, &mcapp.id()))
}

/// Principals who cannot read get the same answer as for a missing app.
pub fn authorize_write(actor: &Actor, mcapp: &MultiClusterApp) -> Result<(), AuthzError> {
    match access_of(actor, mcapp) {
        Some(AccessType::Owner) => Ok(()),
        Some(AccessType::ReadOnly) => Err(AuthzError::Forbidden(ForbiddenReason::NoUpdateAccess {
            user: actor.id().to_string(),
            mcapp: mcapp.id(),
        })),
        None => Err(hidden(actor, &mcapp.id())),
    }
}

/// The error returned for an app the actor may not see, whether or not it
/// exists.
pub fn hidden(actor: &Actor, mcapp_id: &str) -> AuthzError {
    AuthzError::Forbidden(ForbiddenReason::NoAccess {
        user: actor.id().to_string(),
        mcapp: mcapp_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::User;
    use store::types::{Member, MultiClusterAppSpec, ProjectId, Target};

    fn mcapp(members: Vec<Member>) -> MultiClusterApp {
        MultiClusterApp::new(
            "wp",
            MultiClusterAppSpec {
                template_version_id: "tv".into(),
                targets: vec![Target {
                    project_id: ProjectId::new("local", "p-1"),
                }],
                roles: vec![],
                members,
            },
            "creator",
        )
    }

    fn member(principal: &str, access_type: AccessType) -> Member {
        Member {
            user_principal_id: principal.into(),
            access_type,
        }
    }

    #[test]
    fn test_access_levels() {
        let app = mcapp(vec![
            member("local://reader", AccessType::ReadOnly),
            member("local://owner", AccessType::Owner),
        ]);

        let admin = Actor::new(User::admin("admin"));
        let creator = Actor::new(User::new("creator"));
        let reader = Actor::new(User::new("reader"));
        let owner = Actor::new(User::new("owner"));
        let stranger = Actor::new(User::new("stranger"));

        for actor in [&admin, &creator, &owner] {
            assert!(can_read(actor, &app));
            assert!(can_write(actor, &app));
        }

        assert!(can_read(&reader, &app));
        assert!(!can_write(&reader, &app));

        assert!(!can_read(&stranger, &app));
        assert!(!can_write(&stranger, &app));
    }

    #[test]
    fn test_write_errors_distinguish_visibility() {
        let app = mcapp(vec![member("local://reader", AccessType::ReadOnly)]);

        let reader = Actor::new(User::new("reader"));
        let err = authorize_write(&reader, &app).unwrap_err();
        assert!(err.to_string().contains("does not have access to update"));

        let stranger = Actor::new(User::new("stranger"));
        let err = authorize_write(&stranger, &app).unwrap_err();
        assert_eq!(
            err.to_string(),
            "user stranger does not have access to multiclusterapp cattle-global-data:wp"
        );
        assert!(authorize_read(&stranger, &app).is_err());
    }

    #[test]
    fn test_external_principal_membership() {
        let app = mcapp(vec![member("github://octocat", AccessType::Owner)]);

        let mut user = User::new("u-1");
        user.principal_ids = vec!["github://octocat".into()];
        assert!(can_write(&Actor::new(user), &app));
    }

    #[test]
    fn test_owner_entry_wins() {
        let app = mcapp(vec![
            member("local://u-1", AccessType::ReadOnly),
            member("local://u-1", AccessType::Owner),
        ]);
        assert!(can_write(&Actor::new(User::new("u-1")), &app));
    }
}
