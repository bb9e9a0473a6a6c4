//! Request and response bodies of the v3 API.

use serde::{Deserialize, Serialize};
use store::types::{
    Member, MultiClusterApp, ProjectId, RoleName, Target, TargetPhase, TargetStatus, UserId,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateMultiClusterApp {
    pub name: String,
    pub template_version_id: String,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub roles: Vec<RoleName>,
    #[serde(default)]
    pub members: Vec<Member>,
}

/// Fields left out keep their stored value.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMultiClusterApp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<Target>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<RoleName>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<Member>>,
    /// Accepted only when equal to the stored value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_version_id: Option<String>,
    /// When set, the update fails if the app changed since this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<u64>,
}

/// A multiclusterapp as returned by the API. `roles` is the set confirmed in
/// every target; `requestedRoles` is the declared set.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterAppView {
    pub id: String,
    pub name: String,
    pub template_version_id: String,
    pub targets: Vec<Target>,
    pub roles: Vec<RoleName>,
    pub requested_roles: Vec<RoleName>,
    pub members: Vec<Member>,
    pub creator_id: UserId,
    pub updated_by: UserId,
    pub resource_version: u64,
    pub generation: u64,
    pub target_status: Vec<TargetStatus>,
}

impl From<MultiClusterApp> for MultiClusterAppView {
    fn from(mcapp: MultiClusterApp) -> Self {
        MultiClusterAppView {
            id: mcapp.id(),
            name: mcapp.metadata.name,
            template_version_id: mcapp.spec.template_version_id,
            targets: mcapp.spec.targets,
            roles: mcapp.status.roles,
            requested_roles: mcapp.spec.roles,
            members: mcapp.spec.members,
            creator_id: mcapp.metadata.creator_id,
            updated_by: mcapp.metadata.updated_by,
            resource_version: mcapp.metadata.resource_version,
            generation: mcapp.metadata.generation,
            target_status: mcapp.status.targets,
        }
    }
}

impl MultiClusterAppView {
    /// True when every declared target is reconciled at the current generation.
    pub fn is_reconciled(&self) -> bool {
        self.targets.iter().all(|target| {
            self.target_status.iter().any(|status| {
                status.project_id == target.project_id
                    && status.phase == TargetPhase::Reconciled
                    && status.observed_generation == self.generation
            })
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Collection<T> {
    pub data: Vec<T>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_cluster_app_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterRoleBinding {
    pub cluster_id: String,
    pub role_template_id: RoleName,
    pub user_id: UserId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRoleBinding {
    pub project_id: ProjectId,
    pub role_template_id: RoleName,
    pub user_id: UserId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::types::MultiClusterAppSpec;

    #[test]
    fn test_reconciled_tracks_generation() {
        let project = ProjectId::new("local", "p-1");
        let mut mcapp = MultiClusterApp::new(
            "wordpress",
            MultiClusterAppSpec {
                template_version_id: "cattle-global-data:library-wordpress-2.1.10".into(),
                targets: vec![Target {
                    project_id: project.clone(),
                }],
                roles: vec![],
                members: vec![],
            },
            "admin",
        );
        mcapp.metadata.generation = 2;
        assert!(!MultiClusterAppView::from(mcapp.clone()).is_reconciled());

        mcapp.status.targets.push(TargetStatus {
            project_id: project,
            app_name: "wordpress-p-1".into(),
            phase: TargetPhase::Reconciled,
            observed_generation: 1,
            last_error: None,
        });
        assert!(!MultiClusterAppView::from(mcapp.clone()).is_reconciled());

        mcapp.status.targets[0].observed_generation = 2;
        assert!(MultiClusterAppView::from(mcapp).is_reconciled());
    }
}
