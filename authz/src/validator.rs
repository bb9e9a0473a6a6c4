//! Role sufficiency checks run on the request path before an MCApp is
//! persisted. Only reads the role index, so a rejected request can simply be
//! retried once the missing bindings exist.

use crate::errors::{AuthzError, ForbiddenReason};
use crate::metrics_defs::VALIDATION_DECISIONS;
use crate::principal::Actor;
use crate::role_index::PrincipalRoleIndex;
use crate::role_templates::{RoleContext, RoleTemplates};
use shared::counter;
use std::collections::{BTreeSet, HashMap};
use store::types::{BindingScope, RoleName, Target};

#[derive(Clone)]
pub struct RoleRequirementValidator {
    index: PrincipalRoleIndex,
    templates: RoleTemplates,
}

impl RoleRequirementValidator {
    pub fn new(index: PrincipalRoleIndex, templates: RoleTemplates) -> Self {
        RoleRequirementValidator { index, templates }
    }

    pub fn templates(&self) -> &RoleTemplates {
        &self.templates
    }

    /// Checks that `actor` may declare `roles` on an MCApp targeting `targets`.
    ///
    /// Global administrators skip the sufficiency checks entirely. Everyone
    /// else needs some role in every target project, plus every requested
    /// role in the matching cluster or project scope.
    pub async fn validate(
        &self,
        actor: &Actor,
        targets: &[Target],
        roles: &[RoleName],
    ) -> Result<(), AuthzError> {
        let requested = self
            .templates
            .resolve_all(roles)
            .map_err(|name| AuthzError::Invalid(format!("role template {name} not found")))?;

        if actor.is_global_admin() {
            tracing::debug!(user = actor.id(), "global admin, skipping role validation");
            counter!(VALIDATION_DECISIONS, "outcome" => "admin").increment(1);
            return Ok(());
        }

        let (cluster_roles, project_roles): (Vec<_>, Vec<_>) = requested
            .into_iter()
            .partition(|t| t.context == RoleContext::Cluster);

        let mut held_by_cluster: HashMap<String, BTreeSet<RoleName>> = HashMap::new();

        for target in targets {
            let project = &target.project_id;
            let held_in_project = self
                .index
                .roles_of(actor.id(), &BindingScope::Project(project.clone()))
                .await?;

            if held_in_project.is_empty() {
                return Err(self.forbid(ForbiddenReason::NoRolesInProject {
                    user: actor.id().to_string(),
                    project: project.clone(),
                }));
            }

            let cluster = project.cluster();
            if !cluster_roles.is_empty() && !held_by_cluster.contains_key(cluster) {
                let held = self
                    .index
                    .roles_of(actor.id(), &BindingScope::Cluster(cluster.to_string()))
                    .await?;
                held_by_cluster.insert(cluster.to_string(), held);
            }

            let missing_cluster: Vec<RoleName> = cluster_roles
                .iter()
                .filter(|t| {
                    !held_by_cluster
                        .get(cluster)
                        .is_some_and(|held| held.contains(&t.name))
                })
                .map(|t| t.name.clone())
                .collect();
            if !missing_cluster.is_empty() {
                return Err(self.forbid(ForbiddenReason::MissingClusterRoles {
                    user: actor.id().to_string(),
                    cluster: cluster.to_string(),
                    roles: missing_cluster,
                }));
            }

            let missing_project: Vec<RoleName> = project_roles
                .iter()
                .filter(|t| !held_in_project.contains(&t.name))
                .map(|t| t.name.clone())
                .collect();
            if !missing_project.is_empty() {
                return Err(self.forbid(ForbiddenReason::MissingProjectRoles {
                    user: actor.id().to_string(),
                    project: project.clone(),
                    roles: missing_project,
                }));
            }
        }

        counter!(VALIDATION_DECISIONS, "outcome" => "allowed").increment(1);
        Ok(())
    }

    fn forbid(&self, reason: ForbiddenReason) -> AuthzError {
        tracing::info!(%reason, "role validation rejected request");
        counter!(VALIDATION_DECISIONS, "outcome" => "forbidden").increment(1);
        AuthzError::Forbidden(reason)
    }
}
