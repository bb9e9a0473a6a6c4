//! Drives one (multiclusterapp, target) pair towards its declared state.
//!
//! Per target: `Pending -> AppCreated -> RolesBound -> Reconciled`. A target
//! that is no longer declared, or whose multiclusterapp is gone, goes through
//! `Removing -> Deleted` and its status entry is dropped.
//!
//! Every step is idempotent, so a key can be reconciled any number of times.
//! Status records the furthest phase reached and the error that stopped it.

use crate::catalog::CatalogResolver;
use crate::errors::FanoutError;
use crate::metrics_defs::BINDINGS_CREATED;
use authz::principal::{PrincipalId, SharedDirectory};
use authz::{PrincipalRoleIndex, RoleTemplates};
use shared::counter;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use store::types::{
    AccessType, App, BindingFilter, BindingScope, MultiClusterApp, ProjectId, RoleBinding,
    RoleName, TargetPhase, TargetStatus, UserId, app_name,
};
use store::{SharedStore, StoreError};

const MAX_STATUS_ATTEMPTS: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub mcapp_id: String,
    pub project_id: ProjectId,
}

impl TargetKey {
    pub fn new(mcapp_id: &str, project_id: &ProjectId) -> Self {
        TargetKey {
            mcapp_id: mcapp_id.to_string(),
            project_id: project_id.clone(),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mcapp_id, self.project_id)
    }
}

/// A binding the controller wants to exist for one target.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DesiredBinding {
    role: RoleName,
    user: UserId,
}

pub struct TargetReconciler {
    store: SharedStore,
    catalog: Arc<dyn CatalogResolver>,
    directory: SharedDirectory,
    templates: RoleTemplates,
    index: PrincipalRoleIndex,
}

impl TargetReconciler {
    pub fn new(
        store: SharedStore,
        catalog: Arc<dyn CatalogResolver>,
        directory: SharedDirectory,
        templates: RoleTemplates,
    ) -> Self {
        let index = PrincipalRoleIndex::new(store.clone());
        TargetReconciler {
            store,
            catalog,
            directory,
            templates,
            index,
        }
    }

    pub async fn reconcile(&self, key: &TargetKey) -> Result<TargetPhase, FanoutError> {
        let mcapp = match self.store.get_mcapp(&key.mcapp_id).await {
            Ok(mcapp) => Some(mcapp),
            Err(StoreError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        match mcapp {
            Some(mcapp) if mcapp.has_target(&key.project_id) => {
                self.reconcile_target(&mcapp, &key.project_id).await
            }
            mcapp => self.remove_target(mcapp.as_ref(), key).await,
        }
    }

    async fn reconcile_target(
        &self,
        mcapp: &MultiClusterApp,
        project: &ProjectId,
    ) -> Result<TargetPhase, FanoutError> {
        let id = mcapp.id();
        let generation = mcapp.metadata.generation;
        let app = app_name(&mcapp.metadata.name, project);
        let mut reached = TargetPhase::Pending;

        let result = async {
            self.ensure_app(mcapp, project, &app).await?;
            reached = TargetPhase::AppCreated;

            let desired = self.desired_bindings(mcapp).await?;
            self.ensure_bindings(&id, project, &desired).await?;
            self.prune_bindings(&id, project, &desired).await?;
            reached = TargetPhase::RolesBound;

            self.verify_bindings(project, &desired).await?;
            reached = TargetPhase::Reconciled;
            Ok::<(), FanoutError>(())
        }
        .await;

        let last_error = result.as_ref().err().map(|e| e.to_string());
        let status = TargetStatus {
            project_id: project.clone(),
            app_name: app,
            phase: reached,
            observed_generation: generation,
            last_error,
        };
        self.update_status(&id, |mcapp| set_target_status(mcapp, status.clone()))
            .await?;

        result.map(|_| reached)
    }

    async fn ensure_app(
        &self,
        mcapp: &MultiClusterApp,
        project: &ProjectId,
        name: &str,
    ) -> Result<(), FanoutError> {
        let id = mcapp.id();
        let template_version_id = &mcapp.spec.template_version_id;
        let manifest = self.catalog.resolve(template_version_id).await?;

        match self.store.get_app(name).await {
            Ok(existing) if existing.multi_cluster_app_id != id => Err(FanoutError::AppNameTaken {
                app: name.to_string(),
                owner: existing.multi_cluster_app_id,
            }),
            Ok(existing)
                if existing.template_version_id == *template_version_id
                    && existing.manifest == manifest =>
            {
                Ok(())
            }
            Ok(existing) => {
                self.store
                    .update_app(App {
                        template_version_id: template_version_id.clone(),
                        manifest,
                        ..existing
                    })
                    .await?;
                tracing::info!(mcapp = %id, app = name, "updated app");
                Ok(())
            }
            Err(StoreError::NotFound { .. }) => {
                let app = App {
                    name: name.to_string(),
                    project_id: project.clone(),
                    multi_cluster_app_id: id.clone(),
                    template_version_id: template_version_id.clone(),
                    manifest,
                    resource_version: 0,
                };
                match self.store.create_app(app).await {
                    Ok(_) => {
                        tracing::info!(mcapp = %id, app = name, project = %project, "created app");
                        Ok(())
                    }
                    // Raced with another pass; the next pass checks ownership.
                    Err(StoreError::AlreadyExists { .. }) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every declared role for the creator, the last updater and every owner
    /// member. Read-only members are never bound.
    async fn desired_bindings(
        &self,
        mcapp: &MultiClusterApp,
    ) -> Result<BTreeSet<DesiredBinding>, FanoutError> {
        let mut subjects = BTreeSet::from([
            mcapp.metadata.creator_id.clone(),
            mcapp.metadata.updated_by.clone(),
        ]);
        subjects.retain(|s| !s.is_empty());

        for member in &mcapp.spec.members {
            if member.access_type != AccessType::Owner {
                continue;
            }
            let principal: PrincipalId = match member.user_principal_id.parse() {
                Ok(principal) => principal,
                Err(e) => {
                    tracing::warn!(mcapp = %mcapp.id(), error = %e, "skipping member");
                    continue;
                }
            };
            match self.directory.resolve(&principal).await? {
                Some(user) => {
                    subjects.insert(user.id);
                }
                None => tracing::warn!(
                    mcapp = %mcapp.id(),
                    principal = %principal,
                    "owner member not found in directory, skipping"
                ),
            }
        }

        let mut desired = BTreeSet::new();
        for role in &mcapp.spec.roles {
            if self.templates.get(role).is_none() {
                return Err(FanoutError::UnknownRole(role.clone()));
            }
            for user in &subjects {
                desired.insert(DesiredBinding {
                    role: role.clone(),
                    user: user.clone(),
                });
            }
        }
        Ok(desired)
    }

    fn scope_of(&self, role: &str, project: &ProjectId) -> Result<BindingScope, FanoutError> {
        self.templates
            .get(role)
            .map(|t| t.scope_for(project))
            .ok_or_else(|| FanoutError::UnknownRole(role.to_string()))
    }

    async fn ensure_bindings(
        &self,
        mcapp_id: &str,
        project: &ProjectId,
        desired: &BTreeSet<DesiredBinding>,
    ) -> Result<(), FanoutError> {
        for binding in desired {
            let scope = self.scope_of(&binding.role, project)?;
            let mut role_binding = RoleBinding::new(scope.clone(), &binding.role, &binding.user);
            role_binding.user_principal_id = Some(PrincipalId::local(&binding.user).to_string());
            role_binding.owner = Some(mcapp_id.to_string());

            match self.store.create_binding(role_binding).await {
                Ok(created) => {
                    counter!(BINDINGS_CREATED).increment(1);
                    tracing::info!(
                        mcapp = mcapp_id,
                        binding = %created.id,
                        role = %binding.role,
                        user = %binding.user,
                        %scope,
                        "created role binding"
                    );
                }
                // An equivalent binding already grants the role.
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Deletes bindings this app created in the target's scopes that are no
    /// longer desired. The desired set is the same for every target, so a
    /// cluster binding dropped here is not needed by any sibling target.
    async fn prune_bindings(
        &self,
        mcapp_id: &str,
        project: &ProjectId,
        desired: &BTreeSet<DesiredBinding>,
    ) -> Result<(), FanoutError> {
        let owned = self
            .store
            .list_bindings(&BindingFilter {
                owner: Some(mcapp_id.to_string()),
                ..Default::default()
            })
            .await?;

        for binding in owned {
            let in_scope = match &binding.scope {
                BindingScope::Project(p) => p == project,
                BindingScope::Cluster(c) => c == project.cluster(),
            };
            if !in_scope {
                continue;
            }
            let still_desired = desired.iter().any(|d| {
                d.role == binding.role_template_id
                    && d.user == binding.user_id
                    && self.scope_of(&d.role, project).ok().as_ref() == Some(&binding.scope)
            });
            if !still_desired {
                self.delete_binding(mcapp_id, &binding).await?;
            }
        }
        Ok(())
    }

    async fn verify_bindings(
        &self,
        project: &ProjectId,
        desired: &BTreeSet<DesiredBinding>,
    ) -> Result<(), FanoutError> {
        for binding in desired {
            let scope = self.scope_of(&binding.role, project)?;
            if !self.index.has_role(&binding.user, &scope, &binding.role).await? {
                return Err(FanoutError::BindingNotVisible {
                    role: binding.role.clone(),
                    user: binding.user.clone(),
                    scope: scope.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn remove_target(
        &self,
        mcapp: Option<&MultiClusterApp>,
        key: &TargetKey,
    ) -> Result<TargetPhase, FanoutError> {
        let project = &key.project_id;
        if mcapp.is_some() {
            self.update_status(&key.mcapp_id, |m| {
                let status = m.status.targets.iter_mut().find(|t| &t.project_id == project);
                if let Some(status) = status {
                    status.phase = TargetPhase::Removing;
                    status.last_error = None;
                }
            })
            .await?;
        }

        let apps = self
            .store
            .list_apps(&store::types::AppFilter {
                project_id: Some(project.clone()),
                multi_cluster_app_id: Some(key.mcapp_id.clone()),
                ..Default::default()
            })
            .await?;
        for app in apps {
            match self.store.delete_app(&app.name).await {
                Ok(_) => tracing::info!(mcapp = %key.mcapp_id, app = %app.name, "deleted app"),
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let cluster_still_targeted = mcapp.is_some_and(|m| {
            m.spec
                .targets
                .iter()
                .any(|t| t.project_id.cluster() == project.cluster())
        });
        let owned = self
            .store
            .list_bindings(&BindingFilter {
                owner: Some(key.mcapp_id.clone()),
                ..Default::default()
            })
            .await?;
        for binding in owned {
            let remove = match &binding.scope {
                BindingScope::Project(p) => p == project,
                BindingScope::Cluster(c) => c == project.cluster() && !cluster_still_targeted,
            };
            if remove {
                self.delete_binding(&key.mcapp_id, &binding).await?;
            }
        }

        if mcapp.is_some() {
            self.update_status(&key.mcapp_id, |m| {
                m.status.targets.retain(|t| &t.project_id != project);
            })
            .await?;
        }
        tracing::info!(key = %key, "target removed");
        Ok(TargetPhase::Deleted)
    }

    async fn delete_binding(
        &self,
        mcapp_id: &str,
        binding: &RoleBinding,
    ) -> Result<(), FanoutError> {
        match self.store.delete_binding(&binding.id).await {
            Ok(_) => {
                tracing::info!(
                    mcapp = mcapp_id,
                    binding = %binding.id,
                    role = %binding.role_template_id,
                    "deleted role binding"
                );
                Ok(())
            }
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies `change` to the stored status, retrying on write conflicts.
    /// Skips the write when nothing changed; a missing app is not an error.
    async fn update_status<F>(&self, mcapp_id: &str, change: F) -> Result<(), FanoutError>
    where
        F: Fn(&mut MultiClusterApp),
    {
        for _ in 0..MAX_STATUS_ATTEMPTS {
            let mut mcapp = match self.store.get_mcapp(mcapp_id).await {
                Ok(mcapp) => mcapp,
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let before = mcapp.status.clone();
            change(&mut mcapp);
            refresh_reported_roles(&mut mcapp);
            if mcapp.status == before {
                return Ok(());
            }

            match self.store.update_mcapp(mcapp).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(FanoutError::StatusConflict(mcapp_id.to_string()))
    }
}

fn set_target_status(mcapp: &mut MultiClusterApp, status: TargetStatus) {
    // Only record results for targets that are still declared.
    if !mcapp.has_target(&status.project_id) {
        return;
    }
    match mcapp
        .status
        .targets
        .iter_mut()
        .find(|t| t.project_id == status.project_id)
    {
        Some(existing) => *existing = status,
        None => mcapp.status.targets.push(status),
    }
}

/// Publishes the declared roles once every declared target has been
/// reconciled at the current generation.
fn refresh_reported_roles(mcapp: &mut MultiClusterApp) {
    let generation = mcapp.metadata.generation;
    let all_reconciled = mcapp.spec.targets.iter().all(|target| {
        mcapp.status.target(&target.project_id).is_some_and(|s| {
            s.phase == TargetPhase::Reconciled && s.observed_generation == generation
        })
    });
    if all_reconciled {
        mcapp.status.roles = mcapp.spec.roles.clone();
    }
}
