//! Request-path operations. Everything here is synchronous validation plus a
//! single store write; fan-out to targets happens in the controller.

use crate::errors::ApiError;
use crate::types::{
    AppQuery, CreateClusterRoleBinding, CreateMultiClusterApp, CreateProjectRoleBinding,
    UpdateMultiClusterApp,
};
use authz::membership;
use authz::principal::{PrincipalId, SharedDirectory};
use authz::{
    Actor, ForbiddenReason, PrincipalRoleIndex, RoleContext, RoleRequirementValidator,
    RoleTemplates,
};
use std::collections::HashSet;
use store::types::{
    App, AppFilter, BindingScope, Member, MultiClusterApp, MultiClusterAppSpec, ProjectId,
    RoleBinding, RoleName, Target, validate_name,
};
use store::{SharedStore, StoreError};

const MAX_UPDATE_ATTEMPTS: usize = 5;

pub struct MCAppService {
    store: SharedStore,
    directory: SharedDirectory,
    index: PrincipalRoleIndex,
    validator: RoleRequirementValidator,
}

impl MCAppService {
    pub fn new(store: SharedStore, directory: SharedDirectory, templates: RoleTemplates) -> Self {
        let index = PrincipalRoleIndex::new(store.clone());
        let validator = RoleRequirementValidator::new(index.clone(), templates);
        MCAppService {
            store,
            directory,
            index,
            validator,
        }
    }

    /// Resolves the user id supplied by the authenticating proxy.
    pub async fn authenticate(&self, user_id: Option<&str>) -> Result<Actor, ApiError> {
        let user_id = user_id.filter(|u| !u.is_empty()).ok_or(ApiError::Unauthenticated)?;
        self.directory
            .get_user(user_id)
            .await?
            .map(Actor::new)
            .ok_or(ApiError::Unauthenticated)
    }

    pub async fn create(
        &self,
        actor: &Actor,
        request: CreateMultiClusterApp,
    ) -> Result<MultiClusterApp, ApiError> {
        validate_name(&request.name)?;
        check_spec(&request.targets, &request.roles, &request.members)?;
        self.validator
            .validate(actor, &request.targets, &request.roles)
            .await?;

        let spec = MultiClusterAppSpec {
            template_version_id: request.template_version_id,
            targets: request.targets,
            roles: request.roles,
            members: request.members,
        };
        let created = self
            .store
            .create_mcapp(MultiClusterApp::new(&request.name, spec, actor.id()))
            .await?;

        tracing::info!(mcapp = %created.id(), user = actor.id(), "created multiclusterapp");
        Ok(created)
    }

    /// Applies `request` on top of the stored app. Without a resource version
    /// the read-modify-write is retried on conflicting concurrent writes.
    pub async fn update(
        &self,
        actor: &Actor,
        id: &str,
        request: UpdateMultiClusterApp,
    ) -> Result<MultiClusterApp, ApiError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get(actor, id).await?;
            membership::authorize_write(actor, &current)?;

            if let Some(template) = &request.template_version_id
                && template != &current.spec.template_version_id
            {
                return Err(ApiError::Invalid(
                    "templateVersionId cannot be changed".to_string(),
                ));
            }
            if let Some(expected) = request.resource_version
                && expected != current.metadata.resource_version
            {
                let found = current.metadata.resource_version;
                return Err(ApiError::Conflict(format!(
                    "multiclusterapp {id} was modified: \
                     expected resource version {expected}, found {found}"
                )));
            }

            let mut updated = current.clone();
            if let Some(targets) = &request.targets {
                updated.spec.targets = targets.clone();
            }
            if let Some(roles) = &request.roles {
                updated.spec.roles = roles.clone();
            }
            if let Some(members) = &request.members {
                updated.spec.members = members.clone();
            }
            check_spec(
                &updated.spec.targets,
                &updated.spec.roles,
                &updated.spec.members,
            )?;

            // Membership-only changes do not touch target RBAC.
            if updated.spec.roles != current.spec.roles
                || updated.spec.targets != current.spec.targets
            {
                self.validator
                    .validate(actor, &updated.spec.targets, &updated.spec.roles)
                    .await?;
            }

            updated.metadata.updated_by = actor.id().to_string();
            match self.store.update_mcapp(updated).await {
                Ok(stored) => {
                    tracing::info!(
                        mcapp = id,
                        user = actor.id(),
                        generation = stored.metadata.generation,
                        "updated multiclusterapp"
                    );
                    return Ok(stored);
                }
                Err(StoreError::Conflict { .. })
                    if request.resource_version.is_none() && attempt < MAX_UPDATE_ATTEMPTS =>
                {
                    tracing::debug!(mcapp = id, attempt, "update conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads an app, hiding its existence from principals who may not see it.
    pub async fn get(&self, actor: &Actor, id: &str) -> Result<MultiClusterApp, ApiError> {
        let mcapp = match self.store.get_mcapp(id).await {
            Ok(mcapp) => mcapp,
            Err(e @ StoreError::NotFound { .. }) if actor.is_global_admin() => return Err(e.into()),
            Err(StoreError::NotFound { .. }) => return Err(membership::hidden(actor, id).into()),
            Err(e) => return Err(e.into()),
        };
        membership::authorize_read(actor, &mcapp)?;
        Ok(mcapp)
    }

    pub async fn list(&self, actor: &Actor) -> Result<Vec<MultiClusterApp>, ApiError> {
        Ok(self
            .store
            .list_mcapps()
            .await?
            .into_iter()
            .filter(|m| membership::can_read(actor, m))
            .collect())
    }

    pub async fn delete(&self, actor: &Actor, id: &str) -> Result<MultiClusterApp, ApiError> {
        let current = self.get(actor, id).await?;
        membership::authorize_write(actor, &current)?;
        let deleted = self.store.delete_mcapp(id).await?;
        tracing::info!(mcapp = id, user = actor.id(), "deleted multiclusterapp");
        Ok(deleted)
    }

    /// Lists per-target apps. Non-administrators only see apps in projects
    /// where they hold a role.
    pub async fn list_apps(&self, actor: &Actor, query: AppQuery) -> Result<Vec<App>, ApiError> {
        let filter = AppFilter {
            name: query.name,
            project_id: query
                .project_id
                .as_deref()
                .map(str::parse::<ProjectId>)
                .transpose()?,
            multi_cluster_app_id: query.multi_cluster_app_id,
        };
        let apps = self.store.list_apps(&filter).await?;
        if actor.is_global_admin() {
            return Ok(apps);
        }

        let visible = self.index.projects_of(actor.id()).await?;
        Ok(apps
            .into_iter()
            .filter(|app| visible.contains(&app.project_id))
            .collect())
    }

    pub async fn create_cluster_binding(
        &self,
        actor: &Actor,
        request: CreateClusterRoleBinding,
    ) -> Result<(RoleBinding, bool), ApiError> {
        if request.cluster_id.is_empty() || request.cluster_id.contains(':') {
            return Err(ApiError::Invalid(format!(
                "invalid cluster id {:?}",
                request.cluster_id
            )));
        }
        self.create_binding(
            actor,
            BindingScope::Cluster(request.cluster_id),
            RoleContext::Cluster,
            &request.role_template_id,
            &request.user_id,
        )
        .await
    }

    pub async fn create_project_binding(
        &self,
        actor: &Actor,
        request: CreateProjectRoleBinding,
    ) -> Result<(RoleBinding, bool), ApiError> {
        self.create_binding(
            actor,
            BindingScope::Project(request.project_id),
            RoleContext::Project,
            &request.role_template_id,
            &request.user_id,
        )
        .await
    }

    /// Returns the binding and whether it was newly created. An equivalent
    /// existing binding is returned instead; if a multiclusterapp created it,
    /// the explicit grant takes it over so the controller no longer prunes it.
    async fn create_binding(
        &self,
        actor: &Actor,
        scope: BindingScope,
        context: RoleContext,
        role: &str,
        user_id: &str,
    ) -> Result<(RoleBinding, bool), ApiError> {
        require_binding_admin(actor)?;

        let template = self
            .validator
            .templates()
            .get(role)
            .ok_or_else(|| ApiError::Invalid(format!("role template {role} not found")))?;
        if template.context != context {
            return Err(ApiError::Invalid(format!(
                "role template {role} cannot be bound in {scope}"
            )));
        }
        let user = self
            .directory
            .get_user(user_id)
            .await?
            .ok_or_else(|| ApiError::Invalid(format!("user {user_id} not found")))?;

        let mut binding = RoleBinding::new(scope, role, &user.id);
        binding.user_principal_id = Some(user.local_principal().to_string());

        match self.store.create_binding(binding).await {
            Ok(created) => {
                tracing::info!(
                    binding = %created.id,
                    role,
                    user = %user.id,
                    scope = %created.scope,
                    "created role binding"
                );
                Ok((created, true))
            }
            Err(StoreError::AlreadyExists { id, .. }) => {
                Ok((self.adopt_binding(&id).await?, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn adopt_binding(&self, id: &str) -> Result<RoleBinding, ApiError> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut binding = self.store.get_binding(id).await?;
            let Some(owner) = binding.owner.take() else {
                return Ok(binding);
            };
            match self.store.update_binding(binding).await {
                Ok(adopted) => {
                    tracing::info!(binding = id, mcapp = %owner, "adopted role binding");
                    return Ok(adopted);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ApiError::Conflict(format!(
            "role binding {id} kept changing while being adopted"
        )))
    }

    pub async fn get_binding(&self, actor: &Actor, id: &str) -> Result<RoleBinding, ApiError> {
        require_binding_admin(actor)?;
        Ok(self.store.get_binding(id).await?)
    }

    pub async fn delete_binding(&self, actor: &Actor, id: &str) -> Result<RoleBinding, ApiError> {
        require_binding_admin(actor)?;
        let deleted = self.store.delete_binding(id).await?;
        tracing::info!(binding = id, user = actor.id(), "deleted role binding");
        Ok(deleted)
    }
}

fn require_binding_admin(actor: &Actor) -> Result<(), ApiError> {
    if actor.is_global_admin() {
        return Ok(());
    }
    Err(ForbiddenReason::CannotManageBindings {
        user: actor.id().to_string(),
    }
    .into())
}

/// Shape checks that need no store access.
fn check_spec(targets: &[Target], roles: &[RoleName], members: &[Member]) -> Result<(), ApiError> {
    if targets.is_empty() {
        return Err(ApiError::Invalid("at least one target is required".into()));
    }
    let mut projects = HashSet::new();
    for target in targets {
        if !projects.insert(&target.project_id) {
            return Err(ApiError::Invalid(format!(
                "duplicate target project {}",
                target.project_id
            )));
        }
    }

    let mut seen = HashSet::new();
    for role in roles {
        if !seen.insert(role) {
            return Err(ApiError::Invalid(format!("duplicate role {role}")));
        }
    }

    let mut principals = HashSet::new();
    for member in members {
        let principal: PrincipalId = member.user_principal_id.parse()?;
        if !principals.insert(principal) {
            return Err(ApiError::Invalid(format!(
                "duplicate member {}",
                member.user_principal_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use authz::User;
    use authz::principal::InMemoryDirectory;
    use std::sync::Arc;
    use store::ObjectStore;
    use store::memory::InMemoryStore;
    use store::types::AccessType;

    const TEMPLATE: &str = "cattle-global-data:library-wordpress-2.1.10";

    struct Fixture {
        store: Arc<InMemoryStore>,
        service: MCAppService,
        admin: Actor,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let directory = Arc::new(InMemoryDirectory::new([
                User::admin("admin"),
                User::new("u-1"),
                User::new("u-2"),
            ]));
            let service = MCAppService::new(store.clone(), directory, RoleTemplates::builtin());
            Fixture {
                store,
                service,
                admin: Actor::new(User::admin("admin")),
            }
        }

        async fn grant(&self, scope: BindingScope, role: &str, user: &str) {
            self.store
                .create_binding(RoleBinding::new(scope, role, user))
                .await
                .unwrap();
        }
    }

    fn user(id: &str) -> Actor {
        Actor::new(User::new(id))
    }

    fn p1() -> ProjectId {
        ProjectId::new("local", "p-1")
    }

    fn request(name: &str, roles: &[&str]) -> CreateMultiClusterApp {
        CreateMultiClusterApp {
            name: name.into(),
            template_version_id: TEMPLATE.into(),
            targets: vec![Target { project_id: p1() }],
            roles: roles.iter().map(|r| r.to_string()).collect(),
            members: vec![],
        }
    }

    #[tokio::test]
    async fn test_authenticate() {
        let f = Fixture::new();
        assert!(f.service.authenticate(Some("u-1")).await.is_ok());
        assert!(matches!(
            f.service.authenticate(Some("nobody")).await,
            Err(ApiError::Unauthenticated)
        ));
        assert!(matches!(
            f.service.authenticate(None).await,
            Err(ApiError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_create_requires_project_membership() {
        let f = Fixture::new();
        let err = f.service.create(&user("u-1"), request("wp", &[])).await.unwrap_err();
        assert!(err.to_string().contains("has no roles in target project"));

        f.grant(BindingScope::Project(p1()), "project-member", "u-1").await;
        let created = f.service.create(&user("u-1"), request("wp", &[])).await.unwrap();
        assert_eq!(created.metadata.creator_id, "u-1");

        let err = f.service.create(&user("u-1"), request("wp", &[])).await.unwrap_err();
        assert!(matches!(err, ApiError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_create_shape_validation() {
        let f = Fixture::new();
        let mut req = request("wp", &["project-owner", "project-owner"]);
        assert!(matches!(
            f.service.create(&f.admin, req.clone()).await,
            Err(ApiError::Invalid(_))
        ));

        req.roles = vec![];
        req.targets.push(Target { project_id: p1() });
        assert!(matches!(
            f.service.create(&f.admin, req.clone()).await,
            Err(ApiError::Invalid(_))
        ));

        req.targets.truncate(1);
        req.name = "Not_A_Name".into();
        assert!(matches!(
            f.service.create(&f.admin, req.clone()).await,
            Err(ApiError::Invalid(_))
        ));

        let mut req = request("wp", &["no-such-role"]);
        let err = f.service.create(&f.admin, req.clone()).await.unwrap_err();
        assert_eq!(err.to_string(), "role template no-such-role not found");

        req.roles = vec![];
        req.members = vec![Member {
            user_principal_id: "u-1".into(),
            access_type: AccessType::Owner,
        }];
        assert!(matches!(
            f.service.create(&f.admin, req).await,
            Err(ApiError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_update_membership_and_roles() {
        let f = Fixture::new();
        let created = f.service.create(&f.admin, request("wp", &[])).await.unwrap();
        let id = created.id();

        // A stranger cannot tell the app exists.
        let err = f.service.get(&user("u-1"), &id).await.unwrap_err();
        assert!(err.to_string().contains("does not have access to multiclusterapp"));
        let err = f.service.get(&user("u-1"), "cattle-global-data:nope").await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        let err = f.service.get(&f.admin, "cattle-global-data:nope").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let members = vec![
            Member {
                user_principal_id: "local://u-1".into(),
                access_type: AccessType::ReadOnly,
            },
            Member {
                user_principal_id: "local://u-2".into(),
                access_type: AccessType::Owner,
            },
        ];
        let updated = f
            .service
            .update(
                &f.admin,
                &id,
                UpdateMultiClusterApp {
                    members: Some(members),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.metadata.generation, 2);

        assert!(f.service.get(&user("u-1"), &id).await.is_ok());
        let err = f
            .service
            .update(
                &user("u-1"),
                &id,
                UpdateMultiClusterApp {
                    roles: Some(vec!["project-member".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not have access to update multiclusterapp"));

        // u-2 owns the app but holds no project roles for the new role set.
        let err = f
            .service
            .update(
                &user("u-2"),
                &id,
                UpdateMultiClusterApp {
                    roles: Some(vec!["project-member".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has no roles in target project"));

        f.grant(BindingScope::Project(p1()), "project-member", "u-2").await;
        let updated = f
            .service
            .update(
                &user("u-2"),
                &id,
                UpdateMultiClusterApp {
                    roles: Some(vec!["project-member".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.metadata.updated_by, "u-2");
        assert_eq!(updated.metadata.creator_id, "admin");
    }

    #[tokio::test]
    async fn test_update_version_and_template_checks() {
        let f = Fixture::new();
        let created = f.service.create(&f.admin, request("wp", &[])).await.unwrap();
        let id = created.id();

        let stale = UpdateMultiClusterApp {
            roles: Some(vec!["project-owner".into()]),
            resource_version: Some(created.metadata.resource_version + 1),
            ..Default::default()
        };
        assert!(matches!(
            f.service.update(&f.admin, &id, stale).await,
            Err(ApiError::Conflict(_))
        ));

        let retemplate = UpdateMultiClusterApp {
            template_version_id: Some("cattle-global-data:other-1.0".into()),
            ..Default::default()
        };
        assert!(matches!(
            f.service.update(&f.admin, &id, retemplate).await,
            Err(ApiError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_and_list_visibility() {
        let f = Fixture::new();
        let mut req = request("wp", &[]);
        req.members = vec![Member {
            user_principal_id: "local://u-1".into(),
            access_type: AccessType::ReadOnly,
        }];
        let created = f.service.create(&f.admin, req).await.unwrap();
        f.service.create(&f.admin, request("other", &[])).await.unwrap();

        let visible: Vec<_> = f
            .service
            .list(&user("u-1"))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.metadata.name)
            .collect();
        assert_eq!(visible, vec!["wp".to_string()]);
        assert_eq!(f.service.list(&f.admin).await.unwrap().len(), 2);

        assert!(matches!(
            f.service.delete(&user("u-1"), &created.id()).await,
            Err(ApiError::Forbidden(_))
        ));
        f.service.delete(&f.admin, &created.id()).await.unwrap();
        assert!(f.store.get_mcapp(&created.id()).await.is_err());
    }

    #[tokio::test]
    async fn test_list_apps_visibility() {
        let f = Fixture::new();
        for (name, project) in [("wp-p-1", "p-1"), ("wp-p-2", "p-2")] {
            f.store
                .create_app(App {
                    name: name.into(),
                    project_id: ProjectId::new("local", project),
                    multi_cluster_app_id: "cattle-global-data:wp".into(),
                    template_version_id: TEMPLATE.into(),
                    manifest: String::new(),
                    resource_version: 0,
                })
                .await
                .unwrap();
        }
        f.grant(BindingScope::Project(p1()), "read-only", "u-1").await;

        assert_eq!(
            f.service.list_apps(&f.admin, AppQuery::default()).await.unwrap().len(),
            2
        );
        let apps = f.service.list_apps(&user("u-1"), AppQuery::default()).await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "wp-p-1");

        let query = AppQuery {
            project_id: Some("local:p-2".into()),
            ..Default::default()
        };
        assert_eq!(f.service.list_apps(&f.admin, query).await.unwrap()[0].name, "wp-p-2");

        let query = AppQuery {
            project_id: Some("p-2".into()),
            ..Default::default()
        };
        assert!(matches!(
            f.service.list_apps(&f.admin, query).await,
            Err(ApiError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_binding_administration() {
        let f = Fixture::new();
        let request = CreateProjectRoleBinding {
            project_id: p1(),
            role_template_id: "project-member".into(),
            user_id: "u-1".into(),
        };

        let err = f
            .service
            .create_project_binding(&user("u-1"), request.clone())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "user u-1 is not allowed to manage role bindings");

        let (binding, created) = f
            .service
            .create_project_binding(&f.admin, request.clone())
            .await
            .unwrap();
        assert!(created);
        assert_eq!(binding.user_principal_id.as_deref(), Some("local://u-1"));

        let (again, created) = f.service.create_project_binding(&f.admin, request).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, binding.id);

        let wrong_scope = CreateClusterRoleBinding {
            cluster_id: "local".into(),
            role_template_id: "project-member".into(),
            user_id: "u-1".into(),
        };
        assert!(matches!(
            f.service.create_cluster_binding(&f.admin, wrong_scope).await,
            Err(ApiError::Invalid(_))
        ));

        f.service.delete_binding(&f.admin, &binding.id).await.unwrap();
        assert!(matches!(
            f.service.get_binding(&f.admin, &binding.id).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_explicit_grant_adopts_app_binding() {
        let f = Fixture::new();
        let mut materialized =
            RoleBinding::new(BindingScope::Project(p1()), "project-member", "u-1");
        materialized.owner = Some("cattle-global-data:wordpress".into());
        let materialized = f.store.create_binding(materialized).await.unwrap();

        let (binding, created) = f
            .service
            .create_project_binding(
                &f.admin,
                CreateProjectRoleBinding {
                    project_id: p1(),
                    role_template_id: "project-member".into(),
                    user_id: "u-1".into(),
                },
            )
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(binding.id, materialized.id);
        assert_eq!(binding.owner, None);
        assert_eq!(f.store.get_binding(&materialized.id).await.unwrap().owner, None);
    }
}
