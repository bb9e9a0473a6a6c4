//! Answers "which roles does a user hold in a scope" from the role bindings
//! in the object store. Every query reads the store, so a binding is visible
//! as soon as its creation has returned.

use std::collections::{BTreeSet, HashSet};
use store::types::{BindingFilter, BindingScope, ProjectId, RoleName};
use store::{SharedStore, StoreResult};

#[derive(Clone)]
pub struct PrincipalRoleIndex {
    store: SharedStore,
}

impl PrincipalRoleIndex {
    pub fn new(store: SharedStore) -> Self {
        PrincipalRoleIndex { store }
    }

    pub async fn roles_of(
        &self,
        user_id: &str,
        scope: &BindingScope,
    ) -> StoreResult<BTreeSet<RoleName>> {
        let filter = BindingFilter {
            scope: Some(scope.clone()),
            user_id: Some(user_id.to_string()),
            ..Default::default()
        };
        Ok(self
            .store
            .list_bindings(&filter)
            .await?
            .into_iter()
            .map(|b| b.role_template_id)
            .collect())
    }

    pub async fn has_role(
        &self,
        user_id: &str,
        scope: &BindingScope,
        role: &str,
    ) -> StoreResult<bool> {
        let filter = BindingFilter {
            scope: Some(scope.clone()),
            user_id: Some(user_id.to_string()),
            role_template_id: Some(role.to_string()),
            ..Default::default()
        };
        Ok(!self.store.list_bindings(&filter).await?.is_empty())
    }

    /// Projects in which the user holds at least one project-scoped role.
    pub async fn projects_of(&self, user_id: &str) -> StoreResult<HashSet<ProjectId>> {
        let filter = BindingFilter {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        };
        Ok(self
            .store
            .list_bindings(&filter)
            .await?
            .into_iter()
            .filter_map(|b| match b.scope {
                BindingScope::Project(project) => Some(project),
                BindingScope::Cluster(_) => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use store::ObjectStore;
    use store::memory::InMemoryStore;
    use store::types::RoleBinding;

    #[tokio::test]
    async fn test_roles_of_reflects_new_bindings() {
        let store = Arc::new(InMemoryStore::new());
        let index = PrincipalRoleIndex::new(store.clone());
        let project = ProjectId::new("local", "p-1");
        let project_scope = BindingScope::Project(project.clone());
        let cluster_scope = BindingScope::Cluster("local".into());

        assert!(index.roles_of("u-1", &project_scope).await.unwrap().is_empty());

        store
            .create_binding(RoleBinding::new(project_scope.clone(), "project-member", "u-1"))
            .await
            .unwrap();
        store
            .create_binding(RoleBinding::new(cluster_scope.clone(), "cluster-owner", "u-1"))
            .await
            .unwrap();
        store
            .create_binding(RoleBinding::new(project_scope.clone(), "project-owner", "u-2"))
            .await
            .unwrap();

        assert_eq!(
            index.roles_of("u-1", &project_scope).await.unwrap(),
            BTreeSet::from(["project-member".to_string()])
        );
        assert!(index.has_role("u-1", &cluster_scope, "cluster-owner").await.unwrap());
        assert!(!index.has_role("u-1", &project_scope, "project-owner").await.unwrap());
        assert_eq!(
            index.projects_of("u-1").await.unwrap(),
            HashSet::from([project])
        );
    }
}
