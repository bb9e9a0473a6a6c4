use indexmap::IndexMap;
use serde::Deserialize;
use store::types::{BindingScope, ProjectId, RoleName};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleContext {
    Cluster,
    Project,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RoleTemplate {
    pub name: RoleName,
    pub context: RoleContext,
}

impl RoleTemplate {
    pub fn new(name: &str, context: RoleContext) -> Self {
        RoleTemplate {
            name: name.to_string(),
            context,
        }
    }

    /// Scope a binding of this role takes for a target in `project`.
    pub fn scope_for(&self, project: &ProjectId) -> BindingScope {
        match self.context {
            RoleContext::Cluster => BindingScope::Cluster(project.cluster().to_string()),
            RoleContext::Project => BindingScope::Project(project.clone()),
        }
    }
}

/// Known role templates, keyed by name.
#[derive(Clone, Debug)]
pub struct RoleTemplates {
    templates: IndexMap<RoleName, RoleTemplate>,
}

impl Default for RoleTemplates {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RoleTemplates {
    pub fn builtin() -> Self {
        let builtin = [
            RoleTemplate::new("cluster-owner", RoleContext::Cluster),
            RoleTemplate::new("cluster-member", RoleContext::Cluster),
            RoleTemplate::new("project-owner", RoleContext::Project),
            RoleTemplate::new("project-member", RoleContext::Project),
            RoleTemplate::new("read-only", RoleContext::Project),
        ];
        RoleTemplates {
            templates: builtin.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn with(mut self, extra: impl IntoIterator<Item = RoleTemplate>) -> Self {
        for template in extra {
            self.templates.insert(template.name.clone(), template);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&RoleTemplate> {
        self.templates.get(name)
    }

    /// Looks up every role, returning the first unknown name on failure.
    pub fn resolve_all<'a>(
        &'a self,
        roles: &[RoleName],
    ) -> Result<Vec<&'a RoleTemplate>, RoleName> {
        roles
            .iter()
            .map(|r| self.get(r).ok_or_else(|| r.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_and_extra() {
        let templates = RoleTemplates::builtin().with([RoleTemplate::new(
            "cluster-viewer",
            RoleContext::Cluster,
        )]);
        assert_eq!(
            templates.get("cluster-owner").unwrap().context,
            RoleContext::Cluster
        );
        assert_eq!(
            templates.get("project-member").unwrap().context,
            RoleContext::Project
        );
        assert!(templates.get("cluster-viewer").is_some());

        let err = templates
            .resolve_all(&["project-owner".into(), "nope".into()])
            .unwrap_err();
        assert_eq!(err, "nope");
    }

    #[test]
    fn test_scope_for() {
        let project = ProjectId::new("c-1", "p-1");
        let templates = RoleTemplates::builtin();
        assert_eq!(
            templates.get("cluster-owner").unwrap().scope_for(&project),
            BindingScope::Cluster("c-1".into())
        );
        assert_eq!(
            templates.get("project-owner").unwrap().scope_for(&project),
            BindingScope::Project(project)
        );
    }
}
