use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Namespace every multi-cluster app lives in.
pub const GLOBAL_NAMESPACE: &str = "cattle-global-data";

pub type RoleName = String;
pub type UserId = String;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum IdError {
    #[error("invalid project id {0:?}, expected <cluster>:<project>")]
    ProjectId(String),
    #[error("invalid multiclusterapp name {0:?}")]
    Name(String),
}

/// `<clusterId>:<projectName>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId {
    cluster: String,
    project: String,
}

impl ProjectId {
    pub fn new(cluster: impl Into<String>, project: impl Into<String>) -> Self {
        ProjectId {
            cluster: cluster.into(),
            project: project.into(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn project(&self) -> &str {
        &self.project
    }
}

impl FromStr for ProjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((cluster, project))
                if !cluster.is_empty() && !project.is_empty() && !project.contains(':') =>
            {
                Ok(ProjectId::new(cluster, project))
            }
            _ => Err(IdError::ProjectId(s.to_string())),
        }
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cluster, self.project)
    }
}

impl Serialize for ProjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Validates a multi-cluster app name (lowercase DNS label).
pub fn validate_name(name: &str) -> Result<(), IdError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(IdError::Name(name.to_string()))
    }
}

pub fn mcapp_id(name: &str) -> String {
    format!("{GLOBAL_NAMESPACE}:{name}")
}

/// Name of the per-target app spawned for `mcapp_name` in `project`.
pub fn app_name(mcapp_name: &str, project: &ProjectId) -> String {
    format!("{}-{}", mcapp_name, project.project())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessType {
    #[serde(rename = "read-only")]
    ReadOnly,
    #[serde(rename = "owner")]
    Owner,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub project_id: ProjectId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_principal_id: String,
    pub access_type: AccessType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterAppSpec {
    pub template_version_id: String,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub roles: Vec<RoleName>,
    #[serde(default)]
    pub members: Vec<Member>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Bumped by the store on every successful write.
    pub resource_version: u64,
    /// Bumped by the store whenever the spec changes.
    pub generation: u64,
    pub creator_id: UserId,
    pub updated_by: UserId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetPhase {
    #[default]
    Pending,
    AppCreated,
    RolesBound,
    Reconciled,
    Removing,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub project_id: ProjectId,
    pub app_name: String,
    pub phase: TargetPhase,
    pub observed_generation: u64,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterAppStatus {
    /// Roles confirmed as bound in every target. Lags `spec.roles`.
    pub roles: Vec<RoleName>,
    pub targets: Vec<TargetStatus>,
}

impl MultiClusterAppStatus {
    pub fn target(&self, project_id: &ProjectId) -> Option<&TargetStatus> {
        self.targets.iter().find(|t| &t.project_id == project_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterApp {
    pub metadata: ObjectMeta,
    pub spec: MultiClusterAppSpec,
    #[serde(default)]
    pub status: MultiClusterAppStatus,
}

impl MultiClusterApp {
    pub fn new(name: &str, spec: MultiClusterAppSpec, creator_id: &str) -> Self {
        MultiClusterApp {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: GLOBAL_NAMESPACE.to_string(),
                creator_id: creator_id.to_string(),
                updated_by: creator_id.to_string(),
                ..Default::default()
            },
            spec,
            status: MultiClusterAppStatus::default(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}:{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn has_target(&self, project_id: &ProjectId) -> bool {
        self.spec.targets.iter().any(|t| &t.project_id == project_id)
    }
}

/// Concrete app instance in one target project, owned by a multi-cluster app.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub name: String,
    pub project_id: ProjectId,
    pub multi_cluster_app_id: String,
    pub template_version_id: String,
    pub manifest: String,
    #[serde(default)]
    pub resource_version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "id")]
pub enum BindingScope {
    Cluster(String),
    Project(ProjectId),
}

impl BindingScope {
    pub fn cluster(&self) -> &str {
        match self {
            BindingScope::Cluster(cluster) => cluster,
            BindingScope::Project(project) => project.cluster(),
        }
    }
}

impl fmt::Display for BindingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingScope::Cluster(cluster) => write!(f, "cluster {cluster}"),
            BindingScope::Project(project) => write!(f, "project {project}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    /// Assigned by the store on creation.
    #[serde(default)]
    pub id: String,
    pub scope: BindingScope,
    pub role_template_id: RoleName,
    pub user_id: UserId,
    pub user_principal_id: Option<String>,
    /// Id of the multi-cluster app that materialized this binding, if any.
    pub owner: Option<String>,
    #[serde(default)]
    pub resource_version: u64,
}

impl RoleBinding {
    pub fn new(scope: BindingScope, role_template_id: &str, user_id: &str) -> Self {
        RoleBinding {
            id: String::new(),
            scope,
            role_template_id: role_template_id.to_string(),
            user_id: user_id.to_string(),
            user_principal_id: None,
            owner: None,
            resource_version: 0,
        }
    }

    /// Two bindings are equivalent when they grant the same role to the same
    /// user in the same scope.
    pub fn is_equivalent(&self, other: &RoleBinding) -> bool {
        self.scope == other.scope
            && self.role_template_id == other.role_template_id
            && self.user_id == other.user_id
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppFilter {
    pub name: Option<String>,
    pub project_id: Option<ProjectId>,
    pub multi_cluster_app_id: Option<String>,
}

impl AppFilter {
    pub fn matches(&self, app: &App) -> bool {
        self.name.as_ref().is_none_or(|n| &app.name == n)
            && self.project_id.as_ref().is_none_or(|p| &app.project_id == p)
            && self
                .multi_cluster_app_id
                .as_ref()
                .is_none_or(|id| &app.multi_cluster_app_id == id)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindingFilter {
    pub scope: Option<BindingScope>,
    pub user_id: Option<UserId>,
    pub role_template_id: Option<RoleName>,
    pub owner: Option<String>,
}

impl BindingFilter {
    pub fn matches(&self, binding: &RoleBinding) -> bool {
        self.scope.as_ref().is_none_or(|s| &binding.scope == s)
            && self.user_id.as_ref().is_none_or(|u| &binding.user_id == u)
            && self
                .role_template_id
                .as_ref()
                .is_none_or(|r| &binding.role_template_id == r)
            && self
                .owner
                .as_ref()
                .is_none_or(|o| binding.owner.as_ref() == Some(o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_parse() {
        let project: ProjectId = "local:p-abc12".parse().unwrap();
        assert_eq!(project.cluster(), "local");
        assert_eq!(project.project(), "p-abc12");
        assert_eq!(project.to_string(), "local:p-abc12");

        for invalid in ["local", ":p-1", "local:", "a:b:c", ""] {
            assert!(invalid.parse::<ProjectId>().is_err(), "{invalid}");
        }
    }

    #[test]
    fn test_names() {
        let project = ProjectId::new("local", "p-abc12");
        assert_eq!(app_name("wordpress", &project), "wordpress-p-abc12");
        assert_eq!(mcapp_id("wordpress"), "cattle-global-data:wordpress");

        assert!(validate_name("wordpress-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Wordpress").is_err());
        assert!(validate_name("-wp").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_member_wire_format() {
        let member: Member = serde_json::from_str(
            r#"{"userPrincipalId": "local://u-1", "accessType": "read-only"}"#,
        )
        .unwrap();
        assert_eq!(member.access_type, AccessType::ReadOnly);

        let target: Target = serde_json::from_str(r#"{"projectId": "local:p-1"}"#).unwrap();
        assert_eq!(target.project_id, ProjectId::new("local", "p-1"));

        assert!(serde_json::from_str::<Target>(r#"{"projectId": "p-1"}"#).is_err());
    }

    #[test]
    fn test_filters() {
        let app = App {
            name: "wp-p-1".into(),
            project_id: ProjectId::new("local", "p-1"),
            multi_cluster_app_id: mcapp_id("wp"),
            template_version_id: "tv".into(),
            manifest: String::new(),
            resource_version: 1,
        };
        assert!(AppFilter::default().matches(&app));
        assert!(
            AppFilter {
                name: Some("wp-p-1".into()),
                ..Default::default()
            }
            .matches(&app)
        );
        assert!(
            !AppFilter {
                project_id: Some(ProjectId::new("local", "p-2")),
                ..Default::default()
            }
            .matches(&app)
        );

        let mut binding =
            RoleBinding::new(BindingScope::Cluster("local".into()), "cluster-owner", "u-1");
        assert!(
            !BindingFilter {
                owner: Some(mcapp_id("wp")),
                ..Default::default()
            }
            .matches(&binding)
        );
        binding.owner = Some(mcapp_id("wp"));
        assert!(
            BindingFilter {
                owner: Some(mcapp_id("wp")),
                user_id: Some("u-1".into()),
                ..Default::default()
            }
            .matches(&binding)
        );
    }
}
