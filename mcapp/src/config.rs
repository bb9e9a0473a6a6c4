use apiserver::config::Listener;
use authz::principal::User;
use authz::RoleTemplate;
use fanout::ControllerConfig;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 8081,
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Template version id to manifest.
    #[serde(default)]
    pub catalog: BTreeMap<String, String>,
    /// Added to the built-in role templates.
    #[serde(default)]
    pub role_templates: Vec<RoleTemplate>,
    /// Seeds the principal directory.
    #[serde(default)]
    pub users: Vec<User>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.controller.validate()?;

        if let Some(metrics) = &self.metrics
            && metrics.statsd_port == 0
        {
            return Err(ValidationError::InvalidStatsdPort);
        }

        if self.catalog.keys().any(|k| k.is_empty()) {
            return Err(ValidationError::EmptyCatalogKey);
        }

        let mut user_ids = HashSet::new();
        for user in &self.users {
            if user.id.is_empty() {
                return Err(ValidationError::EmptyUserId);
            }
            if !user_ids.insert(&user.id) {
                return Err(ValidationError::DuplicateUser(user.id.clone()));
            }
        }

        let mut templates = HashSet::new();
        for template in &self.role_templates {
            if !templates.insert(&template.name) {
                return Err(ValidationError::DuplicateRoleTemplate(template.name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("listener: {0}")]
    Listener(#[from] apiserver::config::ValidationError),
    #[error("controller: {0}")]
    Controller(#[from] fanout::config::ValidationError),
    #[error("statsd port cannot be 0")]
    InvalidStatsdPort,
    #[error("catalog contains an empty template version id")]
    EmptyCatalogKey,
    #[error("user with empty id")]
    EmptyUserId,
    #[error("duplicate user id: {0}")]
    DuplicateUser(String),
    #[error("duplicate role template: {0}")]
    DuplicateRoleTemplate(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    ValidationError(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use authz::RoleContext;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
listener:
    host: 0.0.0.0
    port: 8080
admin_listener:
    host: 127.0.0.1
    port: 8081
metrics:
    statsd_host: 127.0.0.1
    statsd_port: 8125
logging:
    sentry_dsn: "https://key@sentry.example.com/1"
controller:
    workers: 8
    resync_interval_secs: 10
catalog:
    "cattle-global-data:library-wordpress-2.1.10": "chart: wordpress"
role_templates:
    - name: cluster-viewer
      context: cluster
users:
    - id: admin
      display_name: Admin
      global_roles: [admin]
    - id: u-1
      principal_ids: ["github://octocat"]
"#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.controller.workers, 8);
        assert_eq!(config.controller.backoff_initial_ms, 500);
        assert_eq!(config.metrics.unwrap().statsd_port, 8125);
        assert_eq!(config.role_templates[0].context, RoleContext::Cluster);
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.users[0].global_roles, vec!["admin".to_string()]);
        assert_eq!(config.users[1].principal_ids, vec!["github://octocat".to_string()]);
        assert!(config.catalog.contains_key("cattle-global-data:library-wordpress-2.1.10"));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let tmp = write_tmp_file("users: []\n");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config.listener, Listener::default());
        assert_eq!(config.admin_listener.port, 8081);
        assert_eq!(config.controller, ControllerConfig::default());
        assert!(config.metrics.is_none());
        assert!(config.logging.is_none());
    }

    #[test]
    fn test_validation_errors() {
        let tmp = write_tmp_file(
            r#"
users:
    - id: u-1
    - id: u-1
"#,
        );
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ValidationError(ValidationError::DuplicateUser(_)))
        ));

        let tmp = write_tmp_file("listener: {host: 0.0.0.0, port: 0}\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ValidationError(ValidationError::Listener(_)))
        ));

        let tmp = write_tmp_file("controller: {workers: 0}\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ValidationError(ValidationError::Controller(_)))
        ));

        let tmp = write_tmp_file("listener: [not, a, map]\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));

        assert!(matches!(
            Config::from_file(std::path::Path::new("/nonexistent/mcapp.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }
}
