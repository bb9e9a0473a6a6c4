//! HTTP client for the v3 API, plus helpers that poll for the eventually
//! consistent results of the fan-out controller.

use crate::api::USER_HEADER;
use crate::errors::ErrorBody;
use crate::types::{
    AppQuery, Collection, CreateClusterRoleBinding, CreateMultiClusterApp,
    CreateProjectRoleBinding, MultiClusterAppView, UpdateMultiClusterApp,
};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use shared::retry::{Backoff, PollTimeout, poll_until};
use std::time::Duration;
use store::types::{App, ProjectId, RoleBinding, RoleName};
use url::Url;

/// Default bound for the `wait_for_*` helpers.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("{status} {code}: {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },

    #[error(transparent)]
    Timeout(#[from] PollTimeout),
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(e) => e.status(),
            _ => None,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.status() == Some(StatusCode::FORBIDDEN)
    }

    /// Whether polling may see a different answer later. Rejections such as
    /// 401, 403 or 422 will not change by waiting.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(_) => true,
            ClientError::Api { status, .. } => {
                status.is_server_error()
                    || matches!(
                        *status,
                        StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS
                    )
            }
            ClientError::InvalidUrl(_) | ClientError::Timeout(_) => false,
        }
    }

    /// Server-provided message of an API error.
    pub fn message(&self) -> Option<&str> {
        match self {
            ClientError::Api { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
    base_url: Url,
    user: String,
    backoff: Backoff,
}

impl Client {
    pub fn new(base_url: Url, user: &str) -> Self {
        Client {
            client: reqwest::Client::new(),
            base_url,
            user: user.to_string(),
            backoff: Backoff::default(),
        }
    }

    /// A client for the same server acting as another user.
    pub fn as_user(&self, user: &str) -> Self {
        Client {
            user: user.to_string(),
            ..self.clone()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push("v3")
            .extend(segments);
        Ok(url)
    }

    async fn send<B, T>(&self, method: Method, url: Url, body: Option<&B>) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self
            .client
            .request(method, url)
            .header(USER_HEADER, &self.user);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let text = response.text().await?;
        Err(match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => ClientError::Api {
                status,
                code: body.code,
                message: body.message,
            },
            Err(_) => ClientError::Api {
                status,
                code: status.canonical_reason().unwrap_or("Unknown").to_string(),
                message: text,
            },
        })
    }

    pub async fn create_mcapp(
        &self,
        request: &CreateMultiClusterApp,
    ) -> Result<MultiClusterAppView, ClientError> {
        let url = self.url(&["multiclusterapps"])?;
        self.send(Method::POST, url, Some(request)).await
    }

    pub async fn update_mcapp(
        &self,
        id: &str,
        request: &UpdateMultiClusterApp,
    ) -> Result<MultiClusterAppView, ClientError> {
        let url = self.url(&["multiclusterapps", id])?;
        self.send(Method::PUT, url, Some(request)).await
    }

    pub async fn get_mcapp(&self, id: &str) -> Result<MultiClusterAppView, ClientError> {
        let url = self.url(&["multiclusterapps", id])?;
        self.send::<(), _>(Method::GET, url, None).await
    }

    pub async fn list_mcapps(&self) -> Result<Vec<MultiClusterAppView>, ClientError> {
        let url = self.url(&["multiclusterapps"])?;
        let collection: Collection<MultiClusterAppView> =
            self.send::<(), _>(Method::GET, url, None).await?;
        Ok(collection.data)
    }

    pub async fn delete_mcapp(&self, id: &str) -> Result<MultiClusterAppView, ClientError> {
        let url = self.url(&["multiclusterapps", id])?;
        self.send::<(), _>(Method::DELETE, url, None).await
    }

    pub async fn list_apps(&self, query: &AppQuery) -> Result<Vec<App>, ClientError> {
        let mut url = self.url(&["apps"])?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(name) = &query.name {
                pairs.append_pair("name", name);
            }
            if let Some(project_id) = &query.project_id {
                pairs.append_pair("projectId", project_id);
            }
            if let Some(id) = &query.multi_cluster_app_id {
                pairs.append_pair("multiClusterAppId", id);
            }
        }
        let collection: Collection<App> = self.send::<(), _>(Method::GET, url, None).await?;
        Ok(collection.data)
    }

    pub async fn create_cluster_role_binding(
        &self,
        request: &CreateClusterRoleBinding,
    ) -> Result<RoleBinding, ClientError> {
        let url = self.url(&["clusterroletemplatebindings"])?;
        self.send(Method::POST, url, Some(request)).await
    }

    pub async fn create_project_role_binding(
        &self,
        request: &CreateProjectRoleBinding,
    ) -> Result<RoleBinding, ClientError> {
        let url = self.url(&["projectroletemplatebindings"])?;
        self.send(Method::POST, url, Some(request)).await
    }

    pub async fn get_role_binding(&self, id: &str) -> Result<RoleBinding, ClientError> {
        let url = self.url(&["roletemplatebindings", id])?;
        self.send::<(), _>(Method::GET, url, None).await
    }

    pub async fn delete_role_binding(&self, id: &str) -> Result<RoleBinding, ClientError> {
        let url = self.url(&["roletemplatebindings", id])?;
        self.send::<(), _>(Method::DELETE, url, None).await
    }

    /// Polls until the per-target app `name` shows up in `project`.
    pub async fn wait_for_app(
        &self,
        name: &str,
        project: &ProjectId,
        timeout: Duration,
    ) -> Result<App, ClientError> {
        let query = AppQuery {
            name: Some(name.to_string()),
            project_id: Some(project.to_string()),
            ..Default::default()
        };
        let what = format!("app {name} in project {project}");
        poll_until(&what, timeout, self.backoff, || async {
            match self.list_apps(&query).await {
                Ok(apps) => apps.into_iter().next().map(Ok),
                Err(e) => give_up_on(e),
            }
        })
        .await?
    }

    /// Polls until the reported roles of `id` equal `roles`.
    pub async fn wait_for_roles(
        &self,
        id: &str,
        roles: &[RoleName],
        timeout: Duration,
    ) -> Result<MultiClusterAppView, ClientError> {
        let what = format!("roles {roles:?} on multiclusterapp {id}");
        poll_until(&what, timeout, self.backoff, || async {
            match self.get_mcapp(id).await {
                Ok(mcapp) if mcapp.roles == roles => Some(Ok(mcapp)),
                Ok(_) => None,
                Err(e) => give_up_on(e),
            }
        })
        .await?
    }

    /// Polls until every target of `id` is reconciled at its current
    /// generation, and returns the app as read at that point.
    pub async fn wait_for_reconciled(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<MultiClusterAppView, ClientError> {
        let what = format!("multiclusterapp {id} to be reconciled");
        poll_until(&what, timeout, self.backoff, || async {
            match self.get_mcapp(id).await {
                Ok(mcapp) if mcapp.is_reconciled() => Some(Ok(mcapp)),
                Ok(_) => None,
                Err(e) => give_up_on(e),
            }
        })
        .await?
    }

    /// Polls until the binding `id` can be read back.
    pub async fn wait_for_role_binding(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<RoleBinding, ClientError> {
        let what = format!("role binding {id}");
        poll_until(&what, timeout, self.backoff, || async {
            match self.get_role_binding(id).await {
                Ok(binding) => Some(Ok(binding)),
                Err(e) => give_up_on(e),
            }
        })
        .await?
    }
}

/// Keeps polling through transient errors and stops on the rest.
fn give_up_on<T>(e: ClientError) -> Option<Result<T, ClientError>> {
    if e.is_transient() {
        tracing::debug!(error = %e, "poll attempt failed");
        None
    } else {
        Some(Err(e))
    }
}
