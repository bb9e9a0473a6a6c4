use crate::errors::ApiError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS};
use crate::service::MCAppService;
use crate::types::{
    AppQuery, Collection, CreateClusterRoleBinding, CreateMultiClusterApp,
    CreateProjectRoleBinding, MultiClusterAppView, UpdateMultiClusterApp,
};
use authz::Actor;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use shared::{counter, histogram};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use store::types::{App, RoleBinding};
use tokio::net::TcpListener;

/// Header carrying the id of the user on whose behalf the request is made.
pub const USER_HEADER: &str = "x-mcapp-user";

type AppState = Arc<MCAppService>;

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/v3/multiclusterapps", post(create_mcapp).get(list_mcapps))
        .route(
            "/v3/multiclusterapps/{id}",
            get(get_mcapp).put(update_mcapp).delete(delete_mcapp),
        )
        .route("/v3/apps", get(list_apps))
        .route("/v3/clusterroletemplatebindings", post(create_cluster_binding))
        .route("/v3/projectroletemplatebindings", post(create_project_binding))
        .route(
            "/v3/roletemplatebindings/{id}",
            get(get_binding).delete(delete_binding),
        )
        .with_state(service)
}

/// Serves the API on an already bound listener until it fails.
pub async fn serve(listener: TcpListener, service: AppState) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "api listening");
    }
    axum::serve(listener, router(service)).await
}

/// The authenticated caller.
pub struct Caller(pub Actor);

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok());
        state.authenticate(user).await.map(Caller)
    }
}

/// Runs `handler`, recording its outcome and duration under `operation`.
async fn instrumented<T, Fut>(operation: &'static str, handler: Fut) -> Result<T, ApiError>
where
    Fut: Future<Output = Result<T, ApiError>>,
{
    let start = Instant::now();
    let result = handler.await;
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    counter!(REQUESTS, "operation" => operation, "status" => status).increment(1);
    histogram!(REQUEST_DURATION, "operation" => operation).record(start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::debug!(operation, error = %e, "request rejected");
    }
    result
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::Invalid(rejection.body_text()))
}

async fn create_mcapp(
    State(service): State<AppState>,
    Caller(actor): Caller,
    payload: Result<Json<CreateMultiClusterApp>, JsonRejection>,
) -> Result<Response, ApiError> {
    instrumented("create_mcapp", async {
        let created = service.create(&actor, body(payload)?).await?;
        let view = MultiClusterAppView::from(created);
        Ok::<_, ApiError>((StatusCode::CREATED, Json(view)).into_response())
    })
    .await
}

async fn list_mcapps(
    State(service): State<AppState>,
    Caller(actor): Caller,
) -> Result<Json<Collection<MultiClusterAppView>>, ApiError> {
    instrumented("list_mcapps", async {
        let data = service
            .list(&actor)
            .await?
            .into_iter()
            .map(MultiClusterAppView::from)
            .collect();
        Ok::<_, ApiError>(Json(Collection { data }))
    })
    .await
}

async fn get_mcapp(
    State(service): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<Json<MultiClusterAppView>, ApiError> {
    instrumented("get_mcapp", async {
        Ok::<_, ApiError>(Json(service.get(&actor, &id).await?.into()))
    })
    .await
}

async fn update_mcapp(
    State(service): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
    payload: Result<Json<UpdateMultiClusterApp>, JsonRejection>,
) -> Result<Json<MultiClusterAppView>, ApiError> {
    instrumented("update_mcapp", async {
        let updated = service.update(&actor, &id, body(payload)?).await?;
        Ok::<_, ApiError>(Json(updated.into()))
    })
    .await
}

async fn delete_mcapp(
    State(service): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<Json<MultiClusterAppView>, ApiError> {
    instrumented("delete_mcapp", async {
        Ok::<_, ApiError>(Json(service.delete(&actor, &id).await?.into()))
    })
    .await
}

async fn list_apps(
    State(service): State<AppState>,
    Caller(actor): Caller,
    query: Result<Query<AppQuery>, QueryRejection>,
) -> Result<Json<Collection<App>>, ApiError> {
    instrumented("list_apps", async {
        let Query(query) = query.map_err(|rejection| ApiError::Invalid(rejection.body_text()))?;
        let data = service.list_apps(&actor, query).await?;
        Ok::<_, ApiError>(Json(Collection { data }))
    })
    .await
}

fn binding_response((binding, created): (RoleBinding, bool)) -> Response {
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, Json(binding)).into_response()
}

async fn create_cluster_binding(
    State(service): State<AppState>,
    Caller(actor): Caller,
    payload: Result<Json<CreateClusterRoleBinding>, JsonRejection>,
) -> Result<Response, ApiError> {
    instrumented("create_cluster_binding", async {
        let result = service.create_cluster_binding(&actor, body(payload)?).await?;
        Ok::<_, ApiError>(binding_response(result))
    })
    .await
}

async fn create_project_binding(
    State(service): State<AppState>,
    Caller(actor): Caller,
    payload: Result<Json<CreateProjectRoleBinding>, JsonRejection>,
) -> Result<Response, ApiError> {
    instrumented("create_project_binding", async {
        let result = service.create_project_binding(&actor, body(payload)?).await?;
        Ok::<_, ApiError>(binding_response(result))
    })
    .await
}

async fn get_binding(
    State(service): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<Json<RoleBinding>, ApiError> {
    instrumented("get_binding", async {
        Ok::<_, ApiError>(Json(service.get_binding(&actor, &id).await?))
    })
    .await
}

async fn delete_binding(
    State(service): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<Json<RoleBinding>, ApiError> {
    instrumented("delete_binding", async {
        Ok::<_, ApiError>(Json(service.delete_binding(&actor, &id).await?))
    })
    .await
}
