//! HTTP surface over the orchestrator.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    audit::{AuditEvent, AuditLogError},
    error::ProvisionError,
    orchestrator::{Orchestrator, ProvisionRequest, Provisioned},
    ports::{InvalidPortSpec, PortSpec},
    records::ContainerRecord,
    runtime::ContainerSummary,
};

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip)]
    status: StatusCode,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
            status,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, "BAD_REQUEST")
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        let status = match &err {
            ProvisionError::InvalidReference(_) | ProvisionError::InvalidContainerName(_) => {
                StatusCode::BAD_REQUEST
            }
            ProvisionError::UnknownContainer(_) => StatusCode::NOT_FOUND,
            ProvisionError::RuntimeUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let api_error = Self::new(status, err.to_string(), err.kind());
        match &err {
            ProvisionError::InvalidReference(invalid) => api_error.with_details(json!({
                "reference": invalid.reference,
                "reason": invalid.reason,
            })),
            _ => api_error,
        }
    }
}

impl From<AuditLogError> for ApiError {
    fn from(err: AuditLogError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
            "AUDIT_LOG_ERROR",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<InvalidPortSpec> for ApiError {
    fn from(err: InvalidPortSpec) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string(), "INVALID_PORT")
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub audit_limit: usize,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/vm", get(list_containers).post(create_container))
        .route("/vm/orphans", get(list_orphans))
        .route("/vm/{id}/containers", get(get_container))
        .route("/vm/{id}", delete(delete_container))
        .route("/build", post(build_image))
        .route("/audit", get(recent_audit))
        .with_state(state)
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "message": "pong" }))
}

async fn list_containers(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Json<Vec<ContainerSummary>>> {
    Ok(Json(state.orchestrator.list().await?))
}

async fn get_container(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContainerSummary>> {
    Ok(Json(state.orchestrator.get(&id).await?))
}

/// `port` may be a number, a string such as `"80"`, `"53/udp"` or
/// `"80,443"`, or a list of those.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortField {
    Number(u16),
    Text(String),
    Many(Vec<PortField>),
}

impl PortField {
    fn collect_into(&self, specs: &mut Vec<PortSpec>) -> Result<(), InvalidPortSpec> {
        match self {
            Self::Number(port) => specs.push(port.to_string().parse()?),
            Self::Text(text) => {
                for part in text.split(',') {
                    specs.push(part.trim().parse()?);
                }
            }
            Self::Many(fields) => {
                for field in fields {
                    field.collect_into(specs)?;
                }
            }
        }
        Ok(())
    }

    pub fn specs(&self) -> Result<Vec<PortSpec>, InvalidPortSpec> {
        let mut specs = Vec::new();
        self.collect_into(&mut specs)?;
        Ok(specs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerBody {
    pub link: Option<String>,
    pub image_name: Option<String>,
    pub container_name: Option<String>,
    pub port: Option<PortField>,
    #[serde(default)]
    pub force_rebuild: bool,
}

impl TryFrom<CreateContainerBody> for ProvisionRequest {
    type Error = ApiError;

    fn try_from(body: CreateContainerBody) -> Result<Self, Self::Error> {
        let reference = match (body.link, body.image_name) {
            (Some(link), None) => link,
            (None, Some(image)) => image,
            (Some(_), Some(_)) => {
                return Err(ApiError::bad_request(
                    "Provide either link or imageName, not both",
                ));
            }
            (None, None) => return Err(ApiError::bad_request("Provide link or imageName")),
        };
        let ports = body.port.as_ref().map(PortField::specs).transpose()?;
        let name = body
            .container_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        Ok(ProvisionRequest {
            ports,
            name,
            force_rebuild: body.force_rebuild,
            ..ProvisionRequest::new(reference)
        })
    }
}

#[derive(Debug, Serialize)]
struct CreatedResponse {
    message: String,
    #[serde(flatten)]
    provisioned: Provisioned,
}

async fn create_container(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<CreateContainerBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreatedResponse>)> {
    let Json(body) = payload?;
    let request = ProvisionRequest::try_from(body)?;
    let provisioned = state.orchestrator.provision(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            message: format!("Container with id {} created and started", provisioned.id),
            provisioned,
        }),
    ))
}

async fn delete_container(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.orchestrator.deprovision(&id).await?;
    Ok(Json(json!({
        "message": format!("Container with id {id} removed"),
        "id": id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct BuildBody {
    pub repository: String,
}

async fn build_image(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<BuildBody>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(body) = payload?;
    let metadata = state.orchestrator.build(&body.repository).await?;
    Ok(Json(json!({
        "message": format!("Image {} built", metadata.name),
        "image": metadata.name,
        "id": metadata.id,
        "ports": metadata.exposed_ports,
    })))
}

async fn list_orphans(State(state): State<Arc<ApiState>>) -> Json<Vec<ContainerRecord>> {
    Json(state.orchestrator.orphans().await)
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

async fn recent_audit(
    State(state): State<Arc<ApiState>>,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<AuditEvent>>> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(state.audit_limit);
    Ok(Json(state.orchestrator.recent_audit(limit).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Timeouts;
    use crate::ports::tests::CyclingProbe;
    use crate::ports::{BindingPlanner, PortAllocator};
    use crate::runtime::mock::MockRuntime;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn state(runtime: MockRuntime) -> (Arc<MockRuntime>, Arc<ApiState>) {
        let runtime = Arc::new(runtime);
        let allocator = Arc::new(PortAllocator::new(
            CyclingProbe::new(31_000, 500),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Duration::from_secs(30),
        ));
        let orchestrator = Orchestrator::new(
            runtime.clone(),
            BindingPlanner::new(allocator),
            Timeouts::default(),
        );
        (
            runtime,
            Arc::new(ApiState {
                orchestrator,
                audit_limit: 5,
            }),
        )
    }

    fn body(value: serde_json::Value) -> CreateContainerBody {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_port_field_forms() {
        let parsed = body(json!({ "imageName": "nginx", "port": 80 }));
        assert_eq!(parsed.port.unwrap().specs().unwrap(), vec![PortSpec::tcp(80)]);

        let parsed = body(json!({ "imageName": "nginx", "port": "80, 53/udp" }));
        assert_eq!(
            parsed.port.unwrap().specs().unwrap(),
            vec![PortSpec::tcp(80), PortSpec::udp(53)]
        );

        let parsed = body(json!({ "imageName": "nginx", "port": [443, "8080/tcp"] }));
        assert_eq!(
            parsed.port.unwrap().specs().unwrap(),
            vec![PortSpec::tcp(443), PortSpec::tcp(8080)]
        );

        let parsed = body(json!({ "imageName": "nginx", "port": "http" }));
        assert!(parsed.port.unwrap().specs().is_err());
    }

    #[test]
    fn test_request_conversion() {
        let request = ProvisionRequest::try_from(body(json!({
            "imageName": "nginx",
            "containerName": "web1",
            "port": "80",
        })))
        .unwrap();
        assert_eq!(request.reference, "nginx");
        assert_eq!(request.name.as_deref(), Some("web1"));
        assert_eq!(request.ports, Some(vec![PortSpec::tcp(80)]));
        assert!(!request.force_rebuild);

        let request = ProvisionRequest::try_from(body(json!({
            "link": "https://example.com/org/app.git",
            "forceRebuild": true,
        })))
        .unwrap();
        assert_eq!(request.ports, None);
        assert!(request.force_rebuild);

        let err = ProvisionRequest::try_from(body(json!({ "containerName": "web1" }))).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = ProvisionRequest::try_from(body(json!({
            "link": "https://example.com/org/app.git",
            "imageName": "nginx",
        })))
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_status_mapping() {
        let err: ApiError = ProvisionError::UnknownContainer("abc".to_string()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.code, "CONTAINER_NOT_FOUND");

        let err: ApiError = ProvisionError::RuntimeUnavailable {
            step: "create",
            source: crate::runtime::RuntimeError::Unavailable("down".to_string()),
        }
        .into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let invalid = crate::image::ImageReference::source("ftp://example.com/org/app").unwrap_err();
        let err: ApiError = ProvisionError::from(invalid).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "INVALID_REFERENCE");
        assert!(err.details.is_some());

        let err: ApiError = ProvisionError::InvalidContainerName("-web".to_string()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "INVALID_CONTAINER_NAME");

        let err: ApiError = ProvisionError::ContainerLifecycle {
            step: "remove",
            id: "abc".to_string(),
            source: crate::runtime::RuntimeError::NotFound("container abc".to_string()),
        }
        .into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_body_shape() {
        let err = ApiError::bad_request("Provide link or imageName");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(
            value,
            json!({ "error": "Provide link or imageName", "code": "BAD_REQUEST" })
        );
    }

    #[tokio::test]
    async fn test_create_then_delete_handlers() {
        let (runtime, state) =
            state(MockRuntime::new().with_local_image("nginx", &[PortSpec::tcp(80)]));

        let (status, Json(created)) = create_container(
            State(state.clone()),
            Ok(Json(body(json!({ "imageName": "nginx", "containerName": "web1" })))),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert!(created.message.contains(&created.provisioned.id));

        let serialized = serde_json::to_value(&created).unwrap();
        assert!(serialized["ports"]["80/tcp"].is_u64());
        assert!(serialized.get("warnings").is_none());

        let Json(found) = get_container(State(state.clone()), Path(created.provisioned.id.clone()))
            .await
            .unwrap();
        assert_eq!(found.name, "/web1");

        let Json(deleted) =
            delete_container(State(state.clone()), Path(created.provisioned.id.clone()))
                .await
                .unwrap();
        assert_eq!(deleted["id"], created.provisioned.id);
        assert!(
            deleted["message"]
                .as_str()
                .unwrap()
                .contains(&created.provisioned.id)
        );
        assert_eq!(runtime.container_count(), 0);

        let Json(events) = recent_audit(State(state.clone()), Ok(Query(AuditQuery { limit: None })))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].destroyed_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_container_handlers() {
        let (_, state) = state(MockRuntime::new());

        let err = get_container(State(state.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = delete_container(State(state), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "CONTAINER_LIFECYCLE_ERROR");
    }

    #[tokio::test]
    async fn test_create_handler_rejects_bad_names() {
        let (runtime, state) = state(MockRuntime::new().with_local_image("nginx", &[]));

        let err = create_container(
            State(state.clone()),
            Ok(Json(body(json!({ "imageName": "nginx", "containerName": "web 1" })))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "INVALID_CONTAINER_NAME");

        let err = create_container(
            State(state),
            Ok(Json(body(json!({ "imageName": "Foo/Bar" })))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "INVALID_REFERENCE");
        assert_eq!(MockRuntime::calls(&runtime.create_calls), 0);
    }

    #[tokio::test]
    async fn test_build_handler_rejects_registry_reference() {
        let (runtime, state) = state(MockRuntime::new());
        let err = build_image(
            State(state),
            Ok(Json(BuildBody {
                repository: "nginx".to_string(),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(MockRuntime::calls(&runtime.build_calls), 0);
    }

    #[tokio::test]
    async fn test_ping() {
        let Json(value) = ping().await;
        assert_eq!(value, json!({ "message": "pong" }));
    }
}
