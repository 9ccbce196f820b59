use crate::{App, errors::Error};
use axum::{
    Extension, Json, Router,
    body::Body,
    extract::DefaultBodyLimit,
    response::{self, IntoResponse, Response},
    routing::{get, post, put},
};
use http::{Request, StatusCode, header::HeaderName};
use serde::Serialize;
use serde_with::DisplayFromStr;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use validator::ValidationErrors;

mod disk;
mod iso;
mod vm;

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

#[derive(OpenApi)]
#[openapi(
    paths(
        vm::handler::list,
        vm::handler::get,
        vm::handler::create,
        vm::handler::update,
        vm::handler::delete,
        vm::handler::start,
        vm::handler::stop,
        vm::handler::pause,
        vm::handler::resume,
        vm::handler::restart,
        vm::handler::snapshot,
        vm::handler::log,
        disk::handler::list,
        disk::handler::create,
        disk::handler::update,
        disk::handler::delete,
        iso::handler::list,
        iso::handler::upload,
        iso::handler::upload_base64,
        iso::handler::delete,
    ),
    components(
        schemas(
            crate::model::vms::Vm,
            crate::model::vms::NewVm,
            crate::model::vms::UpdateVm,
            crate::model::vms::VmStatus,
            crate::model::vms::NetworkType,
            crate::model::vms::Memory,
            crate::model::vms::CustomArgs,
            crate::model::vms::VmAction,
            crate::model::vms::DeletedVm,
            crate::model::vms::VmSnapshot,
            crate::model::vms::VmLog,
            crate::model::disks::Disk,
            crate::model::disks::NewDisk,
            crate::model::disks::UpdateDisk,
            crate::model::disks::DiskFormat,
            crate::model::disks::DiskType,
            crate::model::isos::Iso,
            crate::model::isos::Base64Iso,
            crate::model::isos::IsoUpload,
        )
    ),
    tags(
        (name = "vms", description = "Virtual machine lifecycle endpoints"),
        (name = "disks", description = "Disk image management endpoints"),
        (name = "isos", description = "Installation media endpoints")
    ),
    info(
        title = "vmdash API",
        version = "0.1.0",
        description = "REST API for managing QEMU virtual machines, disk images and ISOs on a single host"
    )
)]
pub struct ApiDoc;

pub fn app(env: App) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");
    let body_limit = env.max_upload_bytes();
    Router::new()
        .route("/", get(|| async { "vmdash" }))
        .merge(vms())
        .merge(disks())
        .merge(isos())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
                .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        let request_id = request
                            .extensions()
                            .get::<RequestId>()
                            .map(|value| value.header_value().to_str().unwrap_or_default())
                            .unwrap_or_default();

                        tracing::info_span!(
                            "HTTP",
                            http.method = %request.method(),
                            http.url = %request.uri(),
                            request_id = %request_id,
                        )
                    }),
                ),
        )
        .layer(Extension(env))
}

fn vms() -> Router {
    Router::new()
        .route("/vms", get(vm::handler::list).post(vm::handler::create))
        .route(
            "/vms/{vm_id}",
            get(vm::handler::get)
                .put(vm::handler::update)
                .delete(vm::handler::delete),
        )
        .route("/vms/{vm_id}/start", post(vm::handler::start))
        .route("/vms/{vm_id}/stop", post(vm::handler::stop))
        .route("/vms/{vm_id}/pause", post(vm::handler::pause))
        .route("/vms/{vm_id}/resume", post(vm::handler::resume))
        .route("/vms/{vm_id}/restart", post(vm::handler::restart))
        .route("/vms/{vm_id}/snapshot", post(vm::handler::snapshot))
        .route("/vms/{vm_id}/log", get(vm::handler::log))
}

fn disks() -> Router {
    Router::new()
        .route(
            "/disks",
            get(disk::handler::list).post(disk::handler::create),
        )
        .route(
            "/disks/{filename}",
            put(disk::handler::update).delete(disk::handler::delete),
        )
}

fn isos() -> Router {
    Router::new()
        .route("/isos", get(iso::handler::list).post(iso::handler::upload))
        .route("/isos-base64", post(iso::handler::upload_base64))
        .route(
            "/isos/{filename}",
            axum::routing::delete(iso::handler::delete),
        )
}

pub struct ApiResponse<T> {
    data: T,
    code: StatusCode,
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Send + Sync + Serialize,
{
    fn into_response(self) -> Response {
        let mut response = response::Json(self.data).into_response();

        *response.status_mut() = self.code;
        response
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        #[serde_with::serde_as]
        #[serde_with::skip_serializing_none]
        #[derive(serde::Serialize)]
        struct ErrorResponse<'a> {
            kind: &'static str,

            // Serialize the `Display` output as the error message
            #[serde_as(as = "DisplayFromStr")]
            message: &'a Error,

            errors: Option<&'a ValidationErrors>,
        }

        let errors = match &self {
            Error::InvalidEntity(errors) => Some(errors),
            _ => None,
        };

        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!("API error: {:?}", self);
        } else {
            tracing::warn!("API error: {}", self);
        }
        (
            code,
            Json(ErrorResponse {
                kind: self.kind(),
                message: &self,
                errors,
            }),
        )
            .into_response()
    }
}

impl Error {
    fn status_code(&self) -> StatusCode {
        use Error::*;

        match self {
            ExternalTool(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            InvalidEntity(_) | UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Conflict(_) => StatusCode::CONFLICT,
            NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn kind(&self) -> &'static str {
        use Error::*;

        match self {
            InvalidEntity(_) | UnprocessableEntity(_) => "invalid_argument",
            NotFound(_) => "not_found",
            Conflict(_) => "conflict",
            ExternalTool(_) => "external_tool_failure",
            Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use vmdash_node::NodeError;

    async fn body_of(err: Error) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn node_errors_map_to_status_and_kind() {
        let cases = [
            (NodeError::not_found("VM x"), StatusCode::NOT_FOUND, "not_found"),
            (NodeError::invalid("bad"), StatusCode::UNPROCESSABLE_ENTITY, "invalid_argument"),
            (NodeError::Conflict("dup".into()), StatusCode::CONFLICT, "conflict"),
            (
                NodeError::ExternalTool("qemu-img: boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "external_tool_failure",
            ),
        ];
        for (node, status, kind) in cases {
            let message = node.to_string();
            let (code, body) = body_of(node.into()).await;
            assert_eq!(code, status);
            assert_eq!(body["kind"], kind);
            assert_eq!(body["message"], message);
        }
    }

    #[tokio::test]
    async fn io_failures_are_internal_and_opaque() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "/var/lib/secret");
        let (code, body) = body_of(NodeError::from(io).into()).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["kind"], "internal");
        assert_eq!(body["message"], "internal server error");
        assert!(body.get("errors").is_none());
    }
}
