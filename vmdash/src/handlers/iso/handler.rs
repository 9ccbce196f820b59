use axum::{
    Extension, Json,
    extract::{Multipart, Path},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use http::StatusCode;
use tracing::instrument;
use validator::Validate;

use crate::{
    App,
    errors::Error,
    model::isos::{Base64Iso, Iso, IsoUpload},
};

use crate::handlers::{ApiResponse, Result};

#[utoipa::path(
    get,
    path = "/isos",
    responses(
        (status = 200, description = "List ISO images", body = Vec<Iso>),
        (status = 500, description = "Internal server error")
    ),
    tag = "isos"
)]
#[instrument(skip(env))]
pub async fn list(Extension(env): Extension<App>) -> Result<ApiResponse<Vec<Iso>>> {
    let isos = env.isos().list().await?;
    Ok(ApiResponse {
        data: isos.into_iter().map(Iso::from).collect(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/isos",
    request_body(content = IsoUpload, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "ISO stored", body = Iso),
        (status = 422, description = "Missing file field or not an .iso file")
    ),
    tag = "isos"
)]
#[instrument(skip(env, multipart))]
pub async fn upload(
    Extension(env): Extension<App>,
    mut multipart: Multipart,
) -> Result<ApiResponse<Iso>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::UnprocessableEntity(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_owned)
            .ok_or_else(|| Error::UnprocessableEntity("file field has no file name".into()))?;
        let iso = env.isos().upload_stream(&name, field).await?;
        return Ok(ApiResponse {
            data: iso.into(),
            code: StatusCode::CREATED,
        });
    }
    Err(Error::UnprocessableEntity(
        "multipart field `file` is required".into(),
    ))
}

#[utoipa::path(
    post,
    path = "/isos-base64",
    request_body = Base64Iso,
    responses(
        (status = 201, description = "ISO stored", body = Iso),
        (status = 422, description = "Invalid name or content")
    ),
    tag = "isos"
)]
#[instrument(skip(env, upload))]
pub async fn upload_base64(
    Extension(env): Extension<App>,
    Json(upload): Json<Base64Iso>,
) -> Result<ApiResponse<Iso>> {
    upload.validate()?;
    let content = BASE64_STANDARD
        .decode(upload.content.trim())
        .map_err(|e| Error::UnprocessableEntity(format!("content is not valid base64: {e}")))?;
    let iso = env.isos().upload(&upload.name, &content).await?;
    Ok(ApiResponse {
        data: iso.into(),
        code: StatusCode::CREATED,
    })
}

#[utoipa::path(
    delete,
    path = "/isos/{filename}",
    params(
        ("filename" = String, Path, description = "ISO file name")
    ),
    responses(
        (status = 204, description = "ISO deleted"),
        (status = 404, description = "ISO not found")
    ),
    tag = "isos"
)]
#[instrument(skip(env))]
pub async fn delete(
    Extension(env): Extension<App>,
    Path(filename): Path<String>,
) -> Result<StatusCode> {
    env.isos().delete(&filename).await?;
    Ok(StatusCode::NO_CONTENT)
}
