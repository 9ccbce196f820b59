use axum::{Extension, Json, extract::Path};
use http::StatusCode;
use tracing::instrument;
use validator::Validate;

use crate::{
    App,
    model::disks::{Disk, NewDisk, UpdateDisk},
};

use crate::handlers::{ApiResponse, Result};

#[utoipa::path(
    get,
    path = "/disks",
    responses(
        (status = 200, description = "List disk images", body = Vec<Disk>),
        (status = 500, description = "Internal server error")
    ),
    tag = "disks"
)]
#[instrument(skip(env))]
pub async fn list(Extension(env): Extension<App>) -> Result<ApiResponse<Vec<Disk>>> {
    let disks = env.disks().list().await?;
    Ok(ApiResponse {
        data: disks.into_iter().map(Disk::from).collect(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/disks",
    request_body = NewDisk,
    responses(
        (status = 201, description = "Disk image created", body = Disk),
        (status = 409, description = "Disk already exists"),
        (status = 422, description = "Invalid input or unsupported format/type combination"),
        (status = 500, description = "Image tool failure")
    ),
    tag = "disks"
)]
#[instrument(skip(env))]
pub async fn create(
    Extension(env): Extension<App>,
    Json(disk): Json<NewDisk>,
) -> Result<ApiResponse<Disk>> {
    disk.validate()?;
    let created = env
        .disks()
        .create(
            &disk.name,
            disk.size,
            disk.format.into(),
            disk.disk_type.into(),
        )
        .await?;
    Ok(ApiResponse {
        data: created.into(),
        code: StatusCode::CREATED,
    })
}

#[utoipa::path(
    put,
    path = "/disks/{filename}",
    params(
        ("filename" = String, Path, description = "Disk image file name")
    ),
    request_body = UpdateDisk,
    responses(
        (status = 200, description = "Disk renamed and/or resized", body = Disk),
        (status = 404, description = "Disk not found"),
        (status = 409, description = "Target name already in use"),
        (status = 422, description = "Invalid input or shrink attempt"),
        (status = 500, description = "Image tool failure")
    ),
    tag = "disks"
)]
#[instrument(skip(env))]
pub async fn update(
    Extension(env): Extension<App>,
    Path(filename): Path<String>,
    Json(update): Json<UpdateDisk>,
) -> Result<ApiResponse<Disk>> {
    update.validate()?;
    let disk = env.disks().update(&filename, update.into()).await?;
    Ok(ApiResponse {
        data: disk.into(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    delete,
    path = "/disks/{filename}",
    params(
        ("filename" = String, Path, description = "Disk image file name")
    ),
    responses(
        (status = 204, description = "Disk deleted"),
        (status = 404, description = "Disk not found")
    ),
    tag = "disks"
)]
#[instrument(skip(env))]
pub async fn delete(
    Extension(env): Extension<App>,
    Path(filename): Path<String>,
) -> Result<StatusCode> {
    env.disks().delete(&filename).await?;
    Ok(StatusCode::NO_CONTENT)
}
