use axum::{
    Extension, Json,
    extract::{Path, Query},
};
use http::StatusCode;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use crate::{
    App,
    model::vms::{
        DeleteVmParams, DeletedVm, NewVm, UpdateVm, Vm, VmAction, VmLog, VmSnapshot,
    },
};

use crate::handlers::{ApiResponse, Result};

#[utoipa::path(
    get,
    path = "/vms",
    responses(
        (status = 200, description = "List all VMs with their live status", body = Vec<Vm>),
        (status = 500, description = "Internal server error")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn list(Extension(env): Extension<App>) -> Result<ApiResponse<Vec<Vm>>> {
    let vms = env.vms().list().await?;
    Ok(ApiResponse {
        data: vms.into_iter().map(Vm::from).collect(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    get,
    path = "/vms/{vm_id}",
    params(
        ("vm_id" = uuid::Uuid, Path, description = "VM unique identifier")
    ),
    responses(
        (status = 200, description = "VM details", body = Vm),
        (status = 404, description = "VM not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn get(
    Extension(env): Extension<App>,
    Path(vm_id): Path<Uuid>,
) -> Result<ApiResponse<Vm>> {
    let vm = env.vms().get(vm_id).await?;
    Ok(ApiResponse {
        data: vm.into(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/vms",
    request_body = NewVm,
    responses(
        (status = 201, description = "VM created and started", body = Vm),
        (status = 404, description = "Disk or ISO not found"),
        (status = 409, description = "A VM with this name already exists"),
        (status = 422, description = "Invalid input"),
        (status = 500, description = "Hypervisor or image tool failure")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn create(
    Extension(env): Extension<App>,
    Json(vm): Json<NewVm>,
) -> Result<ApiResponse<Vm>> {
    vm.validate()?;
    let created = env.vms().create(vm.into()).await?;
    Ok(ApiResponse {
        data: created.into(),
        code: StatusCode::CREATED,
    })
}

#[utoipa::path(
    put,
    path = "/vms/{vm_id}",
    params(
        ("vm_id" = uuid::Uuid, Path, description = "VM unique identifier")
    ),
    request_body = UpdateVm,
    responses(
        (status = 200, description = "VM record updated; applies on next start", body = Vm),
        (status = 404, description = "VM or ISO not found"),
        (status = 409, description = "Target name already in use"),
        (status = 422, description = "Invalid input")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn update(
    Extension(env): Extension<App>,
    Path(vm_id): Path<Uuid>,
    Json(update): Json<UpdateVm>,
) -> Result<ApiResponse<Vm>> {
    update.validate()?;
    let vm = env.vms().update(vm_id, update.into()).await?;
    Ok(ApiResponse {
        data: vm.into(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    delete,
    path = "/vms/{vm_id}",
    params(
        ("vm_id" = uuid::Uuid, Path, description = "VM unique identifier"),
        DeleteVmParams
    ),
    responses(
        (status = 200, description = "VM deleted", body = DeletedVm),
        (status = 404, description = "VM not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn delete(
    Extension(env): Extension<App>,
    Path(vm_id): Path<Uuid>,
    Query(params): Query<DeleteVmParams>,
) -> Result<ApiResponse<DeletedVm>> {
    let outcome = env.vms().delete(vm_id, params.remove_disks).await?;
    Ok(ApiResponse {
        data: outcome.into(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/vms/{vm_id}/start",
    params(
        ("vm_id" = uuid::Uuid, Path, description = "VM unique identifier")
    ),
    responses(
        (status = 200, description = "VM started, or already running", body = VmAction),
        (status = 404, description = "VM, disk or ISO not found"),
        (status = 500, description = "Hypervisor failed to start")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn start(
    Extension(env): Extension<App>,
    Path(vm_id): Path<Uuid>,
) -> Result<ApiResponse<VmAction>> {
    let outcome = env.vms().start(vm_id).await?;
    Ok(ApiResponse {
        data: outcome.into(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/vms/{vm_id}/stop",
    params(
        ("vm_id" = uuid::Uuid, Path, description = "VM unique identifier")
    ),
    responses(
        (status = 200, description = "VM stopped", body = VmAction),
        (status = 404, description = "VM not found")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn stop(
    Extension(env): Extension<App>,
    Path(vm_id): Path<Uuid>,
) -> Result<ApiResponse<VmAction>> {
    let outcome = env.vms().stop(vm_id).await?;
    Ok(ApiResponse {
        data: outcome.into(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/vms/{vm_id}/pause",
    params(
        ("vm_id" = uuid::Uuid, Path, description = "VM unique identifier")
    ),
    responses(
        (status = 200, description = "VM paused", body = VmAction),
        (status = 404, description = "VM not found")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn pause(
    Extension(env): Extension<App>,
    Path(vm_id): Path<Uuid>,
) -> Result<ApiResponse<VmAction>> {
    let outcome = env.vms().pause(vm_id).await?;
    Ok(ApiResponse {
        data: outcome.into(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/vms/{vm_id}/resume",
    params(
        ("vm_id" = uuid::Uuid, Path, description = "VM unique identifier")
    ),
    responses(
        (status = 200, description = "VM resumed", body = VmAction),
        (status = 404, description = "VM not found")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn resume(
    Extension(env): Extension<App>,
    Path(vm_id): Path<Uuid>,
) -> Result<ApiResponse<VmAction>> {
    let outcome = env.vms().resume(vm_id).await?;
    Ok(ApiResponse {
        data: outcome.into(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/vms/{vm_id}/restart",
    params(
        ("vm_id" = uuid::Uuid, Path, description = "VM unique identifier")
    ),
    responses(
        (status = 200, description = "VM restarted", body = VmAction),
        (status = 404, description = "VM, disk or ISO not found"),
        (status = 500, description = "Hypervisor failed to start")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn restart(
    Extension(env): Extension<App>,
    Path(vm_id): Path<Uuid>,
) -> Result<ApiResponse<VmAction>> {
    let outcome = env.vms().restart(vm_id).await?;
    Ok(ApiResponse {
        data: outcome.into(),
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/vms/{vm_id}/snapshot",
    params(
        ("vm_id" = uuid::Uuid, Path, description = "VM unique identifier")
    ),
    responses(
        (status = 201, description = "Overlay image created", body = VmSnapshot),
        (status = 404, description = "VM or disk not found"),
        (status = 500, description = "Image tool failure")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn snapshot(
    Extension(env): Extension<App>,
    Path(vm_id): Path<Uuid>,
) -> Result<ApiResponse<VmSnapshot>> {
    let snapshot = env.snapshots().create(vm_id).await?;
    Ok(ApiResponse {
        data: snapshot.into(),
        code: StatusCode::CREATED,
    })
}

#[utoipa::path(
    get,
    path = "/vms/{vm_id}/log",
    params(
        ("vm_id" = uuid::Uuid, Path, description = "VM unique identifier")
    ),
    responses(
        (status = 200, description = "Tail of the hypervisor output", body = VmLog),
        (status = 404, description = "VM not found")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn log(
    Extension(env): Extension<App>,
    Path(vm_id): Path<Uuid>,
) -> Result<ApiResponse<VmLog>> {
    let log = env.vms().log_tail(vm_id).await?;
    Ok(ApiResponse {
        data: VmLog { id: vm_id, log },
        code: StatusCode::OK,
    })
}
