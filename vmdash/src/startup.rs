use std::future::IntoFuture;
use std::sync::Arc;

use tokio::net::TcpListener;
use vmdash_node::image_tool::QemuImg;

use crate::{App, configuration::Settings, handlers::app};

/// Build the application state described by `configuration`.
pub async fn build(configuration: &Settings) -> vmdash_node::Result<App> {
    let dirs = configuration.storage.directories();
    let image_tool = Arc::new(QemuImg::new(&configuration.qemu.img_binary));
    App::open(
        &dirs,
        configuration.qemu.settings(),
        image_tool,
        configuration.application.max_upload_bytes,
    )
    .await
}

pub async fn run(
    listener: TcpListener,
    env: App,
) -> Result<impl IntoFuture<Output = std::io::Result<()>> + Send, Box<dyn std::error::Error + Send>>
{
    let app = app(env);
    let server = axum::serve(listener, app);
    Ok(server)
}
