use tokio::net::TcpListener;

use common::telemtry::{get_subscriber, init_subscriber};
use vmdash::{
    configuration::get_configuration,
    startup::{build, run},
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let subscriber = get_subscriber("vmdash".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber);

    let configuration = get_configuration().expect("Failed to read configuration.");
    tracing::info!(
        "Storage root: {}, hypervisor: {}",
        configuration.storage.root.display(),
        configuration.qemu.binary.display()
    );

    let env = match build(&configuration).await {
        Ok(env) => env,
        Err(e) => {
            tracing::error!("Failed to initialize storage: {}", e);
            return Err(std::io::Error::other(e.to_string()));
        }
    };

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    tracing::info!("Starting server on {}", address);
    let listener = TcpListener::bind(address).await?;
    match run(listener, env).await {
        Ok(server) => {
            server.await?;
        }
        Err(e) => {
            tracing::error!("Server failed to start: {}", e);
        }
    }

    Ok(())
}
