use stellar_collab::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    log::info!(
        "Starting stellar-collab on {} (idle timeout {:?}, conflict window {:?})",
        config.bind_addr,
        config.idle_timeout(),
        config.conflict_window()
    );

    let server = CollabServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
