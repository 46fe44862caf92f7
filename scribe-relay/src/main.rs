use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use scribe_relay::{
    CollabService, Directory, DocumentStore, FileStore, MemoryStore, RelayConfig, RelayError,
    RelayServer,
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Relay stopped: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), RelayError> {
    info!("Starting scribe-relay...");
    let config = RelayConfig::load()?;

    let directory = Arc::new(match &config.directory_path {
        Some(path) => Directory::load(path)?,
        None => {
            info!("No directory file configured, every join will be denied");
            Directory::new()
        }
    });

    let store: Arc<dyn DocumentStore> = match &config.storage_path {
        Some(path) => Arc::new(FileStore::open(path).await?),
        None => {
            info!("No storage path configured, documents live in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let service = Arc::new(CollabService::new(
        &config,
        directory.clone(),
        directory,
        store,
    ));
    let server = RelayServer::new(config, service.clone());

    tokio::select! {
        result = server.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
        }
    }

    let flushed = service.shutdown().await?;
    info!("Flushed {flushed} document(s), bye");
    Ok(())
}
