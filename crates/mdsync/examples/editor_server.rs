use mdsync::{
    ActorConfig, DocumentRegistry, FileStorage, FsBlobStore, MemoryMetadataStore, Services,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting editor server...");

    // Optional JSON actor configuration as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => ActorConfig::from_json(&tokio::fs::read_to_string(path).await?)?,
        None => ActorConfig::default(),
    };

    let services = Services::new(
        Arc::new(FileStorage::open("data/updates").await?),
        Arc::new(FsBlobStore::open("data/blobs").await?),
        Arc::new(MemoryMetadataStore::new()),
    );
    let registry = Arc::new(DocumentRegistry::with_config(services, config));

    // Exports interrupted by the last shutdown
    registry.resume_alarms().await?;

    // Periodically stop actors nobody is connected to
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                let evicted = registry.evict_idle().await;
                if evicted > 0 {
                    info!("Evicted {} idle document actors", evicted);
                }
            }
        });
    }

    let app = mdsync::router(registry);

    // Start server
    let listener = TcpListener::bind("127.0.0.1:3001").await?;
    info!("Server running on http://127.0.0.1:3001");
    info!("API endpoints:");
    info!("  POST   /editors          - Create an editor");
    info!("  DELETE /editors/:id      - Delete an editor and its content");
    info!("  GET    /editors/:id/doc  - Snapshot of the document state");
    info!("  GET    /editors/:id/ws   - Real-time sync WebSocket");

    axum::serve(listener, app).await?;

    Ok(())
}
