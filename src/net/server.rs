use std::rc::Rc;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::capacity::Capacity;
use crate::net::connection::{self, Role};
use crate::net::registry::Registry;

/// Listen for peers offering their workers.
pub async fn start(port: u16, capacity: Rc<Capacity>, registry: Arc<Registry>) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(port, error = %err, "Cannot listen for peers");
            std::process::exit(1);
        }
    };
    tracing::info!(port, "Listening for peers");
    serve(listener, capacity, registry).await;
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, capacity: Rc<Capacity>, registry: Arc<Registry>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tracing::info!(%peer_addr, "Accepted peer connection");
                connection::establish(stream, Role::Server, capacity.clone(), registry.clone());
            }
            Err(err) => tracing::warn!(error = %err, "Failed to accept peer connection"),
        }
    }
}
