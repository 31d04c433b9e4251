//! Ephemeral loopback port allocation.

use crate::error::{Error, Result};
use tokio::net::TcpListener;

/// Obtain a free TCP port on loopback.
///
/// Binds a short-lived listener with port 0 so the OS assigns a free
/// ephemeral port, reads the assignment back, and releases the socket.
/// The port is not reserved afterwards; the backend is expected to bind it
/// promptly.
///
/// This function is instrumented with `tracing`.
#[tracing::instrument]
pub async fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| Error::PortAllocation(format!("Failed to bind loopback socket: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::PortAllocation(format!("Failed to read bound address: {}", e)))?
        .port();
    tracing::debug!(port, "Allocated ephemeral port");
    Ok(port)
}
