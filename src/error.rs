/// Error handling module for the Studio backend runner.
///
/// This module defines the error types used throughout the library.
/// It provides a comprehensive set of errors that can occur when
/// managing the local analysis server, along with helpful context
/// for debugging.
///
/// # Example
///
/// ```
/// use studio_backend::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::HealthCheckTimeout(msg)) => println!("Backend never became ready: {}", msg),
///         Err(Error::SetupRequired) => println!("No runtime available, run setup first"),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use thiserror::Error;

/// Errors that can occur in the studio-backend library.
///
/// This enum represents all possible error types that can be returned from
/// operations in the backend runner. Each variant includes context
/// information to help diagnose and handle the error appropriately.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to obtain a free loopback port from the OS.
    ///
    /// This error occurs when:
    /// - Ephemeral ports are exhausted
    /// - A sandbox forbids binding sockets
    #[error("Failed to allocate port: {0}")]
    PortAllocation(String),

    /// Failed to spawn the backend process at all.
    ///
    /// This error occurs when:
    /// - The resolved executable does not exist
    /// - The executable is not permitted to run
    #[error("Failed to spawn backend: {0}")]
    Spawn(String),

    /// Error while interacting with a running backend process.
    ///
    /// This error occurs when:
    /// - Stdout/stderr pipes cannot be taken from the child
    /// - Signaling or waiting on the child fails
    #[error("Backend process error: {0}")]
    Process(String),

    /// The backend process is running but never reported ready.
    ///
    /// This error occurs when:
    /// - The server takes longer than the readiness ceiling to bind
    /// - The server starts but its health endpoint keeps failing
    #[error("Health check timed out: {0}")]
    HealthCheckTimeout(String),

    /// Error in the HTTP layer while probing or downloading.
    ///
    /// This error occurs when:
    /// - A request cannot be built or sent
    /// - The response body cannot be decoded
    #[error("HTTP error: {0}")]
    Http(String),

    /// No runtime is available to launch the backend with.
    ///
    /// This error occurs when:
    /// - No managed runtime has been provisioned yet
    /// - No standalone executable is packaged
    /// - No development interpreter exists as a fallback
    #[error("No backend runtime available, setup required")]
    SetupRequired,

    /// A runtime provisioning step failed.
    ///
    /// This error occurs when:
    /// - The runtime archive cannot be downloaded or extracted
    /// - Environment creation or package installation fails
    #[error("Runtime setup error: {0}")]
    Provision(String),

    /// A user-supplied environment failed validation.
    ///
    /// This error occurs when:
    /// - The interpreter path does not exist
    /// - The interpreter version is below the supported minimum
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    /// Persisted settings could not be read or written.
    ///
    /// This error occurs when:
    /// - The settings file contains malformed JSON
    /// - The user-data directory is not writable
    #[error("Settings error: {0}")]
    Settings(String),

    /// Error in serializing or deserializing data.
    ///
    /// This error occurs when:
    /// - A health payload does not match the expected shape
    /// - Build metadata cannot be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other error not covered by the above categories.
    ///
    /// This is a catch-all error for cases not explicitly handled elsewhere.
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for studio-backend operations.
///
/// This is a convenience type alias for `std::result::Result` with the `Error` type
/// from this module. Use this throughout the library and in client code to handle
/// errors in a consistent way.
pub type Result<T> = std::result::Result<T, Error>;
