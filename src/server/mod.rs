/// Server supervision module for the Studio backend runner.
///
/// This module handles everything between "we want a backend" and "the
/// backend is serving requests": allocating a loopback port, resolving
/// which runtime launches the server, owning the spawned process, and
/// probing/monitoring its health endpoint.
/// All public components are instrumented with `tracing` spans.
///
/// # Components
///
/// * `port` - Ephemeral loopback port allocation
/// * `locator` - Resolves the launch command for the current installation
/// * `process` - Core process supervision for the backend instance
/// * `health` - Readiness probing against the backend's HTTP surface
/// * `monitor` - Periodic health monitoring of a running backend
pub mod health;
pub mod locator;
pub mod monitor;
mod process;
pub mod port;
mod terminate;

pub use health::{HealthProbe, HealthReport, MlReadiness};
pub use locator::{LaunchPlan, LaunchSource};
pub use monitor::{HealthMonitor, HealthMonitorConfig};
pub use port::allocate_port;
pub use process::{BackendId, BackendProcess};
