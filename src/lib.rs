//! stoker: QEMU virtual-machine lifecycle driver
//!
//! Takes a declarative instance description (identity, expanded config
//! map, expanded device set, architecture, storage pool binding) and
//! realizes it as a running, monitorable, mutable guest process.
//!
//! # Key Features
//!
//! - **Deterministic launches**: storage mounts, passed file descriptors
//!   and the hypervisor readconfig are derived from the instance record
//! - **Typed monitor protocol**: QMP request/response with an async event
//!   stream, driving suspend/resume/shutdown/quit
//! - **Device reconciliation**: desired vs. running device sets diffed
//!   and applied, honoring per-device hot-plug capability
//! - **Crash-safe state machine**: per-instance operation locks, LIFO
//!   rollback on failed starts, durable PID/NVRAM/volatile state
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stoker::{Driver, Instance};
//! use stoker::state::DriverState;
//!
//! async fn cycle(state: Arc<DriverState>, inst: Instance) -> stoker::Result<()> {
//!     let driver = Driver::new(state, inst)?;
//!     driver.start(false).await?;
//!     driver.shutdown(Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod agent;
pub mod certs;
pub mod configdrive;
pub mod cpu;
pub mod devices;
pub mod error;
pub mod instance;
pub mod monitor;
pub mod oplock;
pub mod qemu;
pub mod revert;
pub mod state;
pub mod template;
pub mod units;

// Re-exports for convenience
pub use error::{Error, Result};
pub use instance::{Architecture, Instance, InstanceArgs, Profile};
pub use qemu::{Driver, InstanceStateCode};

// Prelude for common imports
pub mod prelude {
    pub use crate::devices::{DeviceConfig, Devices, RunConfig};
    pub use crate::error::{Error, Result};
    pub use crate::instance::{Architecture, Instance, InstanceArgs, Profile};
    pub use crate::monitor::Monitor;
    pub use crate::oplock::{Action, OperationLockRegistry};
    pub use crate::qemu::{Driver, InstanceStateCode};
    pub use crate::state::{DriverState, HostConfig};
}
