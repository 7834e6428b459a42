//! Error types for stoker

use thiserror::Error;

use crate::oplock::Action;

/// Result type alias using the stoker Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving an instance
#[derive(Error, Debug)]
pub enum Error {
    /// Operation requires a stopped instance
    #[error("The instance is already running")]
    AlreadyRunning,

    /// Operation requires a running instance
    #[error("The instance is already stopped")]
    AlreadyStopped,

    /// Another lifecycle operation holds the instance lock
    #[error("Instance is already running a {0} operation")]
    AlreadyRunningOperation(Action),

    /// The QMP transport was lost. Callers of powerdown/quit treat this
    /// as success since the guest may exit before the reply arrives.
    #[error("Monitor is disconnected")]
    MonitorDisconnect,

    /// The in-guest agent is not reachable
    #[error("VM agent isn't currently running")]
    AgentOffline,

    /// Device operation denied while the instance is running
    #[error("Device cannot be changed when instance is running")]
    NotHotPluggable,

    /// Device kind unknown to this build
    #[error("Unsupported device type")]
    UnsupportedDevType,

    /// A configuration key failed validation
    #[error("Invalid config key {key:?}: {reason}")]
    InvalidConfig { key: String, reason: String },

    /// A device entry failed validation
    #[error("Invalid device {name:?}: {reason}")]
    InvalidDevices { name: String, reason: String },

    /// Functionality not implemented for virtual machines
    #[error("{0} isn't supported for virtual machines")]
    Unsupported(&'static str),

    /// Delete blocked by security.protection.delete
    #[error("Instance is protected")]
    Protected,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hypervisor process failed to launch
    #[error("Failed to run hypervisor: {stderr}")]
    Spawn { stderr: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// System call errors
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// Transport-level failure talking to the guest agent
    #[error("Agent transport error: {0}")]
    Transport(String),

    /// Wrapped host-level failure with a single line of context
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Wrap an arbitrary failure with a one-line context message.
    pub fn context(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True when a monitor command failed because the transport went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::MonitorDisconnect)
    }
}
