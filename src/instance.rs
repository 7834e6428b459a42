//! Instance records and configuration expansion.
//!
//! An instance carries two layers of configuration: the keys set directly
//! on it (`local_config`/`local_devices`) and the effective view with
//! profiles merged underneath (`expanded_config`/`expanded_devices`).
//! Expansion is a pure function of the local layer and the profile list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::devices::Devices;
use crate::{Error, Result};

/// Separator between a parent instance name and its snapshot name.
pub const SNAPSHOT_DELIMITER: &str = "/";

/// Flat string-keyed configuration map, ordered for deterministic output.
pub type ConfigMap = BTreeMap<String, String>;

/// Guest CPU architectures this driver can launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86_64,
    Aarch64,
    Ppc64le,
}

impl Architecture {
    /// Hypervisor binary name for this guest architecture.
    pub fn hypervisor_binary(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "qemu-system-x86_64",
            Architecture::Aarch64 => "qemu-system-aarch64",
            Architecture::Ppc64le => "qemu-system-ppc64",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Aarch64 => "aarch64",
            Architecture::Ppc64le => "ppc64le",
        }
    }

    /// UEFI firmware applies everywhere except ppc64le.
    pub fn uses_uefi(&self) -> bool {
        !matches!(self, Architecture::Ppc64le)
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "x86_64" => Ok(Architecture::X86_64),
            "aarch64" => Ok(Architecture::Aarch64),
            "ppc64le" => Ok(Architecture::Ppc64le),
            other => Err(Error::context(format!(
                "Architecture {other:?} isn't supported for virtual machines"
            ))),
        }
    }
}

/// A named profile contributing config and devices below the local layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub devices: Devices,
}

/// Mutable subset of an instance accepted by `Update`.
#[derive(Debug, Clone, Default)]
pub struct InstanceArgs {
    pub description: String,
    pub architecture: Option<Architecture>,
    pub ephemeral: bool,
    pub config: ConfigMap,
    pub devices: Devices,
    pub profiles: Vec<Profile>,
    /// Snapshot expiry, milliseconds since the epoch. Zero means none.
    pub expiry_ms: u64,
}

/// Identity and configuration of one virtual machine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    pub project: String,
    #[serde(default)]
    pub description: String,
    pub architecture: Architecture,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub snapshot: bool,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub local_config: ConfigMap,
    #[serde(default)]
    pub local_devices: Devices,
    #[serde(skip)]
    pub expanded_config: ConfigMap,
    #[serde(skip)]
    pub expanded_devices: Devices,
    #[serde(default)]
    pub created_ms: u64,
    #[serde(default)]
    pub last_used_ms: u64,
    #[serde(default)]
    pub expiry_ms: u64,
}

impl Instance {
    /// Recompute the expanded layers from profiles plus local overrides.
    pub fn expand(&mut self) {
        let (config, devices) = expand(&self.local_config, &self.local_devices, &self.profiles);
        self.expanded_config = config;
        self.expanded_devices = devices;
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// vsock context id; 3 is the first usable guest CID.
    pub fn vsock_id(&self) -> u32 {
        self.id as u32 + 3
    }

    /// Name used for on-disk paths, prefixed with the project when it is
    /// not the default one.
    pub fn storage_name(&self) -> String {
        storage_name(&self.project, &self.name)
    }

    /// Split a snapshot name into (parent, snapshot) parts.
    pub fn parent_and_snapshot_name(&self) -> Option<(&str, &str)> {
        self.name.split_once(SNAPSHOT_DELIMITER)
    }

    /// Effective boolean config value, honoring common truthy spellings.
    pub fn config_bool(&self, key: &str, default: bool) -> bool {
        match self.expanded_config.get(key) {
            Some(value) => is_true(value),
            None => default,
        }
    }

    /// Validate the identity invariants of this record.
    pub fn validate(&self) -> Result<()> {
        valid_name(&self.name, self.snapshot)?;

        if self.snapshot && !self.name.contains(SNAPSHOT_DELIMITER) {
            return Err(Error::context(
                "Snapshot instances require a parent name and snapshot suffix",
            ));
        }

        Ok(())
    }
}

/// Compute the expanded config and device layers.
pub fn expand(
    local_config: &ConfigMap,
    local_devices: &Devices,
    profiles: &[Profile],
) -> (ConfigMap, Devices) {
    let mut config = ConfigMap::new();
    let mut devices = Devices::new();

    for profile in profiles {
        for (k, v) in &profile.config {
            config.insert(k.clone(), v.clone());
        }
        for (name, dev) in profile.devices.iter() {
            devices.insert(name.clone(), dev.clone());
        }
    }

    for (k, v) in local_config {
        config.insert(k.clone(), v.clone());
    }
    for (name, dev) in local_devices.iter() {
        devices.insert(name.clone(), dev.clone());
    }

    (config, devices)
}

/// Default-project aware storage/log directory name.
pub fn storage_name(project: &str, name: &str) -> String {
    if project.is_empty() || project == "default" {
        name.replace(SNAPSHOT_DELIMITER, "-")
    } else {
        format!("{project}_{name}").replace(SNAPSHOT_DELIMITER, "-")
    }
}

/// Keys under `volatile.` are driver-owned and read-only to users.
pub fn is_volatile_key(key: &str) -> bool {
    key.starts_with("volatile.")
}

/// Keys under `image.` are fixed after instance creation.
pub fn is_image_key(key: &str) -> bool {
    key.starts_with("image.")
}

pub fn is_true(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes" | "on")
}

/// Validate an instance name. Snapshot names carry exactly one delimiter
/// separating a valid parent name from a valid snapshot suffix.
pub fn valid_name(name: &str, is_snapshot: bool) -> Result<()> {
    let invalid = |reason: &str| Error::context(format!("Invalid instance name {name:?}: {reason}"));

    if is_snapshot {
        let (parent, snap) = name
            .split_once(SNAPSHOT_DELIMITER)
            .ok_or_else(|| invalid("missing snapshot delimiter"))?;
        valid_single_name(parent).map_err(|_| invalid("bad parent name"))?;
        valid_single_name(snap).map_err(|_| invalid("bad snapshot name"))?;
        return Ok(());
    }

    if name.contains(SNAPSHOT_DELIMITER) {
        return Err(invalid("snapshot delimiter not allowed"));
    }

    valid_single_name(name)
}

fn valid_single_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::context(format!("Invalid instance name {name:?}: {reason}"));

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > 63 {
        return Err(invalid("longer than 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(invalid("only letters, digits and hyphens are allowed"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("may not start or end with a hyphen"));
    }
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Err(invalid("may not start with a digit"));
    }

    Ok(())
}
