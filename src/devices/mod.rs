//! Device management for instances.
//!
//! Devices are `(name, config)` pairs typed by `config["type"]`. The
//! manager loads, validates, starts and stops them, gates hot-plug while
//! the guest runs, and diffs desired against current sets for `Update`.
//!
//! Start order is the lexicographic device-name order and stop order its
//! reverse, so nested mount paths stack and unstack correctly.

pub mod disk;
pub mod generic;
pub mod gpu;
pub mod nic;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::instance::Instance;
use crate::state::InstanceStore;
use crate::{Error, Result};

/// Configuration map of one device.
pub type DeviceConfig = BTreeMap<String, String>;

/// Named device set, ordered by device name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Devices(BTreeMap<String, DeviceConfig>);

impl Devices {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&DeviceConfig> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: String, config: DeviceConfig) {
        self.0.insert(name, config);
    }

    pub fn remove(&mut self, name: &str) -> Option<DeviceConfig> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DeviceConfig)> {
        self.0.iter()
    }

    /// Devices in start order (lexicographic by name).
    pub fn sorted(&self) -> Vec<(&String, &DeviceConfig)> {
        self.0.iter().collect()
    }

    /// Devices in stop order (reverse of start order).
    pub fn reversed(&self) -> Vec<(&String, &DeviceConfig)> {
        self.0.iter().rev().collect()
    }
}

impl FromIterator<(String, DeviceConfig)> for Devices {
    fn from_iter<T: IntoIterator<Item = (String, DeviceConfig)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The device kinds known to this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Nic,
    Infiniband,
    Gpu,
    Proxy,
    Usb,
    Pci,
    UnixChar,
    UnixBlock,
}

impl DeviceKind {
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        match config.get("type").map(String::as_str) {
            Some("disk") => Ok(DeviceKind::Disk),
            Some("nic") => Ok(DeviceKind::Nic),
            Some("infiniband") => Ok(DeviceKind::Infiniband),
            Some("gpu") => Ok(DeviceKind::Gpu),
            Some("proxy") => Ok(DeviceKind::Proxy),
            Some("usb") => Ok(DeviceKind::Usb),
            Some("pci") => Ok(DeviceKind::Pci),
            Some("unix-char") => Ok(DeviceKind::UnixChar),
            Some("unix-block") => Ok(DeviceKind::UnixBlock),
            _ => Err(Error::UnsupportedDevType),
        }
    }

    /// Hot-plug capability and the config fields that may change without a
    /// remove-and-re-add cycle.
    pub fn can_hot_plug(&self) -> (bool, &'static [&'static str]) {
        match self {
            DeviceKind::Disk => (false, &["limits.read", "limits.write", "size"]),
            DeviceKind::Nic => (
                true,
                &[
                    "ipv4.address",
                    "ipv6.address",
                    "maas.subnet.ipv4",
                    "maas.subnet.ipv6",
                    "security.mac_filtering",
                ],
            ),
            DeviceKind::Infiniband => (false, &[]),
            DeviceKind::Gpu => (false, &[]),
            DeviceKind::Proxy => (true, &["listen", "connect"]),
            DeviceKind::Usb => (false, &[]),
            DeviceKind::Pci => (false, &[]),
            DeviceKind::UnixChar | DeviceKind::UnixBlock => (false, &[]),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Disk => "disk",
            DeviceKind::Nic => "nic",
            DeviceKind::Infiniband => "infiniband",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Proxy => "proxy",
            DeviceKind::Usb => "usb",
            DeviceKind::Pci => "pci",
            DeviceKind::UnixChar => "unix-char",
            DeviceKind::UnixBlock => "unix-block",
        };
        write!(f, "{name}")
    }
}

/// One host-side mount produced by a started device.
///
/// `target_path == "/"` marks the root disk; `fs_type == "9p"` marks a
/// directory share, anything else a block-like disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub dev_name: String,
    pub dev_path: String,
    pub target_path: String,
    pub fs_type: String,
    pub opts: Vec<String>,
}

/// Host-side NIC wiring produced by a started network device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub dev_name: String,
    /// Host link the guest NIC attaches to (tap/macvtap interface name).
    pub link: String,
    pub hwaddr: String,
    /// PCI address for physical passthrough, empty otherwise.
    pub pci_slot_name: String,
}

/// Cleanup callback run after a device stops.
pub type PostHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Host-side wiring a device contributes when started.
#[derive(Default)]
pub struct RunConfig {
    pub mounts: Vec<Mount>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub post_hooks: Vec<PostHook>,
}

impl RunConfig {
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.network_interfaces.is_empty() && self.post_hooks.is_empty()
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("mounts", &self.mounts)
            .field("network_interfaces", &self.network_interfaces)
            .field("post_hooks", &self.post_hooks.len())
            .finish()
    }
}

/// The `nictype` of a device, empty for non-NIC devices.
pub fn nic_type(config: &DeviceConfig) -> &str {
    config.get("nictype").map(String::as_str).unwrap_or("")
}

/// Load a device: resolve its kind and produce the config the device will
/// run with. NIC-like devices get generated volatile fields filled in;
/// everything else receives a deep copy so the device cannot mutate the
/// caller's state.
pub fn load(
    inst: &mut Instance,
    store: &dyn InstanceStore,
    name: &str,
    raw: &DeviceConfig,
) -> Result<(DeviceKind, DeviceConfig)> {
    let kind = DeviceKind::from_config(raw)?;

    let config = match kind {
        DeviceKind::Nic | DeviceKind::Infiniband => {
            nic::fill_network_device(inst, store, name, raw)?
        }
        _ => raw.clone(),
    };

    Ok((kind, config))
}

/// Validate a device config without starting it.
pub fn validate(name: &str, config: &DeviceConfig) -> Result<()> {
    let kind = DeviceKind::from_config(config)?;
    match kind {
        DeviceKind::Disk => disk::validate(name, config),
        DeviceKind::Nic | DeviceKind::Infiniband => nic::validate(name, config),
        DeviceKind::Gpu => gpu::validate(name, config),
        _ => generic::validate(name, config),
    }
}

/// Start a device and return its host-side wiring.
///
/// Denied with `NotHotPluggable` when the instance is running and the
/// device kind cannot attach live.
pub fn start(
    inst: &mut Instance,
    store: &dyn InstanceStore,
    name: &str,
    raw: &DeviceConfig,
    is_running: bool,
) -> Result<RunConfig> {
    let (kind, config) = load(inst, store, name, raw)?;

    let (can_hot_plug, _) = kind.can_hot_plug();
    if is_running && !can_hot_plug {
        return Err(Error::NotHotPluggable);
    }

    match kind {
        DeviceKind::Disk => disk::start(inst, name, &config),
        DeviceKind::Nic | DeviceKind::Infiniband => nic::start(inst, name, &config),
        DeviceKind::Gpu => gpu::start(name, &config),
        _ => generic::start(name, &config),
    }
}

/// Stop a device and run any post-stop hooks it produced.
pub fn stop(
    inst: &mut Instance,
    store: &dyn InstanceStore,
    name: &str,
    raw: &DeviceConfig,
    is_running: bool,
) -> Result<()> {
    let (kind, config) = load(inst, store, name, raw)?;

    let (can_hot_plug, _) = kind.can_hot_plug();
    if is_running && !can_hot_plug {
        return Err(Error::NotHotPluggable);
    }

    let run = match kind {
        DeviceKind::Disk => disk::stop(inst, name, &config)?,
        DeviceKind::Nic | DeviceKind::Infiniband => nic::stop(inst, name, &config)?,
        DeviceKind::Gpu => gpu::stop(name, &config)?,
        _ => generic::stop(name, &config)?,
    };

    for hook in run.post_hooks {
        hook()?;
    }

    Ok(())
}

/// Device creation hook, run when the device record is added.
pub fn add(
    inst: &mut Instance,
    store: &dyn InstanceStore,
    name: &str,
    raw: &DeviceConfig,
) -> Result<()> {
    let (kind, config) = load(inst, store, name, raw)?;
    match kind {
        DeviceKind::Disk => disk::add(inst, name, &config),
        _ => Ok(()),
    }
}

/// Device removal hook, run when the device record is deleted.
pub fn remove(
    inst: &mut Instance,
    store: &dyn InstanceStore,
    name: &str,
    raw: &DeviceConfig,
) -> Result<()> {
    let (kind, config) = match load(inst, store, name, raw) {
        Ok(loaded) => loaded,
        Err(Error::UnsupportedDevType) => return Err(Error::UnsupportedDevType),
        // Stricter validation must not keep an old device from being removed.
        Err(err) => {
            error!(device = name, %err, "device remove validation failed");
            (DeviceKind::from_config(raw)?, raw.clone())
        }
    };

    match kind {
        DeviceKind::Disk => disk::remove(inst, name, &config),
        _ => Ok(()),
    }
}

/// Apply an in-place device update for fields within its declared
/// update set. The change was already validated by the diff; device
/// kinds without live state to adjust only re-validate.
pub fn update(
    inst: &mut Instance,
    store: &dyn InstanceStore,
    name: &str,
    raw: &DeviceConfig,
    _old_devices: &Devices,
    _is_running: bool,
) -> Result<()> {
    let (kind, config) = load(inst, store, name, raw)?;
    match kind {
        DeviceKind::Disk => disk::validate(name, &config),
        DeviceKind::Nic | DeviceKind::Infiniband => nic::validate(name, &config),
        DeviceKind::Gpu => gpu::validate(name, &config),
        _ => generic::validate(name, &config),
    }
}

/// Result of diffing an old expanded device set against a new one.
#[derive(Debug, Default)]
pub struct DeviceDiff {
    pub remove: Devices,
    pub add: Devices,
    pub update: Devices,
    /// All config fields that differ on devices present in both sets.
    pub changed_fields: Vec<String>,
}

/// Classify the differences between two expanded device sets.
///
/// A device present in both sets counts as an update only when its type
/// and nictype are unchanged and every differing field is one the device
/// declares updateable; otherwise it is scheduled for remove-and-add.
pub fn update_diff(old: &Devices, new: &Devices) -> DeviceDiff {
    let mut diff = DeviceDiff::default();

    for (name, old_config) in old.iter() {
        let Some(new_config) = new.get(name) else {
            diff.remove.insert(name.clone(), old_config.clone());
            continue;
        };

        let changed = changed_keys(old_config, new_config);
        if changed.is_empty() {
            continue;
        }

        for key in &changed {
            if !diff.changed_fields.contains(key) {
                diff.changed_fields.push(key.clone());
            }
        }

        let same_type = old_config.get("type") == new_config.get("type")
            && nic_type(old_config) == nic_type(new_config);

        let updateable = same_type
            && DeviceKind::from_config(new_config)
                .map(|kind| {
                    let (_, update_fields) = kind.can_hot_plug();
                    changed.iter().all(|k| update_fields.contains(&k.as_str()))
                })
                .unwrap_or(false);

        if updateable {
            diff.update.insert(name.clone(), new_config.clone());
        } else {
            diff.remove.insert(name.clone(), old_config.clone());
            diff.add.insert(name.clone(), new_config.clone());
        }
    }

    for (name, new_config) in new.iter() {
        if !old.contains(name) {
            diff.add.insert(name.clone(), new_config.clone());
        }
    }

    diff
}

fn changed_keys(old: &DeviceConfig, new: &DeviceConfig) -> Vec<String> {
    let mut keys = Vec::new();
    for (k, v) in old {
        if new.get(k) != Some(v) {
            keys.push(k.clone());
        }
    }
    for k in new.keys() {
        if !old.contains_key(k) && !keys.contains(k) {
            keys.push(k.clone());
        }
    }
    keys
}

/// Clear a removed or re-typed device's volatile keys.
///
/// On type or nictype change every `volatile.<name>.*` key goes; on a
/// same-type re-add only the keys whose suffix reappears in the new config
/// are cleared.
pub fn reset_volatile(
    inst: &mut Instance,
    store: &dyn InstanceStore,
    name: &str,
    old_config: &DeviceConfig,
    new_config: Option<&DeviceConfig>,
) -> Result<()> {
    let prefix = format!("volatile.{name}.");
    let mut clear = Vec::new();

    let type_changed = match new_config {
        None => true,
        Some(new_config) => {
            new_config.get("type") != old_config.get("type")
                || nic_type(new_config) != nic_type(old_config)
        }
    };

    for key in inst.local_config.keys() {
        let Some(suffix) = key.strip_prefix(&prefix) else {
            continue;
        };

        if type_changed || new_config.is_some_and(|c| c.contains_key(suffix)) {
            clear.push(key.clone());
        }
    }

    for key in clear {
        store.volatile_delete(inst.id, &key)?;
        inst.local_config.remove(&key);
        inst.expanded_config.remove(&key);
    }

    Ok(())
}
