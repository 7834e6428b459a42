//! Network devices.
//!
//! NIC and infiniband devices carry a generated MAC address in
//! `volatile.<name>.hwaddr`. The address is generated once and persisted
//! through the instance store with a retry that tolerates a concurrent
//! writer filling the same key first.

use rand::Rng;
use tracing::debug;

use crate::devices::{DeviceConfig, NetworkInterface, RunConfig};
use crate::instance::Instance;
use crate::state::InstanceStore;
use crate::{Error, Result};

/// NIC types whose MAC comes from the hardware rather than generation.
const PHYSICAL_NIC_TYPES: [&str; 3] = ["physical", "ipvlan", "sriov"];

pub fn validate(name: &str, config: &DeviceConfig) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidDevices {
        name: name.into(),
        reason: reason.into(),
    };

    let dev_type = config.get("type").map(String::as_str).unwrap_or("");
    if dev_type == "infiniband" {
        if config.get("parent").is_none() {
            return Err(invalid("infiniband devices require a parent"));
        }
        return Ok(());
    }

    match config.get("nictype").map(String::as_str) {
        Some("bridged") | Some("macvtap") | Some("physical") | Some("sriov") | Some("ipvlan") => {
            if config.get("parent").is_none() {
                return Err(invalid("this nictype requires a parent"));
            }
            Ok(())
        }
        Some(_) => Err(invalid("unknown nictype")),
        None => Err(invalid("nic devices require a nictype")),
    }
}

/// Enrich a nic/infiniband config with the generated `hwaddr`.
///
/// Idempotent: once `volatile.<name>.hwaddr` exists no new address is
/// generated and no store write happens.
pub fn fill_network_device(
    inst: &mut Instance,
    store: &dyn InstanceStore,
    name: &str,
    raw: &DeviceConfig,
) -> Result<DeviceConfig> {
    let mut config = raw.clone();

    let skip = PHYSICAL_NIC_TYPES.contains(&super::nic_type(&config))
        || config.get("hwaddr").is_some_and(|v| !v.is_empty());
    if skip {
        return Ok(config);
    }

    let key = format!("volatile.{name}.hwaddr");
    let hwaddr = match inst.local_config.get(&key) {
        Some(existing) => existing.clone(),
        None => {
            let generated = next_interface_hwaddr();
            // The store resolves races: whichever writer lands first wins
            // and everyone observes that value.
            let stored = store.volatile_insert(inst.id, &key, &generated)?;
            if stored != generated {
                debug!(device = name, "concurrent writer filled hwaddr first");
            }
            inst.local_config.insert(key.clone(), stored.clone());
            inst.expanded_config.insert(key, stored.clone());
            stored
        }
    };

    config.insert("hwaddr".to_string(), hwaddr);
    Ok(config)
}

/// Generate a locally-administered MAC in the 00:16:3e prefix.
pub fn next_interface_hwaddr() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "00:16:3e:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

pub fn start(inst: &mut Instance, name: &str, config: &DeviceConfig) -> Result<RunConfig> {
    validate(name, config)?;

    // The host link is the interface created by the network layer when one
    // exists, otherwise the parent itself (macvtap/physical).
    let host_name_key = format!("volatile.{name}.host_name");
    let link = inst
        .local_config
        .get(&host_name_key)
        .cloned()
        .or_else(|| config.get("parent").cloned())
        .unwrap_or_default();

    let pci_slot_name = if super::nic_type(config) == "physical" {
        inst.local_config
            .get(&format!("volatile.{name}.last_state.pci.slot.name"))
            .cloned()
            .or_else(|| config.get("pci.slot.name").cloned())
            .unwrap_or_default()
    } else {
        String::new()
    };

    Ok(RunConfig {
        network_interfaces: vec![NetworkInterface {
            dev_name: name.to_string(),
            link,
            hwaddr: config.get("hwaddr").cloned().unwrap_or_default(),
            pci_slot_name,
        }],
        ..Default::default()
    })
}

pub fn stop(_inst: &mut Instance, _name: &str, _config: &DeviceConfig) -> Result<RunConfig> {
    Ok(RunConfig::default())
}
