//! Remaining device kinds: proxy, usb, pci and unix-char/unix-block.
//! These contribute no host-side wiring to the hypervisor launch but are
//! validated and tracked like any other device.

use crate::devices::{DeviceConfig, DeviceKind, RunConfig};
use crate::{Error, Result};

pub fn validate(name: &str, config: &DeviceConfig) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidDevices {
        name: name.into(),
        reason: reason.into(),
    };

    match DeviceKind::from_config(config)? {
        DeviceKind::Proxy => {
            if config.get("listen").is_none() || config.get("connect").is_none() {
                return Err(invalid("proxy devices require listen and connect"));
            }
        }
        DeviceKind::Pci => {
            if config.get("address").is_none() {
                return Err(invalid("pci devices require an address"));
            }
        }
        DeviceKind::UnixChar | DeviceKind::UnixBlock => {
            if config.get("path").is_none() && config.get("source").is_none() {
                return Err(invalid("unix devices require a path or source"));
            }
        }
        DeviceKind::Usb => {}
        _ => {}
    }

    Ok(())
}

pub fn start(name: &str, config: &DeviceConfig) -> Result<RunConfig> {
    validate(name, config)?;
    Ok(RunConfig::default())
}

pub fn stop(_name: &str, _config: &DeviceConfig) -> Result<RunConfig> {
    Ok(RunConfig::default())
}
