//! GPU passthrough devices. Only the PCI wiring is handled here; the
//! device shows up in the guest through VFIO.

use crate::devices::{DeviceConfig, RunConfig};
use crate::{Error, Result};

pub fn validate(name: &str, config: &DeviceConfig) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidDevices {
        name: name.into(),
        reason: reason.into(),
    };

    let Some(slot) = config.get("pci") else {
        return Err(invalid("gpu devices require a pci address"));
    };

    if !slot
        .chars()
        .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
    {
        return Err(invalid("malformed pci address"));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_address_validation() {
        let mut config = DeviceConfig::new();
        config.insert("type".into(), "gpu".into());
        assert!(validate("gpu0", &config).is_err());

        config.insert("pci".into(), "0000:81:00.0".into());
        assert!(validate("gpu0", &config).is_ok());

        config.insert("pci".into(), "../../etc".into());
        assert!(validate("gpu0", &config).is_err());
    }
}
