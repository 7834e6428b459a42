//! Disk devices: the root disk plus supplementary block devices and
//! directory shares.

use crate::devices::{DeviceConfig, Mount, RunConfig};
use crate::instance::{is_true, Instance};
use crate::{Error, Result};

pub fn validate(name: &str, config: &DeviceConfig) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidDevices {
        name: name.into(),
        reason: reason.into(),
    };

    let path = config.get("path").map(String::as_str).unwrap_or("");
    let source = config.get("source").map(String::as_str).unwrap_or("");

    if path.is_empty() {
        return Err(invalid("disk devices require a path"));
    }

    if path == "/" {
        if config.get("pool").map(String::as_str).unwrap_or("").is_empty() {
            return Err(invalid("the root disk requires a pool"));
        }
        if !source.is_empty() {
            return Err(invalid("the root disk may not have a source"));
        }
        return Ok(());
    }

    if source.is_empty() {
        return Err(invalid("non-root disk devices require a source"));
    }

    Ok(())
}

/// Produce the mount entry for this disk.
///
/// The root disk's device path is left empty; the config builder resolves
/// it through the storage pool when emitting the drive section. Directory
/// sources become 9p shares.
pub fn start(_inst: &mut Instance, name: &str, config: &DeviceConfig) -> Result<RunConfig> {
    validate(name, config)?;

    let path = config.get("path").cloned().unwrap_or_default();
    let source = config.get("source").cloned().unwrap_or_default();

    let mut opts = Vec::new();
    if is_true(config.get("readonly").map(String::as_str).unwrap_or("")) {
        opts.push("ro".to_string());
    }

    let fs_type = if path != "/" && std::path::Path::new(&source).is_dir() {
        "9p".to_string()
    } else {
        config.get("fs").cloned().unwrap_or_default()
    };

    Ok(RunConfig {
        mounts: vec![Mount {
            dev_name: name.to_string(),
            dev_path: source,
            target_path: path,
            fs_type,
            opts,
        }],
        ..Default::default()
    })
}

pub fn stop(_inst: &mut Instance, _name: &str, _config: &DeviceConfig) -> Result<RunConfig> {
    Ok(RunConfig::default())
}

/// Creation hook. The root volume itself is created by the storage pool;
/// only the config shape is checked here.
pub fn add(_inst: &mut Instance, name: &str, config: &DeviceConfig) -> Result<()> {
    validate(name, config)
}

pub fn remove(_inst: &mut Instance, _name: &str, _config: &DeviceConfig) -> Result<()> {
    Ok(())
}
