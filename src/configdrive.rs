//! Config share builder.
//!
//! Before every launch the 9p-exported `config/` directory is rebuilt
//! from scratch: cloud-init seed data, the guest agent binary and its
//! certificates, systemd units to self-install the agent, and any
//! image-provided template output.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::certs;
use crate::instance::Instance;
use crate::state::DriverState;
use crate::template::{self, ImageMetadata, TemplateContext};
use crate::Result;

const AGENT_SERVICE_UNIT: &str = r#"[Unit]
Description=LXD - agent
ConditionPathExists=/dev/virtio-ports/org.linuxcontainers.lxd
Requires=lxd-agent-9p.service
After=lxd-agent-9p.service
Before=cloud-init.target

[Service]
Type=simple
WorkingDirectory=/run/lxd_config/9p
ExecStart=/run/lxd_config/9p/lxd-agent

[Install]
WantedBy=multi-user.target
"#;

const AGENT_MOUNT_UNIT: &str = r#"[Unit]
Description=LXD - agent - 9p mount
ConditionPathExists=/dev/virtio-ports/org.linuxcontainers.lxd

[Service]
Type=oneshot
RemainAfterExit=yes
ExecStartPre=-/sbin/modprobe 9pnet_virtio
ExecStartPre=/bin/mkdir -p /run/lxd_config/9p
ExecStartPre=/bin/chmod 0700 /run/lxd_config/
ExecStart=/bin/mount -t 9p config /run/lxd_config/9p -o access=0,trans=virtio

[Install]
WantedBy=multi-user.target
"#;

const INSTALL_SCRIPT: &str = r#"#!/bin/sh
if [ ! -e "systemd" ] || [ ! -e "lxd-agent" ]; then
    echo "This script must be run from within the 9p mount"
    exit 1
fi

if [ ! -e "/lib/systemd/system" ]; then
    echo "This script only works on systemd systems"
    exit 1
fi

cp systemd/lxd-agent.service /lib/systemd/system/
cp systemd/lxd-agent-9p.service /lib/systemd/system/
systemctl daemon-reload
systemctl enable lxd-agent.service lxd-agent-9p.service

echo ""
echo "Agent has been installed, reboot to confirm setup."
echo "To start it now, unmount this filesystem and run: systemctl start lxd-agent-9p lxd-agent"
"#;

/// Rebuild the instance's exported config directory.
///
/// The tree is assembled writable and sealed read-only directory by
/// directory; the drive root itself stays writable until `seal` runs,
/// since the config emission step still drops `agent-mounts.json` there.
pub fn generate(state: &DriverState, inst: &mut Instance) -> Result<()> {
    let drive = state.config_drive_path(inst);

    if drive.exists() {
        remove_readonly_tree(&drive)?;
    }
    create_dir_mode(&drive, 0o700)?;

    write_cloud_init(inst, &drive)?;
    install_agent_binary(state, &drive)?;
    write_certs(state, inst, &drive)?;
    write_systemd_units(&drive)?;

    let files_dir = drive.join("files");
    create_dir_mode(&files_dir, 0o700)?;

    // One-shot template trigger: consumed and cleared before the regular
    // start trigger runs.
    let apply_key = "volatile.apply_template";
    if let Some(trigger) = inst.local_config.get(apply_key).cloned() {
        template_apply(state, inst, &trigger, &files_dir)?;
        state.store.volatile_delete(inst.id, apply_key)?;
        inst.local_config.remove(apply_key);
        inst.expanded_config.remove(apply_key);
    }

    template_apply(state, inst, "start", &files_dir)?;

    fs::set_permissions(&files_dir, fs::Permissions::from_mode(0o500))?;
    Ok(())
}

/// Make the populated config drive read-only for the 9p export.
pub fn seal(state: &DriverState, inst: &Instance) -> Result<()> {
    let drive = state.config_drive_path(inst);
    fs::set_permissions(&drive, fs::Permissions::from_mode(0o500))?;
    Ok(())
}

fn write_cloud_init(inst: &Instance, drive: &Path) -> Result<()> {
    let cloud_init = drive.join("cloud-init");
    create_dir_mode(&cloud_init, 0o700)?;

    let user_data = inst
        .expanded_config
        .get("user.user-data")
        .cloned()
        .unwrap_or_else(|| "#cloud-config\n".to_string());
    write_file_mode(&cloud_init.join("user-data"), user_data.as_bytes(), 0o400)?;

    let vendor_data = inst
        .expanded_config
        .get("user.vendor-data")
        .cloned()
        .unwrap_or_else(|| "#cloud-config\n".to_string());
    write_file_mode(&cloud_init.join("vendor-data"), vendor_data.as_bytes(), 0o400)?;

    match inst.expanded_config.get("user.network-config") {
        Some(network_config) => write_file_mode(
            &cloud_init.join("network-config"),
            network_config.as_bytes(),
            0o400,
        )?,
        None => {
            let stale = cloud_init.join("network-config");
            if stale.exists() {
                fs::remove_file(stale)?;
            }
        }
    }

    let user_meta = inst
        .expanded_config
        .get("user.meta-data")
        .map(String::as_str)
        .unwrap_or("");
    let meta_data = format!(
        "instance-id: {name}\nlocal-hostname: {name}\n{user_meta}\n",
        name = inst.name
    );
    write_file_mode(&cloud_init.join("meta-data"), meta_data.as_bytes(), 0o400)?;

    fs::set_permissions(&cloud_init, fs::Permissions::from_mode(0o500))?;
    Ok(())
}

fn install_agent_binary(state: &DriverState, drive: &Path) -> Result<()> {
    let Some(source) = find_on_path(&state.host.agent_binary) else {
        warn!(
            binary = %state.host.agent_binary,
            "guest agent binary not found on PATH, skipping its inclusion in the config drive"
        );
        return Ok(());
    };

    let target = drive.join(&state.host.agent_binary);
    fs::copy(&source, &target)?;
    fs::set_permissions(&target, fs::Permissions::from_mode(0o500))?;

    // The share is exported with access=0, so only in-guest root can read
    // the binary once ownership is root:root.
    if let Err(err) = nix::unistd::chown(
        &target,
        Some(nix::unistd::Uid::from_raw(0)),
        Some(nix::unistd::Gid::from_raw(0)),
    ) {
        warn!(%err, "failed to chown agent binary to root");
    }

    Ok(())
}

fn write_certs(state: &DriverState, inst: &Instance, drive: &Path) -> Result<()> {
    let certs = certs::find_or_generate(&state.instance_path(inst), &inst.name)?;

    // The guest verifies us against our client certificate.
    write_file_mode(&drive.join("server.crt"), certs.client_cert.as_bytes(), 0o400)?;
    write_file_mode(&drive.join("agent.crt"), certs.server_cert.as_bytes(), 0o400)?;
    write_file_mode(&drive.join("agent.key"), certs.server_key.as_bytes(), 0o400)?;

    Ok(())
}

fn write_systemd_units(drive: &Path) -> Result<()> {
    let systemd = drive.join("systemd");
    create_dir_mode(&systemd, 0o700)?;

    write_file_mode(
        &systemd.join("lxd-agent.service"),
        AGENT_SERVICE_UNIT.as_bytes(),
        0o400,
    )?;
    write_file_mode(
        &systemd.join("lxd-agent-9p.service"),
        AGENT_MOUNT_UNIT.as_bytes(),
        0o400,
    )?;
    write_file_mode(&drive.join("install.sh"), INSTALL_SCRIPT.as_bytes(), 0o700)?;

    fs::set_permissions(&systemd, fs::Permissions::from_mode(0o500))?;
    Ok(())
}

/// Render every image template whose `when` list names the trigger.
pub fn template_apply(
    state: &DriverState,
    inst: &Instance,
    trigger: &str,
    files_dir: &Path,
) -> Result<()> {
    let metadata_path = state.instance_path(inst).join("metadata.json");
    if !metadata_path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&metadata_path)?;
    let metadata: ImageMetadata = serde_json::from_str(&raw)?;

    let mut instance_meta = BTreeMap::new();
    instance_meta.insert("name".to_string(), inst.name.clone());
    instance_meta.insert(
        "architecture".to_string(),
        inst.architecture.name().to_string(),
    );
    instance_meta.insert("ephemeral".to_string(), inst.ephemeral.to_string());

    let templates_dir = state.templates_path(inst);
    for (tpl_path, spec) in &metadata.templates {
        if !spec.when.iter().any(|when| when == trigger) {
            continue;
        }

        debug!(template = %spec.template, trigger, "rendering template");
        let source = template::load_template(&templates_dir, &spec.template)?;
        let rendered = template::render(
            &source,
            &TemplateContext {
                trigger,
                path: tpl_path,
                instance: &instance_meta,
                config: &inst.expanded_config,
                devices: &inst.expanded_devices,
                properties: &spec.properties,
            },
        );

        let output = files_dir.join(format!("{}.out", spec.template));
        write_file_mode(&output, rendered.as_bytes(), 0o644)?;
    }

    Ok(())
}

/// Delete a directory tree whose directories are kept read-only between
/// launches.
fn remove_readonly_tree(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_readonly_tree(&entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    fs::remove_dir(path)?;
    Ok(())
}

pub(crate) fn create_dir_mode(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

pub(crate) fn write_file_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Look an executable up on PATH.
pub fn find_on_path(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            let is_executable = fs::metadata(&candidate)
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false);
            if is_executable {
                return Some(candidate);
            }
        }
    }
    None
}
