//! Hypervisor configuration emission.
//!
//! Two artifacts come out of here: the `-readconfig` file describing the
//! machine, and the ordered list of host files whose descriptors are
//! passed to the hypervisor at fd 3 and up. Sections are emitted
//! deterministically so a given instance always produces the same file.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::configdrive::write_file_mode;
use crate::devices::{DeviceKind, RunConfig};
use crate::instance::{Architecture, Instance};
use crate::monitor::RINGBUF_SIZE_BYTES;
use crate::state::DriverState;
use crate::units::parse_byte_size;
use crate::{cpu, Error, Result};

/// Default memory size when `limits.memory` is unset.
const DEFAULT_MEMORY_BYTES: u64 = 1 << 30;

/// One 9p share the guest agent must mount, in emission order.
#[derive(Debug, Clone, Serialize)]
pub struct AgentMount {
    pub source: String,
    pub target: String,
    #[serde(rename = "fsType")]
    pub fs_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Result of config emission.
#[derive(Debug)]
pub struct GeneratedConfig {
    pub conf_file: PathBuf,
    /// Host files opened and passed through as fd 3, 4, ...
    pub fd_files: Vec<PathBuf>,
}

/// Emit the readconfig file and `agent-mounts.json`, returning the config
/// path and fd pass-through list.
pub fn generate(
    state: &DriverState,
    inst: &Instance,
    run_configs: &[RunConfig],
) -> Result<GeneratedConfig> {
    let built = build(state, inst, run_configs)?;

    let agent_mounts_json = serde_json::to_vec(&built.agent_mounts)?;
    write_file_mode(
        &state.config_drive_path(inst).join("agent-mounts.json"),
        &agent_mounts_json,
        0o400,
    )?;

    let conf_file = state.conf_file_path(inst);
    write_file_mode(&conf_file, built.text.as_bytes(), 0o640)?;
    debug!(conf = %conf_file.display(), fds = built.fd_files.len(), "wrote hypervisor config");

    Ok(GeneratedConfig {
        conf_file,
        fd_files: built.fd_files,
    })
}

pub(crate) struct BuiltConfig {
    pub text: String,
    pub fd_files: Vec<PathBuf>,
    pub agent_mounts: Vec<AgentMount>,
}

pub(crate) fn build(
    state: &DriverState,
    inst: &Instance,
    run_configs: &[RunConfig],
) -> Result<BuiltConfig> {
    let mut sb = String::new();
    let mut fd_files: Vec<PathBuf> = Vec::new();
    let mut agent_mounts: Vec<AgentMount> = Vec::new();

    add_base(&mut sb, inst.architecture);
    add_memory(&mut sb, inst)?;
    add_cpu(&mut sb, inst)?;
    add_firmware(&mut sb, state, inst);
    add_vsock(&mut sb, inst);
    add_monitor(&mut sb, state, inst);
    add_config_drive(&mut sb, state, inst);

    let boot_indexes = boot_priorities(inst)?;

    let mut nic_index = 0;
    for run in run_configs {
        for mount in &run.mounts {
            if mount.target_path == "/" {
                add_root_drive(&mut sb, state, inst, &boot_indexes, &mount.dev_name)?;
            } else if mount.fs_type == "9p" {
                add_drive_dir(&mut sb, &mut fd_files, &mut agent_mounts, mount);
            } else {
                add_drive(&mut sb, &boot_indexes, &mount.dev_name, Path::new(&mount.dev_path));
            }
        }

        for nic in &run.network_interfaces {
            add_net_dev(&mut sb, state, &boot_indexes, nic_index, nic, &mut fd_files)?;
            nic_index += 1;
        }
    }

    Ok(BuiltConfig {
        text: sb,
        fd_files,
        agent_mounts,
    })
}

/// Map device name to hypervisor boot index.
///
/// Disks and NICs sort by explicit `boot.priority` descending; a root
/// disk without one ranks above any other unset device. The sort is
/// stable, so equal priorities keep device-map order.
pub(crate) fn boot_priorities(inst: &Instance) -> Result<BTreeMap<String, usize>> {
    let mut devices: Vec<(String, u32)> = Vec::new();

    for (name, config) in inst.expanded_devices.iter() {
        let kind = match DeviceKind::from_config(config) {
            Ok(kind) => kind,
            Err(_) => continue,
        };
        if !matches!(kind, DeviceKind::Disk | DeviceKind::Nic) {
            continue;
        }

        let priority = match config.get("boot.priority") {
            Some(raw) => raw.parse::<u32>().map_err(|_| Error::InvalidDevices {
                name: name.clone(),
                reason: format!("invalid boot.priority {raw:?}"),
            })?,
            None if config.get("path").map(String::as_str) == Some("/") => 1,
            None => 0,
        };

        devices.push((name.clone(), priority));
    }

    devices.sort_by(|a, b| b.1.cmp(&a.1));

    Ok(devices
        .into_iter()
        .enumerate()
        .map(|(index, (name, _))| (name, index))
        .collect())
}

/// Register a host file for fd pass-through. The first entry lands on
/// fd 3.
fn add_file_descriptor(fd_files: &mut Vec<PathBuf>, path: PathBuf) -> usize {
    fd_files.push(path);
    2 + fd_files.len()
}

fn add_base(sb: &mut String, arch: Architecture) {
    let (machine, accel) = match arch {
        Architecture::X86_64 => ("q35", "kvm"),
        Architecture::Aarch64 => ("virt", "kvm"),
        Architecture::Ppc64le => ("pseries", "tcg"),
    };

    let _ = write!(
        sb,
        r#"# Machine
[machine]
graphics = "off"
type = "{machine}"
accel = "{accel}"
usb = "off"

[boot-opts]
strict = "on"

# Console
[chardev "console"]
backend = "ringbuf"
size = "{ringbuf}"

"#,
        ringbuf = RINGBUF_SIZE_BYTES,
    );
}

fn add_memory(sb: &mut String, inst: &Instance) -> Result<()> {
    let mem_bytes = match inst.expanded_config.get("limits.memory") {
        Some(raw) => parse_byte_size(raw)?,
        None => DEFAULT_MEMORY_BYTES,
    };

    let _ = write!(
        sb,
        r#"# Memory
[memory]
size = "{mem_bytes}B"

"#
    );
    Ok(())
}

fn add_cpu(sb: &mut String, inst: &Instance) -> Result<()> {
    let limit = inst
        .expanded_config
        .get("limits.cpu")
        .map(String::as_str)
        .unwrap_or("1");

    let (count, sockets, cores, threads) = match limit.parse::<u64>() {
        // A plain count exposes single-thread cores on one socket.
        Ok(count) => (count, 1, count, 1),
        Err(_) => {
            let host = cpu::HostTopology::detect()?;
            let topo = cpu::solve(&host, &inst.name, limit)?;
            (topo.vcpu_count(), topo.sockets, topo.cores, topo.threads)
        }
    };

    let _ = write!(
        sb,
        r#"# CPU
[smp-opts]
cpus = "{count}"
sockets = "{sockets}"
cores = "{cores}"
threads = "{threads}"

"#
    );
    Ok(())
}

fn add_firmware(sb: &mut String, state: &DriverState, inst: &Instance) {
    if !inst.architecture.uses_uefi() {
        return;
    }

    let code = state.host.ovmf_path().join("OVMF_CODE.fd");
    let nvram = state.nvram_path(inst);

    let _ = write!(
        sb,
        r#"# Firmware (read only)
[drive]
file = "{code}"
if = "pflash"
format = "raw"
unit = "0"
readonly = "on"

# Firmware settings (writable)
[drive]
file = "{nvram}"
if = "pflash"
format = "raw"
unit = "1"

"#,
        code = code.display(),
        nvram = nvram.display(),
    );
}

fn add_vsock(sb: &mut String, inst: &Instance) {
    let _ = write!(
        sb,
        r#"# Vsock
[device "qemu_vsock"]
driver = "vhost-vsock-pci"
guest-cid = "{cid}"

"#,
        cid = inst.vsock_id(),
    );
}

fn add_monitor(sb: &mut String, state: &DriverState, inst: &Instance) {
    let _ = write!(
        sb,
        r#"# Qemu control
[chardev "monitor"]
backend = "socket"
path = "{path}"
server = "on"
wait = "off"

[mon]
chardev = "monitor"
mode = "control"

"#,
        path = state.monitor_path(inst).display(),
    );
}

fn add_config_drive(sb: &mut String, state: &DriverState, inst: &Instance) {
    let _ = write!(
        sb,
        r#"# Config drive
[fsdev "qemu_config"]
fsdriver = "local"
security_model = "none"
readonly = "on"
path = "{path}"

[device "dev-qemu_config"]
driver = "virtio-9p-pci"
fsdev = "qemu_config"
mount_tag = "config"

"#,
        path = state.config_drive_path(inst).display(),
    );
}

fn add_root_drive(
    sb: &mut String,
    state: &DriverState,
    inst: &Instance,
    boot_indexes: &BTreeMap<String, usize>,
    dev_name: &str,
) -> Result<()> {
    let disk_path = state.pool.instance_disk_path(inst)?;
    add_drive(sb, boot_indexes, dev_name, &disk_path);
    Ok(())
}

fn add_drive(
    sb: &mut String,
    boot_indexes: &BTreeMap<String, usize>,
    dev_name: &str,
    dev_path: &Path,
) {
    let boot_index = boot_indexes.get(dev_name).copied().unwrap_or(0);
    let _ = write!(
        sb,
        r#"# {dev_name} drive
[drive "stoker_{dev_name}"]
file = "{path}"
format = "raw"
if = "virtio"
cache = "none"
aio = "native"
bootindex = "{boot_index}"

"#,
        path = dev_path.display(),
    );
}

fn add_drive_dir(
    sb: &mut String,
    fd_files: &mut Vec<PathBuf>,
    agent_mounts: &mut Vec<AgentMount>,
    mount: &crate::devices::Mount,
) {
    let dev_name = &mount.dev_name;
    let mount_tag = format!("stoker_{dev_name}");
    let readonly = mount.opts.iter().any(|o| o == "ro");

    agent_mounts.push(AgentMount {
        source: mount_tag.clone(),
        target: mount.target_path.clone(),
        fs_type: mount.fs_type.clone(),
        options: if readonly {
            vec!["ro".to_string()]
        } else {
            Vec::new()
        },
    });

    if readonly {
        let _ = write!(
            sb,
            r#"# {dev_name} drive (9p share)
[fsdev "stoker_{dev_name}"]
fsdriver = "local"
security_model = "none"
readonly = "on"
path = "{path}"
"#,
            path = mount.dev_path,
        );
    } else {
        // Writable shares go through a proxy fd so the privileged helper
        // owns the filesystem access.
        let proxy_fd = add_file_descriptor(fd_files, PathBuf::from(&mount.dev_path));
        let _ = write!(
            sb,
            r#"# {dev_name} drive (9p share)
[fsdev "stoker_{dev_name}"]
fsdriver = "proxy"
sock_fd = "{proxy_fd}"
readonly = "off"
"#
        );
    }

    let _ = write!(
        sb,
        r#"
[device "dev-stoker_{dev_name}"]
driver = "virtio-9p-pci"
fsdev = "stoker_{dev_name}"
mount_tag = "{mount_tag}"

"#
    );
}

fn add_net_dev(
    sb: &mut String,
    state: &DriverState,
    boot_indexes: &BTreeMap<String, usize>,
    _nic_index: usize,
    nic: &crate::devices::NetworkInterface,
    fd_files: &mut Vec<PathBuf>,
) -> Result<()> {
    let dev_name = &nic.dev_name;
    let boot_index = boot_indexes.get(dev_name).copied().unwrap_or(0);
    let sys_net = &state.host.sys_net_dir;

    if sys_net.join(&nic.link).join("macvtap").exists() {
        // macvtap interfaces are reached through their tap character
        // device, passed in as an inherited descriptor.
        let ifindex_raw = std::fs::read_to_string(sys_net.join(&nic.link).join("ifindex"))
            .map_err(|e| Error::context(format!("Error getting tap device ifindex: {e}")))?;
        let ifindex: u64 = ifindex_raw
            .trim()
            .parse()
            .map_err(|_| Error::context("Error parsing tap device ifindex"))?;

        let tap_fd = add_file_descriptor(fd_files, PathBuf::from(format!("/dev/tap{ifindex}")));
        let _ = write!(
            sb,
            r#"# Network card ("{dev_name}" device)
[netdev "stoker_{dev_name}"]
type = "tap"
fd = "{tap_fd}"

[device "dev-stoker_{dev_name}"]
driver = "virtio-net-pci"
netdev = "stoker_{dev_name}"
mac = "{mac}"
bootindex = "{boot_index}"

"#,
            mac = nic.hwaddr,
        );
    } else if sys_net.join(&nic.link).join("tun_flags").exists() {
        let _ = write!(
            sb,
            r#"# Network card ("{dev_name}" device)
[netdev "stoker_{dev_name}"]
type = "tap"
ifname = "{link}"
script = "no"
downscript = "no"

[device "dev-stoker_{dev_name}"]
driver = "virtio-net-pci"
netdev = "stoker_{dev_name}"
mac = "{mac}"
bootindex = "{boot_index}"

"#,
            link = nic.link,
            mac = nic.hwaddr,
        );
    } else if !nic.pci_slot_name.is_empty() {
        let _ = write!(
            sb,
            r#"# Network card ("{dev_name}" device)
[device "dev-stoker_{dev_name}"]
driver = "vfio-pci"
host = "{slot}"
bootindex = "{boot_index}"

"#,
            slot = nic.pci_slot_name,
        );
    } else {
        return Err(Error::InvalidDevices {
            name: dev_name.clone(),
            reason: format!("unrecognised network interface {:?}", nic.link),
        });
    }

    Ok(())
}
