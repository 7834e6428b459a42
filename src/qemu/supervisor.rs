//! Hypervisor process launch.
//!
//! The hypervisor runs under a `forklimits` helper that lifts the memlock
//! rlimit (PCI passthrough needs it) and inherits any pass-through file
//! descriptors at fd 3 and up. The hypervisor daemonizes itself, so a
//! successful spawn means the guest process is up and its PID file
//! written; stderr of a failed spawn is surfaced verbatim.

use std::fs;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::configdrive::find_on_path;
use crate::instance::{is_true, Instance};
use crate::qemu::conf::GeneratedConfig;
use crate::state::DriverState;
use crate::{Error, Result};

const QEMU_SANDBOX: &str = "on,obsolete=deny,elevateprivileges=allow,spawn=deny,resourcecontrol=deny";

/// Locate the hypervisor binary for the instance's architecture.
pub fn hypervisor_path(state: &DriverState, inst: &Instance) -> Result<PathBuf> {
    if let Some(path) = &state.host.hypervisor_override {
        return Ok(path.clone());
    }

    let binary = inst.architecture.hypervisor_binary();
    find_on_path(binary).ok_or_else(|| Error::context(format!("{binary} not found on PATH")))
}

/// Launch the hypervisor and return the PID read back from its pidfile.
pub async fn spawn(
    state: &DriverState,
    inst: &Instance,
    conf: &GeneratedConfig,
    vm_uuid: &str,
) -> Result<i32> {
    let qemu_path = hypervisor_path(state, inst)?;
    let pid_file = state.pid_file_path(inst);

    let mut args: Vec<String> = vec!["limit=memlock:unlimited:unlimited".into()];
    for i in 0..conf.fd_files.len() {
        args.push(format!("fd={}", 3 + i));
    }
    args.push("--".into());

    args.push(qemu_path.to_string_lossy().into_owned());
    args.extend(
        [
            "-S",
            "-name",
            &inst.name,
            "-uuid",
            vm_uuid,
            "-daemonize",
            "-cpu",
            "host",
            "-nographic",
            "-serial",
            "chardev:console",
            "-nodefaults",
            "-no-reboot",
            "-no-user-config",
            "-sandbox",
            QEMU_SANDBOX,
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push("-readconfig".into());
    args.push(conf.conf_file.to_string_lossy().into_owned());
    args.push("-pidfile".into());
    args.push(pid_file.to_string_lossy().into_owned());
    args.push("-D".into());
    args.push(state.log_file_path(inst).to_string_lossy().into_owned());
    args.push("-chroot".into());
    args.push(state.instance_path(inst).to_string_lossy().into_owned());

    // Drop privileges when an unprivileged user is configured; the config
    // share must then be readable by that uid for 9p to work.
    if let Some(user) = &state.host.unpriv_user {
        args.push("-runas".into());
        args.push(user.clone());

        if let Some(uid) = state.host.unpriv_uid {
            chown_recursive(&state.config_drive_path(inst), uid)?;
        }
    }

    if is_true(
        inst.expanded_config
            .get("limits.memory.hugepages")
            .map(String::as_str)
            .unwrap_or(""),
    ) {
        args.push("-mem-path".into());
        args.push("/dev/hugepages/".into());
        args.push("-mem-prealloc".into());
    }

    // Passthrough flags are split on literal whitespace; quoting is not
    // honored.
    if let Some(raw) = inst.expanded_config.get("raw.qemu") {
        args.extend(raw.split_whitespace().map(str::to_string));
    }

    let pass_fds = open_pass_fds(&conf.fd_files)?;

    debug!(instance = %inst.name, ?args, "spawning hypervisor");
    let mut command = Command::new(&state.host.forklimits_path);
    command.args(&args);

    if !pass_fds.is_empty() {
        let raw_fds: Vec<RawFd> = pass_fds.iter().map(|f| f.as_raw_fd()).collect();
        unsafe {
            command.pre_exec(move || remap_fds(&raw_fds));
        }
    }

    let output = command
        .output()
        .await
        .map_err(|e| Error::context(format!("Failed to run forklimits: {e}")))?;

    // Parent-side copies are no longer needed once the child inherited
    // its duplicates.
    drop(pass_fds);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::Spawn { stderr });
    }

    let pid = read_pid(&pid_file).await?;
    info!(instance = %inst.name, pid, "hypervisor started");
    Ok(pid)
}

/// Pass-through file held open until the child has inherited it.
enum PassFd {
    Socket(std::os::unix::net::UnixStream),
    File(fs::File),
}

impl AsRawFd for PassFd {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            PassFd::Socket(stream) => stream.as_raw_fd(),
            PassFd::File(file) => file.as_raw_fd(),
        }
    }
}

/// Open every pass-through file: sockets are connected as streams, plain
/// files opened read-write.
fn open_pass_fds(fd_files: &[PathBuf]) -> Result<Vec<PassFd>> {
    let mut fds = Vec::with_capacity(fd_files.len());

    for file in fd_files {
        let metadata = fs::metadata(file)
            .map_err(|e| Error::context(format!("Error detecting file type {file:?}: {e}")))?;

        let fd = if metadata.file_type().is_socket() {
            let stream = std::os::unix::net::UnixStream::connect(file)
                .map_err(|e| Error::context(format!("Error opening socket file {file:?}: {e}")))?;
            PassFd::Socket(stream)
        } else {
            let opened = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(file)
                .map_err(|e| Error::context(format!("Error opening extra file {file:?}: {e}")))?;
            PassFd::File(opened)
        };

        fds.push(fd);
    }

    Ok(fds)
}

/// Move inherited descriptors onto the contiguous range starting at 3.
///
/// Sources are first parked above the target range so a source fd that
/// happens to sit inside it is not clobbered mid-way.
fn remap_fds(fds: &[RawFd]) -> std::io::Result<()> {
    let park_base = 3 + fds.len() as RawFd + 64;

    for (i, fd) in fds.iter().enumerate() {
        let parked = unsafe { libc::dup2(*fd, park_base + i as RawFd) };
        if parked < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    for i in 0..fds.len() {
        let target = 3 + i as RawFd;
        if unsafe { libc::dup2(park_base + i as RawFd, target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        unsafe { libc::close(park_base + i as RawFd) };
    }

    Ok(())
}

/// Read the PID the daemonized hypervisor wrote to its pidfile. The file
/// appears as part of daemonization, so a short grace period is allowed.
pub async fn read_pid(pid_file: &Path) -> Result<i32> {
    for _ in 0..10 {
        if let Ok(raw) = fs::read_to_string(pid_file) {
            if let Ok(pid) = raw.trim().parse::<i32>() {
                return Ok(pid);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Err(Error::context(format!(
        "Hypervisor PID file {} never appeared",
        pid_file.display()
    )))
}

/// PID from an existing pidfile, if any.
pub fn read_pid_sync(pid_file: &Path) -> Option<i32> {
    fs::read_to_string(pid_file)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

/// Force-kill a hypervisor process. Missing processes are fine.
pub fn kill(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) => debug!(pid, "killed hypervisor process"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(err) => warn!(pid, %err, "failed to kill hypervisor process"),
    }
}

fn chown_recursive(path: &Path, uid: u32) -> Result<()> {
    use nix::unistd::{chown, Uid};

    chown(path, Some(Uid::from_raw(uid)), None)?;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            chown_recursive(&entry?.path(), uid)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::mock::{test_instance, test_state};
    use std::os::unix::fs::PermissionsExt;

    /// Stand-in for forklimits+qemu: records argv, writes its own pid to
    /// the pidfile, exits 0.
    const STUB_OK: &str = r#"#!/bin/sh
pidfile=""
prev=""
for a in "$@"; do
  [ "$prev" = "-pidfile" ] && pidfile="$a"
  prev="$a"
done
printf '%s\n' "$@" > "${pidfile%.pid}.argv"
echo $$ > "$pidfile"
exit 0
"#;

    const STUB_FAIL: &str = r#"#!/bin/sh
echo "qemu-system-x86_64: failed to initialize KVM" >&2
exit 1
"#;

    fn write_stub(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("forklimits");
        fs::write(&path, contents).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn launch_state(dir: &Path, stub: &str) -> crate::state::DriverState {
        let mut state = test_state(dir);
        state.host.forklimits_path = write_stub(dir, stub);
        state.host.hypervisor_override = Some(PathBuf::from("/bin/true"));
        state
    }

    #[tokio::test]
    async fn test_spawn_reads_pid_and_builds_argv() {
        let dir = tempfile::tempdir().unwrap();
        let state = launch_state(dir.path(), STUB_OK);
        let mut inst = test_instance(1, "web");
        inst.expanded_config
            .insert("raw.qemu".into(), "-no-acpi  -d guest_errors".into());

        fs::create_dir_all(state.log_path(&inst)).unwrap();

        let conf = GeneratedConfig {
            conf_file: state.conf_file_path(&inst),
            fd_files: Vec::new(),
        };

        let pid = spawn(&state, &inst, &conf, "15f4b8ae-0000-4000-8000-000000000001")
            .await
            .unwrap();
        assert!(pid > 0);

        let argv = fs::read_to_string(state.log_path(&inst).join("qemu.argv")).unwrap();
        let lines: Vec<&str> = argv.lines().collect();

        assert_eq!(lines[0], "limit=memlock:unlimited:unlimited");
        assert!(lines.contains(&"--"));
        assert!(lines.contains(&"-daemonize"));
        assert!(lines.contains(&"-no-reboot"));
        assert!(lines.contains(&QEMU_SANDBOX));
        // raw.qemu splits on whitespace, empty fields dropped.
        assert!(lines.contains(&"-no-acpi"));
        assert!(lines.contains(&"guest_errors"));

        let readconfig_pos = lines.iter().position(|l| *l == "-readconfig").unwrap();
        assert_eq!(
            lines[readconfig_pos + 1],
            state.conf_file_path(&inst).to_string_lossy()
        );
    }

    #[tokio::test]
    async fn test_spawn_passes_fd_indices() {
        let dir = tempfile::tempdir().unwrap();
        let state = launch_state(dir.path(), STUB_OK);
        let inst = test_instance(1, "web");
        fs::create_dir_all(state.log_path(&inst)).unwrap();

        let extra = dir.path().join("extra.img");
        fs::write(&extra, "x").unwrap();
        let extra2 = dir.path().join("extra2.img");
        fs::write(&extra2, "y").unwrap();

        let conf = GeneratedConfig {
            conf_file: state.conf_file_path(&inst),
            fd_files: vec![extra, extra2],
        };

        spawn(&state, &inst, &conf, "uuid").await.unwrap();

        let argv = fs::read_to_string(state.log_path(&inst).join("qemu.argv")).unwrap();
        let lines: Vec<&str> = argv.lines().collect();
        assert_eq!(lines[1], "fd=3");
        assert_eq!(lines[2], "fd=4");
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let state = launch_state(dir.path(), STUB_FAIL);
        let inst = test_instance(1, "web");
        fs::create_dir_all(state.log_path(&inst)).unwrap();

        let conf = GeneratedConfig {
            conf_file: state.conf_file_path(&inst),
            fd_files: Vec::new(),
        };

        let err = spawn(&state, &inst, &conf, "uuid").await.unwrap_err();
        match err {
            Error::Spawn { stderr } => {
                assert_eq!(stderr, "qemu-system-x86_64: failed to initialize KVM")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_kill_missing_pid_is_silent() {
        // Kernel pid limit makes this pid impossible.
        kill(i32::MAX - 1);
    }
}
