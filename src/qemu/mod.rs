//! The QEMU lifecycle driver.
//!
//! `Driver` realizes one instance description as a running guest process
//! and walks it through its state machine: Start, Stop, Shutdown, Freeze,
//! Unfreeze, Restore, Update, Delete and Rename, plus the OnStop
//! finalizer invoked from the monitor's SHUTDOWN event.

pub mod conf;
pub mod supervisor;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::AgentClient;
use crate::configdrive;
use crate::devices::{self, DeviceConfig, Devices, RunConfig};
use crate::instance::{is_image_key, is_volatile_key, valid_name, Instance, InstanceArgs};
use crate::monitor::{Event, EventHandler, Monitor};
use crate::oplock::Action;
use crate::revert::Reverter;
use crate::state::{now_ms, DriverState, PowerState};
use crate::{cpu, Error, Result};

/// Coarse instance states reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStateCode {
    Running,
    Frozen,
    Stopped,
    Error,
}

/// Per-instance lifecycle driver. Cheap to clone; all clones share the
/// same instance record and cached handles.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    state: Arc<DriverState>,
    inst: tokio::sync::Mutex<Instance>,
    /// Cached QMP session, replaced when it disconnects.
    monitor: tokio::sync::Mutex<Option<Monitor>>,
    /// Cached agent HTTP client, built lazily on first use.
    agent: tokio::sync::Mutex<Option<AgentClient>>,
}

impl Driver {
    pub fn new(state: Arc<DriverState>, mut inst: Instance) -> Result<Self> {
        inst.validate()?;
        inst.expand();

        Ok(Self {
            inner: Arc::new(DriverInner {
                state,
                inst: tokio::sync::Mutex::new(inst),
                monitor: tokio::sync::Mutex::new(None),
                agent: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// Copy of the current instance record.
    pub async fn instance(&self) -> Instance {
        self.inner.inst.lock().await.clone()
    }

    fn state(&self) -> &DriverState {
        &self.inner.state
    }

    /// The SHUTDOWN handler: resolve the stop target from the event
    /// reason and run OnStop on its own task. The handler itself must
    /// never block or issue monitor commands.
    fn event_handler(&self) -> EventHandler {
        let driver = self.clone();
        Arc::new(move |event: Event| {
            if event.name != "SHUTDOWN" {
                return;
            }

            let target = match event.data.get("reason").and_then(|r| r.as_str()) {
                Some("guest-reset") => "reboot",
                _ => "stop",
            };

            let driver = driver.clone();
            let target = target.to_string();
            tokio::spawn(async move {
                if let Err(err) = driver.on_stop(&target).await {
                    error!(%err, "failed to cleanly stop instance");
                }
            });
        })
    }

    /// Connect to the control socket, reusing the cached session while it
    /// is alive.
    async fn monitor(&self) -> Result<Monitor> {
        let mut cached = self.inner.monitor.lock().await;
        if let Some(monitor) = cached.as_ref() {
            if !monitor.is_disconnected() {
                return Ok(monitor.clone());
            }
        }

        let path = {
            let inst = self.inner.inst.lock().await;
            self.state().monitor_path(&inst)
        };
        let monitor = Monitor::connect(&path, self.event_handler()).await?;
        *cached = Some(monitor.clone());
        Ok(monitor)
    }

    /// Current state as seen through the monitor. A missing or dead
    /// control socket means the guest is stopped.
    pub async fn state_code(&self) -> InstanceStateCode {
        let monitor = match self.monitor().await {
            Ok(monitor) => monitor,
            Err(_) => return InstanceStateCode::Stopped,
        };

        match monitor.status().await {
            Ok(status) if status == "running" => InstanceStateCode::Running,
            Ok(status) if status == "paused" => InstanceStateCode::Frozen,
            Ok(_) => InstanceStateCode::Stopped,
            Err(Error::MonitorDisconnect) => InstanceStateCode::Stopped,
            Err(_) => InstanceStateCode::Error,
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(
            self.state_code().await,
            InstanceStateCode::Running | InstanceStateCode::Frozen
        )
    }

    pub async fn is_frozen(&self) -> bool {
        self.state_code().await == InstanceStateCode::Frozen
    }

    /// Start the instance.
    pub async fn start(&self, stateful: bool) -> Result<()> {
        if stateful {
            return Err(Error::Unsupported("Stateful start"));
        }

        // The vsock link to the agent needs the module before launch.
        self.state().modules.load("vhost_vsock")?;

        if self.is_running().await {
            return Err(Error::AlreadyRunning);
        }

        let (id, project, name) = {
            let inst = self.inner.inst.lock().await;
            (inst.id, inst.project.clone(), inst.name.clone())
        };

        let op = self
            .state()
            .oplocks
            .create(id, Action::Start, false, false)?;

        match self.start_inner().await {
            Ok(()) => {
                op.done(None);
                self.state()
                    .events
                    .send_lifecycle(&project, "virtual-machine-started", &name);
                Ok(())
            }
            Err(err) => {
                op.done(Some(&err));
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let state = self.inner.state.clone();
        let mut inst = self.inner.inst.lock().await;
        let mut revert = Reverter::new();

        info!(instance = %inst.name, "starting instance");

        state.pool.mount_instance(&inst)?;
        {
            let pool = state.pool.clone();
            let snapshot = inst.clone();
            revert.add(move || {
                let _ = pool.unmount_instance(&snapshot);
            });
        }

        configdrive::generate(&state, &mut inst)?;

        configdrive::create_dir_mode(&state.log_path(&inst), 0o700)?;
        configdrive::create_dir_mode(&state.devices_path(&inst), 0o711)?;
        configdrive::create_dir_mode(&state.shmounts_path(&inst), 0o711)?;

        let vm_uuid = match inst.local_config.get("volatile.vm.uuid") {
            Some(existing) => existing.clone(),
            None => {
                let generated = Uuid::new_v4().to_string();
                state
                    .store
                    .volatile_set(inst.id, "volatile.vm.uuid", &generated)?;
                inst.local_config
                    .insert("volatile.vm.uuid".into(), generated.clone());
                inst.expanded_config
                    .insert("volatile.vm.uuid".into(), generated.clone());
                generated
            }
        };

        // The firmware variables file is writable by the guest, so each
        // instance runs on its own copy of the template.
        if !state.nvram_path(&inst).exists() {
            setup_nvram(&state, &inst)?;
        }

        let device_list: Vec<(String, DeviceConfig)> = inst
            .expanded_devices
            .sorted()
            .into_iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();

        let mut run_configs: Vec<RunConfig> = Vec::with_capacity(device_list.len());
        for (dev_name, dev_config) in &device_list {
            let run = devices::start(&mut inst, state.store.as_ref(), dev_name, dev_config, false)
                .map_err(|e| {
                    Error::context(format!("Failed to start device {dev_name:?}: {e}"))
                })?;

            {
                let state = state.clone();
                let mut snapshot = inst.clone();
                let dev_name = dev_name.clone();
                let dev_config = dev_config.clone();
                revert.add(move || {
                    if let Err(err) = devices::stop(
                        &mut snapshot,
                        state.store.as_ref(),
                        &dev_name,
                        &dev_config,
                        false,
                    ) {
                        error!(device = %dev_name, %err, "failed to clean up device");
                    }
                });
            }

            if !run.is_empty() {
                run_configs.push(run);
            }
        }

        let generated = conf::generate(&state, &inst, &run_configs)?;
        configdrive::seal(&state, &inst)?;

        let pid = supervisor::spawn(&state, &inst, &generated, &vm_uuid).await?;
        revert.add(move || supervisor::kill(pid));

        // New launch, new control socket: drop any stale session.
        *self.inner.monitor.lock().await = None;

        let monitor = Monitor::connect(&state.monitor_path(&inst), self.event_handler()).await?;
        *self.inner.monitor.lock().await = Some(monitor.clone());

        // Apply CPU pinning when limits.cpu is a cpuset.
        if let Some(limit) = inst.expanded_config.get("limits.cpu") {
            if !limit.is_empty() && limit.parse::<u64>().is_err() {
                let host = cpu::HostTopology::detect()?;
                let topology = cpu::solve(&host, &inst.name, limit)?;

                let pids = monitor.get_cpus().await?;
                if pids.len() != topology.vcpus.len() {
                    return Err(Error::context("QEMU has less vCPUs than configured"));
                }

                for (i, thread_pid) in pids.iter().enumerate() {
                    pin_thread(*thread_pid, topology.vcpus[i] as usize)?;
                }
            }
        }

        // Leave -S suspension.
        monitor.cont().await?;

        state
            .store
            .set_power_state(inst.id, PowerState::Running, Some(now_ms()))?;

        inst.last_used_ms = now_ms();
        revert.commit();
        info!(instance = %inst.name, pid, "instance started");
        Ok(())
    }

    /// Ask the guest to shut down cleanly, waiting up to `timeout` for it
    /// to exit. A zero timeout waits forever.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if !self.is_running().await {
            return Err(Error::AlreadyStopped);
        }

        let (id, project, name) = {
            let inst = self.inner.inst.lock().await;
            (inst.id, inst.project.clone(), inst.name.clone())
        };

        let op = self.state().oplocks.create(id, Action::Stop, true, true)?;

        let monitor = match self.monitor().await {
            Ok(monitor) => monitor,
            Err(err) => {
                op.done(Some(&err));
                return Err(err);
            }
        };

        let mut wait = match monitor.wait_channel() {
            Ok(wait) => wait,
            Err(err) if err.is_disconnect() => {
                op.done(None);
                return Ok(());
            }
            Err(err) => {
                op.done(Some(&err));
                return Err(err);
            }
        };

        match monitor.powerdown().await {
            Ok(()) => {}
            // The guest may die before the reply makes it back.
            Err(err) if err.is_disconnect() => {
                op.done(None);
                return Ok(());
            }
            Err(err) => {
                op.done(Some(&err));
                return Err(err);
            }
        }

        let disconnected = async {
            while !*wait.borrow() {
                if wait.changed().await.is_err() {
                    break;
                }
            }
        };

        if timeout > Duration::ZERO {
            tokio::select! {
                _ = disconnected => {}
                _ = tokio::time::sleep(timeout) => {
                    let err = Error::context("Instance was not shutdown after timeout");
                    op.done(Some(&err));
                    return Err(err);
                }
            }
        } else {
            disconnected.await;
        }

        op.done(None);
        self.state()
            .events
            .send_lifecycle(&project, "virtual-machine-shutdown", &name);
        Ok(())
    }

    /// Stop the instance immediately via the hypervisor.
    pub async fn stop(&self, stateful: bool) -> Result<()> {
        if stateful {
            return Err(Error::Unsupported("Stateful stop"));
        }

        if !self.is_running().await {
            return Err(Error::AlreadyStopped);
        }

        let (id, project, name, ephemeral, snapshot) = {
            let inst = self.inner.inst.lock().await;
            (
                inst.id,
                inst.project.clone(),
                inst.name.clone(),
                inst.ephemeral,
                inst.snapshot,
            )
        };

        let op = self.state().oplocks.create(id, Action::Stop, false, true)?;

        let monitor = match self.monitor().await {
            // Connection failure means the guest is already off.
            Err(_) => {
                op.done(None);
                return Ok(());
            }
            Ok(monitor) => monitor,
        };

        let mut wait = match monitor.wait_channel() {
            Ok(wait) => wait,
            Err(err) if err.is_disconnect() => {
                op.done(None);
                return Ok(());
            }
            Err(err) => {
                op.done(Some(&err));
                return Err(err);
            }
        };

        match monitor.quit().await {
            Ok(()) => {}
            Err(err) if err.is_disconnect() => {}
            Err(err) => {
                op.done(Some(&err));
                return Err(err);
            }
        }

        // Hypervisor exit can lag behind pending I/O.
        while !*wait.borrow() {
            if wait.changed().await.is_err() {
                break;
            }
        }

        // OnStop owns the cleanup; wait for it to finalize the state.
        if let Err(err) = op.wait().await {
            if self.is_running().await {
                return Err(err);
            }
        }

        self.state()
            .events
            .send_lifecycle(&project, "virtual-machine-stopped", &name);

        if ephemeral && !snapshot {
            self.delete().await?;
        }

        Ok(())
    }

    /// Finalize a stopped guest: tear down devices, drop runtime files,
    /// unmount, record the state, and restart when the guest asked for a
    /// reboot.
    ///
    /// Invoked from the SHUTDOWN event. Cleanup always runs; an existing
    /// stop lock is picked up and signalled, a conflicting lock aborts.
    pub async fn on_stop(&self, target: &str) -> Result<()> {
        let id = self.inner.inst.lock().await.id;

        let op = self.state().oplocks.get(id);
        if let Some(op) = &op {
            if op.action() != Action::Stop {
                return Err(Error::AlreadyRunningOperation(op.action()));
            }
        }

        {
            let mut inst = self.inner.inst.lock().await;
            let state = self.inner.state.clone();

            info!(instance = %inst.name, stop_target = target, "instance stopped, cleaning up");

            // Teardown in reverse of start order.
            let device_list: Vec<(String, DeviceConfig)> = inst
                .expanded_devices
                .reversed()
                .into_iter()
                .map(|(name, config)| (name.clone(), config.clone()))
                .collect();
            for (dev_name, dev_config) in &device_list {
                match devices::stop(&mut inst, state.store.as_ref(), dev_name, dev_config, false)
                {
                    Ok(()) | Err(Error::UnsupportedDevType) => {}
                    Err(err) => error!(device = %dev_name, %err, "failed to stop device"),
                }
            }

            let _ = fs::remove_file(state.pid_file_path(&inst));
            let _ = fs::remove_file(state.monitor_path(&inst));

            if let Err(err) = state.pool.unmount_instance(&inst) {
                warn!(%err, "failed to unmount instance volume");
            }

            if let Err(err) = state
                .store
                .set_power_state(inst.id, PowerState::Stopped, None)
            {
                if let Some(op) = &op {
                    op.done(Some(&err));
                }
                return Err(err);
            }
        }

        *self.inner.monitor.lock().await = None;
        *self.inner.agent.lock().await = None;

        if target == "reboot" {
            self.start(false).await?;
        }

        if let Some(op) = &op {
            op.done(None);
        }

        Ok(())
    }

    /// Pause guest CPUs.
    pub async fn freeze(&self) -> Result<()> {
        let monitor = self.monitor().await?;
        monitor.pause().await
    }

    /// Resume a paused guest.
    pub async fn unfreeze(&self) -> Result<()> {
        let monitor = self.monitor().await?;
        monitor.cont().await
    }

    /// Apply a configuration update.
    ///
    /// Config, profile and architecture changes require a stopped
    /// instance; device-only changes flow through the diff and may apply
    /// live when every affected device supports hot-plug.
    pub async fn update(&self, args: InstanceArgs, user_requested: bool) -> Result<()> {
        let is_running = self.is_running().await;

        let state = self.inner.state.clone();
        let mut inst = self.inner.inst.lock().await;

        validate_config(&args.config)?;
        for (name, config) in args.devices.iter() {
            match devices::validate(name, config) {
                Ok(()) | Err(Error::UnsupportedDevType) => {}
                Err(err) => return Err(err),
            }
        }

        let known_profiles = state.store.profile_names(&inst.project)?;
        let mut seen = Vec::new();
        for profile in &args.profiles {
            if !known_profiles.contains(&profile.name) {
                return Err(Error::context(format!(
                    "Requested profile {:?} doesn't exist",
                    profile.name
                )));
            }
            if seen.contains(&profile.name) {
                return Err(Error::context("Duplicate profile found in request"));
            }
            seen.push(profile.name.clone());
        }

        if user_requested {
            check_protected_keys(&inst, &args)?;
        }

        // Pre-commit snapshot for the rollback path.
        let old_description = inst.description.clone();
        let old_architecture = inst.architecture;
        let old_ephemeral = inst.ephemeral;
        let old_local_config = inst.local_config.clone();
        let old_local_devices = inst.local_devices.clone();
        let old_expanded_config = inst.expanded_config.clone();
        let old_expanded_devices = inst.expanded_devices.clone();
        let old_profiles = inst.profiles.clone();
        let old_expiry = inst.expiry_ms;

        inst.description = args.description.clone();
        inst.architecture = args.architecture.unwrap_or(old_architecture);
        inst.ephemeral = args.ephemeral;
        inst.local_config = args.config.clone();
        inst.local_devices = args.devices.clone();
        inst.profiles = args.profiles.clone();
        inst.expiry_ms = args.expiry_ms;
        inst.expand();

        let result = self
            .apply_update(&state, &mut inst, is_running, &old_expanded_config, &old_expanded_devices)
            .await;

        match result {
            Ok(()) => {
                let (project, name) = (inst.project.clone(), inst.name.clone());
                state
                    .events
                    .send_lifecycle(&project, "virtual-machine-updated", &name);
                Ok(())
            }
            Err(err) => {
                // All seven fields revert together.
                inst.description = old_description;
                inst.architecture = old_architecture;
                inst.ephemeral = old_ephemeral;
                inst.local_config = old_local_config;
                inst.local_devices = old_local_devices;
                inst.expanded_config = old_expanded_config;
                inst.expanded_devices = old_expanded_devices;
                inst.profiles = old_profiles;
                inst.expiry_ms = old_expiry;
                Err(err)
            }
        }
    }

    async fn apply_update(
        &self,
        state: &Arc<DriverState>,
        inst: &mut Instance,
        is_running: bool,
        old_expanded_config: &crate::instance::ConfigMap,
        old_expanded_devices: &Devices,
    ) -> Result<()> {
        // Keys that changed in the expanded config, both directions.
        let mut changed_config: Vec<String> = Vec::new();
        for key in old_expanded_config.keys() {
            if old_expanded_config.get(key) != inst.expanded_config.get(key) {
                changed_config.push(key.clone());
            }
        }
        for key in inst.expanded_config.keys() {
            if old_expanded_config.get(key) != inst.expanded_config.get(key)
                && !changed_config.contains(key)
            {
                changed_config.push(key.clone());
            }
        }

        if is_running {
            let non_device_change = !changed_config.is_empty();
            if non_device_change {
                return Err(Error::context("Update whilst running not supported"));
            }
        }

        validate_config(&inst.expanded_config)?;
        for (name, config) in inst.expanded_devices.clone().iter() {
            match devices::validate(name, config) {
                Ok(()) | Err(Error::UnsupportedDevType) => {}
                Err(err) => return Err(err),
            }
        }

        let diff = devices::update_diff(old_expanded_devices, &inst.expanded_devices);

        // Removals run in reverse order, then additions and updates in
        // sorted order.
        for (name, old_config) in diff.remove.reversed() {
            if is_running {
                match devices::stop(inst, state.store.as_ref(), name, old_config, true) {
                    Ok(()) | Err(Error::UnsupportedDevType) => {}
                    Err(err) => {
                        return Err(Error::context(format!(
                            "Failed to stop device {name:?}: {err}"
                        )))
                    }
                }
            }

            match devices::remove(inst, state.store.as_ref(), name, old_config) {
                Ok(()) | Err(Error::UnsupportedDevType) => {}
                Err(err) => return Err(err),
            }

            devices::reset_volatile(
                inst,
                state.store.as_ref(),
                name,
                old_config,
                diff.add.get(name),
            )?;
        }

        for (name, new_config) in diff.add.sorted() {
            match devices::add(inst, state.store.as_ref(), name, new_config) {
                Ok(()) | Err(Error::UnsupportedDevType) => {}
                Err(err) => {
                    return Err(Error::context(format!(
                        "Failed to add device {name:?}: {err}"
                    )))
                }
            }

            if is_running {
                match devices::start(inst, state.store.as_ref(), name, new_config, true) {
                    Ok(_) | Err(Error::UnsupportedDevType) => {}
                    Err(err) => {
                        return Err(Error::context(format!(
                            "Failed to start device {name:?}: {err}"
                        )))
                    }
                }
            }
        }

        for (name, new_config) in diff.update.sorted() {
            match devices::update(
                inst,
                state.store.as_ref(),
                name,
                new_config,
                old_expanded_devices,
                is_running,
            ) {
                Ok(()) | Err(Error::UnsupportedDevType) => {}
                Err(err) => {
                    return Err(Error::context(format!(
                        "Failed to update device {name:?}: {err}"
                    )))
                }
            }
        }

        // MAAS cares about address and subnet fields.
        let maas_keys = [
            "maas.subnet.ipv4",
            "maas.subnet.ipv6",
            "ipv4.address",
            "ipv6.address",
        ];
        if !inst.snapshot
            && diff
                .changed_fields
                .iter()
                .any(|key| maas_keys.contains(&key.as_str()))
        {
            state.maas.update_instance(inst)?;
        }

        if changed_config
            .iter()
            .any(|key| key.as_str() == "security.secureboot")
        {
            setup_nvram(state, inst)?;
        }

        if inst.snapshot {
            state
                .store
                .update_snapshot(inst.id, &inst.description, inst.expiry_ms)?;
        } else {
            state.store.replace_instance(inst)?;
        }

        if let Err(err) = state.pool.update_backup_file(inst) {
            warn!(%err, "failed to rewrite backup file");
        }

        Ok(())
    }

    /// Restore the instance from one of its snapshots.
    pub async fn restore(&self, source: &Instance, stateful: bool) -> Result<()> {
        if stateful {
            return Err(Error::Unsupported("Stateful snapshot restore"));
        }

        let state = self.inner.state.clone();
        let snapshot = self.instance().await;

        // Keep storage attached for the backup file rewrite.
        let our_mount = state.pool.mount_instance(&snapshot)?;

        let was_running = self.is_running().await;
        let was_ephemeral = snapshot.ephemeral;
        if was_running {
            if was_ephemeral {
                // Stopping an ephemeral instance would delete it.
                let mut args = args_from(&snapshot);
                args.ephemeral = false;
                self.update(args, false).await?;
            }

            self.stop(false).await?;
        }

        info!(instance = %snapshot.name, source = %source.name, "restoring instance");

        {
            let inst = self.inner.inst.lock().await;
            state.pool.restore_instance_snapshot(&inst, source)?;
        }

        let mut args = args_from(source);
        args.ephemeral = was_ephemeral;
        self.update(args, false).await?;

        {
            let inst = self.inner.inst.lock().await;
            state.pool.update_backup_file(&inst)?;
            state
                .events
                .send_lifecycle(&inst.project, "virtual-machine-snapshot-restored", &inst.name);
        }

        if our_mount {
            let inst = self.inner.inst.lock().await;
            let _ = state.pool.unmount_instance(&inst);
        }

        if was_running {
            self.start(false).await?;
        }

        Ok(())
    }

    /// Delete the instance, its snapshots and its host-side footprint.
    pub async fn delete(&self) -> Result<()> {
        let state = self.inner.state.clone();
        let mut inst = self.inner.inst.lock().await;

        if inst.config_bool("security.protection.delete", false) && !inst.snapshot {
            return Err(Error::Protected);
        }

        info!(instance = %inst.name, "deleting instance");

        if inst.snapshot {
            state.pool.delete_instance_snapshot(&inst)?;
        } else {
            // Snapshot subtree goes first.
            for snap in state.store.snapshots_of(&inst.project, &inst.name)? {
                state.pool.delete_instance_snapshot(&snap)?;
                state.store.delete_instance(&snap.project, &snap.name)?;
            }

            state.pool.delete_instance(&inst)?;
        }

        if !inst.snapshot {
            state.maas.delete_instance(&inst)?;

            let device_list: Vec<(String, DeviceConfig)> = inst
                .expanded_devices
                .iter()
                .map(|(name, config)| (name.clone(), config.clone()))
                .collect();
            for (dev_name, dev_config) in &device_list {
                match devices::remove(&mut inst, state.store.as_ref(), dev_name, dev_config) {
                    Ok(()) | Err(Error::UnsupportedDevType) => {}
                    Err(err) => {
                        return Err(Error::context(format!(
                            "Failed to remove device {dev_name:?}: {err}"
                        )))
                    }
                }
            }

            cleanup_host_paths(&state, &inst);
        }

        state.store.delete_instance(&inst.project, &inst.name)?;

        let event = if inst.snapshot {
            "virtual-machine-snapshot-deleted"
        } else {
            "virtual-machine-deleted"
        };
        state.events.send_lifecycle(&inst.project, event, &inst.name);

        Ok(())
    }

    /// Rename the instance and every record hanging off its name.
    pub async fn rename(&self, new_name: &str) -> Result<()> {
        let state = self.inner.state.clone();

        if self.is_running().await {
            return Err(Error::context("Renaming of running instance not allowed"));
        }

        let mut inst = self.inner.inst.lock().await;
        valid_name(new_name, inst.snapshot)?;

        info!(instance = %inst.name, new_name, "renaming instance");

        let old_name = inst.name.clone();
        let old_storage_name = inst.storage_name();

        cleanup_host_paths(&state, &inst);

        if inst.snapshot {
            let new_snap = new_name
                .split_once('/')
                .map(|(_, snap)| snap.to_string())
                .ok_or_else(|| Error::context("Invalid snapshot name"))?;

            state.pool.rename_instance_snapshot(&inst, &new_snap)?;

            let (parent, old_snap) = inst
                .parent_and_snapshot_name()
                .map(|(p, s)| (p.to_string(), s.to_string()))
                .ok_or_else(|| Error::context("Invalid snapshot name"))?;
            state
                .store
                .rename_snapshot(&inst.project, &parent, &old_snap, &new_snap)?;
        } else {
            state.pool.rename_instance(&inst, new_name)?;

            // Snapshot rows follow their parent's name.
            for snap in state.store.snapshots_of(&inst.project, &old_name)? {
                if let Some((_, snap_suffix)) = snap.parent_and_snapshot_name() {
                    state.store.rename_snapshot(
                        &inst.project,
                        &old_name,
                        snap_suffix,
                        snap_suffix,
                    )?;
                }
            }

            state
                .store
                .rename_instance(&inst.project, &old_name, new_name)?;

            state.maas.rename_instance(&inst, new_name)?;
        }

        inst.name = new_name.to_string();

        // Move the log directory along.
        let old_log = state.log_path_for(&old_storage_name);
        let new_log = state.log_path(&inst);
        if new_log.exists() {
            let _ = fs::remove_dir_all(&new_log);
        }
        if old_log.exists() {
            fs::rename(&old_log, &new_log)?;
        }

        state.dnsmasq.update_static_leases()?;

        state
            .events
            .send_lifecycle(&inst.project, "virtual-machine-renamed", &old_name);

        Ok(())
    }

    /// Attach to the guest console chardev. Only one console per
    /// instance; the returned handle releases the slot on drop.
    pub async fn console(&self) -> Result<ConsoleHandle> {
        let id = self.inner.inst.lock().await.id;

        {
            let mut consoles = self.state().consoles.lock().expect("console set poisoned");
            if !consoles.insert(id) {
                return Err(Error::context(
                    "There is already an active console for this instance",
                ));
            }
        }

        let result = async {
            let monitor = self.monitor().await?;
            monitor.console("console").await
        }
        .await;

        match result {
            Ok(stream) => Ok(ConsoleHandle {
                stream,
                state: self.inner.state.clone(),
                instance_id: id,
            }),
            Err(err) => {
                self.state()
                    .consoles
                    .lock()
                    .expect("console set poisoned")
                    .remove(&id);
                Err(err)
            }
        }
    }

    /// Drain the console ring buffer into `console.log` and return the
    /// captured output.
    pub async fn console_log(&self) -> Result<String> {
        let monitor = self.monitor().await?;
        let captured = monitor.ringbuf_read("console").await?;

        let path = {
            let inst = self.inner.inst.lock().await;
            self.state().console_log_path(&inst)
        };
        if !captured.is_empty() {
            use std::io::Write;
            let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(captured.as_bytes())?;
        }

        Ok(captured)
    }

    /// Cached mutual-TLS agent client, built on first use.
    pub async fn agent(&self) -> Result<AgentClient> {
        // Fail fast when the guest agent hasn't come up.
        let monitor = self.monitor().await?;
        if !monitor.agent_ready().await {
            return Err(Error::AgentOffline);
        }

        let mut cached = self.inner.agent.lock().await;
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }

        let inst = self.inner.inst.lock().await;
        let client = AgentClient::new(
            inst.vsock_id(),
            &self.state().instance_path(&inst),
            &inst.name,
        )?;
        *cached = Some(client.clone());
        Ok(client)
    }

    /// In-guest state report via the agent.
    pub async fn agent_state(&self) -> Result<serde_json::Value> {
        self.agent().await?.get_state().await
    }

    /// Fetch a file from the guest filesystem.
    pub async fn file_pull(&self, path: &str) -> Result<Vec<u8>> {
        self.agent().await?.file_get(path).await
    }

    /// Push a file into the guest filesystem.
    pub async fn file_push(
        &self,
        path: &str,
        content: &[u8],
        args: &crate::agent::FilePutArgs,
    ) -> Result<()> {
        self.agent().await?.file_put(path, content, args).await
    }

    /// Remove a file from the guest filesystem.
    pub async fn file_remove(&self, path: &str) -> Result<()> {
        self.agent().await?.file_delete(path).await
    }

    /// Run a command inside the guest.
    pub async fn exec(&self, req: &crate::agent::ExecRequest) -> Result<crate::agent::ExecResult> {
        self.agent().await?.exec(req).await
    }

    /// Arrange for image templates with the given trigger to render on
    /// the next config drive rebuild.
    pub async fn defer_template_apply(&self, trigger: &str) -> Result<()> {
        let mut inst = self.inner.inst.lock().await;
        self.state()
            .store
            .volatile_set(inst.id, "volatile.apply_template", trigger)?;
        inst.local_config
            .insert("volatile.apply_template".into(), trigger.to_string());
        inst.expanded_config
            .insert("volatile.apply_template".into(), trigger.to_string());
        Ok(())
    }

    /// Stateful migration is not implemented for virtual machines.
    pub fn migrate(&self) -> Result<()> {
        Err(Error::Unsupported("Migration"))
    }

    /// Cgroup limits apply to containers, not VMs.
    pub fn cgroup_set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(Error::Unsupported("CGroupSet"))
    }

    /// Device-originated events have no VM counterpart.
    pub fn device_event_handler(&self) -> Result<()> {
        Err(Error::Unsupported("DeviceEventHandler"))
    }
}

/// Guest console stream plus the in-use registration it holds.
pub struct ConsoleHandle {
    pub stream: UnixStream,
    state: Arc<DriverState>,
    instance_id: i64,
}

impl Drop for ConsoleHandle {
    fn drop(&mut self) {
        self.state
            .consoles
            .lock()
            .expect("console set poisoned")
            .remove(&self.instance_id);
    }
}

/// Copy the firmware variables template matching the secureboot setting
/// into the instance's NVRAM file.
fn setup_nvram(state: &DriverState, inst: &Instance) -> Result<()> {
    if !inst.architecture.uses_uefi() {
        return Ok(());
    }

    let source = if inst.config_bool("security.secureboot", true) {
        state.host.ovmf_path().join("OVMF_VARS.ms.fd")
    } else {
        state.host.ovmf_path().join("OVMF_VARS.fd")
    };

    if !source.exists() {
        return Err(Error::context(format!(
            "Required EFI firmware settings file missing: {}",
            source.display()
        )));
    }

    let nvram = state.nvram_path(inst);
    let _ = fs::remove_file(&nvram);
    fs::copy(&source, &nvram)?;
    Ok(())
}

/// Pin one guest vCPU thread to a single host CPU.
fn pin_thread(thread_pid: i32, host_cpu: usize) -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(host_cpu)?;
    sched_setaffinity(Pid::from_raw(thread_pid), &set)?;
    Ok(())
}

fn cleanup_host_paths(state: &DriverState, inst: &Instance) {
    let devices_path = state.devices_path(inst);
    if devices_path.exists() {
        if let Err(err) = fs::remove_dir_all(&devices_path) {
            warn!(%err, "failed to remove devices path");
        }
    }

    let shmounts_path = state.shmounts_path(inst);
    if shmounts_path.exists() {
        if let Err(err) = fs::remove_dir_all(&shmounts_path) {
            warn!(%err, "failed to remove shmounts path");
        }
    }
}

/// Shallow validation of the driver-owned config keys.
fn validate_config(config: &crate::instance::ConfigMap) -> Result<()> {
    if let Some(memory) = config.get("limits.memory") {
        crate::units::parse_byte_size(memory)?;
    }

    if let Some(limit) = config.get("limits.cpu") {
        if !limit.is_empty() && limit.parse::<u64>().is_err() {
            cpu::parse_cpuset(limit)?;
        }
    }

    for key in ["security.secureboot", "security.protection.delete", "limits.memory.hugepages"] {
        if let Some(value) = config.get(key) {
            if !matches!(value.as_str(), "true" | "false" | "1" | "0" | "yes" | "no" | "on" | "off")
            {
                return Err(Error::InvalidConfig {
                    key: key.into(),
                    reason: format!("{value:?} is not a boolean"),
                });
            }
        }
    }

    Ok(())
}

/// Volatile and image keys are driver-owned; user updates may not touch
/// them in either direction.
fn check_protected_keys(inst: &Instance, args: &InstanceArgs) -> Result<()> {
    let protected = |key: &str| is_volatile_key(key) || is_image_key(key);

    for (key, value) in &args.config {
        if protected(key) && inst.local_config.get(key) != Some(value) {
            return Err(Error::InvalidConfig {
                key: key.clone(),
                reason: "volatile and image keys are read-only".into(),
            });
        }
    }

    for (key, value) in &inst.local_config {
        if protected(key) && args.config.get(key) != Some(value) {
            return Err(Error::InvalidConfig {
                key: key.clone(),
                reason: "volatile and image keys are read-only".into(),
            });
        }
    }

    Ok(())
}

fn args_from(inst: &Instance) -> InstanceArgs {
    InstanceArgs {
        description: inst.description.clone(),
        architecture: Some(inst.architecture),
        ephemeral: inst.ephemeral,
        config: inst.local_config.clone(),
        devices: inst.local_devices.clone(),
        profiles: inst.profiles.clone(),
        expiry_ms: inst.expiry_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::mock::{test_instance, test_state};
    use std::path::Path;

    fn driver(base: &Path) -> Driver {
        let state = Arc::new(test_state(base));
        Driver::new(state, test_instance(1, "web")).unwrap()
    }

    #[tokio::test]
    async fn test_stopped_without_monitor_socket() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        assert_eq!(driver.state_code().await, InstanceStateCode::Stopped);
        assert!(!driver.is_running().await);
    }

    #[tokio::test]
    async fn test_stateful_operations_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());

        assert!(matches!(
            driver.start(true).await.unwrap_err(),
            Error::Unsupported(_)
        ));
        assert!(matches!(
            driver.stop(true).await.unwrap_err(),
            Error::Unsupported(_)
        ));
        assert!(matches!(driver.migrate().unwrap_err(), Error::Unsupported(_)));
        assert!(matches!(
            driver.cgroup_set("limits.memory", "1GiB").unwrap_err(),
            Error::Unsupported(_)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        assert!(matches!(
            driver.shutdown(Duration::from_secs(1)).await.unwrap_err(),
            Error::AlreadyStopped
        ));
    }

    #[test]
    fn test_nvram_source_selection() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut inst = test_instance(1, "web");
        fs::create_dir_all(state.instance_path(&inst)).unwrap();
        fs::create_dir_all(state.host.ovmf_path()).unwrap();
        fs::write(state.host.ovmf_path().join("OVMF_VARS.ms.fd"), b"secure").unwrap();
        fs::write(state.host.ovmf_path().join("OVMF_VARS.fd"), b"plain").unwrap();

        // Default is secureboot.
        setup_nvram(&state, &inst).unwrap();
        assert_eq!(fs::read(state.nvram_path(&inst)).unwrap(), b"secure");

        inst.expanded_config
            .insert("security.secureboot".into(), "false".into());
        setup_nvram(&state, &inst).unwrap();
        assert_eq!(fs::read(state.nvram_path(&inst)).unwrap(), b"plain");
    }

    #[test]
    fn test_nvram_missing_template_fails() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let inst = test_instance(1, "web");
        fs::create_dir_all(state.instance_path(&inst)).unwrap();

        let err = setup_nvram(&state, &inst).unwrap_err();
        assert!(err.to_string().contains("EFI firmware settings file missing"));
    }

    #[test]
    fn test_nvram_skipped_on_ppc64le() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut inst = test_instance(1, "power");
        inst.architecture = crate::instance::Architecture::Ppc64le;

        setup_nvram(&state, &inst).unwrap();
        assert!(!state.nvram_path(&inst).exists());
    }

    #[test]
    fn test_protected_keys_guard() {
        let inst = {
            let mut inst = test_instance(1, "web");
            inst.local_config
                .insert("volatile.vm.uuid".into(), "abc".into());
            inst.local_config.insert("image.os".into(), "ubuntu".into());
            inst
        };

        // Unchanged keys pass.
        let mut args = args_from(&inst);
        args.description = "new".into();
        assert!(check_protected_keys(&inst, &args).is_ok());

        // Changing a volatile key fails.
        let mut args = args_from(&inst);
        args.config
            .insert("volatile.vm.uuid".into(), "other".into());
        assert!(check_protected_keys(&inst, &args).is_err());

        // Dropping an image key fails too.
        let mut args = args_from(&inst);
        args.config.remove("image.os");
        assert!(check_protected_keys(&inst, &args).is_err());
    }

    #[test]
    fn test_validate_config() {
        let mut config = crate::instance::ConfigMap::new();
        config.insert("limits.memory".into(), "2GiB".into());
        config.insert("limits.cpu".into(), "0-3".into());
        config.insert("security.secureboot".into(), "false".into());
        assert!(validate_config(&config).is_ok());

        config.insert("limits.memory".into(), "lots".into());
        assert!(validate_config(&config).is_err());

        config.insert("limits.memory".into(), "1GiB".into());
        config.insert("security.secureboot".into(), "maybe".into());
        assert!(validate_config(&config).is_err());
    }
}
