//! Shared driver state and the contracts of external collaborators.
//!
//! The driver composes a storage pool, the cluster record store, the
//! lifecycle event stream and a few host integrations. Each is consumed
//! through a trait so the lifecycle logic stays testable; `mock` provides
//! in-memory implementations used across the test suite.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::instance::Instance;
use crate::oplock::OperationLockRegistry;
use crate::Result;

/// Recorded power state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Stopped,
}

/// Storage pool operations the driver consumes.
///
/// Mount and unmount return whether this call performed the transition,
/// so callers only undo mounts they themselves created.
pub trait StoragePool: Send + Sync {
    fn mount_instance(&self, inst: &Instance) -> Result<bool>;
    fn unmount_instance(&self, inst: &Instance) -> Result<bool>;

    /// Host path of the instance's root disk block device or image.
    fn instance_disk_path(&self, inst: &Instance) -> Result<PathBuf>;

    /// Root volume usage in bytes.
    fn instance_usage(&self, inst: &Instance) -> Result<u64>;

    fn restore_instance_snapshot(&self, inst: &Instance, source: &Instance) -> Result<()>;
    fn delete_instance(&self, inst: &Instance) -> Result<()>;
    fn delete_instance_snapshot(&self, inst: &Instance) -> Result<()>;
    fn rename_instance(&self, inst: &Instance, new_name: &str) -> Result<()>;
    fn rename_instance_snapshot(&self, inst: &Instance, new_snap_name: &str) -> Result<()>;

    /// Rewrite the on-volume backup file from the current record.
    fn update_backup_file(&self, inst: &Instance) -> Result<()>;
}

/// Cluster database operations, reduced to what the driver needs.
pub trait InstanceStore: Send + Sync {
    /// Record the power state and last-used timestamp in one transaction.
    fn set_power_state(&self, id: i64, state: PowerState, last_used_ms: Option<u64>) -> Result<()>;

    /// Insert a volatile key unless a concurrent writer beat us to it.
    /// Returns the value that ended up stored.
    fn volatile_insert(&self, id: i64, key: &str, value: &str) -> Result<String>;

    fn volatile_set(&self, id: i64, key: &str, value: &str) -> Result<()>;
    fn volatile_delete(&self, id: i64, key: &str) -> Result<()>;

    /// Persist a full record update: clear-and-reinsert config, profiles
    /// and devices, then update the instance row. Retried internally.
    fn replace_instance(&self, inst: &Instance) -> Result<()>;

    /// Snapshot records update only description and expiry.
    fn update_snapshot(&self, id: i64, description: &str, expiry_ms: u64) -> Result<()>;

    fn rename_instance(&self, project: &str, old_name: &str, new_name: &str) -> Result<()>;
    fn rename_snapshot(
        &self,
        project: &str,
        parent: &str,
        old_snap: &str,
        new_snap: &str,
    ) -> Result<()>;
    fn delete_instance(&self, project: &str, name: &str) -> Result<()>;

    /// Snapshot records below a parent instance.
    fn snapshots_of(&self, project: &str, parent: &str) -> Result<Vec<Instance>>;

    /// Names of profiles defined in a project, for Update validation.
    fn profile_names(&self, project: &str) -> Result<Vec<String>>;
}

/// Lifecycle event stream. Events are emitted only on success.
pub trait EventSink: Send + Sync {
    fn send_lifecycle(&self, project: &str, event: &str, name: &str);
}

/// MAAS DNS/DHCP integration.
pub trait MaasClient: Send + Sync {
    fn update_instance(&self, inst: &Instance) -> Result<()>;
    fn rename_instance(&self, inst: &Instance, new_name: &str) -> Result<()>;
    fn delete_instance(&self, inst: &Instance) -> Result<()>;
}

/// DNSMasq static lease maintenance, refreshed after renames.
pub trait DnsmasqHook: Send + Sync {
    fn update_static_leases(&self) -> Result<()>;
}

/// Kernel module loader. vhost_vsock must be present before launch.
pub trait KernelModules: Send + Sync {
    fn load(&self, module: &str) -> Result<()>;
}

/// Host-level paths and knobs for launching hypervisors.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Base directory holding `virtual-machines/`, `devices/`, `shmounts/`.
    pub var_dir: PathBuf,
    /// Base directory for per-instance log directories.
    pub log_dir: PathBuf,
    /// UEFI firmware directory. `STOKER_OVMF_PATH` overrides it when set.
    pub ovmf_dir: PathBuf,
    /// fd-passing and rlimit-lifting exec wrapper.
    pub forklimits_path: PathBuf,
    /// Unprivileged user the hypervisor drops to, when configured.
    pub unpriv_user: Option<String>,
    pub unpriv_uid: Option<u32>,
    /// Name of the guest agent binary looked up on PATH.
    pub agent_binary: String,
    /// Where network interface details are read from.
    pub sys_net_dir: PathBuf,
    /// Test hook: bypass the PATH search for the hypervisor binary.
    pub hypervisor_override: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            var_dir: PathBuf::from("/var/lib/stoker"),
            log_dir: PathBuf::from("/var/log/stoker"),
            ovmf_dir: PathBuf::from("/usr/share/OVMF"),
            forklimits_path: PathBuf::from("forklimits"),
            unpriv_user: None,
            unpriv_uid: None,
            agent_binary: "lxd-agent".to_string(),
            sys_net_dir: PathBuf::from("/sys/class/net"),
            hypervisor_override: None,
        }
    }
}

impl HostConfig {
    /// Firmware directory, honoring the `STOKER_OVMF_PATH` override.
    pub fn ovmf_path(&self) -> PathBuf {
        match std::env::var("STOKER_OVMF_PATH") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => self.ovmf_dir.clone(),
        }
    }
}

/// Everything the driver shares across instances.
pub struct DriverState {
    pub pool: Arc<dyn StoragePool>,
    pub store: Arc<dyn InstanceStore>,
    pub events: Arc<dyn EventSink>,
    pub maas: Arc<dyn MaasClient>,
    pub dnsmasq: Arc<dyn DnsmasqHook>,
    pub modules: Arc<dyn KernelModules>,
    pub oplocks: OperationLockRegistry,
    /// Instances with an active console attachment, one console per VM.
    pub consoles: Mutex<HashSet<i64>>,
    pub host: HostConfig,
}

impl DriverState {
    /// Per-instance directory on the config volume.
    pub fn instance_path(&self, inst: &Instance) -> PathBuf {
        self.var_dir()
            .join("virtual-machines")
            .join(inst.storage_name())
    }

    pub fn var_dir(&self) -> PathBuf {
        self.host.var_dir.clone()
    }

    pub fn log_path(&self, inst: &Instance) -> PathBuf {
        self.host.log_dir.join(inst.storage_name())
    }

    pub fn log_path_for(&self, storage_name: &str) -> PathBuf {
        self.host.log_dir.join(storage_name)
    }

    pub fn devices_path(&self, inst: &Instance) -> PathBuf {
        self.var_dir().join("devices").join(inst.storage_name())
    }

    pub fn shmounts_path(&self, inst: &Instance) -> PathBuf {
        self.var_dir().join("shmounts").join(inst.storage_name())
    }

    pub fn monitor_path(&self, inst: &Instance) -> PathBuf {
        self.log_path(inst).join("qemu.monitor")
    }

    pub fn pid_file_path(&self, inst: &Instance) -> PathBuf {
        self.log_path(inst).join("qemu.pid")
    }

    pub fn log_file_path(&self, inst: &Instance) -> PathBuf {
        self.log_path(inst).join("qemu.log")
    }

    pub fn console_log_path(&self, inst: &Instance) -> PathBuf {
        self.log_path(inst).join("console.log")
    }

    pub fn conf_file_path(&self, inst: &Instance) -> PathBuf {
        self.log_path(inst).join("qemu.conf")
    }

    pub fn nvram_path(&self, inst: &Instance) -> PathBuf {
        self.instance_path(inst).join("qemu.nvram")
    }

    pub fn config_drive_path(&self, inst: &Instance) -> PathBuf {
        self.instance_path(inst).join("config")
    }

    pub fn templates_path(&self, inst: &Instance) -> PathBuf {
        self.instance_path(inst).join("templates")
    }

    pub fn metadata_path(&self, inst: &Instance) -> PathBuf {
        self.instance_path(inst).join("metadata.yaml")
    }
}

/// Milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-memory collaborator implementations for tests and local experiments.
pub mod mock {
    use super::*;
    use crate::devices::Devices;
    use crate::instance::{Architecture, ConfigMap};

    /// In-memory instance store tracking volatile keys, power states and
    /// persisted records.
    #[derive(Default)]
    pub struct MockStore {
        inner: Mutex<MockStoreInner>,
    }

    #[derive(Default)]
    struct MockStoreInner {
        volatile: HashMap<(i64, String), String>,
        volatile_writes: usize,
        power: HashMap<i64, (PowerState, Option<u64>)>,
        replaced: Vec<i64>,
        deleted: Vec<String>,
        snapshots: HashMap<String, Vec<Instance>>,
        profiles: HashMap<String, Vec<String>>,
    }

    impl MockStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn volatile_writes(&self) -> usize {
            self.inner.lock().unwrap().volatile_writes
        }

        pub fn power_state(&self, id: i64) -> Option<PowerState> {
            self.inner.lock().unwrap().power.get(&id).map(|(s, _)| *s)
        }

        pub fn last_used(&self, id: i64) -> Option<u64> {
            self.inner
                .lock()
                .unwrap()
                .power
                .get(&id)
                .and_then(|(_, t)| *t)
        }

        pub fn replaced_count(&self, id: i64) -> usize {
            self.inner
                .lock()
                .unwrap()
                .replaced
                .iter()
                .filter(|i| **i == id)
                .count()
        }

        pub fn deleted_names(&self) -> Vec<String> {
            self.inner.lock().unwrap().deleted.clone()
        }

        pub fn volatile_get(&self, id: i64, key: &str) -> Option<String> {
            self.inner
                .lock()
                .unwrap()
                .volatile
                .get(&(id, key.to_string()))
                .cloned()
        }

        pub fn define_profiles(&self, project: &str, names: &[&str]) {
            self.inner.lock().unwrap().profiles.insert(
                project.to_string(),
                names.iter().map(|s| s.to_string()).collect(),
            );
        }

        pub fn define_snapshots(&self, project: &str, parent: &str, snaps: Vec<Instance>) {
            self.inner
                .lock()
                .unwrap()
                .snapshots
                .insert(format!("{project}/{parent}"), snaps);
        }
    }

    impl InstanceStore for MockStore {
        fn set_power_state(
            &self,
            id: i64,
            state: PowerState,
            last_used_ms: Option<u64>,
        ) -> Result<()> {
            self.inner
                .lock()
                .unwrap()
                .power
                .insert(id, (state, last_used_ms));
            Ok(())
        }

        fn volatile_insert(&self, id: i64, key: &str, value: &str) -> Result<String> {
            let mut inner = self.inner.lock().unwrap();
            let slot = (id, key.to_string());
            if let Some(existing) = inner.volatile.get(&slot) {
                return Ok(existing.clone());
            }
            inner.volatile.insert(slot, value.to_string());
            inner.volatile_writes += 1;
            Ok(value.to_string())
        }

        fn volatile_set(&self, id: i64, key: &str, value: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner
                .volatile
                .insert((id, key.to_string()), value.to_string());
            inner.volatile_writes += 1;
            Ok(())
        }

        fn volatile_delete(&self, id: i64, key: &str) -> Result<()> {
            self.inner
                .lock()
                .unwrap()
                .volatile
                .remove(&(id, key.to_string()));
            Ok(())
        }

        fn replace_instance(&self, inst: &Instance) -> Result<()> {
            self.inner.lock().unwrap().replaced.push(inst.id);
            Ok(())
        }

        fn update_snapshot(&self, id: i64, _description: &str, _expiry_ms: u64) -> Result<()> {
            self.inner.lock().unwrap().replaced.push(id);
            Ok(())
        }

        fn rename_instance(&self, _project: &str, _old: &str, _new: &str) -> Result<()> {
            Ok(())
        }

        fn rename_snapshot(
            &self,
            _project: &str,
            _parent: &str,
            _old_snap: &str,
            _new_snap: &str,
        ) -> Result<()> {
            Ok(())
        }

        fn delete_instance(&self, project: &str, name: &str) -> Result<()> {
            self.inner
                .lock()
                .unwrap()
                .deleted
                .push(format!("{project}/{name}"));
            Ok(())
        }

        fn snapshots_of(&self, project: &str, parent: &str) -> Result<Vec<Instance>> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .snapshots
                .get(&format!("{project}/{parent}"))
                .cloned()
                .unwrap_or_default())
        }

        fn profile_names(&self, project: &str) -> Result<Vec<String>> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .profiles
                .get(project)
                .cloned()
                .unwrap_or_else(|| vec!["default".to_string()]))
        }
    }

    /// Storage pool over a plain directory tree.
    pub struct MockPool {
        base: PathBuf,
        inner: Mutex<MockPoolInner>,
    }

    #[derive(Default)]
    struct MockPoolInner {
        mounted: HashSet<String>,
        mounts: usize,
        unmounts: usize,
        restored: Vec<String>,
        deleted: Vec<String>,
    }

    impl MockPool {
        pub fn new(base: impl Into<PathBuf>) -> Self {
            Self {
                base: base.into(),
                inner: Mutex::new(MockPoolInner::default()),
            }
        }

        pub fn mount_count(&self) -> usize {
            self.inner.lock().unwrap().mounts
        }

        pub fn unmount_count(&self) -> usize {
            self.inner.lock().unwrap().unmounts
        }

        pub fn is_mounted(&self, inst: &Instance) -> bool {
            self.inner
                .lock()
                .unwrap()
                .mounted
                .contains(&inst.storage_name())
        }

        pub fn restored(&self) -> Vec<String> {
            self.inner.lock().unwrap().restored.clone()
        }

        pub fn deleted(&self) -> Vec<String> {
            self.inner.lock().unwrap().deleted.clone()
        }
    }

    impl StoragePool for MockPool {
        fn mount_instance(&self, inst: &Instance) -> Result<bool> {
            let mut inner = self.inner.lock().unwrap();
            inner.mounts += 1;
            Ok(inner.mounted.insert(inst.storage_name()))
        }

        fn unmount_instance(&self, inst: &Instance) -> Result<bool> {
            let mut inner = self.inner.lock().unwrap();
            inner.unmounts += 1;
            Ok(inner.mounted.remove(&inst.storage_name()))
        }

        fn instance_disk_path(&self, inst: &Instance) -> Result<PathBuf> {
            Ok(self.base.join(inst.storage_name()).join("root.img"))
        }

        fn instance_usage(&self, _inst: &Instance) -> Result<u64> {
            Ok(0)
        }

        fn restore_instance_snapshot(&self, inst: &Instance, source: &Instance) -> Result<()> {
            self.inner
                .lock()
                .unwrap()
                .restored
                .push(format!("{} <- {}", inst.name, source.name));
            Ok(())
        }

        fn delete_instance(&self, inst: &Instance) -> Result<()> {
            self.inner.lock().unwrap().deleted.push(inst.name.clone());
            Ok(())
        }

        fn delete_instance_snapshot(&self, inst: &Instance) -> Result<()> {
            self.inner.lock().unwrap().deleted.push(inst.name.clone());
            Ok(())
        }

        fn rename_instance(&self, _inst: &Instance, _new_name: &str) -> Result<()> {
            Ok(())
        }

        fn rename_instance_snapshot(&self, _inst: &Instance, _new_snap_name: &str) -> Result<()> {
            Ok(())
        }

        fn update_backup_file(&self, _inst: &Instance) -> Result<()> {
            Ok(())
        }
    }

    /// Captures lifecycle events in order.
    #[derive(Default)]
    pub struct MockEvents {
        events: Mutex<Vec<String>>,
    }

    impl MockEvents {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn recorded(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for MockEvents {
        fn send_lifecycle(&self, _project: &str, event: &str, _name: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }
    }

    #[derive(Default)]
    pub struct MockMaas {
        pub updates: Mutex<usize>,
    }

    impl MaasClient for MockMaas {
        fn update_instance(&self, _inst: &Instance) -> Result<()> {
            *self.updates.lock().unwrap() += 1;
            Ok(())
        }

        fn rename_instance(&self, _inst: &Instance, _new_name: &str) -> Result<()> {
            Ok(())
        }

        fn delete_instance(&self, _inst: &Instance) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockDnsmasq;

    impl DnsmasqHook for MockDnsmasq {
        fn update_static_leases(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockModules {
        pub loaded: Mutex<Vec<String>>,
        pub fail: Mutex<bool>,
    }

    impl MockModules {
        pub fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    impl KernelModules for MockModules {
        fn load(&self, module: &str) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(crate::Error::context(format!(
                    "Failed to load kernel module {module}"
                )));
            }
            self.loaded.lock().unwrap().push(module.to_string());
            Ok(())
        }
    }

    /// Minimal instance record for unit tests.
    pub fn test_instance(id: i64, name: &str) -> Instance {
        Instance {
            id,
            name: name.to_string(),
            project: "default".to_string(),
            description: String::new(),
            architecture: Architecture::X86_64,
            ephemeral: false,
            snapshot: false,
            stateful: false,
            profiles: Vec::new(),
            local_config: ConfigMap::new(),
            local_devices: Devices::new(),
            expanded_config: ConfigMap::new(),
            expanded_devices: Devices::new(),
            created_ms: now_ms(),
            last_used_ms: 0,
            expiry_ms: 0,
        }
    }

    /// Build a complete mock driver state rooted at `base`.
    pub fn test_state(base: &Path) -> DriverState {
        DriverState {
            pool: Arc::new(MockPool::new(base.join("pool"))),
            store: Arc::new(MockStore::new()),
            events: Arc::new(MockEvents::new()),
            maas: Arc::new(MockMaas::default()),
            dnsmasq: Arc::new(MockDnsmasq),
            modules: Arc::new(MockModules::default()),
            oplocks: OperationLockRegistry::new(),
            consoles: Mutex::new(HashSet::new()),
            host: HostConfig {
                var_dir: base.join("var"),
                log_dir: base.join("logs"),
                ovmf_dir: base.join("ovmf"),
                forklimits_path: PathBuf::from("forklimits"),
                unpriv_user: None,
                unpriv_uid: None,
                agent_binary: "lxd-agent".to_string(),
                sys_net_dir: base.join("sys-net"),
                hypervisor_override: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn test_paths_layout() {
        let state = test_state(Path::new("/base"));
        let inst = test_instance(1, "web");

        assert_eq!(
            state.instance_path(&inst),
            Path::new("/base/var/virtual-machines/web")
        );
        assert_eq!(
            state.monitor_path(&inst),
            Path::new("/base/logs/web/qemu.monitor")
        );
        assert_eq!(state.nvram_path(&inst), Path::new("/base/var/virtual-machines/web/qemu.nvram"));
        assert_eq!(
            state.config_drive_path(&inst),
            Path::new("/base/var/virtual-machines/web/config")
        );
    }

    #[test]
    fn test_mock_pool_mount_tracking() {
        let pool = MockPool::new("/tmp/pool");
        let inst = test_instance(1, "web");

        assert!(pool.mount_instance(&inst).unwrap());
        assert!(!pool.mount_instance(&inst).unwrap());
        assert!(pool.unmount_instance(&inst).unwrap());
        assert!(!pool.unmount_instance(&inst).unwrap());
    }

    #[test]
    fn test_volatile_insert_first_writer_wins() {
        let store = MockStore::new();
        assert_eq!(store.volatile_insert(1, "k", "a").unwrap(), "a");
        assert_eq!(store.volatile_insert(1, "k", "b").unwrap(), "a");
        assert_eq!(store.volatile_writes(), 1);
    }
}
