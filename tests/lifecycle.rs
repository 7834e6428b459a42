//! Lifecycle tests for the QEMU driver
//!
//! These run the full orchestration paths against mock collaborators, a
//! stub hypervisor launcher, and a scripted QMP endpoint speaking the
//! real wire protocol over the instance's monitor socket.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use stoker::devices::{DeviceConfig, Devices};
use stoker::state::mock::{MockDnsmasq, MockEvents, MockMaas, MockModules, MockPool, MockStore};
use stoker::state::{now_ms, DriverState, HostConfig, PowerState};
use stoker::{Architecture, Driver, Error, Instance, InstanceArgs, InstanceStateCode};

// =============================================================================
// TEST HARNESS
// =============================================================================

/// Behaviour of the scripted hypervisor endpoint.
#[derive(Default)]
struct QmpServerState {
    /// Guest CPU thread ids returned by query-cpus.
    cpu_pids: Vec<i32>,
    /// Set once `cont` has been received; drives query-status.
    running: bool,
    /// When true, `system_powerdown` is followed by a SHUTDOWN event and
    /// a hangup, as a cooperating guest would.
    powerdown_exits: bool,
    /// Monotonic connection counter; events go to the latest connection.
    conn_counter: u64,
    current_conn: u64,
    /// Reason attached to the next pushed SHUTDOWN event.
    shutdown_reason: Option<String>,
}

struct Harness {
    _dir: TempDir,
    state: Arc<DriverState>,
    store: Arc<MockStore>,
    pool: Arc<MockPool>,
    events: Arc<MockEvents>,
    qmp: Arc<Mutex<QmpServerState>>,
    push_event: Arc<Notify>,
    monitor_path: PathBuf,
}

const STUB_FORKLIMITS: &str = r#"#!/bin/sh
pidfile=""
prev=""
for a in "$@"; do
  [ "$prev" = "-pidfile" ] && pidfile="$a"
  prev="$a"
done
echo $$ > "$pidfile"
exit 0
"#;

fn harness() -> (Harness, Instance) {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().to_path_buf();

    let stub = base.join("forklimits");
    fs::write(&stub, STUB_FORKLIMITS).unwrap();
    fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();

    let store = Arc::new(MockStore::new());
    let pool = Arc::new(MockPool::new(base.join("pool")));
    let events = Arc::new(MockEvents::new());
    let modules = Arc::new(MockModules::default());

    let host = HostConfig {
        var_dir: base.join("var"),
        log_dir: base.join("logs"),
        ovmf_dir: base.join("ovmf"),
        forklimits_path: stub,
        unpriv_user: None,
        unpriv_uid: None,
        agent_binary: "lxd-agent".to_string(),
        sys_net_dir: base.join("sys-net"),
        hypervisor_override: Some(PathBuf::from("/bin/true")),
    };

    // Firmware templates the NVRAM setup copies from.
    fs::create_dir_all(&host.ovmf_dir).unwrap();
    fs::write(host.ovmf_dir.join("OVMF_CODE.fd"), b"code").unwrap();
    fs::write(host.ovmf_dir.join("OVMF_VARS.ms.fd"), b"secureboot-vars").unwrap();
    fs::write(host.ovmf_dir.join("OVMF_VARS.fd"), b"plain-vars").unwrap();

    // The bridge parent resolves as a tun-backed tap link.
    let link = host.sys_net_dir.join("lxdbr0");
    fs::create_dir_all(&link).unwrap();
    fs::write(link.join("tun_flags"), "0x1002\n").unwrap();

    let state = Arc::new(DriverState {
        pool: pool.clone(),
        store: store.clone(),
        events: events.clone(),
        maas: Arc::new(MockMaas::default()),
        dnsmasq: Arc::new(MockDnsmasq),
        modules,
        oplocks: stoker::oplock::OperationLockRegistry::new(),
        consoles: Mutex::new(Default::default()),
        host,
    });

    let inst = s1_instance(&base);
    let monitor_path = state.log_path(&inst).join("qemu.monitor");
    fs::create_dir_all(state.log_path(&inst)).unwrap();

    let harness = Harness {
        _dir: dir,
        state,
        store,
        pool,
        events,
        qmp: Arc::new(Mutex::new(QmpServerState {
            cpu_pids: vec![9001, 9002],
            powerdown_exits: true,
            ..Default::default()
        })),
        push_event: Arc::new(Notify::new()),
        monitor_path,
    };

    (harness, inst)
}

fn dev(pairs: &[(&str, &str)]) -> DeviceConfig {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// The S1 instance: two disks and one bridged NIC.
fn s1_instance(base: &Path) -> Instance {
    let data_img = base.join("data.img");
    fs::write(&data_img, b"disk").unwrap();

    let mut devices = Devices::new();
    devices.insert(
        "root".into(),
        dev(&[("type", "disk"), ("path", "/"), ("pool", "default")]),
    );
    devices.insert(
        "data".into(),
        dev(&[
            ("type", "disk"),
            ("path", "/srv"),
            ("source", data_img.to_str().unwrap()),
        ]),
    );
    devices.insert(
        "eth0".into(),
        dev(&[("type", "nic"), ("nictype", "bridged"), ("parent", "lxdbr0")]),
    );

    let mut config = stoker::instance::ConfigMap::new();
    config.insert("limits.memory".into(), "2GiB".into());
    config.insert("limits.cpu".into(), "2".into());
    config.insert("security.secureboot".into(), "true".into());

    Instance {
        id: 10,
        name: "web".into(),
        project: "default".into(),
        description: String::new(),
        architecture: Architecture::X86_64,
        ephemeral: false,
        snapshot: false,
        stateful: false,
        profiles: Vec::new(),
        local_config: config,
        local_devices: devices,
        expanded_config: Default::default(),
        expanded_devices: Devices::new(),
        created_ms: now_ms(),
        last_used_ms: 0,
        expiry_ms: 0,
    }
}

/// Scripted QMP endpoint. Keeps the monitor socket bound (re-binding
/// after OnStop unlinks it), answers commands from the shared state and
/// pushes SHUTDOWN events to the most recent connection on request.
fn spawn_qmp_server(harness: &Harness) {
    let path = harness.monitor_path.clone();
    let state = harness.qmp.clone();
    let push = harness.push_event.clone();

    tokio::spawn(async move {
        let mut listener: Option<UnixListener> = None;
        loop {
            if !path.exists() {
                listener = UnixListener::bind(&path).ok();
            }
            let Some(active) = listener.as_ref() else {
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            };

            match tokio::time::timeout(Duration::from_millis(10), active.accept()).await {
                Ok(Ok((stream, _))) => {
                    let conn_id = {
                        let mut s = state.lock().unwrap();
                        s.conn_counter += 1;
                        s.current_conn = s.conn_counter;
                        s.conn_counter
                    };
                    tokio::spawn(handle_conn(stream, state.clone(), push.clone(), conn_id));
                }
                Ok(Err(_)) => listener = None,
                Err(_) => {}
            }
        }
    });
}

async fn handle_conn(
    mut stream: UnixStream,
    state: Arc<Mutex<QmpServerState>>,
    push: Arc<Notify>,
    conn_id: u64,
) {
    if stream
        .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
        .await
        .is_err()
    {
        return;
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        tokio::select! {
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }

                let Ok(request) = serde_json::from_str::<Value>(&line) else { continue };
                let command = request.get("execute").and_then(Value::as_str).unwrap_or("");
                let id = request.get("id").cloned().unwrap_or(Value::Null);

                let (reply, then_shutdown): (Value, Option<String>) = {
                    let mut s = state.lock().unwrap();
                    match command {
                        "qmp_capabilities" => (json!({}), None),
                        "query-status" => {
                            let status = if s.running { "running" } else { "shutdown" };
                            (json!({ "status": status }), None)
                        }
                        "query-cpus" => {
                            let cpus: Vec<Value> = s
                                .cpu_pids
                                .iter()
                                .enumerate()
                                .map(|(i, pid)| json!({ "CPU": i, "thread_id": pid }))
                                .collect();
                            (Value::Array(cpus), None)
                        }
                        "cont" => {
                            s.running = true;
                            (json!({}), None)
                        }
                        "stop" => {
                            s.running = false;
                            (json!({}), None)
                        }
                        "system_powerdown" => {
                            if s.powerdown_exits {
                                s.running = false;
                                (json!({}), Some("guest-shutdown".to_string()))
                            } else {
                                (json!({}), None)
                            }
                        }
                        "quit" => {
                            s.running = false;
                            (json!({}), Some("host-qmp-quit".to_string()))
                        }
                        _ => (json!({}), None),
                    }
                };

                let response = json!({ "return": reply, "id": id });
                if write_half
                    .write_all(format!("{response}\n").as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }

                if let Some(reason) = then_shutdown {
                    let event = shutdown_event(&reason);
                    let _ = write_half.write_all(format!("{event}\n").as_bytes()).await;
                    return; // hang up, the hypervisor exited
                }
            }
            _ = push.notified() => {
                let (is_current, reason) = {
                    let mut s = state.lock().unwrap();
                    let reason = s.shutdown_reason.take().unwrap_or_else(|| "guest-shutdown".into());
                    (s.current_conn == conn_id, reason)
                };
                if !is_current {
                    continue;
                }
                let event = shutdown_event(&reason);
                let _ = write_half.write_all(format!("{event}\n").as_bytes()).await;
                let mut s = state.lock().unwrap();
                s.running = false;
                return;
            }
        }
    }
}

fn shutdown_event(reason: &str) -> Value {
    json!({
        "event": "SHUTDOWN",
        "data": { "guest": true, "reason": reason },
        "timestamp": { "seconds": 1, "microseconds": 0 },
    })
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// =============================================================================
// S1: COLD START
// =============================================================================

#[tokio::test]
async fn test_cold_start_two_disks_one_nic() {
    let (harness, inst) = harness();
    spawn_qmp_server(&harness);

    let driver = Driver::new(harness.state.clone(), inst.clone()).unwrap();
    driver.start(false).await.unwrap();

    // NVRAM came from the secureboot template.
    let nvram = fs::read(harness.state.nvram_path(&inst)).unwrap();
    assert_eq!(nvram, b"secureboot-vars");

    // The emitted config holds exactly two drives plus the firmware
    // pflash pair, with boot indexes root=0 data=1 eth0=2.
    let conf = fs::read_to_string(harness.state.conf_file_path(&inst)).unwrap();
    assert_eq!(conf.matches("[drive \"stoker_").count(), 2);
    assert!(conf.contains("[drive \"stoker_root\"]"));
    assert!(conf.contains("[drive \"stoker_data\"]"));

    let root_section = conf.split("[drive \"stoker_root\"]").nth(1).unwrap();
    assert!(root_section.starts_with('\n'));
    assert!(root_section.contains("bootindex = \"0\""));

    let data_section = conf.split("[drive \"stoker_data\"]").nth(1).unwrap();
    assert!(data_section.contains("bootindex = \"1\""));

    let nic_section = conf.split("[netdev \"stoker_eth0\"]").nth(1).unwrap();
    assert!(nic_section.contains("bootindex = \"2\""));

    // vsock context id is instance id + 3.
    assert!(conf.contains("guest-cid = \"13\""));

    // Two vCPU threads reported and the guest is running.
    assert_eq!(harness.store.power_state(10), Some(PowerState::Running));
    assert!(harness.store.last_used(10).is_some());
    assert_eq!(driver.state_code().await, InstanceStateCode::Running);

    assert_eq!(
        harness.events.recorded(),
        vec!["virtual-machine-started".to_string()]
    );

    // Generated NIC MAC was persisted once.
    assert!(harness
        .store
        .volatile_get(10, "volatile.eth0.hwaddr")
        .is_some());
}

#[tokio::test]
async fn test_start_twice_fails() {
    let (harness, inst) = harness();
    spawn_qmp_server(&harness);

    let driver = Driver::new(harness.state.clone(), inst).unwrap();
    driver.start(false).await.unwrap();

    assert!(matches!(
        driver.start(false).await.unwrap_err(),
        Error::AlreadyRunning
    ));
}

// =============================================================================
// S2: GRACEFUL SHUTDOWN WITH TIMEOUT
// =============================================================================

#[tokio::test]
async fn test_shutdown_guest_cooperates() {
    let (harness, inst) = harness();
    spawn_qmp_server(&harness);

    let driver = Driver::new(harness.state.clone(), inst.clone()).unwrap();
    driver.start(false).await.unwrap();

    driver.shutdown(Duration::from_secs(5)).await.unwrap();

    // OnStop runs from the SHUTDOWN event and finalizes the state.
    let store = harness.store.clone();
    wait_until("power state STOPPED", || {
        store.power_state(10) == Some(PowerState::Stopped)
    })
    .await;

    let pid_file = harness.state.pid_file_path(&inst);
    wait_until("pid file removed", || !pid_file.exists()).await;

    let events = harness.events.recorded();
    assert!(events.contains(&"virtual-machine-shutdown".to_string()));
}

#[tokio::test]
async fn test_shutdown_timeout_leaves_guest_running() {
    let (harness, inst) = harness();
    harness.qmp.lock().unwrap().powerdown_exits = false;
    spawn_qmp_server(&harness);

    let driver = Driver::new(harness.state.clone(), inst).unwrap();
    driver.start(false).await.unwrap();

    let err = driver.shutdown(Duration::from_millis(300)).await.unwrap_err();
    assert_eq!(err.to_string(), "Instance was not shutdown after timeout");

    // Guest untouched.
    assert_eq!(harness.store.power_state(10), Some(PowerState::Running));
    assert_eq!(driver.state_code().await, InstanceStateCode::Running);

    // The failed shutdown released its lock; a stop can proceed.
    assert!(harness.state.oplocks.get(10).is_none());
}

// =============================================================================
// S3: GUEST-INITIATED REBOOT
// =============================================================================

#[tokio::test]
async fn test_guest_reset_triggers_restart() {
    let (harness, inst) = harness();
    spawn_qmp_server(&harness);

    let driver = Driver::new(harness.state.clone(), inst).unwrap();
    driver.start(false).await.unwrap();
    assert_eq!(harness.events.recorded().len(), 1);

    // Guest resets itself.
    harness.qmp.lock().unwrap().shutdown_reason = Some("guest-reset".into());
    harness.push_event.notify_waiters();

    // OnStop cleans up, then immediately starts again.
    let events = harness.events.clone();
    wait_until("restart event", || {
        events
            .recorded()
            .iter()
            .filter(|e| *e == "virtual-machine-started")
            .count()
            == 2
    })
    .await;

    let store = harness.store.clone();
    wait_until("running again", || {
        store.power_state(10) == Some(PowerState::Running)
    })
    .await;
    assert_eq!(driver.state_code().await, InstanceStateCode::Running);
}

// =============================================================================
// EXPLICIT STOP
// =============================================================================

#[tokio::test]
async fn test_stop_finalizes_through_on_stop() {
    let (harness, inst) = harness();
    spawn_qmp_server(&harness);

    let driver = Driver::new(harness.state.clone(), inst.clone()).unwrap();
    driver.start(false).await.unwrap();
    assert!(harness.pool.is_mounted(&inst));

    driver.stop(false).await.unwrap();

    assert_eq!(harness.store.power_state(10), Some(PowerState::Stopped));
    assert!(!harness.state.pid_file_path(&inst).exists());
    assert!(!harness.pool.is_mounted(&inst));
    assert!(harness
        .events
        .recorded()
        .contains(&"virtual-machine-stopped".to_string()));

    // Lock released for the next operation.
    assert!(harness.state.oplocks.get(10).is_none());
}

// =============================================================================
// S4: HOT-PLUG NIC VIA UPDATE
// =============================================================================

#[tokio::test]
async fn test_hot_plug_nic_on_running_instance() {
    let (harness, inst) = harness();
    spawn_qmp_server(&harness);

    let driver = Driver::new(harness.state.clone(), inst.clone()).unwrap();
    driver.start(false).await.unwrap();

    // Build the update from the current record, as the API layer would.
    let current = driver.instance().await;
    let mut args = InstanceArgs {
        description: current.description.clone(),
        architecture: Some(current.architecture),
        ephemeral: current.ephemeral,
        config: current.local_config.clone(),
        devices: current.local_devices.clone(),
        profiles: current.profiles.clone(),
        expiry_ms: current.expiry_ms,
    };
    args.devices.insert(
        "eth1".into(),
        dev(&[("type", "nic"), ("nictype", "bridged"), ("parent", "lxdbr0")]),
    );

    driver.update(args, true).await.unwrap();

    // Device record added and started: its MAC was generated.
    assert!(harness
        .store
        .volatile_get(10, "volatile.eth1.hwaddr")
        .is_some());

    // Still running, config persisted, update event emitted.
    assert_eq!(harness.store.power_state(10), Some(PowerState::Running));
    assert_eq!(harness.store.replaced_count(10), 1);
    assert!(harness
        .events
        .recorded()
        .contains(&"virtual-machine-updated".to_string()));
}

#[tokio::test]
async fn test_non_hot_pluggable_device_rejected_while_running() {
    let (harness, inst) = harness();
    spawn_qmp_server(&harness);

    let driver = Driver::new(harness.state.clone(), inst.clone()).unwrap();
    driver.start(false).await.unwrap();

    let extra_img = harness.state.host.var_dir.join("extra.img");
    fs::write(&extra_img, b"disk").unwrap();

    let current = driver.instance().await;
    let mut args = InstanceArgs {
        description: current.description.clone(),
        architecture: Some(current.architecture),
        ephemeral: current.ephemeral,
        config: current.local_config.clone(),
        devices: current.local_devices.clone(),
        profiles: current.profiles.clone(),
        expiry_ms: current.expiry_ms,
    };
    args.devices.insert(
        "extra".into(),
        dev(&[
            ("type", "disk"),
            ("path", "/extra"),
            ("source", extra_img.to_str().unwrap()),
        ]),
    );

    let err = driver.update(args, true).await.unwrap_err();
    assert!(err.to_string().contains("extra"));

    // Rolled back: no volatile keys, no persisted record.
    assert_eq!(harness.store.replaced_count(10), 0);
    let current = driver.instance().await;
    assert!(!current.local_devices.contains("extra"));
}

// =============================================================================
// S5: CPU PINNING MISMATCH
// =============================================================================

#[tokio::test]
async fn test_pinning_mismatch_fails_and_reverts() {
    let (harness, mut inst) = harness();
    // The hypervisor reports three vCPU threads for a one-CPU pin set.
    harness.qmp.lock().unwrap().cpu_pids = vec![9001, 9002, 9003];
    spawn_qmp_server(&harness);

    inst.local_config.insert("limits.cpu".into(), "0-0".into());

    let driver = Driver::new(harness.state.clone(), inst.clone()).unwrap();
    let err = driver.start(false).await.unwrap_err();
    assert_eq!(err.to_string(), "QEMU has less vCPUs than configured");

    // Reverter unwound the mount; state never became RUNNING.
    assert_ne!(harness.store.power_state(10), Some(PowerState::Running));
    assert!(!harness.pool.is_mounted(&inst));
    assert!(harness.events.recorded().is_empty());

    // Lock released after the failed start.
    assert!(harness.state.oplocks.get(10).is_none());
}

// =============================================================================
// S6: DELETE PROTECTION
// =============================================================================

#[tokio::test]
async fn test_delete_protection() {
    let (harness, mut inst) = harness();
    inst.local_config
        .insert("security.protection.delete".into(), "true".into());

    let driver = Driver::new(harness.state.clone(), inst).unwrap();
    let err = driver.delete().await.unwrap_err();
    assert!(matches!(err, Error::Protected));

    // Nothing was touched.
    assert!(harness.pool.deleted().is_empty());
    assert!(harness.store.deleted_names().is_empty());
    assert!(harness.events.recorded().is_empty());
}

#[tokio::test]
async fn test_delete_unprotected() {
    let (harness, inst) = harness();

    let driver = Driver::new(harness.state.clone(), inst).unwrap();
    driver.delete().await.unwrap();

    assert_eq!(harness.pool.deleted(), vec!["web".to_string()]);
    assert_eq!(harness.store.deleted_names(), vec!["default/web".to_string()]);
    assert!(harness
        .events
        .recorded()
        .contains(&"virtual-machine-deleted".to_string()));
}

// =============================================================================
// UPDATE GUARDRAILS
// =============================================================================

#[tokio::test]
async fn test_user_update_cannot_touch_volatile() {
    let (harness, mut inst) = harness();
    inst.local_config
        .insert("volatile.vm.uuid".into(), "fixed".into());

    let driver = Driver::new(harness.state.clone(), inst.clone()).unwrap();

    let mut args = InstanceArgs {
        description: String::new(),
        architecture: Some(inst.architecture),
        ephemeral: false,
        config: inst.local_config.clone(),
        devices: inst.local_devices.clone(),
        profiles: Vec::new(),
        expiry_ms: 0,
    };
    args.config
        .insert("volatile.vm.uuid".into(), "tampered".into());

    let err = driver.update(args, true).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));

    // The driver itself may write the same key.
    let current = driver.instance().await;
    assert_eq!(current.local_config.get("volatile.vm.uuid").unwrap(), "fixed");
}

#[tokio::test]
async fn test_update_rejects_unknown_profile() {
    let (harness, inst) = harness();
    harness.store.define_profiles("default", &["default"]);

    let driver = Driver::new(harness.state.clone(), inst.clone()).unwrap();

    let args = InstanceArgs {
        description: String::new(),
        architecture: Some(inst.architecture),
        ephemeral: false,
        config: inst.local_config.clone(),
        devices: inst.local_devices.clone(),
        profiles: vec![stoker::Profile {
            name: "missing".into(),
            ..Default::default()
        }],
        expiry_ms: 0,
    };

    assert!(driver.update(args, true).await.is_err());
}

// =============================================================================
// RENAME
// =============================================================================

#[tokio::test]
async fn test_rename_stopped_instance() {
    let (harness, inst) = harness();

    let driver = Driver::new(harness.state.clone(), inst).unwrap();
    driver.rename("web2").await.unwrap();

    let current = driver.instance().await;
    assert_eq!(current.name, "web2");
    assert!(harness
        .events
        .recorded()
        .contains(&"virtual-machine-renamed".to_string()));
}

#[tokio::test]
async fn test_rename_running_refused() {
    let (harness, inst) = harness();
    spawn_qmp_server(&harness);

    let driver = Driver::new(harness.state.clone(), inst).unwrap();
    driver.start(false).await.unwrap();

    assert!(driver.rename("web2").await.is_err());
    assert_eq!(driver.instance().await.name, "web");
}
