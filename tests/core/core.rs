use mongovisor::core::config::{SupervisorConfig, load_config_file};
use mongovisor::core::error::VisorError;
use mongovisor::core::events::EventLog;
use mongovisor::core::state::{InstanceRecord, InstanceStatus, InstanceStore};
use mongovisor::core::store::Store;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn store_in(dir: &Path) -> InstanceStore {
    let home = Store::new(dir);
    InstanceStore::new(home.instances_path(), home.lock_path())
}

fn record(name: &str, port: u16, status: InstanceStatus) -> InstanceRecord {
    InstanceRecord {
        name: name.to_string(),
        data_directory: format!("/var/mongodb/data/{}", name).into(),
        port,
        status,
    }
}

#[test]
fn save_of_load_is_byte_identical() {
    let tmp = tempdir().expect("tempdir");
    let store = store_in(tmp.path());
    store
        .save(&[
            record("alpha", 27017, InstanceStatus::Running),
            record("beta", 27018, InstanceStatus::Stopped),
        ])
        .expect("save");
    let first = fs::read(store.path()).expect("read");

    let loaded = store.load().expect("load");
    store.save(&loaded).expect("save again");
    assert_eq!(fs::read(store.path()).expect("read"), first);

    let text = String::from_utf8(first).expect("utf8");
    assert!(text.contains("\"dataDirectory\": \"/var/mongodb/data/alpha\""));
    assert!(text.contains("\"status\": \"stopped\""));
    assert!(text.ends_with("]\n"));
}

#[test]
fn file_written_by_hand_is_accepted() {
    let tmp = tempdir().expect("tempdir");
    let store = store_in(tmp.path());
    fs::write(
        store.path(),
        r#"[{"name":"legacy","dataDirectory":"/data/legacy","port":27020,"status":"running"}]"#,
    )
    .expect("write");

    let records = store.load().expect("load");
    assert_eq!(records, vec![InstanceRecord {
        name: "legacy".into(),
        data_directory: "/data/legacy".into(),
        port: 27020,
        status: InstanceStatus::Running,
    }]);
}

#[test]
fn corrupt_state_is_fatal_and_left_alone() {
    let tmp = tempdir().expect("tempdir");
    let store = store_in(tmp.path());
    fs::write(store.path(), "{ not json").expect("write");

    let err = store.transact(|_| Ok(())).unwrap_err();
    assert!(matches!(err, VisorError::StateCorruption { .. }));
    assert_eq!(fs::read_to_string(store.path()).expect("read"), "{ not json");
}

#[test]
fn held_lock_times_out_other_writers() {
    let tmp = tempdir().expect("tempdir");
    let holder = store_in(tmp.path());
    let contender = store_in(tmp.path()).with_lock_timeout(Duration::from_millis(100));

    let guard = holder.lock().expect("first lock");
    let err = contender
        .transact(|records| {
            records.push(record("late", 27017, InstanceStatus::Stopped));
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, VisorError::LockTimeout { .. }));
    assert!(!holder.path().exists());

    drop(guard);
    contender
        .transact(|records| {
            records.push(record("late", 27017, InstanceStatus::Stopped));
            Ok(())
        })
        .expect("lock after release");
    assert_eq!(holder.load().expect("load").len(), 1);
}

#[test]
fn concurrent_writers_do_not_lose_updates() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    let writers = 6;
    let barrier = Arc::new(Barrier::new(writers));

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let root = root.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = store_in(&root).with_lock_timeout(Duration::from_secs(10));
                barrier.wait();
                store
                    .transact(|records| {
                        records.push(record(&format!("w{}", i), 28000 + i as u16, InstanceStatus::Stopped));
                        Ok(())
                    })
                    .expect("transact");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }

    let mut names: Vec<String> = store_in(&root)
        .load()
        .expect("load")
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort();
    let expected: Vec<String> = (0..writers).map(|i| format!("w{}", i)).collect();
    assert_eq!(names, expected);
}

#[test]
fn config_file_and_environment_layer() {
    let tmp = tempdir().expect("tempdir");
    let path = Store::new(tmp.path()).config_path();
    fs::write(
        &path,
        "[readiness]\nmarker = \"\"\ntcp_probe = true\n\n[state]\nlock_timeout_secs = 2\n",
    )
    .expect("write config");

    let mut config = load_config_file(&path).expect("load config");
    assert_eq!(config.readiness.marker, "");
    assert_eq!(config.lock_timeout(), Duration::from_secs(2));
    assert_eq!(config.server.binary, SupervisorConfig::default().server.binary);

    let env: HashMap<&str, &str> = HashMap::from([
        ("MONGOVISOR_SERVER_BIN", "/opt/mongo/bin/mongod"),
        ("MONGOVISOR_STOP_TIMEOUT_SECS", "7"),
    ]);
    config
        .apply_env(|key| env.get(key).map(|v| v.to_string()))
        .expect("apply env");
    assert_eq!(config.server.binary, "/opt/mongo/bin/mongod");
    assert_eq!(config.stop_timeout(), Duration::from_secs(7));
    assert_eq!(config.ready_timeout(), Duration::from_secs(30));
}

#[test]
fn unreadable_config_is_a_config_error() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    fs::write(&path, "[readiness]\ntimeout_secs = \"soon\"\n").expect("write");
    assert!(matches!(
        load_config_file(&path),
        Err(VisorError::ConfigError(_))
    ));
}

#[test]
fn event_log_skips_torn_lines() {
    let tmp = tempdir().expect("tempdir");
    let home = Store::new(tmp.path());
    let log = EventLog::new(home.events_path());
    log.record("create", Some("alpha"), Some(27017), "pending", None, None)
        .expect("record");
    fs::OpenOptions::new()
        .append(true)
        .open(log.path())
        .and_then(|mut f| std::io::Write::write_all(&mut f, b"{\"ts\":\n"))
        .expect("append torn line");
    log.record("create", Some("alpha"), Some(27017), "success", Some(7), None)
        .expect("record");

    let events = log.read_all().expect("read");
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].pid, Some(7));
    assert!(events.iter().all(|e| e.ts.ends_with('Z')));
}

#[test]
fn explicit_root_wins() {
    let tmp = tempdir().expect("tempdir");
    let home = Store::resolve(Some(tmp.path())).expect("resolve");
    assert_eq!(home.root, tmp.path());
    home.ensure().expect("ensure");
    assert!(home.logs_dir().is_dir());
    assert_eq!(
        home.server_log_path("alpha"),
        tmp.path().join("logs").join("alpha.log")
    );
}
