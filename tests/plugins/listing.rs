use mongovisor::core::state::{InstanceRecord, InstanceStatus, InstanceStore};
use mongovisor::core::store::Store;
use std::fs;
use std::process::{Command, Output};
use tempfile::TempDir;

fn run_mongovisor(home: &Store, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mongovisor"))
        .arg("--root")
        .arg(&home.root)
        .args(args)
        .env_remove("MONGOVISOR_LOG")
        .output()
        .expect("run mongovisor")
}

fn setup() -> (TempDir, Store) {
    let tmp = TempDir::new().expect("tmpdir");
    let home = Store::new(tmp.path().join("root"));
    (tmp, home)
}

fn seed(home: &Store, records: &[InstanceRecord]) {
    InstanceStore::new(home.instances_path(), home.lock_path())
        .save(records)
        .expect("seed state");
}

fn record(name: &str, dir: &str, port: u16, status: InstanceStatus) -> InstanceRecord {
    InstanceRecord {
        name: name.to_string(),
        data_directory: dir.into(),
        port,
        status,
    }
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

#[test]
fn empty_root_lists_nothing() {
    let (_tmp, home) = setup();
    let out = run_mongovisor(&home, &["list"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("No instances recorded"));

    let out = run_mongovisor(&home, &["list", "--format", "json"]);
    assert!(out.status.success());
    let rows: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("json");
    assert_eq!(rows, serde_json::json!([]));
    assert!(!home.instances_path().exists());
}

#[test]
fn json_listing_keeps_order_and_ids() {
    let (_tmp, home) = setup();
    seed(
        &home,
        &[
            record("alpha", "/var/mongodb/data/alpha", 27017, InstanceStatus::Stopped),
            record("beta", "/var/mongodb/data/beta", 27018, InstanceStatus::Stopped),
        ],
    );
    let before = fs::read(home.instances_path()).expect("state");

    let out = run_mongovisor(&home, &["ls", "--format", "json"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let rows: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("json");
    assert_eq!(rows[0]["id"], 0);
    assert_eq!(rows[0]["name"], "alpha");
    assert_eq!(rows[1]["id"], 1);
    assert_eq!(rows[1]["dataDirectory"], "/var/mongodb/data/beta");
    assert_eq!(rows[1]["status"], "stopped");
    assert_eq!(fs::read(home.instances_path()).expect("state"), before);
}

#[test]
fn table_listing_shows_names_and_ports() {
    let (_tmp, home) = setup();
    seed(
        &home,
        &[record("reporting", "/srv/reporting", 27019, InstanceStatus::Stopped)],
    );
    let out = run_mongovisor(&home, &["list"]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.contains("reporting"));
    assert!(text.contains("27019"));
    assert!(text.contains("stopped"));
}

#[test]
fn out_of_range_id_is_not_found() {
    let (_tmp, home) = setup();
    for cmd in ["start", "stop", "restart", "delete"] {
        let out = run_mongovisor(&home, &[cmd, "0"]);
        assert_eq!(out.status.code(), Some(1), "{} should fail", cmd);
        assert!(stderr(&out).contains("Instance not found"), "stderr: {}", stderr(&out));
    }
    assert!(!home.instances_path().exists());
}

#[test]
fn corrupt_state_fails_without_rewriting() {
    let (_tmp, home) = setup();
    home.ensure().expect("ensure");
    fs::write(home.instances_path(), "[{\"name\": \"alpha\"").expect("write");

    for args in [vec!["list"], vec!["stop", "0"], vec!["reconcile"]] {
        let out = run_mongovisor(&home, &args);
        assert_eq!(out.status.code(), Some(1));
        assert!(stderr(&out).contains("corrupt"), "stderr: {}", stderr(&out));
    }
    assert_eq!(
        fs::read_to_string(home.instances_path()).expect("read"),
        "[{\"name\": \"alpha\""
    );
}

#[test]
fn unknown_list_format_is_rejected() {
    let (_tmp, home) = setup();
    let out = run_mongovisor(&home, &["list", "--format", "yaml"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("unknown list format"));
}

#[test]
fn create_rejects_names_that_are_not_directory_names() {
    let (tmp, home) = setup();
    let data = tmp.path().join("data").display().to_string();
    for name in ["a/b", "..", "   "] {
        let out = run_mongovisor(&home, &["create", "--name", name, "--data-dir", &data]);
        assert_eq!(out.status.code(), Some(1), "name {:?} should fail", name);
    }
    assert!(!home.instances_path().exists());
}

#[test]
fn start_with_missing_binary_names_instance_and_keeps_status() {
    let (tmp, home) = setup();
    home.ensure().expect("ensure");
    let data = tmp.path().join("data").join("alpha");
    fs::create_dir_all(&data).expect("data dir");
    fs::write(
        home.config_path(),
        "[server]\nbinary = \"/nonexistent/bin/mongod\"\n",
    )
    .expect("config");
    seed(
        &home,
        &[record(
            "alpha",
            &data.display().to_string(),
            1,
            InstanceStatus::Stopped,
        )],
    );

    let out = run_mongovisor(&home, &["start", "0"]);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("alpha"), "stderr: {}", err);
    assert!(err.contains("Failed to spawn"), "stderr: {}", err);

    let records = InstanceStore::new(home.instances_path(), home.lock_path())
        .load()
        .expect("load");
    assert_eq!(records[0].status, InstanceStatus::Stopped);
}

#[test]
fn reconcile_marks_orphaned_records_stopped() {
    let (_tmp, home) = setup();
    home.ensure().expect("ensure");
    fs::write(
        home.config_path(),
        "[server]\nbinary = \"/nonexistent/bin/mongod-for-tests\"\n",
    )
    .expect("config");
    seed(
        &home,
        &[
            record("ghost", "/srv/ghost", 1, InstanceStatus::Running),
            record("idle", "/srv/idle", 2, InstanceStatus::Stopped),
        ],
    );

    let out = run_mongovisor(&home, &["list", "--live", "--format", "json"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let rows: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("json");
    assert!(rows[0]["livePid"].is_null());
    assert_eq!(rows[0]["status"], "running");

    let out = run_mongovisor(&home, &["reconcile"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("ghost"));

    let records = InstanceStore::new(home.instances_path(), home.lock_path())
        .load()
        .expect("load");
    assert_eq!(records[0].status, InstanceStatus::Stopped);
    assert_eq!(records[1].status, InstanceStatus::Stopped);

    let out = run_mongovisor(&home, &["reconcile"]);
    assert!(stdout(&out).contains("All instances match"));
}

#[test]
fn root_can_come_from_the_environment() {
    let (_tmp, home) = setup();
    seed(
        &home,
        &[record("envroot", "/srv/envroot", 27017, InstanceStatus::Stopped)],
    );
    let out = Command::new(env!("CARGO_BIN_EXE_mongovisor"))
        .args(["list", "--format", "json"])
        .env("MONGOVISOR_ROOT", &home.root)
        .output()
        .expect("run mongovisor");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("envroot"));
}
