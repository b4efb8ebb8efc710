#![cfg(unix)]

mod common;

use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use common::FakeDist;
use ephemeral_mysql::state::{self, InstanceRecord};

fn cli(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ephemeral-mysql"))
        .current_dir(cwd)
        .args(args)
        .output()
        .unwrap()
}

/// Starts `run` in the background and waits until it has recorded its server.
fn spawn_run(cwd: &Path, args: &[&str]) -> (Child, InstanceRecord) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_ephemeral-mysql"))
        .current_dir(cwd)
        .arg("run")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if let Ok(Some(record)) = state::read_record(&cwd.join("mysql-data")) {
            return (child, record);
        }
        if let Some(status) = child.try_wait().unwrap() {
            panic!("run exited early with {status}");
        }
        assert!(Instant::now() < deadline, "no instance recorded in time");
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn send(child: &Child, signal: i32) {
    assert_eq!(unsafe { libc::kill(child.id() as i32, signal) }, 0);
}

fn write_project(cwd: &Path, port: u16) -> FakeDist {
    let dist = FakeDist::new(&cwd.join("dist"));
    std::fs::write(
        cwd.join("ephemeral-mysql.yaml"),
        format!("port: {port}\ndist: dist\ndata: mysql-data\nstartup_timeout_secs: 5\n"),
    )
    .unwrap();
    dist
}

#[test]
fn sigterm_stops_the_server() {
    let temp = tempfile::tempdir().unwrap();
    write_project(temp.path(), 23332);
    let (mut child, record) = spawn_run(temp.path(), &[]);
    assert!(state::is_running(record.pid));

    send(&child, libc::SIGTERM);
    let status = child.wait().unwrap();

    assert!(status.success());
    assert!(!state::is_running(record.pid));
    assert!(
        state::read_record(&temp.path().join("mysql-data"))
            .unwrap()
            .is_none()
    );
}

#[test]
fn sighup_stops_wrapped_command_and_server() {
    let temp = tempfile::tempdir().unwrap();
    write_project(temp.path(), 23333);
    let (mut child, record) = spawn_run(temp.path(), &["--", "sleep", "30"]);

    send(&child, libc::SIGHUP);
    let started = Instant::now();
    let status = child.wait().unwrap();

    assert_eq!(status.code(), Some(129));
    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(!state::is_running(record.pid));
}

#[test]
fn run_wraps_command_and_cleans_up() {
    let temp = tempfile::tempdir().unwrap();
    let dist = write_project(temp.path(), 23330);

    let output = cli(
        temp.path(),
        &[
            "run",
            "--",
            "sh",
            "-c",
            "echo \"$MYSQL_PORT $MYSQL_DATABASE $EPHEMERAL_MYSQL_REUSED\" > env.txt; exit 7",
        ],
    );

    assert_eq!(output.status.code(), Some(7));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("MySQL is up and running on port 23330"));
    let env = std::fs::read_to_string(temp.path().join("env.txt")).unwrap();
    assert_eq!(env.trim(), "23330 root false");
    assert!(
        state::read_record(&temp.path().join("mysql-data"))
            .unwrap()
            .is_none()
    );
    assert_eq!(dist.launches().len(), 1);
}

#[test]
fn skip_does_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let dist = FakeDist::new(&temp.path().join("dist"));
    let dist_arg = dist.root.display().to_string();
    let output = cli(temp.path(), &["run", "--skip", "--dist", &dist_arg]);

    assert!(output.status.success());
    assert!(dist.calls().is_empty());
    assert!(!temp.path().join("target").exists());
}

#[test]
fn status_without_record_reports_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let output = cli(temp.path(), &["status", "--data", "mysql-data"]);

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No MySQL instance recorded"));
}

#[test]
fn stop_terminates_recorded_server() {
    let temp = tempfile::tempdir().unwrap();
    let data = temp.path().join("mysql-data");
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    let record = InstanceRecord {
        port: 23331,
        pid: child.id(),
        started_at: chrono::Utc::now(),
        reused: false,
        socket: data.join("mysql.sock"),
        data_dir: data.clone(),
    };
    state::write_record(&data, &record).unwrap();

    let status = cli(temp.path(), &["status", "--data", "mysql-data", "--json"]);
    let value: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(value["port"], 23331);
    assert_eq!(value["running"], true);

    let output = cli(temp.path(), &["stop", "--data", "mysql-data"]);
    let exit = child.wait().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Stopped MySQL"));
    assert!(!exit.success());
    assert!(state::read_record(&data).unwrap().is_none());
}

#[test]
fn classify_prints_host_classifier() {
    let temp = tempfile::tempdir().unwrap();
    let output = cli(temp.path(), &["classify"]);

    assert!(output.status.success());
    let value = String::from_utf8_lossy(&output.stdout);
    let value = value.trim();
    assert!(value.contains('-'));
    assert_eq!(value, value.to_lowercase());
}
