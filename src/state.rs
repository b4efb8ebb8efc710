//! On-disk record of an instance started by the CLI, used to find and stop
//! a server whose owning process is gone.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

use crate::registry::InstanceInfo;

pub const RECORD_FILE_NAME: &str = "instance.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub port: u16,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub reused: bool,
    pub socket: PathBuf,
    pub data_dir: PathBuf,
}

impl From<&InstanceInfo> for InstanceRecord {
    fn from(info: &InstanceInfo) -> Self {
        Self {
            port: info.port,
            pid: info.pid,
            started_at: info.started_at,
            reused: info.reused,
            socket: info.socket.clone(),
            data_dir: info.target.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

pub fn record_path(target: &Path) -> PathBuf {
    target.join(RECORD_FILE_NAME)
}

pub fn write_record(target: &Path, record: &InstanceRecord) -> anyhow::Result<()> {
    write_json(&record_path(target), record)
}

pub fn read_record(target: &Path) -> anyhow::Result<Option<InstanceRecord>> {
    read_json(&record_path(target))
}

pub fn remove_record(target: &Path) -> anyhow::Result<()> {
    let path = record_path(target);
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

/// Terminates the recorded server, if any, and removes the record.
pub fn stop_recorded(target: &Path, graceful_timeout: Duration) -> anyhow::Result<StopOutcome> {
    let Some(record) = read_record(target)? else {
        return Ok(StopOutcome::NotRunning);
    };
    let outcome = if is_running(record.pid) {
        terminate_process(record.pid, graceful_timeout)?;
        StopOutcome::Stopped
    } else {
        StopOutcome::NotRunning
    };
    remove_record(target)?;
    Ok(outcome)
}

pub fn is_running(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    let value = serde_json::from_slice(&data)?;
    Ok(Some(value))
}

pub fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn terminate_process(pid: u32, graceful_timeout: Duration) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::time::Instant;

        let _ = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        let deadline = Instant::now() + graceful_timeout;
        while Instant::now() < deadline {
            if !is_running(pid) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let _ = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        Ok(())
    }

    #[cfg(windows)]
    {
        let _ = graceful_timeout;
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .status();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32, target: &Path) -> InstanceRecord {
        InstanceRecord {
            port: 13306,
            pid,
            started_at: Utc::now(),
            reused: true,
            socket: target.join("mysql.sock"),
            data_dir: target.to_path_buf(),
        }
    }

    #[test]
    fn record_survives_a_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let written = record(42, temp.path());
        write_record(temp.path(), &written).unwrap();
        assert!(!temp.path().join("instance.tmp").exists());
        assert_eq!(read_record(temp.path()).unwrap(), Some(written));
    }

    #[test]
    fn stopping_without_record_is_a_no_op() {
        let temp = tempfile::tempdir().unwrap();
        let outcome = stop_recorded(temp.path(), Duration::from_millis(100)).unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
    }

    #[cfg(unix)]
    #[test]
    fn stops_recorded_process() {
        let temp = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        write_record(temp.path(), &record(child.id(), temp.path())).unwrap();

        let outcome = stop_recorded(temp.path(), Duration::from_secs(2));
        let status = child.wait().unwrap();
        assert_eq!(outcome.unwrap(), StopOutcome::Stopped);
        assert!(!status.success());
        assert!(read_record(temp.path()).unwrap().is_none());
    }
}
