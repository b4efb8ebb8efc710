use std::io::{BufRead, BufReader, PipeReader};
use std::path::Path;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command;
use crate::config::{DEFAULT_ADMIN_USER, InstanceConfig};
use crate::data_dir::DataDirectory;
use crate::error::{InstanceError, Result};

const SERVER_BINARY: &str = "bin/mysqld";
const HOME_ENV: &str = "MYSQL_HOME";

/// A running `mysqld` child.
///
/// Its merged stdout/stderr is drained by a detached thread for as long as
/// the pipe stays open.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    port: u16,
}

impl ServerProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Exit status if the process is gone, `None` while it runs.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(err) => {
                warn!("unable to poll mysqld pid {}: {err}", self.pid());
                None
            }
        }
    }

    /// Asks the server to shut down and kills it after `grace`.
    pub fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        let pid = self.pid();
        let graceful = request_shutdown(pid);
        let deadline = Instant::now() + grace;
        while graceful && Instant::now() < deadline {
            if self.exit_status().is_some() {
                info!("mysqld pid {pid} on port {} stopped", self.port);
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }
        if graceful {
            warn!("mysqld pid {pid} ignored shutdown for {grace:?}; killing it");
        }
        if let Err(err) = self.child.kill()
            && err.kind() != std::io::ErrorKind::InvalidInput
        {
            return Err(InstanceError::io(format!("pid {pid}"), err));
        }
        self.child
            .wait()
            .map_err(|err| InstanceError::io(format!("pid {pid}"), err))?;
        Ok(())
    }
}

/// Full `mysqld` argument vector for one instance, options appended last.
pub fn server_args(
    config: &InstanceConfig,
    dist: &Path,
    dir: &DataDirectory,
    socket: &Path,
    os_user: &str,
) -> Vec<String> {
    let mut args = vec![
        "--no-defaults".to_string(),
        format!("--user={os_user}"),
        "--general_log".to_string(),
        "--console".to_string(),
        "--innodb_buffer_pool_size=64M".to_string(),
        "--innodb_log_file_size=64M".to_string(),
        "--innodb_use_native_aio=0".to_string(),
        format!("--binlog-ignore-db={}", config.database()),
        format!("--basedir={}", dist.display()),
        format!("--lc-messages-dir={}", dist.join("share").display()),
        format!("--datadir={}", dir.data_dir().display()),
        format!("--tmpdir={}", dir.temp_dir().display()),
        format!("--socket={}", socket.display()),
        format!("--log-error={}", dir.error_log().display()),
        format!("--general-log-file={}", dir.general_log().display()),
        format!("--pid-file={}", dir.pid_file().display()),
        format!("--port={}", config.port()),
    ];
    args.extend(
        config
            .options()
            .iter()
            .filter(|option| !option.trim().is_empty())
            .map(|option| format!("--{option}")),
    );
    args
}

/// Spawns `mysqld` without waiting for it to accept connections.
pub fn launch(
    config: &InstanceConfig,
    dist: &Path,
    dir: &DataDirectory,
    socket: &Path,
) -> Result<ServerProcess> {
    let args = server_args(config, dist, dir, socket, &os_user());
    let mut command = command::build_command(dist, SERVER_BINARY, &args)?;
    command.env(HOME_ENV, dist);

    let (reader, writer) = std::io::pipe().map_err(|err| InstanceError::io(dist, err))?;
    let writer_err = writer
        .try_clone()
        .map_err(|err| InstanceError::io(dist, err))?;
    command.stdout(writer).stderr(writer_err);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EPERM) {
                        return Ok(());
                    }
                    return Err(err);
                }
                Ok(())
            });
        }
    }

    let program = command.get_program().into();
    let child = command
        .spawn()
        .map_err(|source| InstanceError::Spawn { program, source })?;
    // Release our copies of the pipe's write end so the reader sees EOF when
    // the server exits.
    drop(command);

    let port = config.port();
    if let Err(err) = thread::Builder::new()
        .name(format!("mysqld-{port}-output"))
        .spawn(move || drain_output(reader, port))
    {
        warn!("unable to start output drain for port {port}: {err}");
    }
    info!("mysqld started with pid {} on port {port}", child.id());
    Ok(ServerProcess { child, port })
}

fn drain_output(reader: PipeReader, port: u16) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                debug!(target: "mysqld", "[{port}] {}", text.trim_end());
            }
            Err(err) => {
                debug!(target: "mysqld", "[{port}] output closed: {err}");
                break;
            }
        }
    }
}

/// Name of the account running this process, passed as `mysqld --user`.
pub fn os_user() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|value| !value.is_empty()))
        .unwrap_or_else(|| DEFAULT_ADMIN_USER.to_string())
}

/// Sends SIGTERM to the server's process group, falling back to the pid.
/// Returns false when no graceful request can be made.
#[cfg(unix)]
fn request_shutdown(pid: u32) -> bool {
    let pid = pid as i32;
    if unsafe { libc::kill(-pid, libc::SIGTERM) } == 0 {
        return true;
    }
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_shutdown(_pid: u32) -> bool {
    false
}
