use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::{debug, info};

use crate::error::{InstanceError, Result};

pub const SCRIPT_INTERPRETER: &str = "perl";

/// Executable found for a logical command name inside a distribution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedCommand {
    /// `<dist>/<name>` exists as-is.
    Native(PathBuf),
    /// `<dist>/<name>.exe`.
    PlatformSuffixed(PathBuf),
    /// `<dist>/<name>.pl`, run through an interpreter.
    Script { interpreter: String, script: PathBuf },
}

impl ResolvedCommand {
    /// Probes `dist` for `name` (e.g. `bin/mysqld`).
    pub fn resolve(dist: &Path, name: &str) -> Result<Self> {
        let native = dist.join(name);
        if native.is_file() {
            ensure_executable(&native)?;
            return Ok(ResolvedCommand::Native(absolute(&native)));
        }
        let suffixed = dist.join(format!("{name}.exe"));
        if suffixed.is_file() {
            return Ok(ResolvedCommand::PlatformSuffixed(absolute(&suffixed)));
        }
        let script = dist.join(format!("{name}.pl"));
        if script.is_file() {
            return Ok(ResolvedCommand::Script {
                interpreter: SCRIPT_INTERPRETER.to_string(),
                script: absolute(&script),
            });
        }
        Err(InstanceError::CommandNotFound {
            name: name.to_string(),
            dist: dist.to_path_buf(),
            tried: vec![native, suffixed, script],
        })
    }

    /// The program the OS is asked to start.
    pub fn program(&self) -> PathBuf {
        match self {
            ResolvedCommand::Native(path) | ResolvedCommand::PlatformSuffixed(path) => {
                path.clone()
            }
            ResolvedCommand::Script { interpreter, .. } => PathBuf::from(interpreter),
        }
    }

    /// Full argument vector, program first.
    pub fn argv<I, S>(&self, args: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv: Vec<OsString> = match self {
            ResolvedCommand::Native(path) | ResolvedCommand::PlatformSuffixed(path) => {
                vec![path.clone().into_os_string()]
            }
            ResolvedCommand::Script {
                interpreter,
                script,
            } => vec![
                OsString::from(interpreter),
                script.clone().into_os_string(),
            ],
        };
        argv.extend(args.into_iter().map(Into::into));
        argv
    }
}

/// Resolves `name` and prepares a [`Command`] running in `dist` with `args`.
pub fn build_command(dist: &Path, name: &str, args: &[String]) -> Result<Command> {
    let resolved = ResolvedCommand::resolve(dist, name)?;
    let argv = resolved.argv(args.iter().cloned());
    info!(
        "$ {}",
        argv.iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).current_dir(dist);
    Ok(command)
}

/// Runs `command` to completion, logging its output, and fails with
/// [`InstanceError::BootstrapFailure`] naming `step` on a non-zero exit.
pub fn run_to_completion(step: &str, mut command: Command) -> Result<Output> {
    let program = PathBuf::from(command.get_program());
    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|source| InstanceError::Spawn { program, source })?;
    for line in String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
    {
        debug!(target: "mysqld", "{step}: {line}");
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InstanceError::bootstrap(
            step,
            format!("exited with {}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(output)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(unix)]
fn ensure_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|err| InstanceError::io(path, err))?;
    let mut permissions = metadata.permissions();
    if permissions.mode() & 0o111 == 0o111 {
        return Ok(());
    }
    permissions.set_mode(permissions.mode() | 0o111);
    std::fs::set_permissions(path, permissions).map_err(|err| InstanceError::io(path, err))
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> Result<()> {
    Ok(())
}
