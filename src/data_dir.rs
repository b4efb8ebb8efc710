//! Fresh-versus-reuse policy for an instance's target directory and the
//! one-time initialization of its `data` subdirectory.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::command::{self, ResolvedCommand};
use crate::config::DEFAULT_ADMIN_USER;
use crate::error::{InstanceError, Result};

pub const DATA_SUB_DIR: &str = "data";
pub const TEMP_SUB_DIR: &str = "temp";
pub const DEFAULT_SOCKET_NAME: &str = "mysql.sock";
pub const ERROR_LOG_NAME: &str = "errors.log";
pub const GENERAL_LOG_NAME: &str = "mysql.log";
pub const PID_FILE_NAME: &str = "mysql.pid";

const INSTALL_SCRIPT: &str = "scripts/mysql_install_db";
const SERVER_BINARY: &str = "bin/mysqld";
const DEFAULTS_FILE_CONTENTS: &str = "[mysql]\n# no defaults...";

/// Target directory of one instance together with its clean/reuse decision.
#[derive(Clone, Debug)]
pub struct DataDirectory {
    target: PathBuf,
    clean: bool,
}

impl DataDirectory {
    /// Decides whether `target` is reused: only when `data/` already exists
    /// and `force_erase` is off.
    pub fn decide(target: impl Into<PathBuf>, force_erase: bool) -> Self {
        let target = target.into();
        let clean = force_erase || !target.join(DATA_SUB_DIR).exists();
        if clean {
            info!("creating a clean database in {}", target.display());
        } else {
            info!("reuse existing database {}", target.display());
        }
        Self { target, clean }
    }

    pub fn is_clean(&self) -> bool {
        self.clean
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn data_dir(&self) -> PathBuf {
        self.target.join(DATA_SUB_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.target.join(TEMP_SUB_DIR)
    }

    pub fn default_socket(&self) -> PathBuf {
        self.target.join(DEFAULT_SOCKET_NAME)
    }

    pub fn error_log(&self) -> PathBuf {
        self.target.join(ERROR_LOG_NAME)
    }

    pub fn general_log(&self) -> PathBuf {
        self.target.join(GENERAL_LOG_NAME)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.target.join(PID_FILE_NAME)
    }

    /// Wipes the target when clean, then makes sure it and `temp/` exist.
    pub fn prepare(&self) -> Result<()> {
        if self.clean && self.target.exists() {
            std::fs::remove_dir_all(&self.target)
                .map_err(|err| InstanceError::io(&self.target, err))?;
            info!("deleted {} directory", self.target.display());
        }
        if !self.target.exists() {
            std::fs::create_dir_all(&self.target)
                .map_err(|err| InstanceError::io(&self.target, err))?;
            info!("created {} directory", self.target.display());
        }
        let temp = self.temp_dir();
        std::fs::create_dir_all(&temp).map_err(|err| InstanceError::io(&temp, err))
    }

    /// Creates the base data files with the distribution's install script,
    /// or `mysqld --initialize-insecure` when the script is absent.
    ///
    /// Does nothing for a reused directory.
    pub fn bootstrap(&self, dist: &Path) -> Result<()> {
        if !self.clean {
            return Ok(());
        }
        let data = self.data_dir();
        let defaults = write_defaults_file(dist)?;
        self.initialize(dist, &data, &defaults)?;
        if !data.is_dir() {
            return Err(InstanceError::bootstrap(
                "initialize",
                format!("{} was not created", data.display()),
            ));
        }
        info!("initialized data directory {}", data.display());
        Ok(())
    }

    /// Runs whichever initializer the distribution ships. Every failure,
    /// including a missing or unlaunchable program, is reported as a
    /// bootstrap failure of that step.
    fn initialize(&self, dist: &Path, data: &Path, defaults: &Path) -> Result<()> {
        match ResolvedCommand::resolve(dist, INSTALL_SCRIPT) {
            Ok(_) => {
                let args = vec![
                    format!("--defaults-file={}", defaults.display()),
                    "--force".to_string(),
                    "--innodb_use_native_aio=0".to_string(),
                    format!("--datadir={}", data.display()),
                    format!("--basedir={}", dist.display()),
                ];
                command::build_command(dist, INSTALL_SCRIPT, &args)
                    .and_then(|command| command::run_to_completion("install", command))
                    .map_err(|err| as_bootstrap("install", err))?;
            }
            Err(InstanceError::CommandNotFound { .. }) => {
                let args = vec![
                    "--initialize-insecure".to_string(),
                    format!("--user={DEFAULT_ADMIN_USER}"),
                    format!("--datadir={}", data.display()),
                    format!("--basedir={}", dist.display()),
                    format!("--log-error={}", self.error_log().display()),
                    format!("--general-log-file={}", self.general_log().display()),
                ];
                command::build_command(dist, SERVER_BINARY, &args)
                    .and_then(|command| command::run_to_completion("initialize", command))
                    .map_err(|err| as_bootstrap("initialize", err))?;
            }
            Err(err) => return Err(as_bootstrap("install", err)),
        }
        Ok(())
    }
}

fn as_bootstrap(step: &str, err: InstanceError) -> InstanceError {
    match err {
        InstanceError::BootstrapFailure { .. } => err,
        other => InstanceError::bootstrap(step, other.to_string()),
    }
}

fn write_defaults_file(dist: &Path) -> Result<PathBuf> {
    let share = dist.join("share");
    std::fs::create_dir_all(&share).map_err(|err| InstanceError::io(&share, err))?;
    let path = share.join("my-default.cnf");
    std::fs::write(&path, DEFAULTS_FILE_CONTENTS).map_err(|err| InstanceError::io(&path, err))?;
    Ok(path)
}
