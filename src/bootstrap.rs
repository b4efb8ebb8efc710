//! Administrative setup of a freshly initialized server: admin password,
//! application database, user and grants.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::{debug, info};

use crate::command;
use crate::config::{AdminCredentials, InstanceConfig, RegistrySettings};
use crate::error::{InstanceError, Result};

const ADMIN_BINARY: &str = "bin/mysqladmin";
const CLIENT_BINARY: &str = "bin/mysql";

/// SQL fed to the administrative client on a clean instance.
pub fn bootstrap_script(config: &InstanceConfig, admin: &AdminCredentials) -> String {
    let mut script = format!("CREATE DATABASE {};\n", config.database());
    if config.user() != admin.user {
        script.push_str(&format!(
            "CREATE USER '{}'@'{}' IDENTIFIED BY '{}';\n",
            config.user(),
            admin.host,
            config.password()
        ));
        script.push_str(&format!(
            "GRANT ALL ON {}.* TO '{}'@'{}';\n",
            config.database(),
            config.user(),
            admin.host
        ));
        script.push_str("SHOW DATABASES;\n");
    }
    script
}

/// Password the admin account ends up with.
///
/// When the requested user is the admin account itself, its requested
/// password replaces the default so those exact credentials work.
pub fn admin_password<'a>(config: &'a InstanceConfig, admin: &'a AdminCredentials) -> &'a str {
    if config.user() == admin.user {
        config.password()
    } else {
        &admin.password
    }
}

/// Sets the admin password, then creates the database and user through the
/// `mysql` client's standard input.
pub fn configure(
    config: &InstanceConfig,
    dist: &Path,
    socket: &Path,
    settings: &RegistrySettings,
) -> Result<()> {
    let admin = &settings.admin;
    let password = admin_password(config, admin);
    let args = vec![
        "--no-defaults".to_string(),
        format!("--wait={}", settings.admin_retries),
        format!("--port={}", config.port()),
        format!("--user={}", admin.user),
        format!("--socket={}", socket.display()),
        format!("--host={}", admin.host),
        "password".to_string(),
        password.to_string(),
    ];
    let command = command::build_command(dist, ADMIN_BINARY, &args)?;
    command::run_to_completion("admin password", command)?;
    info!("root password set for the '{}' user", admin.user);

    let args = vec![
        format!("--port={}", config.port()),
        format!("--user={}", admin.user),
        format!("--password={password}"),
        format!("--socket={}", socket.display()),
    ];
    let mut command = command::build_command(dist, CLIENT_BINARY, &args)?;
    let program = PathBuf::from(command.get_program());
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| InstanceError::Spawn { program, source })?;
    let script = bootstrap_script(config, admin);
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .map_err(|err| InstanceError::bootstrap("create database", err.to_string()))?;
    }
    let output = child
        .wait_with_output()
        .map_err(|err| InstanceError::bootstrap("create database", err.to_string()))?;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(target: "mysqld", "create database: {line}");
    }
    if !output.status.success() {
        return Err(InstanceError::bootstrap(
            "create database",
            format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    info!(
        "the '{}' user created in the '{}' database",
        config.user(),
        config.database()
    );
    Ok(())
}
