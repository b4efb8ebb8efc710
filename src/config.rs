use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{InstanceError, Result};

pub const CONFIG_FILE_NAME: &str = "ephemeral-mysql.yaml";

pub const DEFAULT_ADMIN_USER: &str = "root";
pub const DEFAULT_ADMIN_PASSWORD: &str = "root";
pub const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ADMIN_RETRIES: u32 = 5;

/// Configuration of one database instance.
///
/// Two configs are equal when all of their values are equal; the port is the
/// key a [`crate::registry::Registry`] uses to tell instances apart.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceConfig {
    port: u16,
    user: String,
    password: String,
    database: String,
    options: Vec<String>,
}

impl InstanceConfig {
    pub fn new(
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
        options: Vec<String>,
    ) -> Result<Self> {
        let config = Self {
            port,
            user: user.into(),
            password: password.into(),
            database: database.into(),
            options,
        };
        if config.port == 0 {
            return Err(invalid("port", "must be a positive integer"));
        }
        for (field, value) in [
            ("user", &config.user),
            ("password", &config.password),
            ("database", &config.database),
        ] {
            if value.is_empty() {
                return Err(invalid(field, "cannot be empty"));
            }
        }
        Ok(config)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Extra server flags in insertion order, without the leading `--`.
    pub fn options(&self) -> &[String] {
        &self.options
    }
}

fn invalid(field: &str, message: &str) -> InstanceError {
    InstanceError::InvalidConfig {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Administrative account used to bootstrap a fresh data directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminCredentials {
    pub user: String,
    pub password: String,
    pub host: String,
}

impl Default for AdminCredentials {
    fn default() -> Self {
        Self {
            user: DEFAULT_ADMIN_USER.to_string(),
            password: DEFAULT_ADMIN_PASSWORD.to_string(),
            host: DEFAULT_ADMIN_HOST.to_string(),
        }
    }
}

/// Tunables shared by every instance a registry starts.
#[derive(Clone, Debug)]
pub struct RegistrySettings {
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
    pub admin: AdminCredentials,
    /// Value passed to `mysqladmin --wait`.
    pub admin_retries: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            admin: AdminCredentials::default(),
            admin_retries: DEFAULT_ADMIN_RETRIES,
        }
    }
}

/// Contents of `ephemeral-mysql.yaml`.
#[derive(Clone, Debug, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub skip: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dist")]
    pub dist: PathBuf,
    #[serde(default = "default_root")]
    pub user: String,
    #[serde(default = "default_root")]
    pub password: String,
    #[serde(default = "default_root")]
    pub dbname: String,
    #[serde(default = "default_data")]
    pub data: PathBuf,
    #[serde(default)]
    pub socket: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub erase: bool,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
    #[serde(default)]
    pub admin_user: Option<String>,
    #[serde(default)]
    pub admin_password: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            skip: false,
            port: default_port(),
            dist: default_dist(),
            user: default_root(),
            password: default_root(),
            dbname: default_root(),
            data: default_data(),
            socket: None,
            erase: default_true(),
            options: Vec::new(),
            startup_timeout_secs: None,
            admin_user: None,
            admin_password: None,
        }
    }
}

impl ProjectConfig {
    pub fn instance_config(&self) -> Result<InstanceConfig> {
        InstanceConfig::new(
            self.port,
            self.user.clone(),
            self.password.clone(),
            self.dbname.clone(),
            self.options.clone(),
        )
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        let mut settings = RegistrySettings::default();
        if let Some(secs) = self.startup_timeout_secs {
            settings.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(user) = &self.admin_user {
            settings.admin.user = user.clone();
        }
        if let Some(password) = &self.admin_password {
            settings.admin.password = password.clone();
        }
        settings
    }

    /// Resolves relative `dist`, `data` and `socket` paths against `root`.
    pub fn resolve_paths(&mut self, root: &Path) {
        self.dist = resolve_relative(root, &self.dist);
        self.data = resolve_relative(root, &self.data);
        if let Some(socket) = &self.socket {
            self.socket = Some(resolve_relative(root, socket));
        }
    }
}

pub fn load_project_config(path: &Path) -> anyhow::Result<Option<ProjectConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    if contents
        .lines()
        .all(|line| line.trim().is_empty() || line.trim().starts_with('#'))
    {
        return Ok(None);
    }
    let config: ProjectConfig = serde_yaml_bw::from_str(&contents)?;
    Ok(Some(config))
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn default_port() -> u16 {
    3306
}

fn default_root() -> String {
    DEFAULT_ADMIN_USER.to_string()
}

fn default_dist() -> PathBuf {
    PathBuf::from("target").join("mysql-dist")
}

fn default_data() -> PathBuf {
    PathBuf::from("target").join("mysql-data")
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_port_and_empty_values() {
        assert!(InstanceConfig::new(0, "root", "root", "root", Vec::new()).is_err());
        let err = InstanceConfig::new(3306, "root", "", "root", Vec::new()).unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn equality_is_by_value() {
        let options = vec!["sql-mode=ALLOW_INVALID_DATES".to_string()];
        let left = InstanceConfig::new(13306, "u", "p", "db", options.clone()).unwrap();
        let right = InstanceConfig::new(13306, "u", "p", "db", options).unwrap();
        assert_eq!(left, right);
        let other = InstanceConfig::new(13307, "u", "p", "db", Vec::new()).unwrap();
        assert_ne!(left, other);
    }

    #[test]
    fn missing_or_comment_only_file_is_absent() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        assert!(load_project_config(&path).unwrap().is_none());
        std::fs::write(&path, "# nothing yet\n\n").unwrap();
        assert!(load_project_config(&path).unwrap().is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "port: 13306\nuser: alice\nerase: false\noptions:\n  - sql-mode=ALLOW_INVALID_DATES\nstartup_timeout_secs: 60\n",
        )
        .unwrap();
        let mut config = load_project_config(&path).unwrap().unwrap();
        assert_eq!(config.port, 13306);
        assert_eq!(config.user, "alice");
        assert_eq!(config.password, "root");
        assert!(!config.erase);
        assert_eq!(config.options, vec!["sql-mode=ALLOW_INVALID_DATES"]);
        assert_eq!(
            config.registry_settings().startup_timeout,
            Duration::from_secs(60)
        );

        config.resolve_paths(temp.path());
        assert_eq!(config.data, temp.path().join("target").join("mysql-data"));
        assert!(config.socket.is_none());
    }

    #[test]
    fn defaults_match_plugin_defaults() {
        let config = ProjectConfig::default();
        assert_eq!(config.port, 3306);
        assert!(config.erase);
        assert!(!config.skip);
        let instance = config.instance_config().unwrap();
        assert_eq!(instance.database(), "root");
        assert!(instance.options().is_empty());
    }
}
