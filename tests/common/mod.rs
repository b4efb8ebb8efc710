#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use ephemeral_mysql::RegistrySettings;

const MYSQLD: &str = r#"#!/bin/sh
DIST="$(cd "$(dirname "$0")/.." && pwd)"
echo "mysqld $*" >> "$DIST/calls.log"
datadir=""
socket=""
init=""
for arg in "$@"; do
  case "$arg" in
    --datadir=*) datadir="${arg#--datadir=}" ;;
    --socket=*) socket="${arg#--socket=}" ;;
    --initialize-insecure) init=1 ;;
  esac
done
if [ -n "$init" ]; then
  mkdir -p "$datadir"
  exit 0
fi
echo "mysqld: ready for connections"
echo "mysqld: [Warning] running under test" >&2
if [ -f "$DIST/exit-early" ]; then
  exit 3
fi
trap 'rm -f "$socket"; exit 0' TERM
if [ ! -f "$DIST/no-socket" ]; then
  : > "$socket"
fi
while :; do
  sleep 1
done
"#;

const MYSQLADMIN: &str = r#"#!/bin/sh
DIST="$(cd "$(dirname "$0")/.." && pwd)"
echo "mysqladmin $*" >> "$DIST/calls.log"
"#;

const MYSQL: &str = r#"#!/bin/sh
DIST="$(cd "$(dirname "$0")/.." && pwd)"
echo "mysql $*" >> "$DIST/calls.log"
cat >> "$DIST/client-input.sql"
echo "Database"
"#;

const INSTALL_DB: &str = r#"#!/bin/sh
DIST="$(cd "$(dirname "$0")/.." && pwd)"
echo "mysql_install_db $*" >> "$DIST/calls.log"
for arg in "$@"; do
  case "$arg" in
    --datadir=*) mkdir -p "${arg#--datadir=}" ;;
  esac
done
"#;

/// A distribution of shell scripts standing in for the MySQL binaries.
pub struct FakeDist {
    pub root: PathBuf,
}

impl FakeDist {
    pub fn new(root: &Path) -> Self {
        let root = root.to_path_buf();
        write_script(&root.join("bin/mysqld"), MYSQLD);
        write_script(&root.join("bin/mysqladmin"), MYSQLADMIN);
        write_script(&root.join("bin/mysql"), MYSQL);
        Self { root }
    }

    pub fn with_install_script(self) -> Self {
        write_script(&self.root.join("scripts/mysql_install_db"), INSTALL_DB);
        self
    }

    /// Makes the server run without ever creating its socket.
    pub fn never_ready(&self) {
        std::fs::write(self.root.join("no-socket"), "").unwrap();
    }

    /// Makes the server exit right after launch.
    pub fn exit_early(&self) {
        std::fs::write(self.root.join("exit-early"), "").unwrap();
    }

    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.root.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Server launches, excluding data directory initialization.
    pub fn launches(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|line| line.starts_with("mysqld ") && !line.contains("--initialize-insecure"))
            .collect()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }

    pub fn client_input(&self) -> String {
        std::fs::read_to_string(self.root.join("client-input.sql")).unwrap_or_default()
    }
}

pub fn fast_settings() -> RegistrySettings {
    RegistrySettings {
        startup_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(3),
        ..RegistrySettings::default()
    }
}

fn write_script(path: &Path, contents: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
    let mut permissions = std::fs::metadata(path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(path, permissions).unwrap();
}
