//! Daemon process lifecycle: paths, pid file, liveness checks.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Default socket path: `$XDG_RUNTIME_DIR/gantry/gantryd.sock`.
pub fn socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("gantry")
        .join("gantryd.sock")
}

/// Default pid file path: `$XDG_CONFIG_HOME/gantry/gantryd.pid`.
pub fn pid_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("gantry")
        .join("gantryd.pid")
}

/// Write this process's pid.
pub fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, std::process::id().to_string())?;
    Ok(())
}

pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Check the pid file and /proc for a live daemon.
pub fn is_daemon_running_at(path: &Path) -> bool {
    if let Ok(contents) = fs::read_to_string(path) {
        if let Ok(pid) = contents.trim().parse::<u32>() {
            return Path::new(&format!("/proc/{pid}")).exists();
        }
    }
    false
}

/// Remove a stale socket file.
pub fn remove_socket(path: &Path) {
    let _ = fs::remove_file(path);
}
