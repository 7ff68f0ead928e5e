use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;

/// Default sink program.  Any player that accepts aplay's flags and reads raw
/// PCM from stdin will do.
pub const DEFAULT_SINK_PROGRAM: &str = "aplay";

pub fn data_dir() -> PathBuf {
    // ~/.local/share/meter/ (XDG layout, also on macOS)
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join("meter")
}

pub fn config_dir() -> PathBuf {
    // Honour $XDG_CONFIG_HOME when set, otherwise ~/.config/meter/
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("meter");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("meter")
}

fn find_beside_exe(name: &str) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let p = current_exe.parent()?.join(name);
    p.exists().then_some(p)
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.exists())
}

/// Resolve the sink program.
///
/// Absolute or relative paths are used as-is.  Bare names are looked up
/// beside the current exe, then on PATH.  Falls back to the bare name so the
/// spawn error names the missing program.
pub fn find_sink_binary(program: &str) -> PathBuf {
    if Path::new(program).components().count() > 1 {
        return PathBuf::from(program);
    }
    find_beside_exe(program)
        .or_else(|| find_on_path(program))
        .unwrap_or_else(|| PathBuf::from(program))
}

/// Device names from `aplay -L` output.
///
/// Names sit on unindented lines; indented lines are descriptions.  Only
/// `default` and `card:option` style names are kept.
pub fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| *line == "default" || line.contains(':'))
        .map(str::to_string)
        .collect()
}

/// Ask the sink program for the available output devices.
pub fn list_audio_devices(program: &str) -> anyhow::Result<Vec<String>> {
    let binary = find_sink_binary(program);
    let output = Command::new(&binary)
        .arg("-L")
        .output()
        .with_context(|| format!("running {} -L", binary.display()))?;
    if !output.status.success() {
        anyhow::bail!("{} -L exited with {}", binary.display(), output.status);
    }
    Ok(parse_device_list(&String::from_utf8_lossy(&output.stdout)))
}
