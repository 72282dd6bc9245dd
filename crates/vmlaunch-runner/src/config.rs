use std::path::Path;

use anyhow::Context;
use vmlaunch_process::RunConfiguration;

/// Reads a run configuration from a TOML file.
///
/// Relative `sdk_path`, `working_directory` and `script_path` entries are
/// resolved against the file's directory.
pub fn load_run_configuration(path: &Path) -> anyhow::Result<RunConfiguration> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read run configuration {}", path.display()))?;
    let mut cfg = parse_run_configuration(&raw)
        .with_context(|| format!("parse run configuration {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    if let Some(sdk) = cfg.sdk_path.as_mut()
        && sdk.is_relative()
    {
        *sdk = base.join(&*sdk);
    }
    if let Some(dir) = cfg.working_directory.as_mut()
        && dir.is_relative()
    {
        *dir = base.join(&*dir);
    }
    if !cfg.script_path.as_os_str().is_empty() && cfg.script_path.is_relative() {
        cfg.script_path = base.join(&cfg.script_path);
    }
    Ok(cfg)
}

pub fn parse_run_configuration(raw: &str) -> anyhow::Result<RunConfiguration> {
    Ok(toml::from_str(raw)?)
}
