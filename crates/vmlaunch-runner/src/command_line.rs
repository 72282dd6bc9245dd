//! Turning a [`RunConfiguration`] into the exact process invocation.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    path::{Path, PathBuf},
};

use vmlaunch_process::{ExecutionMode, NegotiatedPort, ParentEnvironment, RunConfiguration};

use crate::{
    error::LaunchError,
    options::tokenize_opt,
    port_alloc::PortAllocator,
    port_negotiator::{self, PortSource},
};

pub const CHECKED_MODE_FLAG: &str = "--checked";
pub const PAUSE_ON_START_FLAG: &str = "--pause-isolates-on-start";
pub const CHARSET: &str = "UTF-8";

/// A fully resolved process invocation for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub exe: PathBuf,
    /// Arguments after the executable. Paths are passed through byte-exact.
    pub args: Vec<OsString>,
    pub working_directory: PathBuf,
    pub env: BTreeMap<OsString, OsString>,
    pub charset: &'static str,
    pub port: NegotiatedPort,
    pub port_source: PortSource,
}

impl CommandSpec {
    /// Executable followed by its arguments.
    pub fn argv(&self) -> Vec<OsString> {
        let mut out = Vec::with_capacity(self.args.len() + 1);
        out.push(self.exe.clone().into_os_string());
        out.extend(self.args.iter().cloned());
        out
    }

    /// Lossy, space-joined command line for logs and the console.
    pub fn display(&self) -> String {
        self.argv()
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Location of the VM executable inside an SDK.
pub fn vm_executable(sdk: &Path) -> PathBuf {
    let name = if cfg!(windows) { "dart.exe" } else { "dart" };
    sdk.join("bin").join(name)
}

/// Path with the platform's own separators.
pub fn to_system_dependent(path: &Path) -> OsString {
    match path.to_str() {
        Some(s) if cfg!(windows) => s.replace('/', "\\").into(),
        _ => path.as_os_str().to_owned(),
    }
}

fn resolve_vm_executable(cfg: &RunConfiguration) -> Result<PathBuf, LaunchError> {
    let sdk = cfg
        .sdk_path
        .as_deref()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| LaunchError::configuration("Dart SDK is not configured"))?;
    let exe = vm_executable(sdk);
    if !exe.is_file() {
        return Err(LaunchError::configuration(format!(
            "Dart VM executable not found: {}",
            exe.display()
        )));
    }
    Ok(exe)
}

fn resolve_environment(cfg: &RunConfiguration) -> BTreeMap<OsString, OsString> {
    match cfg.parent_environment() {
        ParentEnvironment::Console => merge_environment(std::env::vars_os(), &cfg.envs),
        ParentEnvironment::None => merge_environment(std::iter::empty(), &cfg.envs),
    }
}

/// `parent` overlaid with the user's variables. Parent entries need not be
/// valid UTF-8.
fn merge_environment(
    parent: impl IntoIterator<Item = (OsString, OsString)>,
    envs: &BTreeMap<String, String>,
) -> BTreeMap<OsString, OsString> {
    let mut env: BTreeMap<OsString, OsString> = parent.into_iter().collect();
    env.extend(envs.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))));
    env
}

/// Builds the command line for `cfg`.
///
/// `main_override` replaces the configured script, e.g. for a generated
/// entry point. Nothing is spawned; every error surfaces here.
pub fn build<A: PortAllocator + ?Sized>(
    cfg: &RunConfiguration,
    main_override: Option<&Path>,
    allocator: &A,
) -> Result<CommandSpec, LaunchError> {
    let exe = resolve_vm_executable(cfg)?;
    if cfg.script_path.as_os_str().is_empty() {
        return Err(LaunchError::configuration("Dart file is not set"));
    }
    let script = main_override.unwrap_or(&cfg.script_path);
    if script.as_os_str().is_empty() {
        return Err(LaunchError::configuration("main file override is empty"));
    }

    let working_directory = cfg.process_working_directory();
    let env = resolve_environment(cfg);

    let vm_options = tokenize_opt(cfg.vm_options.as_deref());
    let decision = port_negotiator::negotiate(&vm_options, allocator)?;

    let mut args: Vec<OsString> = vm_options.into_iter().map(OsString::from).collect();
    if cfg.checked_mode {
        args.push(CHECKED_MODE_FLAG.into());
    }
    if cfg.mode == ExecutionMode::Debug {
        args.push(PAUSE_ON_START_FLAG.into());
    }
    if let Some(flag) = decision.flag_to_append() {
        args.push(flag.into());
    }
    args.push(to_system_dependent(script));
    args.extend(
        tokenize_opt(cfg.arguments.as_deref())
            .into_iter()
            .map(OsString::from),
    );

    let spec = CommandSpec {
        exe,
        args,
        working_directory,
        env,
        charset: CHARSET,
        port: decision.port,
        port_source: decision.source,
    };
    tracing::debug!(
        command = %spec.display(),
        port = %spec.port,
        source = ?spec.port_source,
        "built command line"
    );
    Ok(spec)
}
