use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

/// Port the VM uses when the service flag is given without an explicit port.
pub const DEFAULT_SERVICE_PORT: u16 = 8181;

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Run,
    Debug,
}

/// Which environment the child starts from before user variables are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentEnvironment {
    /// Inherit the environment of the launching process.
    Console,
    /// Start from an empty environment.
    None,
}

/// The service port of a single run. Never zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "u16", into = "u16")]
pub struct NegotiatedPort(u16);

impl NegotiatedPort {
    pub fn new(port: u16) -> Option<Self> {
        (port != 0).then_some(Self(port))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for NegotiatedPort {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| "service port must be in 1..=65535".to_string())
    }
}

impl From<NegotiatedPort> for u16 {
    fn from(value: NegotiatedPort) -> Self {
        value.0
    }
}

impl fmt::Display for NegotiatedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Everything needed to launch one script on the VM.
///
/// Owned by the host's configuration layer; the launcher only reads it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RunConfiguration {
    /// SDK root. The VM executable lives at `bin/dart` below it.
    pub sdk_path: Option<PathBuf>,
    /// Defaults to the script's directory when unset.
    pub working_directory: Option<PathBuf>,
    pub envs: BTreeMap<String, String>,
    pub include_parent_envs: bool,
    pub vm_options: Option<String>,
    pub arguments: Option<String>,
    pub checked_mode: bool,
    pub script_path: PathBuf,
    pub mode: ExecutionMode,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            sdk_path: None,
            working_directory: None,
            envs: BTreeMap::new(),
            include_parent_envs: true,
            vm_options: None,
            arguments: None,
            checked_mode: false,
            script_path: PathBuf::new(),
            mode: ExecutionMode::Run,
        }
    }
}

impl RunConfiguration {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            ..Self::default()
        }
    }

    pub fn parent_environment(&self) -> ParentEnvironment {
        if self.include_parent_envs {
            ParentEnvironment::Console
        } else {
            ParentEnvironment::None
        }
    }

    /// Working directory the child runs in.
    ///
    /// An explicit setting wins; otherwise the script's parent directory, or
    /// the script path itself when it names a directory.
    pub fn process_working_directory(&self) -> PathBuf {
        if let Some(dir) = &self.working_directory
            && !dir.as_os_str().is_empty()
        {
            return dir.clone();
        }
        if self.script_path.is_dir() {
            return self.script_path.clone();
        }
        self.script_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    Terminated,
    Failed,
}

impl ProcessState {
    pub fn is_final(self) -> bool {
        matches!(self, ProcessState::Terminated | ProcessState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub id: RunId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub port: Option<NegotiatedPort>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl ProcessStatus {
    /// Numeric port for hosts that expect `-1` before one is assigned.
    pub fn port_or_unassigned(&self) -> i32 {
        self.port.map(|p| i32::from(p.get())).unwrap_or(-1)
    }
}
