use std::{
    process::ExitStatus,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use vmlaunch_process::{NegotiatedPort, ProcessState, ProcessStatus, RunId};

use crate::{
    command_line::CommandSpec,
    console::{Console, ConsoleLine, ConsoleStream},
    error::LaunchError,
    settings,
};

pub const LOCAL_HOST: &str = "127.0.0.1";

/// How long to let stdout/stderr drain after exit before notifying listeners.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub type TerminationListener = Box<dyn FnOnce(&ProcessStatus) + Send + 'static>;

struct Shared {
    status: ProcessStatus,
    listeners: Vec<TerminationListener>,
}

fn lock(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // The VM must not outlive the launcher.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn exit_message(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return if code == 0 {
            "exited".to_string()
        } else {
            format!("exited with code {code}")
        };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("terminated by signal {sig}");
        }
    }
    "terminated".to_string()
}

#[cfg(unix)]
fn send_sigterm(pgid: i32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn signal_terminate(_child: &mut Child, pgid: Option<i32>) {
    if let Some(pgid) = pgid
        && let Err(e) = send_sigterm(pgid)
    {
        tracing::warn!(pgid, error = %e, "failed to signal VM process group");
    }
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child, _pgid: Option<i32>) {
    let _ = child.start_kill();
}

fn pump_output<R>(reader: R, stream: ConsoleStream, console: Console) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    console
                        .emit(stream, String::from_utf8_lossy(&buf).into_owned())
                        .await;
                }
            }
        }
    })
}

/// Starts VM processes from finished command specs.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    console_max_lines: Option<usize>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_console_max_lines(max_lines: usize) -> Self {
        Self {
            console_max_lines: Some(max_lines),
        }
    }

    /// Spawns the process described by `spec`. Must run inside a Tokio runtime.
    ///
    /// Spawn failures (missing executable, bad working directory) come back as
    /// [`LaunchError::Resource`]. Anything after that, including an immediate
    /// crash, is reported to termination listeners.
    pub async fn start(&self, spec: CommandSpec) -> Result<ProcessHandle, LaunchError> {
        let id = RunId::new();
        let console = match self.console_max_lines {
            Some(n) => Console::with_max_lines(n),
            None => Console::default(),
        };

        let mut cmd = Command::new(&spec.exe);
        cmd.args(&spec.args)
            .current_dir(&spec.working_directory)
            .env_clear()
            .envs(&spec.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so termination reaches the whole process tree.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let status = ProcessStatus {
                    id,
                    state: ProcessState::Failed,
                    pid: None,
                    port: Some(spec.port),
                    exit_code: None,
                    message: Some(format!("spawn failed: {e}")),
                };
                tracing::warn!(?status, exe = %spec.exe.display(), "failed to start VM");
                return Err(LaunchError::resource(
                    format!(
                        "spawn process: exec={} (cwd {})",
                        spec.exe.display(),
                        spec.working_directory.display()
                    ),
                    e,
                ));
            }
        };

        let pid = child.id();
        tracing::info!(run_id = %id, ?pid, port = %spec.port, "VM process started");

        console
            .emit(ConsoleStream::System, format!("[vmlaunch] exec: {}", spec.display()))
            .await;

        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(pump_output(out, ConsoleStream::Stdout, console.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(pump_output(err, ConsoleStream::Stderr, console.clone()));
        }

        let shared = Arc::new(Mutex::new(Shared {
            status: ProcessStatus {
                id: id.clone(),
                state: ProcessState::Running,
                pid,
                port: Some(spec.port),
                exit_code: None,
                message: None,
            },
            listeners: Vec::new(),
        }));
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn({
            let shared = shared.clone();
            let console = console.clone();
            let pgid = pid.and_then(|p| i32::try_from(p).ok());
            async move {
                let res = loop {
                    tokio::select! {
                        res = child.wait() => break res,
                        Some(()) = kill_rx.recv() => signal_terminate(&mut child, pgid),
                    }
                };

                for reader in readers {
                    let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
                }

                let (exit_code, message) = match &res {
                    Ok(status) => (status.code(), exit_message(status)),
                    Err(err) => (None, format!("wait failed: {err}")),
                };
                console
                    .emit(ConsoleStream::System, format!("[vmlaunch] {message}"))
                    .await;

                let (status, listeners) = {
                    let mut s = lock(&shared);
                    s.status.state = ProcessState::Terminated;
                    s.status.exit_code = exit_code;
                    s.status.message = Some(message);
                    (s.status.clone(), std::mem::take(&mut s.listeners))
                };
                tracing::info!(
                    run_id = %status.id,
                    exit_code = ?status.exit_code,
                    reason = status.message.as_deref().unwrap_or_default(),
                    "VM process terminated"
                );
                state_tx.send_replace(ProcessState::Terminated);
                for listener in listeners {
                    listener(&status);
                }
            }
        });

        Ok(ProcessHandle {
            id,
            port: spec.port,
            pid,
            console,
            shared,
            state_rx,
            kill_tx,
        })
    }
}

/// A live VM run.
pub struct ProcessHandle {
    id: RunId,
    port: NegotiatedPort,
    pid: Option<u32>,
    console: Console,
    shared: Arc<Mutex<Shared>>,
    state_rx: watch::Receiver<ProcessState>,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("pid", &self.pid)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl ProcessHandle {
    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn negotiated_port(&self) -> NegotiatedPort {
        self.port
    }

    pub fn is_alive(&self) -> bool {
        *self.state_rx.borrow() == ProcessState::Running
    }

    pub fn status(&self) -> ProcessStatus {
        lock(&self.shared).status.clone()
    }

    pub fn service_url_for(port: NegotiatedPort) -> String {
        format!("http://{LOCAL_HOST}:{port}")
    }

    /// Service URL while the VM runs; `None` once it has terminated.
    pub fn service_url(&self) -> Option<String> {
        self.is_alive().then(|| Self::service_url_for(self.port))
    }

    /// Calls `listener` once when the process terminates, or right away if it
    /// already has.
    pub fn on_terminated<F>(&self, listener: F)
    where
        F: FnOnce(&ProcessStatus) + Send + 'static,
    {
        let status = {
            let mut s = lock(&self.shared);
            if !s.status.state.is_final() {
                s.listeners.push(Box::new(listener));
                return;
            }
            s.status.clone()
        };
        listener(&status);
    }

    /// Asks the process to exit. Returns `false` if it already terminated.
    ///
    /// Best effort: on Unix the process group gets SIGTERM and may ignore it.
    pub fn terminate(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        tracing::info!(run_id = %self.id, pid = ?self.pid, "terminating VM process");
        self.kill_tx.send(()).is_ok()
    }

    pub fn subscribe_console(&self) -> tokio::sync::broadcast::Receiver<ConsoleLine> {
        self.console.subscribe()
    }

    pub async fn tail_console(&self, cursor: u64, limit: usize) -> (Vec<ConsoleLine>, u64) {
        self.console.tail(cursor, limit).await
    }

    /// Lines after `cursor` in order; cursor 0 starts at the oldest line kept.
    pub async fn read_console(&self, cursor: u64, limit: usize) -> (Vec<ConsoleLine>, u64) {
        self.console.read_after(cursor, limit).await
    }

    /// Resolves once the process has terminated.
    pub async fn wait(&self) -> ProcessStatus {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|s| s.is_final()).await;
        self.status()
    }

    /// Polls the service port until it accepts connections.
    ///
    /// Gives up when the process terminates or `timeout` elapses.
    pub async fn wait_for_service(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return false;
            }
            if let Ok(s) = tokio::net::TcpStream::connect((LOCAL_HOST, self.port.get())).await {
                drop(s);
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// [`wait_for_service`](Self::wait_for_service) with the configured
    /// default timeout.
    pub async fn wait_for_service_default(&self) -> bool {
        self.wait_for_service(settings::port_probe_timeout()).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        collections::BTreeMap,
        ffi::OsString,
        os::unix::fs::PermissionsExt,
        path::PathBuf,
        sync::atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::port_negotiator::PortSource;

    fn shell(script: &str, port: u16) -> CommandSpec {
        let mut env = BTreeMap::new();
        env.insert(OsString::from("VMLAUNCH_GREETING"), OsString::from("hello"));
        CommandSpec {
            exe: PathBuf::from("/bin/sh"),
            args: vec![OsString::from("-c"), OsString::from(script)],
            working_directory: std::env::temp_dir(),
            env,
            charset: "UTF-8",
            port: NegotiatedPort::new(port).unwrap(),
            port_source: PortSource::Allocated,
        }
    }

    #[tokio::test]
    async fn captures_output_and_notifies_once() {
        let handle = ProcessSupervisor::new()
            .start(shell("echo \"$VMLAUNCH_GREETING\"; echo oops >&2; exit 3", 40001))
            .await
            .unwrap();
        assert_eq!(handle.negotiated_port().get(), 40001);

        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        handle.on_terminated(move |status| {
            assert_eq!(status.exit_code, Some(3));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let status = handle.wait().await;
        assert_eq!(status.state, ProcessState::Terminated);
        assert_eq!(status.exit_code, Some(3));
        assert_eq!(status.message.as_deref(), Some("exited with code 3"));
        assert!(!handle.is_alive());
        assert_eq!(handle.service_url(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (lines, _) = handle.tail_console(0, 100).await;
        assert!(
            lines
                .iter()
                .any(|l| l.stream == ConsoleStream::Stdout && l.text == "hello")
        );
        assert!(
            lines
                .iter()
                .any(|l| l.stream == ConsoleStream::Stderr && l.text == "oops")
        );
    }

    #[tokio::test]
    async fn late_listener_runs_immediately() {
        let handle = ProcessSupervisor::new()
            .start(shell("exit 0", 40002))
            .await
            .unwrap();
        handle.wait().await;

        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        handle.on_terminated(move |status| {
            assert_eq!(status.message.as_deref(), Some("exited"));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminate_stops_process_and_is_idempotent() {
        let handle = ProcessSupervisor::new()
            .start(shell("sleep 30", 40003))
            .await
            .unwrap();
        assert!(handle.is_alive());
        assert_eq!(
            handle.service_url().as_deref(),
            Some("http://127.0.0.1:40003")
        );

        assert!(handle.terminate());
        let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap();
        assert_eq!(status.state, ProcessState::Terminated);
        assert!(status.exit_code.is_none());
        assert!(!handle.terminate());
    }

    #[tokio::test]
    async fn missing_executable_is_resource_error() {
        let mut spec = shell("", 40004);
        spec.exe = PathBuf::from("/nonexistent/bin/dart");
        let err = ProcessSupervisor::new().start(spec).await.unwrap_err();
        assert_eq!(err.code(), "resource_error");
    }

    #[tokio::test]
    async fn missing_working_directory_is_resource_error() {
        let mut spec = shell("exit 0", 40005);
        spec.working_directory = PathBuf::from("/nonexistent/vmlaunch/cwd");
        let err = ProcessSupervisor::new().start(spec).await.unwrap_err();
        assert_eq!(err.code(), "resource_error");
        assert!(err.to_string().contains("/nonexistent/vmlaunch/cwd"));
    }

    #[tokio::test]
    async fn non_executable_vm_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("dart");
        std::fs::write(&exe, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o644)).unwrap();

        let mut spec = shell("", 40006);
        spec.exe = exe;
        let err = ProcessSupervisor::new().start(spec).await.unwrap_err();
        assert_eq!(err.code(), "resource_error");
        match err {
            LaunchError::Resource { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn signalling_a_missing_group_reports_error() {
        let err = send_sigterm(i32::MAX).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }

    #[tokio::test]
    async fn console_reads_from_first_line() {
        let handle = ProcessSupervisor::with_console_max_lines(2000)
            .start(shell("i=1; while [ $i -le 700 ]; do echo line$i; i=$((i+1)); done", 40007))
            .await
            .unwrap();
        handle.wait().await;

        let mut texts = Vec::new();
        let mut cursor = 0;
        loop {
            let (lines, next) = handle.read_console(cursor, 500).await;
            if lines.is_empty() {
                break;
            }
            texts.extend(
                lines
                    .into_iter()
                    .filter(|l| l.stream == ConsoleStream::Stdout)
                    .map(|l| l.text),
            );
            cursor = next;
        }
        assert_eq!(texts.len(), 700);
        assert_eq!(texts.first().map(String::as_str), Some("line1"));
        assert_eq!(texts.last().map(String::as_str), Some("line700"));
    }

    #[tokio::test]
    async fn service_probe_sees_listener() {
        let listener = tokio::net::TcpListener::bind((LOCAL_HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = ProcessSupervisor::new()
            .start(shell("sleep 30", port))
            .await
            .unwrap();

        assert!(handle.wait_for_service(Duration::from_secs(5)).await);
        handle.terminate();
        handle.wait().await;
        assert!(!handle.wait_for_service(Duration::from_secs(1)).await);
    }
}
