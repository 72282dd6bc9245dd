use std::time::Duration;

const DEFAULT_CONSOLE_MAX_LINES: usize = 1000;
const DEFAULT_PORT_PROBE_TIMEOUT_MS: u64 = 90_000;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Lines of console output kept for tailing.
pub fn console_max_lines() -> usize {
    clamp_console_max_lines(env_usize("VMLAUNCH_LOG_MAX_LINES"))
}

/// How long to wait for the VM service port to accept connections.
pub fn port_probe_timeout() -> Duration {
    clamp_port_probe_timeout(env_u64("VMLAUNCH_PORT_PROBE_TIMEOUT_MS"))
}

fn clamp_console_max_lines(raw: Option<usize>) -> usize {
    raw.map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_CONSOLE_MAX_LINES)
}

fn clamp_port_probe_timeout(raw: Option<u64>) -> Duration {
    Duration::from_millis(
        raw.map(|v| v.clamp(1000, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_PORT_PROBE_TIMEOUT_MS),
    )
}
