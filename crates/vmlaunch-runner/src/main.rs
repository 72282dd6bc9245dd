use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use vmlaunch_process::ExecutionMode;
use vmlaunch_runner::{
    ProcessHandle,
    config::load_run_configuration,
    console::{ConsoleLine, ConsoleStream},
    error_payload, launch,
};

const CONSOLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONSOLE_BATCH: usize = 500;

#[derive(Debug, Parser)]
#[command(name = "vmlaunch", version, about = "Run a Dart script with the VM service enabled")]
struct Cli {
    /// Run configuration (TOML).
    #[arg(long, short)]
    config: PathBuf,

    /// Pause isolates on start so a debugger can attach.
    #[arg(long)]
    debug: bool,

    /// Script to run instead of the configured one.
    #[arg(long = "main")]
    main_override: Option<PathBuf>,

    /// Wait until the VM service accepts connections before printing its URL.
    #[arg(long)]
    wait_for_service: bool,
}

fn print_lines(lines: &[ConsoleLine]) {
    for line in lines {
        match line.stream {
            ConsoleStream::Stdout => println!("{}", line.text),
            ConsoleStream::Stderr | ConsoleStream::System => eprintln!("{}", line.text),
        }
    }
}

async fn drain_console(handle: &ProcessHandle, mut cursor: u64) -> u64 {
    loop {
        let (lines, next) = handle.read_console(cursor, CONSOLE_BATCH).await;
        print_lines(&lines);
        if lines.len() < CONSOLE_BATCH {
            return next;
        }
        cursor = next;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = load_run_configuration(&cli.config)?;
    if cli.debug {
        cfg.mode = ExecutionMode::Debug;
    }

    let handle = match launch(&cfg, cli.main_override.as_deref()).await {
        Ok(h) => h,
        Err(e) => {
            eprintln!("{}", error_payload::encode(&e));
            return Err(e).context("start VM");
        }
    };

    if cli.wait_for_service && !handle.wait_for_service_default().await {
        tracing::warn!(port = %handle.negotiated_port(), "VM service did not come up");
    }
    if let Some(url) = handle.service_url() {
        eprintln!("VM service: {url}");
    }

    let mut cursor = 0;
    let mut interrupted = false;
    let mut ticker = tokio::time::interval(CONSOLE_POLL_INTERVAL);
    let status = loop {
        tokio::select! {
            status = handle.wait() => break status,
            res = tokio::signal::ctrl_c(), if !interrupted => {
                res.context("listen for Ctrl-C")?;
                interrupted = true;
                handle.terminate();
            }
            _ = ticker.tick() => {
                cursor = drain_console(&handle, cursor).await;
            }
        }
    };
    drain_console(&handle, cursor).await;

    std::process::exit(status.exit_code.unwrap_or(1));
}
