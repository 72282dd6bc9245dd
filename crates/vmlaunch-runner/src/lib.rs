//! Launching a Dart VM script with a negotiated VM service port.
//!
//! [`launch`] runs the whole pipeline: tokenize the options, pick the service
//! port, build the command line, spawn and supervise the process.

use std::path::Path;

use vmlaunch_process::RunConfiguration;

pub mod command_line;
pub mod config;
pub mod console;
pub mod error;
pub mod error_payload;
pub mod options;
pub mod port_alloc;
pub mod port_negotiator;
pub mod settings;
pub mod supervisor;

pub use command_line::CommandSpec;
pub use error::LaunchError;
pub use supervisor::{ProcessHandle, ProcessSupervisor};

/// Builds the command line for `cfg` and starts it.
///
/// The port is allocated from the OS unless the VM options name one.
pub async fn launch(
    cfg: &RunConfiguration,
    main_override: Option<&Path>,
) -> Result<ProcessHandle, LaunchError> {
    let spec = command_line::build(cfg, main_override, &port_alloc::OsPortAllocator)?;
    ProcessSupervisor::new().start(spec).await
}
