use std::net::TcpListener;

use vmlaunch_process::NegotiatedPort;

use crate::error::LaunchError;

/// Source of free TCP ports.
pub trait PortAllocator {
    fn allocate(&self) -> Result<NegotiatedPort, LaunchError>;
}

/// Asks the OS for an ephemeral port and releases it right away so the VM can
/// bind it.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPortAllocator;

impl PortAllocator for OsPortAllocator {
    fn allocate(&self) -> Result<NegotiatedPort, LaunchError> {
        allocate_tcp_port()
    }
}

pub fn allocate_tcp_port() -> Result<NegotiatedPort, LaunchError> {
    let listener = TcpListener::bind(("0.0.0.0", 0))
        .map_err(|e| LaunchError::resource("allocate service port", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| LaunchError::resource("read allocated service port", e))?
        .port();
    NegotiatedPort::new(port).ok_or_else(|| {
        LaunchError::resource(
            "allocate service port",
            std::io::Error::other("OS returned port 0"),
        )
    })
}
