//! Choosing the VM service port for a run.

use vmlaunch_process::{DEFAULT_SERVICE_PORT, NegotiatedPort};

use crate::{error::LaunchError, options::parse_int_before_slash, port_alloc::PortAllocator};

pub const ENABLE_SERVICE_FLAG: &str = "--enable-vm-service";
pub const OBSERVE_FLAG: &str = "--observe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    /// `--enable-vm-service:<port>` or `--observe:<port>` in the VM options.
    Explicit,
    /// A bare service flag; the VM falls back to its default port.
    Default,
    /// Nothing usable in the VM options; taken from the OS.
    Allocated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDecision {
    pub port: NegotiatedPort,
    pub source: PortSource,
}

impl PortDecision {
    /// Flag to append so the VM listens on the negotiated port. `None` when
    /// the user's own flag already tells it.
    pub fn flag_to_append(&self) -> Option<String> {
        match self.source {
            PortSource::Allocated => Some(service_flag(self.port)),
            PortSource::Explicit | PortSource::Default => None,
        }
    }
}

pub fn service_flag(port: NegotiatedPort) -> String {
    format!("{ENABLE_SERVICE_FLAG}:{port}")
}

/// Port requested by a single VM option, if it is a service flag at all.
///
/// A service flag with an unusable port value is treated like any other
/// option.
pub fn port_from_option(option: &str) -> Option<(NegotiatedPort, PortSource)> {
    if option == ENABLE_SERVICE_FLAG || option == OBSERVE_FLAG {
        let port = NegotiatedPort::new(DEFAULT_SERVICE_PORT)?;
        return Some((port, PortSource::Default));
    }

    let value = [ENABLE_SERVICE_FLAG, OBSERVE_FLAG]
        .iter()
        .find_map(|flag| option.strip_prefix(*flag)?.strip_prefix(':'))?;

    let port = parse_int_before_slash(value)
        .and_then(|v| u16::try_from(v).ok())
        .and_then(NegotiatedPort::new);
    if port.is_none() {
        tracing::debug!(option, "ignoring service flag with unparseable port");
    }
    Some((port?, PortSource::Explicit))
}

/// First service flag in `vm_options` wins; without one a free port is
/// allocated.
pub fn negotiate<A: PortAllocator + ?Sized>(
    vm_options: &[String],
    allocator: &A,
) -> Result<PortDecision, LaunchError> {
    if let Some((port, source)) = vm_options.iter().find_map(|o| port_from_option(o)) {
        return Ok(PortDecision { port, source });
    }

    let port = allocator.allocate()?;
    tracing::debug!(%port, "allocated service port");
    Ok(PortDecision {
        port,
        source: PortSource::Allocated,
    })
}
