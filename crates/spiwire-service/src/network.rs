//! Network readiness probe consulted before the listener is opened.

use std::net::{IpAddr, Ipv4Addr};

/// Answers whether the device has a usable local address yet.
pub trait NetworkProbe: Send + 'static {
    /// The local address, or `None` while the network is not up.
    fn local_address(&mut self) -> Option<IpAddr>;
}

/// Probe for hosts whose network is up before the service starts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

impl NetworkProbe for AlwaysReady {
    fn local_address(&mut self) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl<F> NetworkProbe for F
where
    F: FnMut() -> Option<IpAddr> + Send + 'static,
{
    fn local_address(&mut self) -> Option<IpAddr> {
        self()
    }
}
