//! Boundary to the lower network layer.

use crate::Result;

/// Handle to the route an endpoint sends its segments over.
///
/// The endpoint core emits fully formed, checksummed TCP segments; the route
/// wraps them in whatever network header it maintains and puts them on the
/// wire. Implementations must be callable from both the connection's worker
/// thread and (for control segments such as handshake RSTs) any thread
/// poking the endpoint.
pub trait Route: Send + Sync {
    /// The link MTU in bytes, as seen by the transport layer. The SYN's MSS
    /// option advertises `mtu() - 20`.
    fn mtu(&self) -> u16;

    /// Hands one outbound segment (TCP header plus payload) to the network
    /// layer.
    fn write_packet(&self, packet: &[u8]) -> Result<()>;
}
