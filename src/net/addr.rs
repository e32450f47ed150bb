//! Socket constants and wire address decoding.
//!
//! The sandbox forwards `sin_addr.s_addr` and `sin_port` exactly as they sit
//! in its `sockaddr_in`: network byte order, printed as native integers.
//! On a little-endian sandbox that means the first address octet is the low
//! byte of the integer and the port's bytes are swapped.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{PassthroughError, Result};

/// IPv4 address family.
pub const AF_INET: i64 = 2;

/// IPv6 address family (Linux value).
pub const AF_INET6: i64 = 10;

/// Stream socket type.
pub const SOCK_STREAM: i64 = 1;

/// Default protocol for the family/type pair.
pub const DEFAULT_PROTOCOL: i64 = 0;

/// Decode a packed wire address into a host address.
///
/// Values may arrive negative when the sandbox formatted the field as a
/// signed integer; only the low 32 bits matter.
///
/// ```
/// use sandbox_passthrough::net::decode_address;
///
/// let wire = i64::from(u32::from_le_bytes([127, 0, 0, 1]));
/// assert_eq!(decode_address(wire).to_string(), "127.0.0.1");
/// ```
pub fn decode_address(wire: i64) -> Ipv4Addr {
    Ipv4Addr::from((wire as u32).to_le_bytes())
}

/// Decode a byte-swapped wire port into host order.
pub fn decode_port(wire: i64) -> u16 {
    (wire as u16).swap_bytes()
}

/// Encode a host address the way the sandbox sends it.
pub fn encode_address(addr: Ipv4Addr) -> i64 {
    i64::from(u32::from_le_bytes(addr.octets()))
}

/// Encode a host port the way the sandbox sends it.
pub fn encode_port(port: u16) -> i64 {
    i64::from(port.swap_bytes())
}

/// Decode a `(family, address, port)` triple into an IPv4 endpoint.
///
/// # Errors
///
/// Returns `UnsupportedSocket` for any family other than [`AF_INET`].
pub fn decode_endpoint(family: i64, address: i64, port: i64) -> Result<SocketAddrV4> {
    if family != AF_INET {
        return Err(PassthroughError::UnsupportedSocket(format!(
            "Unsupported socket family: {}",
            family
        )));
    }
    Ok(SocketAddrV4::new(decode_address(address), decode_port(port)))
}

/// Check the arguments of `socket(domain, type, protocol)`.
pub fn validate_socket_args(domain: i64, socket_type: i64, protocol: i64) -> Result<()> {
    if domain != AF_INET {
        return Err(PassthroughError::UnsupportedSocket(format!(
            "Unsupported socket domain: {}",
            domain
        )));
    }
    if socket_type != SOCK_STREAM {
        return Err(PassthroughError::UnsupportedSocket(format!(
            "Unsupported socket type: {}",
            socket_type
        )));
    }
    if protocol != DEFAULT_PROTOCOL {
        return Err(PassthroughError::UnsupportedSocket(format!(
            "Unsupported protocol: {}",
            protocol
        )));
    }
    Ok(())
}

/// Family constant for a peer address, in the `socket()` domain numbering.
pub fn family_code(addr: &SocketAddr) -> i64 {
    match addr {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    }
}
