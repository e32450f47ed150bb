//! Virtual networking for the sandbox.
//!
//! The sandbox sees small integer socket ids; each id maps to a
//! [`VirtualSocket`] backed by a host TCP stream or listener.

mod addr;
mod socket;
mod table;

pub use addr::{
    decode_address, decode_endpoint, decode_port, encode_address, encode_port, family_code,
    validate_socket_args, AF_INET, AF_INET6, DEFAULT_PROTOCOL, SOCK_STREAM,
};
pub use socket::{ReadOutcome, VirtualSocket, EAGAIN_CODE, EOF_CODE};
pub use table::{ConnectionTable, FIRST_SOCKET_ID};
