//! Virtual socket operations.
//!
//! `socket` allocates an id; every other method takes that id as its first
//! argument.

use std::net::SocketAddrV4;

use serde_json::Value;

use super::Args;
use crate::error::{PassthroughError, Result};
use crate::net::{decode_endpoint, validate_socket_args, ConnectionTable, DEFAULT_PROTOCOL};
use crate::protocol::Outcome;

/// Socket methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetMethod {
    /// `socket(domain, type, protocol)` → id.
    Socket,
    /// `connect(id, domain, address, port)` → 0.
    Connect,
    /// `bind(id, domain, address, port)` → 0.
    Bind,
    /// `accept(id)` → new id, or null with an empty backlog.
    Accept,
    /// `read(id, maxBytes)` → hex data, EAGAIN or EOF.
    Read,
    /// `write(id, data, encoding?)` → null.
    Write,
    /// `close(id)` → null.
    Close,
    /// `getRemoteAddress(id)` → dotted quad.
    GetRemoteAddress,
    /// `getRemotePort(id)` → port.
    GetRemotePort,
    /// `getRemoteFamily(id)` → family constant.
    GetRemoteFamily,
}

impl NetMethod {
    /// Parse a normalized method name.
    pub fn parse(method: &str) -> Option<Self> {
        let parsed = match method {
            "socket" => Self::Socket,
            "connect" => Self::Connect,
            "bind" => Self::Bind,
            "accept" => Self::Accept,
            "read" => Self::Read,
            "write" => Self::Write,
            "close" => Self::Close,
            "getRemoteAddress" => Self::GetRemoteAddress,
            "getRemotePort" => Self::GetRemotePort,
            "getRemoteFamily" => Self::GetRemoteFamily,
            _ => return None,
        };
        Some(parsed)
    }

    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Connect => "connect",
            Self::Bind => "bind",
            Self::Accept => "accept",
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
            Self::GetRemoteAddress => "getRemoteAddress",
            Self::GetRemotePort => "getRemotePort",
            Self::GetRemoteFamily => "getRemoteFamily",
        }
    }
}

pub(super) async fn call(table: &ConnectionTable, method: NetMethod, args: &Args) -> Result<Outcome> {
    let id = || args.int(0, "socket");
    match method {
        NetMethod::Socket => {
            validate_socket_args(
                args.int(0, "domain")?,
                args.int(1, "type")?,
                args.opt_int(2, "protocol")?.unwrap_or(DEFAULT_PROTOCOL),
            )?;
            let socket = table.open();
            tracing::debug!(socket = socket.id(), "Socket created");
            Ok(Outcome::single(socket.id()))
        }
        NetMethod::Connect => {
            let socket = table.get(id()?)?;
            socket.connect(endpoint(args)?).await?;
            Ok(Outcome::single(0))
        }
        NetMethod::Bind => {
            let socket = table.get(id()?)?;
            socket.bind(endpoint(args)?).await?;
            Ok(Outcome::single(0))
        }
        NetMethod::Accept => {
            let listener = id()?;
            let (stream, peer) = match table.get(listener)?.accept() {
                Some(pending) => pending,
                None => return Ok(Outcome::Single(Value::Null)),
            };
            let accepted = table.open();
            if let Err(e) = accepted.attach(stream).await {
                table.remove(i64::from(accepted.id()))?;
                return Err(e);
            }
            tracing::debug!(listener, socket = accepted.id(), %peer, "Accepted");
            Ok(Outcome::single(accepted.id()))
        }
        NetMethod::Read => {
            let socket = table.get(id()?)?;
            let max_bytes = args.size(1, "maxBytes")?;
            Ok(Outcome::Single(socket.read(max_bytes).into_value()))
        }
        NetMethod::Write => {
            let socket = table.get(id()?)?;
            let data = args.str(1, "data")?;
            let bytes = match args.opt_str(2, "encoding")? {
                Some("hex") => hex::decode(data)?,
                _ => data.as_bytes().to_vec(),
            };
            socket.write(&bytes).await?;
            Ok(Outcome::Unit)
        }
        NetMethod::Close => {
            let socket = table.remove(id()?)?;
            socket.close().await;
            tracing::debug!(socket = socket.id(), "Socket closed");
            Ok(Outcome::Unit)
        }
        NetMethod::GetRemoteAddress => Ok(Outcome::single(table.get(id()?)?.remote_address()?)),
        NetMethod::GetRemotePort => Ok(Outcome::single(table.get(id()?)?.remote_port()?)),
        NetMethod::GetRemoteFamily => Ok(Outcome::single(table.get(id()?)?.remote_family()?)),
    }
}

fn endpoint(args: &Args) -> Result<SocketAddrV4> {
    decode_endpoint(
        args.int(1, "domain")?,
        args.int(2, "address")?,
        args.int(3, "port")?,
    )
}
