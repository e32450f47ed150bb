//! Name resolution through the host resolver.

use std::net::IpAddr;

use serde_json::Value;

use super::Args;
use crate::error::{PassthroughError, Result};
use crate::protocol::Outcome;

/// Resolver methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMethod {
    /// `lookup(host, family?)` → `[address, family]`.
    Lookup,
    /// `resolve(host, rrtype?)` → addresses for `A` (default) or `AAAA`.
    Resolve,
    /// `resolve4(host)` → IPv4 addresses.
    Resolve4,
    /// `resolve6(host)` → IPv6 addresses.
    Resolve6,
}

impl DnsMethod {
    /// Parse a normalized method name.
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "lookup" => Some(Self::Lookup),
            "resolve" => Some(Self::Resolve),
            "resolve4" => Some(Self::Resolve4),
            "resolve6" => Some(Self::Resolve6),
            _ => None,
        }
    }

    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Resolve => "resolve",
            Self::Resolve4 => "resolve4",
            Self::Resolve6 => "resolve6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Any),
            4 => Ok(Self::V4),
            6 => Ok(Self::V6),
            other => Err(PassthroughError::invalid_arg(format!(
                "family must be 0, 4 or 6 (got {})",
                other
            ))),
        }
    }

    /// Family argument of `lookup`: a number or an options object.
    fn from_args(args: &Args, index: usize) -> Result<Self> {
        match args.value(index) {
            None => Ok(Self::Any),
            Some(Value::Object(options)) => match options.get("family") {
                None | Some(Value::Null) => Ok(Self::Any),
                Some(family) => {
                    Self::from_code(Args::new(vec![family.clone()]).int(0, "family")?)
                }
            },
            Some(_) => Self::from_code(args.int(index, "family")?),
        }
    }

    fn matches(self, addr: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }
}

fn family_number(addr: &IpAddr) -> i64 {
    if addr.is_ipv4() {
        4
    } else {
        6
    }
}

async fn resolve(host: &str, family: Family) -> Result<Vec<IpAddr>> {
    let mut found: Vec<IpAddr> = Vec::new();
    for addr in tokio::net::lookup_host((host, 0)).await? {
        let ip = addr.ip();
        if family.matches(&ip) && !found.contains(&ip) {
            found.push(ip);
        }
    }
    if found.is_empty() {
        return Err(PassthroughError::HostNotFound(host.to_string()));
    }
    Ok(found)
}

fn address_list(addrs: Vec<IpAddr>) -> Outcome {
    Outcome::single(
        addrs
            .into_iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>(),
    )
}

pub(super) async fn call(method: DnsMethod, args: &Args) -> Result<Outcome> {
    let host = args.str(0, "hostname")?;
    match method {
        DnsMethod::Lookup => {
            let family = Family::from_args(args, 1)?;
            let first = resolve(host, family).await?[0];
            tracing::debug!(host, address = %first, "Resolved");
            Ok(Outcome::pair(first.to_string(), family_number(&first)))
        }
        DnsMethod::Resolve4 => Ok(address_list(resolve(host, Family::V4).await?)),
        DnsMethod::Resolve6 => Ok(address_list(resolve(host, Family::V6).await?)),
        DnsMethod::Resolve => {
            let family = match args.opt_str(1, "rrtype")?.unwrap_or("A") {
                "A" => Family::V4,
                "AAAA" => Family::V6,
                other => {
                    return Err(PassthroughError::invalid_arg(format!(
                        "Unsupported record type: {}",
                        other
                    )))
                }
            };
            Ok(address_list(resolve(host, family).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Args {
        match value {
            Value::Array(items) => Args::new(items),
            other => Args::new(vec![other]),
        }
    }

    #[tokio::test]
    async fn test_lookup_literal_address() {
        let result = call(DnsMethod::Lookup, &args(json!(["127.0.0.1", 4])))
            .await
            .unwrap();
        assert_eq!(result.into_value(), json!(["127.0.0.1", 4]));
    }

    #[tokio::test]
    async fn test_lookup_options_object() {
        let result = call(DnsMethod::Lookup, &args(json!(["127.0.0.1", {"family": 4}])))
            .await
            .unwrap();
        assert_eq!(result.into_value()[1], 4);
    }

    #[tokio::test]
    async fn test_lookup_localhost_family() {
        let value = call(DnsMethod::Lookup, &args(json!("localhost")))
            .await
            .unwrap()
            .into_value();
        let family = value[1].as_i64().unwrap();
        assert!(family == 4 || family == 6);
    }

    #[tokio::test]
    async fn test_resolve_wrong_family_not_found() {
        let err = call(DnsMethod::Resolve6, &args(json!("127.0.0.1")))
            .await
            .unwrap_err();
        assert!(matches!(err, PassthroughError::HostNotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_record_types() {
        let value = call(DnsMethod::Resolve, &args(json!(["127.0.0.1", "A"])))
            .await
            .unwrap()
            .into_value();
        assert_eq!(value, json!(["127.0.0.1"]));

        let err = call(DnsMethod::Resolve, &args(json!(["127.0.0.1", "MX"])))
            .await
            .unwrap_err();
        assert!(matches!(err, PassthroughError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_bad_family() {
        let err = call(DnsMethod::Lookup, &args(json!(["127.0.0.1", 5])))
            .await
            .unwrap_err();
        assert!(matches!(err, PassthroughError::InvalidArgument(_)));
    }
}
