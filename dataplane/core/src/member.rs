use crate::SetType;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::num::NonZeroU16;

/// Why a member string was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMember {
    #[error("member is empty")]
    Empty,

    #[error("invalid IPv4 address: {0}")]
    Address(String),

    #[error("invalid CIDR: {0}")]
    Cidr(String),

    #[error("invalid ip,port member: {0}")]
    Port(String),

    #[error("`nomatch` is only valid in a CIDR set: {0}")]
    NoMatchOutsideCidr(String),
}

/// Validates a hash-set member string against the owning set's type.
///
/// Accepted forms: a plain IPv4 address; `ip,[proto:]port` for named-port
/// sets; a CIDR (optionally followed by ` nomatch`) for CIDR sets.
pub fn validate_member(set_type: SetType, member: &str) -> Result<(), InvalidMember> {
    if member.is_empty() {
        return Err(InvalidMember::Empty);
    }

    match set_type {
        SetType::CidrBlocks => {
            let cidr = member.strip_suffix(" nomatch").unwrap_or(member);
            if cidr.parse::<Ipv4Net>().is_ok() || cidr.parse::<Ipv4Addr>().is_ok() {
                Ok(())
            } else {
                Err(InvalidMember::Cidr(member.to_string()))
            }
        }
        SetType::NamedPorts => {
            let (ip, port) = member
                .split_once(',')
                .ok_or_else(|| InvalidMember::Port(member.to_string()))?;
            if ip.parse::<Ipv4Addr>().is_err() {
                return Err(InvalidMember::Address(member.to_string()));
            }
            let port = match port.split_once(':') {
                Some((proto, port)) => {
                    if !matches!(proto, "tcp" | "udp" | "sctp") {
                        return Err(InvalidMember::Port(member.to_string()));
                    }
                    port
                }
                None => port,
            };
            if port.parse::<NonZeroU16>().is_err() {
                return Err(InvalidMember::Port(member.to_string()));
            }
            Ok(())
        }
        _ => {
            if member.ends_with(" nomatch") {
                return Err(InvalidMember::NoMatchOutsideCidr(member.to_string()));
            }
            if member.parse::<Ipv4Addr>().is_err() {
                return Err(InvalidMember::Address(member.to_string()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_members() {
        assert_eq!(validate_member(SetType::Namespace, "10.0.0.1"), Ok(()));
        assert!(validate_member(SetType::Namespace, "").is_err());
        assert!(validate_member(SetType::Namespace, "10.0.0").is_err());
        assert!(validate_member(SetType::Namespace, "10.0.0.1/24").is_err());
        assert!(validate_member(SetType::Namespace, "10.0.0.0/24 nomatch").is_err());
    }

    #[test]
    fn cidr_members() {
        assert_eq!(validate_member(SetType::CidrBlocks, "10.0.0.0/24"), Ok(()));
        assert_eq!(
            validate_member(SetType::CidrBlocks, "10.0.1.0/28 nomatch"),
            Ok(())
        );
        // A bare address is a valid nethash entry.
        assert_eq!(validate_member(SetType::CidrBlocks, "10.0.0.1"), Ok(()));
        assert!(validate_member(SetType::CidrBlocks, "10.0.0.0/33").is_err());
        assert!(validate_member(SetType::CidrBlocks, "nomatch").is_err());
    }

    #[test]
    fn named_port_members() {
        assert_eq!(validate_member(SetType::NamedPorts, "10.0.0.5,8080"), Ok(()));
        assert_eq!(
            validate_member(SetType::NamedPorts, "10.0.0.5,tcp:8080"),
            Ok(())
        );
        assert_eq!(
            validate_member(SetType::NamedPorts, "10.0.0.5,udp:53"),
            Ok(())
        );
        assert!(validate_member(SetType::NamedPorts, "10.0.0.5").is_err());
        assert!(validate_member(SetType::NamedPorts, "10.0.0.5,icmp:1").is_err());
        assert!(validate_member(SetType::NamedPorts, "10.0.0.5,tcp:0").is_err());
        assert!(validate_member(SetType::NamedPorts, "10.0.0.5,tcp:").is_err());
    }
}
