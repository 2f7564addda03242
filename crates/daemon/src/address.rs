//! Network Address Type
//!
//! A tagged union over "no address", IPv4 and IPv6 endpoints with the fixed
//! 19 byte wire form used inside tokens, the byte/port views fed into the
//! obfuscation tags, and anonymization for anything handed to the control
//! plane.

use anyhow::{Context, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use crate::constants::ADDRESS_BYTES;

pub const ADDRESS_NONE: u8 = 0;
pub const ADDRESS_IPV4: u8 = 1;
pub const ADDRESS_IPV6: u8 = 2;

/// Endpoint as carried by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Address {
    #[default]
    None,
    V4 { octets: [u8; 4], port: u16 },
    V6 { groups: [u16; 8], port: u16 },
}

impl Address {
    pub fn is_none(&self) -> bool {
        matches!(self, Address::None)
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::None => 0,
            Address::V4 { port, .. } | Address::V6 { port, .. } => *port,
        }
    }

    /// Address bytes in network order. Empty for `None`.
    pub fn address_bytes(&self) -> Vec<u8> {
        match self {
            Address::None => Vec::new(),
            Address::V4 { octets, .. } => octets.to_vec(),
            Address::V6 { groups, .. } => groups.iter().flat_map(|g| g.to_be_bytes()).collect(),
        }
    }

    /// Zero the host part and the port before the address leaves the server.
    pub fn anonymize(&self) -> Address {
        match *self {
            Address::None => Address::None,
            Address::V4 { mut octets, .. } => {
                octets[3] = 0;
                Address::V4 { octets, port: 0 }
            }
            Address::V6 { mut groups, .. } => {
                for group in groups.iter_mut().skip(3) {
                    *group = 0;
                }
                Address::V6 { groups, port: 0 }
            }
        }
    }

    /// Fixed 19 byte form: type, 16 bytes of address data, port LE.
    pub fn write_bytes(&self, out: &mut [u8; ADDRESS_BYTES]) {
        out.fill(0);
        match self {
            Address::None => {}
            Address::V4 { octets, port } => {
                out[0] = ADDRESS_IPV4;
                out[1..5].copy_from_slice(octets);
                out[17..19].copy_from_slice(&port.to_le_bytes());
            }
            Address::V6 { groups, port } => {
                out[0] = ADDRESS_IPV6;
                for (i, group) in groups.iter().enumerate() {
                    out[1 + i * 2..3 + i * 2].copy_from_slice(&group.to_be_bytes());
                }
                out[17..19].copy_from_slice(&port.to_le_bytes());
            }
        }
    }

    pub fn to_bytes(&self) -> [u8; ADDRESS_BYTES] {
        let mut out = [0u8; ADDRESS_BYTES];
        self.write_bytes(&mut out);
        out
    }

    /// Parse the 19 byte form. Unknown type bytes yield `None`.
    pub fn from_bytes(data: &[u8; ADDRESS_BYTES]) -> Option<Address> {
        let port = u16::from_le_bytes([data[17], data[18]]);
        match data[0] {
            ADDRESS_NONE => Some(Address::None),
            ADDRESS_IPV4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&data[1..5]);
                Some(Address::V4 { octets, port })
            }
            ADDRESS_IPV6 => {
                let mut groups = [0u16; 8];
                for (i, group) in groups.iter_mut().enumerate() {
                    *group = u16::from_be_bytes([data[1 + i * 2], data[2 + i * 2]]);
                }
                Some(Address::V6 { groups, port })
            }
            _ => None,
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match *self {
            Address::None => None,
            Address::V4 { octets, port } => {
                Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
            }
            Address::V6 { groups, port } => {
                let ip = Ipv6Addr::new(
                    groups[0], groups[1], groups[2], groups[3], groups[4], groups[5], groups[6],
                    groups[7],
                );
                Some(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::V4 {
                octets: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                // Dual-stack sockets report IPv4 peers as mapped addresses.
                Some(v4) => Address::V4 {
                    octets: v4.octets(),
                    port: v6.port(),
                },
                None => Address::V6 {
                    groups: v6.ip().segments(),
                    port: v6.port(),
                },
            },
        }
    }
}

impl FromStr for Address {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s == "none" {
            return Ok(Address::None);
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::from(addr));
        }
        // Bare IP with no port
        let ip: IpAddr = s
            .parse()
            .with_context(|| format!("Invalid address: {}", s))?;
        Ok(Address::from(SocketAddr::new(ip, 0)))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            None => write!(f, "NONE"),
            Some(addr) if addr.port() == 0 => write!(f, "{}", addr.ip()),
            Some(addr) => write!(f, "{}", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let addr: Address = "1.2.3.4:50000".parse().unwrap();
        assert_eq!(
            addr,
            Address::V4 {
                octets: [1, 2, 3, 4],
                port: 50000
            }
        );
        assert_eq!(addr.to_string(), "1.2.3.4:50000");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr: Address = "[::1]:50000".parse().unwrap();
        assert_eq!(
            addr,
            Address::V6 {
                groups: [0, 0, 0, 0, 0, 0, 0, 1],
                port: 50000
            }
        );
        assert_eq!(addr.to_string(), "[::1]:50000");
    }

    #[test]
    fn test_parse_without_port() {
        let addr: Address = "10.0.0.1".parse().unwrap();
        assert_eq!(addr.port(), 0);
        assert_eq!(addr.to_string(), "10.0.0.1");
        assert!("not an address".parse::<Address>().is_err());
    }

    #[test]
    fn test_mapped_ipv4_collapses() {
        let mapped: SocketAddr = "[::ffff:1.2.3.4]:40000".parse().unwrap();
        assert_eq!(Address::from(mapped), "1.2.3.4:40000".parse().unwrap());
    }

    #[test]
    fn test_wire_form() {
        let v4: Address = "1.2.3.4:50000".parse().unwrap();
        let bytes = v4.to_bytes();
        assert_eq!(bytes[0], ADDRESS_IPV4);
        assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);
        assert_eq!(&bytes[17..19], &50000u16.to_le_bytes());
        assert_eq!(Address::from_bytes(&bytes), Some(v4));

        let v6: Address = "[2001:db8::7]:9".parse().unwrap();
        assert_eq!(Address::from_bytes(&v6.to_bytes()), Some(v6));

        assert_eq!(Address::from_bytes(&Address::None.to_bytes()), Some(Address::None));

        let mut bad = v4.to_bytes();
        bad[0] = 7;
        assert_eq!(Address::from_bytes(&bad), None);
    }

    #[test]
    fn test_anonymize() {
        let v4: Address = "1.2.3.4:50000".parse().unwrap();
        assert_eq!(v4.anonymize(), "1.2.3.0:0".parse().unwrap());

        let v6: Address = "[2001:db8:1:2:3:4:5:6]:50000".parse().unwrap();
        assert_eq!(v6.anonymize(), "[2001:db8:1::]:0".parse().unwrap());

        assert_eq!(Address::None.anonymize(), Address::None);
    }

    #[test]
    fn test_address_bytes() {
        let v4: Address = "1.2.3.4:5".parse().unwrap();
        assert_eq!(v4.address_bytes(), vec![1, 2, 3, 4]);
        let v6: Address = "[::1]:5".parse().unwrap();
        assert_eq!(v6.address_bytes().len(), 16);
        assert!(Address::None.address_bytes().is_empty());
    }
}
