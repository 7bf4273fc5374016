use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, Result};

/// Locality rank of an address, lower is "closer".
///
/// loopback < 192.168/16 < 10/8 < 172.16/12 < everything else.
/// Only ever used to break ties between paths with the same relay hop count.
pub const fn address_rank(ip: &Ipv4Addr) -> u32 {
    let octets = ip.octets();
    if ip.is_loopback() {
        return 0;
    }
    if octets[0] == 192 && octets[1] == 168 {
        return 1;
    }
    if octets[0] == 10 {
        return 2;
    }
    if octets[0] == 172 && octets[1] & 0xf0 == 16 {
        return 3;
    }
    10
}

pub fn socket_rank(addr: &SocketAddr) -> u32 {
    match addr.ip() {
        IpAddr::V4(ip) => address_rank(&ip),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(ip) => address_rank(&ip),
            None if ip.is_loopback() => 0,
            None => 10,
        },
    }
}

/// Formats `ip:port`, the token used inside descriptors and punch bodies.
pub fn addr_to_text(addr: &SocketAddr) -> String {
    addr.to_string()
}

/// Parses an `ip:port` token. A missing or broken port is an error.
pub fn text_to_addr(text: &str) -> Result<SocketAddr> {
    let text = text.trim();
    let (ip, port) = text
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(text.to_string()))?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::InvalidAddress(text.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidAddress(text.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rank_order() {
        let loopback = Ipv4Addr::new(127, 0, 0, 1);
        let class_c = Ipv4Addr::new(192, 168, 1, 2);
        let class_a = Ipv4Addr::new(10, 1, 2, 3);
        let class_b = Ipv4Addr::new(172, 20, 0, 1);
        let public = Ipv4Addr::new(8, 8, 8, 8);
        assert!(address_rank(&loopback) < address_rank(&class_c));
        assert!(address_rank(&class_c) < address_rank(&class_a));
        assert!(address_rank(&class_a) < address_rank(&class_b));
        assert!(address_rank(&class_b) < address_rank(&public));
        assert_eq!(address_rank(&Ipv4Addr::new(172, 32, 0, 1)), 10);
    }

    #[test]
    fn parse_addr_text() {
        let addr = text_to_addr("192.168.1.10:3333").unwrap();
        assert_eq!(addr, "192.168.1.10:3333".parse().unwrap());
        assert_eq!(addr_to_text(&addr), "192.168.1.10:3333");
        assert!(text_to_addr("192.168.1.10").is_err());
        assert!(text_to_addr("nohost:12").is_err());
        assert!(text_to_addr("1.2.3.4:99999").is_err());
    }
}
