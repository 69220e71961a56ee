use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::raw::c_int;

use nix::sys::socket::AddressFamily;

/// Socket domain constants
const AF_INET: c_int = libc::AF_INET;
const AF_INET6: c_int = libc::AF_INET6;

/// Target-visible outcome of an intercepted syscall: a success value or the
/// positive errno that becomes the target's syscall return.
pub type SysOutcome<T> = std::result::Result<T, i32>;

/// Outcome for syscalls whose success value is a plain integer.
pub type SysRet = SysOutcome<i64>;

/// Address domain of a shadowed socket. Only the two inet families are
/// shadowed; everything else is passed through to the kernel untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    V4,
    V6,
}

impl Domain {
    pub fn from_raw(family: c_int) -> Option<Domain> {
        match family {
            AF_INET => Some(Domain::V4),
            AF_INET6 => Some(Domain::V6),
            _ => None,
        }
    }

    pub fn family(self) -> AddressFamily {
        match self {
            Domain::V4 => AddressFamily::Inet,
            Domain::V6 => AddressFamily::Inet6,
        }
    }

    pub fn loopback_ip(self) -> IpAddr {
        match self {
            Domain::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Domain::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    pub fn unspecified_ip(self) -> IpAddr {
        match self {
            Domain::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Domain::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// The address getsockname reports for a never-bound socket.
    pub fn unspecified(self) -> SocketAddr {
        SocketAddr::new(self.unspecified_ip(), 0)
    }

    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Domain::V4 => addr.is_ipv4(),
            Domain::V6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::V4 => write!(f, "inet"),
            Domain::V6 => write!(f, "inet6"),
        }
    }
}

/// Fold a v4-mapped-v6 address back into its plain v4 form. Loopback dials
/// on a dual-stack host come back as ::ffff:127.0.0.1 and would otherwise
/// never match the v4 keys used by the accept rendezvous.
pub fn normalize(addr: SocketAddr) -> SocketAddr {
    if let SocketAddr::V6(v6) = addr {
        if let Some(v4) = v6.ip().to_ipv4_mapped() {
            return SocketAddr::new(IpAddr::V4(v4), addr.port());
        }
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_from_raw() {
        assert_eq!(Domain::from_raw(libc::AF_INET), Some(Domain::V4));
        assert_eq!(Domain::from_raw(libc::AF_INET6), Some(Domain::V6));
        assert_eq!(Domain::from_raw(libc::AF_UNIX), None);
        assert_eq!(Domain::from_raw(libc::AF_NETLINK), None);
    }

    #[test]
    fn test_domain_matches() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(Domain::V4.matches(&v4));
        assert!(!Domain::V4.matches(&v6));
        assert!(Domain::V6.matches(&v6));
    }

    #[test]
    fn test_normalize_mapped() {
        let mapped: SocketAddr = "[::ffff:10.1.2.3]:443".parse().unwrap();
        assert_eq!(normalize(mapped), "10.1.2.3:443".parse().unwrap());

        let plain: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(normalize(plain), plain);

        let v4: SocketAddr = "10.1.2.3:443".parse().unwrap();
        assert_eq!(normalize(v4), v4);
    }
}
