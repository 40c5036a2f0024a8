//! Name resolution for TCP endpoints.
//!
//! Thin wrapper over `getaddrinfo` that keeps the resolver error code,
//! because the caller's retry policy depends on it: some lookup failures
//! are transient and worth retrying, others are hard configuration
//! errors.

use std::ffi::{CStr, CString};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

/// A failed lookup, carrying the raw `EAI_*` code.
#[derive(Debug, Clone)]
pub struct ResolveError {
    pub code: i32,
    pub msg: String,
}

impl ResolveError {
    /// Failures that may clear up on their own; with initial-persist set
    /// these arm a deferred connect instead of failing initialization.
    pub fn transient(&self) -> bool {
        self.code == libc::EAI_AGAIN || self.code == libc::EAI_FAIL
    }

    /// Failures the connector retry loop sleeps and retries on. A name
    /// or service that does not resolve right now may appear later.
    pub fn retryable(&self) -> bool {
        self.transient() || self.code == libc::EAI_NONAME || self.code == libc::EAI_SERVICE
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for ResolveError {}

/// Resolves `(host, service)` to stream-socket candidates in resolver
/// order. `host` is `None` for a passive wildcard bind.
pub fn resolve(
    host: Option<&str>,
    service: &str,
    passive: bool,
) -> Result<Vec<SocketAddr>, ResolveError> {
    let c_host = match host {
        Some(h) => Some(CString::new(h).map_err(|_| ResolveError {
            code: libc::EAI_NONAME,
            msg: "host contains an interior NUL".to_string(),
        })?),
        None => None,
    };
    let c_service = CString::new(service).map_err(|_| ResolveError {
        code: libc::EAI_SERVICE,
        msg: "service contains an interior NUL".to_string(),
    })?;

    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    if passive {
        hints.ai_flags = libc::AI_PASSIVE;
    }

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe {
        libc::getaddrinfo(
            c_host.as_ref().map_or(ptr::null(), |h| h.as_ptr()),
            c_service.as_ptr(),
            &hints,
            &mut res,
        )
    };
    if rc != 0 {
        return Err(gai_error(rc));
    }

    let mut addrs = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        let ai = unsafe { &*cur };
        if let Some(addr) = sockaddr_to_std(ai.ai_addr, ai.ai_addrlen) {
            addrs.push(addr);
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };
    Ok(addrs)
}

fn gai_error(code: i32) -> ResolveError {
    let msg = unsafe {
        let p = libc::gai_strerror(code);
        if p.is_null() {
            format!("resolver error {}", code)
        } else {
            CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    };
    ResolveError { code, msg }
}

fn sockaddr_to_std(sa: *const libc::sockaddr, len: libc::socklen_t) -> Option<SocketAddr> {
    if sa.is_null() {
        return None;
    }
    unsafe {
        match i32::from((*sa).sa_family) {
            libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
                let v4 = &*(sa as *const libc::sockaddr_in);
                let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
                Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(v4.sin_port)))
            }
            libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
                let v6 = &*(sa as *const libc::sockaddr_in6);
                let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
                Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(v6.sin6_port)))
            }
            _ => None,
        }
    }
}

/// The default service for interfaces that do not name a port: the
/// registered `nmea-0183` TCP service when the system knows it, the
/// well-known number otherwise.
pub fn default_service() -> String {
    let name = CString::new("nmea-0183").unwrap();
    let proto = CString::new("tcp").unwrap();
    let ent = unsafe { libc::getservbyname(name.as_ptr(), proto.as_ptr()) };
    if ent.is_null() {
        "10110".to_string()
    } else {
        "nmea-0183".to_string()
    }
}
