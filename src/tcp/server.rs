//! Server mode: bind, listen, accept, and spawn per-connection
//! interfaces.
//!
//! Each accepted connection gets a fresh interface record inheriting
//! the listener's name, filters and tag state, disambiguated by the low
//! bits of the accepted descriptor. A bidirectional listener spawns an
//! OUT/IN pair per connection sharing one socket.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

use crate::engine::{Engine, ID_MINOR_MASK};
use crate::iface::{Direction, IfaceCtx};
use crate::queue::SenQueue;

use super::sockopt::set_nodelay;
use super::{TcpIface, TcpLink};

const BACKLOG: i32 = 5;

/// State of a listening interface.
#[derive(Debug)]
pub struct ServerState {
    listener: TcpListener,
    closed: AtomicBool,
}

impl ServerState {
    pub fn new(listener: TcpListener) -> ServerState {
        ServerState {
            listener,
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Tells the accept loop to stop. An accept already in flight is
    /// not interrupted; the loop exits on its next wakeup.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Creates the listening socket for the first bindable candidate
/// address: `SO_REUSEADDR`, wildcard IPv6 sockets also accepting
/// mapped IPv4, backlog [`BACKLOG`].
pub(crate) fn bind_server(addrs: &[SocketAddr]) -> io::Result<TcpListener> {
    let mut last = io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address");
    for addr in addrs {
        match bind_one(addr) {
            Ok(l) => return Ok(l),
            Err(e) => last = e,
        }
    }
    Err(last)
}

fn bind_one(addr: &SocketAddr) -> io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let on: i32 = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        );
    }
    if let SocketAddr::V6(v6) = addr {
        if v6.ip().is_unspecified() {
            let off: i32 = 0;
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IPV6,
                    libc::IPV6_V6ONLY,
                    &off as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                error!(
                    "failed to set ipv6 mapped ipv4 addresses on socket: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }

    let (storage, len) = sockaddr_from_std(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    if unsafe { libc::listen(fd, BACKLOG) } < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

fn sockaddr_from_std(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// The accept loop. Runs on the listener's interface thread until the
/// server is closed.
pub(crate) fn run_server(ifa: &TcpIface, engine: &Arc<Engine>) {
    let st = match &ifa.link {
        TcpLink::Listener(st) => st,
        _ => return,
    };
    while !st.is_closed() {
        match st.listener.accept() {
            Err(e) => {
                error!("accept failed for connection to {}: {}", ifa.ctx.name, e);
                continue;
            }
            Ok((stream, peer)) => {
                let id = new_tcp_conn(stream, &ifa.ctx, engine);
                debug!(
                    "{}: new connection id {:x} successfully received from {}",
                    ifa.ctx.name, id, peer
                );
            }
        }
    }
    debug!("{}: server loop exiting", ifa.ctx.name);
}

/// Builds and spawns the interface(s) for one accepted connection.
/// Accepted interfaces never persist; reconnecting is the client's job.
fn new_tcp_conn(stream: TcpStream, listener: &IfaceCtx, engine: &Arc<Engine>) -> u32 {
    let fd = stream.as_raw_fd();
    let id = listener.id + (fd as u32 & ID_MINOR_MASK);
    let sock = Arc::new(stream);

    match listener.direction {
        Direction::In => {
            let mut ctx = listener.dup(Direction::In);
            ctx.id = id;
            ctx.persist = false;
            ctx.ipersist = false;
            engine.spawn(TcpIface {
                ctx,
                link: TcpLink::Plain(Arc::clone(&sock)),
                q: Some(engine.queue()),
            });
        }
        Direction::Out | Direction::Both => {
            if let Err(e) = set_nodelay(fd) {
                error!("could not disable Nagle on new tcp connection: {}", e);
            }
            let q = Arc::new(SenQueue::new(listener.qsize));
            let mut out_ctx = listener.dup(Direction::Out);
            out_ctx.id = id;
            out_ctx.persist = false;
            out_ctx.ipersist = false;
            engine.register_output(id, Arc::clone(&q), out_ctx.ofilter.clone());

            if listener.direction == Direction::Both {
                let in_ctx = out_ctx.dup(Direction::In);
                engine.spawn(TcpIface {
                    ctx: in_ctx,
                    link: TcpLink::Plain(Arc::clone(&sock)),
                    q: Some(engine.queue()),
                });
            }
            engine.spawn(TcpIface {
                ctx: out_ctx,
                link: TcpLink::Plain(sock),
                q: Some(q),
            });
        }
        Direction::None => {}
    }
    id
}
