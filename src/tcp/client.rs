//! Client-side connection establishment and the persist read/write
//! paths.
//!
//! The connector loops until a connection is up, retrying transient
//! resolver failures and refused connects. The read and write loops
//! wrap their blocking syscalls in the shared coordinator when the
//! interface is in persist mode, so a dead peer is repaired exactly
//! once however both halves of a pair observe the failure.

use std::io::{self, IoSlice, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::iface::IfaceCtx;
use crate::queue::SenQueue;
use crate::tag::gettag;

use super::resolve::resolve;
use super::shared::{FailOutcome, TcpShared};
use super::sockopt::{establish_keepalive, set_nodelay};
use super::TcpLink;

pub(crate) fn mysleep(secs: u64) {
    thread::sleep(Duration::from_secs(secs));
}

/// Whether a failed write warrants sleeping before the reconnect
/// attempt. A send-timeout expiry means the peer already stalled for
/// the full timeout; reconnect immediately.
pub(crate) fn should_delay_reconnect(kind: io::ErrorKind) -> bool {
    kind != io::ErrorKind::WouldBlock
}

/// Establishes one client connection, looping until it succeeds.
///
/// Retries resolver failures that may clear up and connects that are
/// refused, sleeping the shared retry interval between rounds. On
/// success the socket is tuned, the preamble (if any) is written, and
/// the fresh socket is installed in `slot` where both halves of a pair
/// see it. Returns `false` only on a hard resolver error.
pub(crate) fn do_connect(
    name: &str,
    sh: &TcpShared,
    slot: &mut Option<Arc<TcpStream>>,
) -> bool {
    loop {
        let addrs = match resolve(Some(&sh.host), &sh.port, false) {
            Ok(a) => a,
            Err(e) => {
                warn!(
                    "lookup failed for host {}/service {}: {}",
                    sh.host, sh.port, e
                );
                if !e.retryable() {
                    return false;
                }
                mysleep(sh.retry);
                continue;
            }
        };

        let mut connected = None;
        for addr in &addrs {
            match TcpStream::connect(addr) {
                Ok(s) => {
                    connected = Some(s);
                    break;
                }
                Err(e) => debug!("{}: connect to {} failed: {}", name, addr, e),
            }
        }
        let stream = match connected {
            Some(s) => s,
            None => {
                debug!("{}: connect failed (sleeping)", name);
                mysleep(sh.retry);
                continue;
            }
        };

        let fd = stream.as_raw_fd();
        if sh.tuning.nodelay {
            if let Err(e) = set_nodelay(fd) {
                error!("could not disable Nagle algorithm for tcp socket: {}", e);
            }
        }
        let _ = establish_keepalive(fd, &sh.tuning);

        if let Some(p) = &sh.preamble {
            if let Err(e) = (&stream).write_all(p.as_bytes()) {
                warn!("{}: preamble write failed: {}", name, e);
                drop(stream);
                mysleep(sh.retry);
                continue;
            }
        }

        *slot = Some(Arc::new(stream));
        debug!("{}: connected", name);
        return true;
    }
}

/// Deferred-connect entry: performs the initial connect under the
/// shared lock before the real loop starts. On a bidirectional pair
/// only the first thread in connects; the second finds the slot filled.
pub(crate) fn delayed_connect(name: &str, sh: &TcpShared) -> bool {
    sh.with_slot(|slot| {
        if slot.is_some() {
            true
        } else {
            do_connect(name, sh, slot)
        }
    })
}

/// One raw transport read. Returns the chunk length, or `None` when the
/// interface should exit. In persist mode EOF and errors are repaired
/// through the coordinator and the call blocks until data arrives on
/// whatever connection is current.
pub(crate) fn read_tcp(name: &str, link: &TcpLink, buf: &mut [u8]) -> Option<usize> {
    match link {
        TcpLink::Plain(sock) => match (&**sock).read(buf) {
            Ok(0) => {
                debug!("{}: EOF", name);
                None
            }
            Ok(n) => Some(n),
            Err(e) => {
                debug!("{}: read failed: {}", name, e);
                None
            }
        },
        TcpLink::Persist(sh) => persist_read(name, sh, buf),
        _ => None,
    }
}

fn persist_read(name: &str, sh: &TcpShared, buf: &mut [u8]) -> Option<usize> {
    loop {
        let sock = sh.enter_io()?;
        match (&*sock).read(buf) {
            Ok(n) if n > 0 => {
                sh.leave_io_ok();
                return Some(n);
            }
            res => {
                match &res {
                    Ok(_) => debug!("{}: EOF", name),
                    Err(e) => debug!("{}: read failed: {}", name, e),
                }
                let mut salvaged = 0usize;
                let outcome =
                    sh.leave_io_fail(|slot| reread(name, sh, slot, buf, &mut salvaged));
                if salvaged > 0 {
                    return Some(salvaged);
                }
                if outcome == FailOutcome::GaveUp {
                    error!("{}: failed to reconnect tcp connection", name);
                }
                // Loop: enter_io decides whether to read again or exit.
            }
        }
    }
}

/// Read-side repair, run with the coordinator locked. Probes the old
/// socket without blocking first, so the lock is not held across a
/// blocking read; only a definite EOF or error triggers the connector.
fn reread(
    name: &str,
    sh: &TcpShared,
    slot: &mut Option<Arc<TcpStream>>,
    buf: &mut [u8],
    salvaged: &mut usize,
) -> bool {
    debug!("{}: reconnecting (read) interface", name);
    let sock = match slot.as_ref() {
        Some(s) => Arc::clone(s),
        None => return false,
    };
    if let Err(e) = sock.set_nonblocking(true) {
        error!("failed to make tcp socket non-blocking: {}", e);
        return false;
    }
    match (&*sock).read(buf) {
        Ok(n) if n > 0 => {
            if let Err(e) = sock.set_nonblocking(false) {
                error!("failed to make tcp socket blocking: {}", e);
                return false;
            }
            *salvaged = n;
            true
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            if let Err(e) = sock.set_nonblocking(false) {
                error!("failed to make tcp socket blocking: {}", e);
                return false;
            }
            true
        }
        _ => do_connect(name, sh, slot),
    }
}

fn writev_senblk(sock: &TcpStream, tag: Option<&[u8]>, data: &[u8]) -> io::Result<()> {
    let mut s: &TcpStream = sock;
    match tag {
        // Tag and payload go out in one writev; a short write is not
        // retried.
        Some(t) => s.write_vectored(&[IoSlice::new(t), IoSlice::new(data)])?,
        None => s.write(data)?,
    };
    Ok(())
}

/// Outbound loop: dequeue, render the optional TAG block, write.
/// Returns when the queue closes, on a non-persist write failure, or
/// when a persist repair gives up. A record being written when the
/// connection dies is considered delivered to the lost connection and
/// is not re-sent.
pub(crate) fn write_loop(ctx: &IfaceCtx, link: &TcpLink, q: &SenQueue) {
    let mut tags = ctx.tagflags.any();
    while let Some(sb) = q.next_senblk() {
        let tag = if tags {
            match gettag(&ctx.name, &ctx.tagflags) {
                Some(t) => Some(t),
                None => {
                    error!(
                        "disabling tag output on interface id {:x} ({})",
                        ctx.id, ctx.name
                    );
                    tags = false;
                    None
                }
            }
        } else {
            None
        };

        match link {
            TcpLink::Plain(sock) => {
                if let Err(e) = writev_senblk(sock, tag.as_deref(), &sb.data) {
                    debug!("{} id {:x}: write failed: {}", ctx.name, ctx.id, e);
                    break;
                }
            }
            TcpLink::Persist(sh) => {
                let sock = match sh.enter_io() {
                    Some(s) => s,
                    None => break,
                };
                match writev_senblk(&sock, tag.as_deref(), &sb.data) {
                    Ok(()) => sh.leave_io_ok(),
                    Err(e) => {
                        debug!("{} id {:x}: write failed: {}", ctx.name, ctx.id, e);
                        let outcome = sh.leave_io_fail(|slot| {
                            debug!("{}: reconnecting (write) interface", ctx.name);
                            if should_delay_reconnect(e.kind()) {
                                mysleep(sh.retry);
                            }
                            if do_connect(&ctx.name, sh, slot) {
                                debug!("flushing queue interface {}", ctx.name);
                                q.flush();
                                true
                            } else {
                                false
                            }
                        });
                        if outcome == FailOutcome::GaveUp {
                            error!("{}: failed to reconnect tcp connection", ctx.name);
                            break;
                        }
                    }
                }
            }
            _ => break,
        }
    }
    debug!("{}: write loop exiting", ctx.name);
}
