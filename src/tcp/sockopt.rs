//! TCP socket tuning.
//!
//! Keepalive probing, send timeout/buffer sizing and Nagle control,
//! applied after every successful connect. Individual option failures
//! are logged and do not fail the connection.

use std::io;
use std::os::unix::io::RawFd;

use tracing::error;

pub const DEF_KEEPIDLE: u32 = 30;
pub const DEF_KEEPINTVL: u32 = 10;
pub const DEF_KEEPCNT: u32 = 3;
pub const DEF_SNDTIMEO: i64 = 30;
pub const DEF_SNDBUF: i32 = 8192;

#[cfg(target_os = "macos")]
const KEEPIDLE_OPT: libc::c_int = libc::TCP_KEEPALIVE;
#[cfg(not(target_os = "macos"))]
const KEEPIDLE_OPT: libc::c_int = libc::TCP_KEEPIDLE;

/// Socket tuning carried by a persist interface for every reconnect.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub keepalive: bool,
    pub keepidle: u32,
    pub keepintvl: u32,
    pub keepcnt: u32,
    /// Send timeout in seconds; 0 leaves the socket unbounded.
    pub snd_timeout: i64,
    pub sndbuf: i32,
    pub nodelay: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            keepalive: false,
            keepidle: 0,
            keepintvl: 0,
            keepcnt: 0,
            snd_timeout: 0,
            sndbuf: DEF_SNDBUF,
            nodelay: true,
        }
    }
}

fn setsockopt_int(fd: RawFd, level: i32, optname: i32, value: i32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn setsockopt_timeval(fd: RawFd, level: i32, optname: i32, secs: i64) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: secs as libc::time_t,
        tv_usec: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Disables the Nagle algorithm.
pub fn set_nodelay(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

/// Applies keepalive and send tuning to a connected socket.
///
/// Enabling `SO_KEEPALIVE` itself must succeed; the finer-grained knobs
/// are best-effort. Returns the last failure, which callers are free to
/// ignore.
pub fn establish_keepalive(fd: RawFd, t: &Tuning) -> io::Result<()> {
    let mut err = None;

    if t.keepalive {
        if let Err(e) = setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1) {
            error!("could not enable keepalives on tcp socket: {}", e);
            return Err(e);
        }
        if t.keepidle != 0 {
            if let Err(e) = setsockopt_int(fd, libc::IPPROTO_TCP, KEEPIDLE_OPT, t.keepidle as i32)
            {
                error!("could not set tcp keepidle: {}", e);
                err = Some(e);
            }
        }
        if t.keepintvl != 0 {
            if let Err(e) = setsockopt_int(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPINTVL,
                t.keepintvl as i32,
            ) {
                error!("could not set tcp keepintvl: {}", e);
                err = Some(e);
            }
        }
        if t.keepcnt != 0 {
            if let Err(e) =
                setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, t.keepcnt as i32)
            {
                error!("could not set tcp keepcnt: {}", e);
                err = Some(e);
            }
        }
    }

    if t.snd_timeout > 0 {
        if let Err(e) = setsockopt_timeval(fd, libc::SOL_SOCKET, libc::SO_SNDTIMEO, t.snd_timeout)
        {
            error!("could not set tcp send timeout: {}", e);
            err = Some(e);
        }
        if let Err(e) = setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, t.sndbuf) {
            error!("could not set tcp send buffer size: {}", e);
            err = Some(e);
        }
    }

    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
