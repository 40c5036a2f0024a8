//! TCP transport.
//!
//! Client and server interfaces over plain TCP. Clients optionally run
//! in persist mode, transparently reconnecting on any failure; a
//! bidirectional persist client shares one connection and one shared
//! block between its reader and writer threads.

pub mod preamble;
pub mod resolve;
pub mod sockopt;

mod client;
mod server;
mod shared;

use std::fmt;
use std::io::{self, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use tracing::{debug, error};

use crate::engine::Engine;
use crate::iface::{self, Direction, IfaceCtx};
use crate::queue::SenQueue;

use preamble::{Preamble, PreambleError};
use resolve::{default_service, resolve, ResolveError};
use sockopt::{
    establish_keepalive, set_nodelay, Tuning, DEF_KEEPCNT, DEF_KEEPIDLE, DEF_KEEPINTVL,
    DEF_SNDBUF, DEF_SNDTIMEO,
};

pub use server::ServerState;
pub use shared::{FailOutcome, TcpShared};

/// Default seconds between reconnect attempts.
const DEF_RETRY: u64 = 5;
/// gpsd's listening port.
const GPSD_PORT: &str = "2947";
/// The WATCH command enabling NMEA output from gpsd.
const GPSD_WATCH: &str = "?WATCH={\"enable\":true,\"nmea\":true}";

/// The transport attachment of one interface direction.
#[derive(Debug, Clone)]
pub enum TcpLink {
    /// A plain connection; a bidirectional pair shares the socket.
    Plain(Arc<TcpStream>),
    /// A persist-mode connection, owned by the shared block.
    Persist(Arc<TcpShared>),
    /// Persist mode armed before the first successful connect.
    Deferred(Arc<TcpShared>),
    /// A listening server socket.
    Listener(Arc<ServerState>),
}

/// One TCP interface direction, ready to run on its own thread.
#[derive(Debug)]
pub struct TcpIface {
    pub ctx: IfaceCtx,
    pub link: TcpLink,
    /// Outbound queue for OUT directions, the engine queue for IN.
    pub q: Option<Arc<SenQueue>>,
}

impl TcpIface {
    /// Thread entry for this interface direction.
    pub(crate) fn run(mut self, engine: &Arc<Engine>) {
        let deferred = match &self.link {
            TcpLink::Deferred(sh) => Some(Arc::clone(sh)),
            _ => None,
        };
        if let Some(sh) = deferred {
            if !client::delayed_connect(&self.ctx.name, &sh) {
                error!(
                    "{}: failed to open tcp connection to {} port {}",
                    self.ctx.name, sh.host, sh.port
                );
                return;
            }
            self.link = TcpLink::Persist(sh);
        }
        match (&self.link, self.ctx.direction) {
            (TcpLink::Listener(_), _) => server::run_server(&self, engine),
            (_, Direction::In) => {
                let q = match &self.q {
                    Some(q) => Arc::clone(q),
                    None => return,
                };
                iface::run_read_loop(&self.ctx, &q, |buf| {
                    client::read_tcp(&self.ctx.name, &self.link, buf)
                });
            }
            (_, Direction::Out) => {
                let q = match &self.q {
                    Some(q) => Arc::clone(q),
                    None => return,
                };
                client::write_loop(&self.ctx, &self.link, &q);
                engine.unregister_output(&q);
                q.close();
            }
            _ => {}
        }
    }
}

/// Initialization errors: bad options, failed lookups, failed initial
/// connects and binds.
#[derive(Debug)]
pub enum TcpInitError {
    Option(String),
    Resolve(ResolveError),
    Connect {
        host: String,
        port: String,
        err: io::Error,
    },
    Bind {
        port: String,
        err: io::Error,
    },
}

impl fmt::Display for TcpInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpInitError::Option(msg) => write!(f, "{}", msg),
            TcpInitError::Resolve(e) => write!(f, "lookup failed: {}", e),
            TcpInitError::Connect { host, port, err } => {
                write!(f, "failed to open tcp connection for {}/{}: {}", host, port, err)
            }
            TcpInitError::Bind { port, err } => {
                write!(f, "failed to open tcp server for port {}: {}", port, err)
            }
        }
    }
}

impl std::error::Error for TcpInitError {}

impl From<ResolveError> for TcpInitError {
    fn from(e: ResolveError) -> Self {
        TcpInitError::Resolve(e)
    }
}

impl From<PreambleError> for TcpInitError {
    fn from(e: PreambleError) -> Self {
        TcpInitError::Option(format!("could not parse preamble: {}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Client,
    Server,
}

/// Options recognized by the TCP initializer, after validation.
#[derive(Debug)]
pub(crate) struct TcpOptions {
    pub mode: Mode,
    pub host: Option<String>,
    pub port: Option<String>,
    pub retry: u64,
    pub keepalive: Option<bool>,
    pub keepidle: u32,
    pub keepintvl: u32,
    pub keepcnt: u32,
    /// Send timeout seconds; -1 while unset.
    pub timeout: i64,
    pub sndbuf: i32,
    pub nodelay: bool,
    pub gpsd: bool,
    pub preamble: Option<Preamble>,
}

fn yesno(key: &str, val: &str) -> Result<bool, TcpInitError> {
    if val.eq_ignore_ascii_case("yes") {
        Ok(true)
    } else if val.eq_ignore_ascii_case("no") {
        Ok(false)
    } else {
        Err(TcpInitError::Option(format!(
            "{} must be \"yes\" or \"no\"",
            key
        )))
    }
}

fn positive<T: std::str::FromStr + PartialOrd + From<u8>>(
    key: &str,
    val: &str,
) -> Result<T, TcpInitError> {
    match val.parse::<T>() {
        Ok(n) if n > T::from(0u8) => Ok(n),
        _ => Err(TcpInitError::Option(format!(
            "invalid {} value specified: {}",
            key, val
        ))),
    }
}

/// Parses and validates the `(key, value)` option pairs for one TCP
/// interface. Keys are case-insensitive.
pub(crate) fn parse_options(
    ctx: &IfaceCtx,
    opts: &[(String, String)],
) -> Result<TcpOptions, TcpInitError> {
    let mut o = TcpOptions {
        mode: Mode::Client,
        host: None,
        port: None,
        retry: DEF_RETRY,
        keepalive: None,
        keepidle: 0,
        keepintvl: 0,
        keepcnt: 0,
        timeout: -1,
        sndbuf: DEF_SNDBUF,
        nodelay: true,
        gpsd: false,
        preamble: None,
    };

    let need_persist = |key: &str| -> Result<(), TcpInitError> {
        if ctx.persist {
            Ok(())
        } else {
            Err(TcpInitError::Option(format!(
                "{} only valid with persist option",
                key
            )))
        }
    };
    let outbound_only = |key: &str| -> Result<(), TcpInitError> {
        if ctx.direction == Direction::In {
            Err(TcpInitError::Option(format!(
                "{} option is for sending tcp data only (not receiving)",
                key
            )))
        } else {
            Ok(())
        }
    };

    for (var, val) in opts {
        if var.eq_ignore_ascii_case("address") {
            o.host = Some(val.clone());
        } else if var.eq_ignore_ascii_case("mode") {
            if val.eq_ignore_ascii_case("client") {
                o.mode = Mode::Client;
            } else if val.eq_ignore_ascii_case("server") {
                o.mode = Mode::Server;
            } else {
                return Err(TcpInitError::Option(format!(
                    "unknown tcp mode {} (must be 'client' or 'server')",
                    val
                )));
            }
        } else if var.eq_ignore_ascii_case("port") {
            o.port = Some(val.clone());
        } else if var.eq_ignore_ascii_case("retry") {
            need_persist("retry")?;
            o.retry = positive::<u64>("retry", val)?;
        } else if var.eq_ignore_ascii_case("keepalive") {
            need_persist("keepalive")?;
            o.keepalive = Some(yesno("keepalive", val)?);
        } else if var.eq_ignore_ascii_case("keepidle") {
            o.keepidle = positive::<u32>("keepidle", val)?;
        } else if var.eq_ignore_ascii_case("keepintvl") {
            o.keepintvl = positive::<u32>("keepintvl", val)?;
        } else if var.eq_ignore_ascii_case("keepcnt") {
            o.keepcnt = positive::<u32>("keepcnt", val)?;
        } else if var.eq_ignore_ascii_case("timeout") {
            need_persist("timeout")?;
            outbound_only("timeout")?;
            o.timeout = positive::<i64>("timeout", val)?;
        } else if var.eq_ignore_ascii_case("sndbuf") {
            need_persist("sndbuf")?;
            outbound_only("sndbuf")?;
            o.sndbuf = positive::<i32>("sndbuf", val)?;
        } else if var.eq_ignore_ascii_case("gpsd") {
            o.gpsd = yesno("gpsd", val)?;
        } else if var.eq_ignore_ascii_case("preamble") {
            if o.preamble.is_some() {
                return Err(TcpInitError::Option(
                    "can only specify preamble once".to_string(),
                ));
            }
            o.preamble = Some(Preamble::parse(val)?);
        } else if var.eq_ignore_ascii_case("nodelay") {
            o.nodelay = yesno("nodelay", val)?;
        } else {
            return Err(TcpInitError::Option(format!(
                "unknown interface option {}",
                var
            )));
        }
    }

    if ctx.ipersist && !ctx.persist {
        return Err(TcpInitError::Option(
            "initial-persist requires the persist option".to_string(),
        ));
    }

    if ctx.persist {
        if o.keepalive.is_none() {
            o.keepalive = Some(true);
            if o.keepidle == 0 {
                o.keepidle = DEF_KEEPIDLE;
            }
            if o.keepintvl == 0 {
                o.keepintvl = DEF_KEEPINTVL;
            }
            if o.keepcnt == 0 {
                o.keepcnt = DEF_KEEPCNT;
            }
        }
        if o.timeout == -1 {
            o.timeout = DEF_SNDTIMEO;
        }
    }

    match o.mode {
        Mode::Client => {
            if o.host.is_none() {
                return Err(TcpInitError::Option(
                    "must specify address for tcp client mode".to_string(),
                ));
            }
            if o.gpsd {
                if o.preamble.is_some() {
                    return Err(TcpInitError::Option(
                        "can't specify preamble with gpsd".to_string(),
                    ));
                }
                if o.port.is_none() {
                    o.port = Some(GPSD_PORT.to_string());
                }
                o.preamble = Some(Preamble::parse(GPSD_WATCH)?);
            }
        }
        Mode::Server => {
            if ctx.persist {
                return Err(TcpInitError::Option(
                    "persist option not valid for tcp servers".to_string(),
                ));
            }
            if o.preamble.is_some() {
                return Err(TcpInitError::Option(
                    "preamble option not valid for servers".to_string(),
                ));
            }
            if o.gpsd {
                return Err(TcpInitError::Option(
                    "gpsd not valid for servers".to_string(),
                ));
            }
        }
    }

    Ok(o)
}

/// Builds the interface(s) for one configured TCP endpoint: a single
/// listener for servers, one interface for unidirectional clients, or
/// an OUT/IN pair for bidirectional ones.
pub fn init_tcp(
    engine: &Arc<Engine>,
    ctx: IfaceCtx,
    opts: &[(String, String)],
) -> Result<Vec<TcpIface>, TcpInitError> {
    let o = parse_options(&ctx, opts)?;
    match o.mode {
        Mode::Client => init_client(engine, ctx, o),
        Mode::Server => init_server(ctx, o),
    }
}

fn init_client(
    engine: &Arc<Engine>,
    ctx: IfaceCtx,
    o: TcpOptions,
) -> Result<Vec<TcpIface>, TcpInitError> {
    let host = o.host.clone().unwrap_or_default();
    let port = o.port.clone().unwrap_or_else(default_service);

    let addrs = match resolve(Some(&host), &port, false) {
        Ok(a) => a,
        Err(e) if ctx.ipersist && e.transient() => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut connected = None;
    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address");
    for addr in &addrs {
        match TcpStream::connect(addr) {
            Ok(s) => {
                connected = Some(s);
                break;
            }
            Err(e) => last_err = e,
        }
    }
    if connected.is_none() {
        if !ctx.ipersist {
            return Err(TcpInitError::Connect {
                host,
                port,
                err: last_err,
            });
        }
        debug!(
            "{}: initial connection to {} port {} failed",
            ctx.name, host, port
        );
    }

    let tuning = Tuning {
        keepalive: o.keepalive.unwrap_or(false),
        keepidle: o.keepidle,
        keepintvl: o.keepintvl,
        keepcnt: o.keepcnt,
        snd_timeout: o.timeout.max(0),
        sndbuf: o.sndbuf,
        nodelay: o.nodelay,
    };

    if let Some(stream) = &connected {
        let fd = stream.as_raw_fd();
        if ctx.persist {
            let _ = establish_keepalive(fd, &tuning);
        }
        if ctx.direction != Direction::In && o.nodelay {
            if let Err(e) = set_nodelay(fd) {
                error!("could not disable Nagle algorithm for tcp socket: {}", e);
            }
        }
    }

    // The preamble goes out before any payload on the initial
    // connection too; a failed write counts as a failed connect.
    if let Some(p) = &o.preamble {
        if let Some(stream) = connected.take() {
            match (&stream).write_all(p.as_bytes()) {
                Ok(()) => connected = Some(stream),
                Err(err) if !ctx.ipersist => {
                    return Err(TcpInitError::Connect { host, port, err })
                }
                Err(err) => {
                    debug!("{}: initial preamble write failed: {}", ctx.name, err);
                }
            }
        }
    }

    let out_q = if ctx.direction != Direction::In {
        let q = Arc::new(SenQueue::new(ctx.qsize));
        engine.register_output(ctx.id, Arc::clone(&q), ctx.ofilter.clone());
        Some(q)
    } else {
        None
    };

    let link = if ctx.persist {
        let have_conn = connected.is_some();
        let sh = TcpShared::new(host, port, o.preamble, o.retry, tuning, connected);
        if have_conn {
            TcpLink::Persist(sh)
        } else {
            TcpLink::Deferred(sh)
        }
    } else {
        match connected {
            Some(s) => TcpLink::Plain(Arc::new(s)),
            // Unreachable in practice: a failed connect without
            // initial-persist errored out above, and initial-persist
            // implies persist.
            None => {
                return Err(TcpInitError::Connect {
                    host,
                    port,
                    err: last_err,
                })
            }
        }
    };

    debug!("{}: initialised", ctx.name);

    match ctx.direction {
        Direction::Both => {
            let in_ctx = ctx.dup(Direction::In);
            let out_ctx = ctx.dup(Direction::Out);
            Ok(vec![
                TcpIface {
                    ctx: out_ctx,
                    link: link.clone(),
                    q: out_q,
                },
                TcpIface {
                    ctx: in_ctx,
                    link,
                    q: Some(engine.queue()),
                },
            ])
        }
        Direction::Out => Ok(vec![TcpIface {
            ctx,
            link,
            q: out_q,
        }]),
        _ => Ok(vec![TcpIface {
            ctx,
            link,
            q: Some(engine.queue()),
        }]),
    }
}

fn init_server(ctx: IfaceCtx, o: TcpOptions) -> Result<Vec<TcpIface>, TcpInitError> {
    let port = o.port.clone().unwrap_or_else(default_service);
    let addrs = resolve(o.host.as_deref(), &port, true)?;
    let listener = server::bind_server(&addrs).map_err(|err| TcpInitError::Bind {
        port: port.clone(),
        err,
    })?;
    debug!("{}: initialised", ctx.name);
    Ok(vec![TcpIface {
        ctx,
        link: TcpLink::Listener(Arc::new(ServerState::new(listener))),
        q: None,
    }])
}
