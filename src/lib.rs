//! senmux - NMEA 0183 sentence multiplexer, TCP transport core.
//!
//! This crate moves line-oriented sentence records between TCP
//! endpoints:
//! - `tcp`: client and server interfaces, with persist-mode reconnection
//!   coordinated between the reader and writer of a shared connection
//! - `engine`: the central queue and fan-out between interfaces
//! - `sentence`/`queue`/`filter`/`tag`: sentence framing, buffering,
//!   filtering and TAG block output
//! - `config`: YAML configuration
//!
//! # Example
//!
//! ```rust,ignore
//! let cfg = senmux::config::load("senmux.yaml")?;
//! let engine = senmux::Engine::launch(&cfg)?;
//! ```

pub mod config;
pub mod engine;
pub mod filter;
pub mod iface;
pub mod queue;
pub mod sentence;
pub mod tag;
pub mod tcp;

// Re-export commonly used types at crate root for convenience
pub use config::{load, load_from_bytes, Config, ConfigError, EngineConfig, IfaceConfig};
pub use engine::{Engine, LaunchError, ID_MINOR_BITS, ID_MINOR_MASK};
pub use filter::{addfilter, Filter, FilterError};
pub use iface::{Direction, IfaceCtx};
pub use queue::SenQueue;
pub use sentence::{checksum, checksum_ok, Senblk, Splitter, MAX_SENTENCE};
pub use tag::{gettag, TagFlags, TAG_MAX};
pub use tcp::{
    init_tcp, preamble::Preamble, preamble::PreambleError, preamble::MAX_PREAMBLE,
    resolve::resolve, resolve::ResolveError, sockopt::Tuning, FailOutcome, ServerState,
    TcpIface, TcpInitError, TcpLink, TcpShared,
};
