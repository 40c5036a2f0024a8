//! The multiplexer engine.
//!
//! Owns the central inbound queue, hands out interface ids, tracks the
//! queues of output interfaces and fans every inbound sentence out to
//! them. Interface threads are spawned and registered here.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::config::{Config, ConfigError};
use crate::filter::{self, Filter};
use crate::queue::SenQueue;
use crate::tcp::{init_tcp, TcpIface, TcpInitError};

/// Low bits of an interface id, reserved to disambiguate connections
/// accepted from one listener.
pub const ID_MINOR_BITS: u32 = 16;
pub const ID_MINOR_MASK: u32 = (1 << ID_MINOR_BITS) - 1;

struct Output {
    id: u32,
    q: Arc<SenQueue>,
    filter: Option<Arc<Filter>>,
}

pub struct Engine {
    q: Arc<SenQueue>,
    outputs: Mutex<Vec<Output>>,
    next_id: AtomicU32,
    handles: Mutex<Vec<JoinHandle<()>>>,
    dist: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(qsize: usize) -> Arc<Engine> {
        ignore_sigpipe();
        Arc::new(Engine {
            q: Arc::new(SenQueue::new(qsize)),
            outputs: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
            handles: Mutex::new(Vec::new()),
            dist: Mutex::new(None),
        })
    }

    /// The central inbound queue every input interface pushes into.
    pub fn queue(&self) -> Arc<SenQueue> {
        Arc::clone(&self.q)
    }

    /// Allocates the major id for a new interface. The low
    /// [`ID_MINOR_BITS`] stay zero for accepted-connection minors.
    pub fn alloc_id(&self) -> u32 {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1) << ID_MINOR_BITS
    }

    /// Registers an output interface's queue with the fan-out loop.
    pub fn register_output(&self, id: u32, q: Arc<SenQueue>, filter: Option<Arc<Filter>>) {
        self.outputs.lock().unwrap().push(Output { id, q, filter });
    }

    /// Removes an output queue, normally on writer thread exit.
    pub fn unregister_output(&self, q: &Arc<SenQueue>) {
        self.outputs
            .lock()
            .unwrap()
            .retain(|o| !Arc::ptr_eq(&o.q, q));
    }

    pub fn output_count(&self) -> usize {
        self.outputs.lock().unwrap().len()
    }

    /// Starts the fan-out thread.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let handle = thread::spawn(move || engine.distribute());
        *self.dist.lock().unwrap() = Some(handle);
    }

    fn distribute(&self) {
        while let Some(sb) = self.q.next_senblk() {
            let outputs = self.outputs.lock().unwrap();
            for out in outputs.iter() {
                if out.id == sb.src {
                    continue; // never echo a sentence to its source
                }
                if !filter::passes(&out.filter, &sb.data) {
                    continue;
                }
                out.q.push(sb.clone());
            }
        }
        debug!("engine fan-out exiting");
    }

    /// Spawns the thread for one interface direction.
    pub fn spawn(self: &Arc<Self>, ifa: TcpIface) {
        let engine = Arc::clone(self);
        let handle = thread::spawn(move || ifa.run(&engine));
        self.handles.lock().unwrap().push(handle);
    }

    /// Closes the central queue and every output queue. Writer threads
    /// and the fan-out thread drain and exit; reader threads exit when
    /// their connections close.
    pub fn shutdown(&self) {
        self.q.close();
        for out in self.outputs.lock().unwrap().iter() {
            out.q.close();
        }
        if let Some(h) = self.dist.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    /// Builds and spawns every interface of a parsed configuration.
    pub fn launch(cfg: &Config) -> Result<Arc<Engine>, LaunchError> {
        cfg.validate()?;
        let engine = Engine::new(cfg.engine.qsize);
        engine.start();
        for ic in &cfg.interfaces {
            let ctx = ic.to_ctx(engine.alloc_id())?;
            info!("{}: initialising", ctx.name);
            let ifaces = init_tcp(&engine, ctx, &ic.option_pairs())?;
            for ifa in ifaces {
                engine.spawn(ifa);
            }
        }
        Ok(engine)
    }
}

fn ignore_sigpipe() {
    // Writes to a half-closed socket must fail with EPIPE instead of
    // killing the process.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[derive(Debug)]
pub enum LaunchError {
    Config(ConfigError),
    Tcp(TcpInitError),
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::Config(e) => write!(f, "configuration error: {}", e),
            LaunchError::Tcp(e) => write!(f, "tcp interface error: {}", e),
        }
    }
}

impl std::error::Error for LaunchError {}

impl From<ConfigError> for LaunchError {
    fn from(e: ConfigError) -> Self {
        LaunchError::Config(e)
    }
}

impl From<TcpInitError> for LaunchError {
    fn from(e: TcpInitError) -> Self {
        LaunchError::Tcp(e)
    }
}
