//! Shared connection state for persist-mode interfaces.
//!
//! A bidirectional persist client runs two threads, one reader and one
//! writer, over a single TCP connection. When the peer dies both
//! threads observe the failure independently; the coordinator here
//! makes sure exactly one of them repairs the connection while the
//! other is held off, and that neither issues I/O on a dead socket.
//!
//! The socket lives in a slot inside the coordinator state. `None` is
//! the dead state: a thread that finds the slot empty exits. A repair
//! publishes the fresh socket by replacing the slot while the other
//! thread waits on the condition variable.

use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use super::preamble::Preamble;
use super::sockopt::Tuning;

/// Outcome of the failure path for the thread that reported the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// This thread performed the repair; the slot holds a fresh socket.
    Repaired,
    /// The paired thread performed the repair while this one waited.
    PeerRepaired,
    /// The repair failed; the slot is dead and both threads should exit.
    GaveUp,
}

#[derive(Debug)]
struct Coord {
    sock: Option<Arc<TcpStream>>,
    /// Threads currently inside the I/O critical region (0, 1 or 2).
    critical: u8,
    /// Set while one thread owns an in-progress repair.
    fixing: bool,
    /// Set while the non-repairing thread is parked in the failure path.
    parked: bool,
}

/// State shared by the two halves of a persist interface pair: the
/// coordinator plus everything needed to re-establish the connection.
/// Freed when the last half drops its reference.
#[derive(Debug)]
pub struct TcpShared {
    pub host: String,
    pub port: String,
    pub preamble: Option<Preamble>,
    /// Seconds between reconnect attempts.
    pub retry: u64,
    pub tuning: Tuning,
    coord: Mutex<Coord>,
    fv: Condvar,
}

impl TcpShared {
    pub fn new(
        host: String,
        port: String,
        preamble: Option<Preamble>,
        retry: u64,
        tuning: Tuning,
        initial: Option<TcpStream>,
    ) -> Arc<Self> {
        Arc::new(TcpShared {
            host,
            port,
            preamble,
            retry,
            tuning,
            coord: Mutex::new(Coord {
                sock: initial.map(Arc::new),
                critical: 0,
                fixing: false,
                parked: false,
            }),
            fv: Condvar::new(),
        })
    }

    /// Enters the I/O critical region. Returns the current socket, or
    /// `None` when the connection is dead and the thread should exit.
    /// Blocks while a repair is in progress.
    pub fn enter_io(&self) -> Option<Arc<TcpStream>> {
        let mut st = self.coord.lock().unwrap();
        match st.sock.as_ref() {
            None => None,
            Some(s) => {
                let s = Arc::clone(s);
                st.critical += 1;
                Some(s)
            }
        }
    }

    /// Leaves the critical region after successful I/O, waking a paired
    /// repairer that is waiting for this thread to get out of the way.
    pub fn leave_io_ok(&self) {
        let mut st = self.coord.lock().unwrap();
        st.critical -= 1;
        if st.fixing {
            self.fv.notify_all();
        }
    }

    /// Leaves the critical region after failed I/O and serializes the
    /// repair with the paired thread.
    ///
    /// If the pair is already repairing, this thread announces its
    /// arrival and parks until the repair completes. Otherwise this
    /// thread owns the repair: if the peer is still mid-I/O on the same
    /// socket it is forced out with `shutdown` first, then `repair` runs
    /// with the coordinator locked. `repair` receives the slot and must
    /// leave a fresh socket in it on success; on failure the slot is
    /// cleared so both halves exit.
    pub fn leave_io_fail<F>(&self, repair: F) -> FailOutcome
    where
        F: FnOnce(&mut Option<Arc<TcpStream>>) -> bool,
    {
        let mut st = self.coord.lock().unwrap();
        if st.fixing {
            // The pair is repairing and waiting for us to arrive.
            st.parked = true;
            self.fv.notify_all();
            while st.fixing {
                st = self.fv.wait(st).unwrap();
            }
            st.parked = false;
            st.critical -= 1;
            return FailOutcome::PeerRepaired;
        }

        if st.critical == 2 {
            // The pair is blocked in read/writev on this socket; force
            // its syscall to return so it parks and we can repair.
            st.fixing = true;
            if let Some(s) = st.sock.as_ref() {
                let _ = s.shutdown(Shutdown::Both);
            }
            while !st.parked && st.critical == 2 {
                st = self.fv.wait(st).unwrap();
            }
        }

        let ok = repair(&mut st.sock);
        if !ok {
            st.sock = None;
            debug!("marking shared tcp connection dead");
        }
        if st.fixing {
            st.fixing = false;
            self.fv.notify_all();
        }
        st.critical -= 1;
        if ok {
            FailOutcome::Repaired
        } else {
            FailOutcome::GaveUp
        }
    }

    /// Runs `f` on the socket slot with the coordinator locked. Used by
    /// the deferred-connect entry and by tests.
    pub fn with_slot<R>(&self, f: impl FnOnce(&mut Option<Arc<TcpStream>>) -> R) -> R {
        let mut st = self.coord.lock().unwrap();
        f(&mut st.sock)
    }

    /// Snapshot of the current socket, if any.
    pub fn current(&self) -> Option<Arc<TcpStream>> {
        self.coord.lock().unwrap().sock.clone()
    }
}
