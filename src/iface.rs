//! The generic interface record.
//!
//! Every transport direction runs on its own OS thread and carries one
//! of these records: identity, direction, persistence flags, filters and
//! tag state. Bidirectional interfaces are split into an OUT/IN pair
//! whose records are duplicates sharing filter references.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::filter::{self, Filter};
use crate::queue::SenQueue;
use crate::sentence::{checksum_ok, Senblk, Splitter};
use crate::tag::TagFlags;

/// Bytes requested per raw transport read.
pub(crate) const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    Both,
    /// No direction: the interface is shutting down.
    None,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
            Direction::Both => write!(f, "both"),
            Direction::None => write!(f, "none"),
        }
    }
}

/// Per-direction interface state. Duplicating an interface for the
/// second half of a pair clones this record; filters are shared by
/// reference.
#[derive(Debug, Clone)]
pub struct IfaceCtx {
    pub id: u32,
    pub name: String,
    pub direction: Direction,
    pub persist: bool,
    /// Initial-persist: tolerate the very first connect failing.
    pub ipersist: bool,
    pub qsize: usize,
    pub tagflags: TagFlags,
    /// Heartbeat period in seconds; 0 disables. Scheduling is the
    /// host's concern, the value is carried so accepted connections
    /// inherit it.
    pub heartbeat: u64,
    /// Verify `*hh` checksums on input.
    pub checksum: bool,
    /// Require a `$`/`!` lead-in on input.
    pub strict: bool,
    pub ifilter: Option<Arc<Filter>>,
    pub ofilter: Option<Arc<Filter>>,
}

impl IfaceCtx {
    /// Duplicates the record for a paired direction.
    pub fn dup(&self, direction: Direction) -> IfaceCtx {
        let mut ctx = self.clone();
        ctx.direction = direction;
        ctx
    }
}

/// Generic inbound driver: pulls raw chunks from the transport, frames
/// them into sentences, applies input checks and the input filter, and
/// queues what passes. Returns when the transport reports end of
/// stream.
pub(crate) fn run_read_loop<F>(ctx: &IfaceCtx, q: &SenQueue, mut read_chunk: F)
where
    F: FnMut(&mut [u8]) -> Option<usize>,
{
    let mut splitter = Splitter::new();
    let mut buf = [0u8; READ_CHUNK];
    while let Some(n) = read_chunk(&mut buf) {
        splitter.feed(&buf[..n], &mut |line| {
            if ctx.strict && !matches!(line.first(), Some(&b'$') | Some(&b'!')) {
                trace!("{}: dropping sentence without lead-in", ctx.name);
                return;
            }
            if ctx.checksum && !checksum_ok(line) {
                debug!("{}: dropping sentence with bad checksum", ctx.name);
                return;
            }
            if !filter::passes(&ctx.ifilter, line) {
                return;
            }
            q.push(Senblk::new(line.to_vec(), ctx.id));
        });
    }
    debug!("{}: read loop exiting", ctx.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn ctx(checksum: bool, strict: bool, ifilter: Option<&str>) -> IfaceCtx {
        IfaceCtx {
            id: 0x10000,
            name: "test".to_string(),
            direction: Direction::In,
            persist: false,
            ipersist: false,
            qsize: 16,
            tagflags: TagFlags::default(),
            heartbeat: 0,
            checksum,
            strict,
            ifilter: ifilter.map(|s| Arc::new(Filter::parse(s).unwrap())),
            ofilter: None,
        }
    }

    fn drive(ctx: &IfaceCtx, chunks: &[&[u8]]) -> Vec<Senblk> {
        let q = SenQueue::new(64);
        let mut feed: VecDeque<Vec<u8>> = chunks.iter().map(|c| c.to_vec()).collect();
        run_read_loop(ctx, &q, |buf| {
            let chunk = feed.pop_front()?;
            buf[..chunk.len()].copy_from_slice(&chunk);
            Some(chunk.len())
        });
        q.close();
        let mut out = Vec::new();
        while let Some(sb) = q.next_senblk() {
            out.push(sb);
        }
        out
    }

    #[test]
    fn test_frames_and_tags_source() {
        let c = ctx(false, false, None);
        let out = drive(&c, &[b"$GPGGA,1\r\n$GPRMC,2\r\n"]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].src, 0x10000);
        assert_eq!(out[0].data, b"$GPGGA,1\r\n");
    }

    #[test]
    fn test_strict_drops_bare_lines() {
        let c = ctx(false, true, None);
        let out = drive(&c, &[b"garbage\r\n$GPGGA,1\r\n"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, b"$GPGGA,1\r\n");
    }

    #[test]
    fn test_checksum_enforced() {
        let c = ctx(true, false, None);
        let out = drive(&c, &[b"$GPGGA,123519*00\r\n$GPGGA,123519\r\n"]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_input_filter_applied() {
        let c = ctx(false, false, Some("-GPRMC"));
        let out = drive(&c, &[b"$GPGGA,1\r\n$GPRMC,2\r\n"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, b"$GPGGA,1\r\n");
    }

    #[test]
    fn test_dup_shares_filters() {
        let mut c = ctx(false, false, Some("+GPGGA"));
        c.direction = Direction::Both;
        let d = c.dup(Direction::In);
        assert_eq!(d.direction, Direction::In);
        assert!(Arc::ptr_eq(
            c.ifilter.as_ref().unwrap(),
            d.ifilter.as_ref().unwrap()
        ));
    }
}
