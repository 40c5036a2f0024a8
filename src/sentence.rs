//! Sentence records and the framing layer that turns raw transport bytes
//! into line-oriented sentence blocks.

/// Longest accepted sentence in bytes, including any leading TAG block
/// residue and the CR/LF terminator. NMEA 0183 caps a sentence at 82
/// characters; the margin absorbs slightly oversized talkers.
pub const MAX_SENTENCE: usize = 96;

/// One sentence-sized unit of payload plus metadata. This is the
/// granularity of every queue in the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Senblk {
    /// Sentence bytes, terminator included.
    pub data: Vec<u8>,
    /// Id of the interface the sentence arrived on.
    pub src: u32,
}

impl Senblk {
    pub fn new(data: Vec<u8>, src: u32) -> Self {
        Senblk { data, src }
    }

    /// The address field: the characters between the `$`/`!` lead-in and
    /// the first `,` or `*`. Empty when the sentence has no lead-in.
    pub fn address(&self) -> &[u8] {
        address_field(&self.data)
    }
}

pub(crate) fn address_field(line: &[u8]) -> &[u8] {
    let body = match line.first() {
        Some(&b'$') | Some(&b'!') => &line[1..],
        _ => return &[],
    };
    let end = body
        .iter()
        .position(|&b| b == b',' || b == b'*')
        .unwrap_or(body.len());
    &body[..end]
}

/// XOR checksum over a sentence body (the bytes between the lead-in and
/// the `*` delimiter).
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0, |acc, b| acc ^ b)
}

/// Verifies the `*hh` trailer of a sentence when one is present.
/// Sentences without a trailer pass; a malformed trailer fails.
pub fn checksum_ok(line: &[u8]) -> bool {
    let trimmed = trim_eol(line);
    let body = match trimmed.first() {
        Some(&b'$') | Some(&b'!') => &trimmed[1..],
        _ => return false,
    };
    let star = match body.iter().rposition(|&b| b == b'*') {
        Some(p) => p,
        None => return true,
    };
    let hex = &body[star + 1..];
    if hex.len() != 2 {
        return false;
    }
    let want = match (hexval(hex[0]), hexval(hex[1])) {
        (Some(hi), Some(lo)) => (hi << 4) | lo,
        _ => return false,
    };
    checksum(&body[..star]) == want
}

fn hexval(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Splits a raw byte stream into newline-terminated sentences.
///
/// Oversized lines are discarded in full: once a line exceeds
/// [`MAX_SENTENCE`] the splitter swallows bytes until the next newline.
pub struct Splitter {
    pending: Vec<u8>,
    overrun: bool,
}

impl Splitter {
    pub fn new() -> Self {
        Splitter {
            pending: Vec::with_capacity(MAX_SENTENCE),
            overrun: false,
        }
    }

    /// Feeds a chunk of raw bytes, invoking `deliver` once per complete
    /// sentence. Delivered slices include the CR/LF terminator.
    pub fn feed(&mut self, chunk: &[u8], deliver: &mut dyn FnMut(&[u8])) {
        for &b in chunk {
            if self.overrun {
                if b == b'\n' {
                    self.overrun = false;
                }
                continue;
            }
            self.pending.push(b);
            if b == b'\n' {
                deliver(&self.pending);
                self.pending.clear();
            } else if self.pending.len() >= MAX_SENTENCE {
                self.pending.clear();
                self.overrun = true;
            }
        }
    }
}

impl Default for Splitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(splitter: &mut Splitter, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for c in chunks {
            splitter.feed(c, &mut |line| out.push(line.to_vec()));
        }
        out
    }

    #[test]
    fn test_split_single_chunk() {
        let mut s = Splitter::new();
        let lines = collect(&mut s, &[b"$GPGGA,1*47\r\n$GPRMC,2\r\n"]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], b"$GPGGA,1*47\r\n");
        assert_eq!(lines[1], b"$GPRMC,2\r\n");
    }

    #[test]
    fn test_split_across_chunks() {
        let mut s = Splitter::new();
        let lines = collect(&mut s, &[b"$GPG", b"GA,1", b"\r", b"\n$X\n"]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], b"$GPGGA,1\r\n");
        assert_eq!(lines[1], b"$X\n");
    }

    #[test]
    fn test_oversized_line_discarded() {
        let mut s = Splitter::new();
        let long = vec![b'x'; 2 * MAX_SENTENCE];
        let mut chunks: Vec<&[u8]> = vec![&long];
        chunks.push(b"\n$GPGGA,ok\r\n");
        let lines = collect(&mut s, &chunks);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], b"$GPGGA,ok\r\n");
    }

    #[test]
    fn test_checksum_matches_known_sentence() {
        // Reference fix sentence with a published checksum.
        let line = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";
        assert!(checksum_ok(line));
    }

    #[test]
    fn test_checksum_mismatch() {
        assert!(!checksum_ok(b"$GPGGA,123519*00\r\n"));
    }

    #[test]
    fn test_checksum_absent_passes() {
        assert!(checksum_ok(b"$GPGGA,123519\r\n"));
    }

    #[test]
    fn test_checksum_requires_leadin() {
        assert!(!checksum_ok(b"GPGGA,123519\r\n"));
    }

    #[test]
    fn test_address_field() {
        let sb = Senblk::new(b"$GPGGA,1,2*33\r\n".to_vec(), 0);
        assert_eq!(sb.address(), b"GPGGA");
        let ais = Senblk::new(b"!AIVDM,1,1,,A,13u?etPv,0*00\r\n".to_vec(), 0);
        assert_eq!(ais.address(), b"AIVDM");
        let bare = Senblk::new(b"no lead-in\r\n".to_vec(), 0);
        assert_eq!(bare.address(), b"");
    }
}
