//! Resumable gzip inflater.
//!
//! Decodes gzip (RFC 1952) members holding deflate (RFC 1951) data and, when
//! asked, remembers the decoder state at deflate block boundaries. At a
//! block boundary the whole state is the compressed bit position plus the
//! last 32 KiB of output, so decoding can later restart from that bit with
//! the saved window and produce exactly the same bytes.

use flate2::Crc;
use std::collections::VecDeque;
use std::io::{self, BufRead, Read};
use std::sync::OnceLock;

/// Back-reference window size
pub const WINDOW_SIZE: usize = 32 * 1024;
const WINDOW_MASK: usize = WINDOW_SIZE - 1;
const CHUNK: usize = 32 * 1024;
const INPUT_BUFFER: usize = 64 * 1024;
const MAX_BITS: usize = 15;
/// Codes up to this length decode with a single table lookup.
const FAST_BITS: u32 = 10;
const FAST_MASK: u64 = (1 << FAST_BITS) - 1;

const LEN_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115,
    131, 163, 195, 227, 258,
];
const LEN_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
const DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];
/// Order in which code length code lengths are transmitted
const CLEN_ORDER: [usize; 19] = [16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15];

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;

fn corrupt(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Canonical Huffman code as symbol counts per length plus symbols in
/// canonical order.
///
/// `fast` is indexed by the next `FAST_BITS` input bits (least significant
/// first) and holds `symbol << 4 | length` for codes that short, 0 otherwise.
struct Huffman {
    count: [u16; MAX_BITS + 1],
    symbol: Vec<u16>,
    fast: Vec<u16>,
}

impl Huffman {
    fn new(lengths: &[u8]) -> io::Result<Self> {
        let mut count = [0u16; MAX_BITS + 1];
        for &len in lengths {
            count[len as usize] += 1;
        }
        if count[0] as usize == lengths.len() {
            return Ok(Self {
                count,
                symbol: Vec::new(),
                fast: vec![0; 1 << FAST_BITS],
            });
        }

        let mut left: i32 = 1;
        for len in 1..=MAX_BITS {
            left <<= 1;
            left -= count[len] as i32;
            if left < 0 {
                return Err(corrupt("over-subscribed Huffman code"));
            }
        }

        let mut offsets = [0u16; MAX_BITS + 1];
        for len in 1..MAX_BITS {
            offsets[len + 1] = offsets[len] + count[len];
        }
        let mut symbol = vec![0u16; lengths.len()];
        for (sym, &len) in lengths.iter().enumerate() {
            if len != 0 {
                symbol[offsets[len as usize] as usize] = sym as u16;
                offsets[len as usize] += 1;
            }
        }
        let fast = fast_table(&count, &symbol);
        Ok(Self { count, symbol, fast })
    }
}

fn fast_table(count: &[u16; MAX_BITS + 1], symbol: &[u16]) -> Vec<u16> {
    let mut fast = vec![0u16; 1 << FAST_BITS];
    let mut code: u32 = 0;
    let mut index = 0usize;
    for len in 1..=FAST_BITS {
        for _ in 0..count[len as usize] {
            // Deflate sends Huffman codes most significant bit first.
            let reversed = code.reverse_bits() >> (32 - len);
            let entry = symbol[index] << 4 | len as u16;
            let mut slot = reversed as usize;
            while slot < fast.len() {
                fast[slot] = entry;
                slot += 1 << len;
            }
            code += 1;
            index += 1;
        }
        code <<= 1;
    }
    fast
}

struct FixedTables {
    lit: Huffman,
    dist: Huffman,
}

fn fixed_tables() -> &'static FixedTables {
    static TABLES: OnceLock<FixedTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut lengths = [0u8; 288];
        lengths[..144].fill(8);
        lengths[144..256].fill(9);
        lengths[256..280].fill(7);
        lengths[280..].fill(8);
        let dist_lengths = [5u8; 30];
        // Both code sets are complete, so construction cannot fail.
        let empty = || Huffman {
            count: [0; MAX_BITS + 1],
            symbol: Vec::new(),
            fast: vec![0; 1 << FAST_BITS],
        };
        FixedTables {
            lit: Huffman::new(&lengths).unwrap_or_else(|_| empty()),
            dist: Huffman::new(&dist_lengths).unwrap_or_else(|_| empty()),
        }
    })
}

enum Codes {
    Fixed,
    Dynamic(Box<(Huffman, Huffman)>),
}

enum State {
    MemberHeader,
    BlockHeader,
    Stored(usize),
    Codes(Codes),
    Trailer,
    Done,
    Failed,
}

/// Decoder state at the start of a deflate block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary {
    /// Compressed bit offset of the block header from the start of the file
    pub bit_pos: u64,
    /// Uncompressed offset of the first byte the block produces
    pub out_pos: u64,
    /// Up to 32 KiB of output preceding `out_pos`
    pub window: Vec<u8>,
}

pub struct Inflater<R> {
    input: R,
    inbuf: Vec<u8>,
    in_pos: usize,
    in_len: usize,
    /// Absolute input offset of `inbuf[in_pos]`
    in_offset: u64,
    bitbuf: u64,
    bitcnt: u32,

    state: State,
    last_block: bool,

    window: Vec<u8>,
    wpos: usize,
    wfill: usize,

    pending: Vec<u8>,
    pending_pos: usize,
    produced: u64,

    crc: Crc,
    crc_mark: usize,
    /// False after resuming mid-member, where the running CRC is unknown
    crc_check: bool,

    track: bool,
    boundaries: VecDeque<Boundary>,
}

impl<R: Read> Inflater<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            inbuf: vec![0u8; INPUT_BUFFER],
            in_pos: 0,
            in_len: 0,
            in_offset: 0,
            bitbuf: 0,
            bitcnt: 0,
            state: State::MemberHeader,
            last_block: false,
            window: vec![0u8; WINDOW_SIZE],
            wpos: 0,
            wfill: 0,
            pending: Vec::with_capacity(CHUNK + 512),
            pending_pos: 0,
            produced: 0,
            crc: Crc::new(),
            crc_mark: 0,
            crc_check: true,
            track: false,
            boundaries: VecDeque::new(),
        }
    }

    /// Record a [`Boundary`] at every deflate block header from now on.
    pub fn track_boundaries(mut self, enabled: bool) -> Self {
        self.track = enabled;
        self
    }

    /// Continue decoding from a saved block boundary.
    ///
    /// `input` must be positioned at byte `boundary.bit_pos / 8` of the
    /// compressed file.
    pub fn resume(input: R, boundary: &Boundary) -> io::Result<Self> {
        if boundary.window.len() > WINDOW_SIZE {
            return Err(corrupt("checkpoint window larger than 32 KiB"));
        }
        let mut inflater = Self::new(input);
        inflater.in_offset = boundary.bit_pos / 8;
        inflater.produced = boundary.out_pos;
        inflater.window[..boundary.window.len()].copy_from_slice(&boundary.window);
        inflater.wfill = boundary.window.len();
        inflater.wpos = boundary.window.len() & WINDOW_MASK;
        inflater.state = State::BlockHeader;
        inflater.crc_check = false;

        let skip = (boundary.bit_pos % 8) as u32;
        if skip > 0 {
            inflater.bits(skip)?;
        }
        Ok(inflater)
    }

    /// Uncompressed offset of the next byte handed to the reader.
    pub fn position(&self) -> u64 {
        self.produced - (self.pending.len() - self.pending_pos) as u64
    }

    /// Latest recorded boundary at or before uncompressed offset `pos`.
    pub fn boundary_before(&self, pos: u64) -> Option<&Boundary> {
        self.boundaries.iter().rev().find(|b| b.out_pos <= pos)
    }

    /// Forget boundaries that can no longer be the latest one before `pos`.
    pub fn prune_boundaries(&mut self, pos: u64) {
        while self.boundaries.len() > 1 && self.boundaries[1].out_pos <= pos {
            self.boundaries.pop_front();
        }
    }

    fn bit_pos(&self) -> u64 {
        self.in_offset * 8 - self.bitcnt as u64
    }

    fn refill(&mut self) -> io::Result<()> {
        loop {
            match self.input.read(&mut self.inbuf) {
                Ok(n) => {
                    self.in_pos = 0;
                    self.in_len = n;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn need(&mut self, n: u32) -> io::Result<()> {
        while self.bitcnt < n {
            if self.in_pos == self.in_len {
                self.refill()?;
                if self.in_len == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected end of gzip stream",
                    ));
                }
            }
            self.bitbuf |= (self.inbuf[self.in_pos] as u64) << self.bitcnt;
            self.in_pos += 1;
            self.in_offset += 1;
            self.bitcnt += 8;
        }
        Ok(())
    }

    /// Next `n` bits (n <= 32), least significant first.
    fn bits(&mut self, n: u32) -> io::Result<u32> {
        self.need(n)?;
        let value = (self.bitbuf & ((1u64 << n) - 1)) as u32;
        self.bitbuf >>= n;
        self.bitcnt -= n;
        Ok(value)
    }

    fn align(&mut self) {
        let drop = self.bitcnt % 8;
        self.bitbuf >>= drop;
        self.bitcnt -= drop;
    }

    fn byte(&mut self) -> io::Result<u8> {
        Ok(self.bits(8)? as u8)
    }

    /// Next byte-aligned byte without consuming it; `None` at end of input.
    fn peek_byte(&mut self) -> io::Result<Option<u8>> {
        if self.bitcnt >= 8 {
            return Ok(Some((self.bitbuf & 0xff) as u8));
        }
        if self.in_pos == self.in_len {
            self.refill()?;
            if self.in_len == 0 {
                return Ok(None);
            }
        }
        Ok(Some(self.inbuf[self.in_pos]))
    }

    /// Buffer up to `n` bits without failing at end of input.
    fn prefetch(&mut self, n: u32) -> io::Result<()> {
        while self.bitcnt < n {
            if self.in_pos == self.in_len {
                self.refill()?;
                if self.in_len == 0 {
                    break;
                }
            }
            self.bitbuf |= (self.inbuf[self.in_pos] as u64) << self.bitcnt;
            self.in_pos += 1;
            self.in_offset += 1;
            self.bitcnt += 8;
        }
        Ok(())
    }

    fn decode(&mut self, h: &Huffman) -> io::Result<u16> {
        self.prefetch(FAST_BITS)?;
        let entry = h.fast[(self.bitbuf & FAST_MASK) as usize];
        let len = (entry & 0xf) as u32;
        if len > 0 && len <= self.bitcnt {
            self.bitbuf >>= len;
            self.bitcnt -= len;
            return Ok(entry >> 4);
        }

        let mut code: i32 = 0;
        let mut first: i32 = 0;
        let mut index: i32 = 0;
        for len in 1..=MAX_BITS {
            code |= self.bits(1)? as i32;
            let count = h.count[len] as i32;
            if code - count < first {
                return Ok(h.symbol[(index + (code - first)) as usize]);
            }
            index += count;
            first += count;
            first <<= 1;
            code <<= 1;
        }
        Err(corrupt("invalid Huffman code"))
    }

    fn emit(&mut self, b: u8) {
        self.window[self.wpos] = b;
        self.wpos = (self.wpos + 1) & WINDOW_MASK;
        if self.wfill < WINDOW_SIZE {
            self.wfill += 1;
        }
        self.pending.push(b);
        self.produced += 1;
    }

    fn window_snapshot(&self) -> Vec<u8> {
        if self.wfill == WINDOW_SIZE {
            let mut out = Vec::with_capacity(WINDOW_SIZE);
            out.extend_from_slice(&self.window[self.wpos..]);
            out.extend_from_slice(&self.window[..self.wpos]);
            out
        } else {
            let start = (self.wpos + WINDOW_SIZE - self.wfill) & WINDOW_MASK;
            if start <= self.wpos {
                self.window[start..self.wpos].to_vec()
            } else {
                let mut out = Vec::with_capacity(self.wfill);
                out.extend_from_slice(&self.window[start..]);
                out.extend_from_slice(&self.window[..self.wpos]);
                out
            }
        }
    }

    fn sync_crc(&mut self) {
        if self.crc_mark < self.pending.len() {
            self.crc.update(&self.pending[self.crc_mark..]);
            self.crc_mark = self.pending.len();
        }
    }

    fn read_member_header(&mut self) -> io::Result<()> {
        self.align();
        let id1 = self.byte()?;
        let id2 = self.byte()?;
        if id1 != 0x1f || id2 != 0x8b {
            return Err(corrupt("not in gzip format"));
        }
        if self.byte()? != 8 {
            return Err(corrupt("unknown gzip compression method"));
        }
        let flags = self.byte()?;
        // mtime, xfl, os
        for _ in 0..6 {
            self.byte()?;
        }
        if flags & FEXTRA != 0 {
            let xlen = self.bits(16)?;
            for _ in 0..xlen {
                self.byte()?;
            }
        }
        if flags & FNAME != 0 {
            while self.byte()? != 0 {}
        }
        if flags & FCOMMENT != 0 {
            while self.byte()? != 0 {}
        }
        if flags & FHCRC != 0 {
            self.bits(16)?;
        }
        self.crc = Crc::new();
        self.crc_check = true;
        self.last_block = false;
        Ok(())
    }

    fn read_block_header(&mut self) -> io::Result<State> {
        self.last_block = self.bits(1)? == 1;
        match self.bits(2)? {
            0 => {
                self.align();
                let len = self.bits(16)?;
                let nlen = self.bits(16)?;
                if len != !nlen & 0xffff {
                    return Err(corrupt("stored block length mismatch"));
                }
                Ok(State::Stored(len as usize))
            }
            1 => Ok(State::Codes(Codes::Fixed)),
            2 => Ok(State::Codes(Codes::Dynamic(Box::new(self.read_dynamic_tables()?)))),
            _ => Err(corrupt("invalid deflate block type")),
        }
    }

    fn read_dynamic_tables(&mut self) -> io::Result<(Huffman, Huffman)> {
        let nlen = self.bits(5)? as usize + 257;
        let ndist = self.bits(5)? as usize + 1;
        let ncode = self.bits(4)? as usize + 4;
        if nlen > 286 || ndist > 30 {
            return Err(corrupt("too many length or distance codes"));
        }

        let mut clen = [0u8; 19];
        for &slot in CLEN_ORDER.iter().take(ncode) {
            clen[slot] = self.bits(3)? as u8;
        }
        let lencode = Huffman::new(&clen)?;

        let mut lengths = vec![0u8; nlen + ndist];
        let mut index = 0;
        while index < nlen + ndist {
            let sym = self.decode(&lencode)?;
            if sym < 16 {
                lengths[index] = sym as u8;
                index += 1;
                continue;
            }
            let (value, repeat) = match sym {
                16 => {
                    if index == 0 {
                        return Err(corrupt("repeat with no previous length"));
                    }
                    (lengths[index - 1], 3 + self.bits(2)? as usize)
                }
                17 => (0, 3 + self.bits(3)? as usize),
                _ => (0, 11 + self.bits(7)? as usize),
            };
            if index + repeat > nlen + ndist {
                return Err(corrupt("too many code lengths"));
            }
            lengths[index..index + repeat].fill(value);
            index += repeat;
        }
        if lengths[256] == 0 {
            return Err(corrupt("missing end-of-block code"));
        }

        let lit = Huffman::new(&lengths[..nlen])?;
        let dist = Huffman::new(&lengths[nlen..])?;
        Ok((lit, dist))
    }

    /// Copy stored bytes; returns how many remain in the block.
    fn copy_stored(&mut self, remaining: usize) -> io::Result<usize> {
        let room = CHUNK.saturating_sub(self.pending.len()).max(1);
        let n = remaining.min(room);
        for _ in 0..n {
            let b = self.byte()?;
            self.emit(b);
        }
        Ok(remaining - n)
    }

    /// Decode symbols until end of block (true) or the chunk is full (false).
    fn decode_codes(&mut self, lit: &Huffman, dist: &Huffman) -> io::Result<bool> {
        while self.pending.len() < CHUNK {
            let sym = self.decode(lit)? as usize;
            if sym < 256 {
                self.emit(sym as u8);
                continue;
            }
            if sym == 256 {
                return Ok(true);
            }
            let sym = sym - 257;
            if sym >= LEN_BASE.len() {
                return Err(corrupt("invalid literal/length symbol"));
            }
            let len = LEN_BASE[sym] as usize + self.bits(LEN_EXTRA[sym] as u32)? as usize;
            let dsym = self.decode(dist)? as usize;
            if dsym >= DIST_BASE.len() {
                return Err(corrupt("invalid distance symbol"));
            }
            let distance = DIST_BASE[dsym] as usize + self.bits(DIST_EXTRA[dsym] as u32)? as usize;
            if distance > self.wfill {
                return Err(corrupt("invalid distance too far back"));
            }
            for _ in 0..len {
                let b = self.window[(self.wpos + WINDOW_SIZE - distance) & WINDOW_MASK];
                self.emit(b);
            }
        }
        Ok(false)
    }

    fn read_trailer(&mut self) -> io::Result<()> {
        self.align();
        let crc = self.bits(32)?;
        let isize = self.bits(32)?;
        if self.crc_check && (crc != self.crc.sum() || isize != self.crc.amount()) {
            return Err(corrupt("gzip CRC mismatch"));
        }
        Ok(())
    }

    /// Another member follows; trailing non-gzip bytes are ignored.
    fn next_member(&mut self) -> io::Result<bool> {
        match self.peek_byte()? {
            None => Ok(false),
            Some(0x1f) => Ok(true),
            Some(_) => {
                log::debug!(
                    "[Inflate] Ignoring trailing bytes after gzip member at byte {}",
                    self.bit_pos() / 8
                );
                Ok(false)
            }
        }
    }

    fn after_block(&self) -> State {
        if self.last_block {
            State::Trailer
        } else {
            State::BlockHeader
        }
    }

    fn decode_chunk(&mut self) -> io::Result<()> {
        while self.pending.len() < CHUNK {
            match std::mem::replace(&mut self.state, State::Failed) {
                State::MemberHeader => {
                    self.read_member_header()?;
                    self.state = State::BlockHeader;
                }
                State::BlockHeader => {
                    if self.track {
                        let boundary = Boundary {
                            bit_pos: self.bit_pos(),
                            out_pos: self.produced,
                            window: self.window_snapshot(),
                        };
                        self.boundaries.push_back(boundary);
                    }
                    self.state = self.read_block_header()?;
                }
                State::Stored(remaining) => {
                    let left = self.copy_stored(remaining)?;
                    self.state = if left > 0 {
                        State::Stored(left)
                    } else {
                        self.after_block()
                    };
                }
                State::Codes(codes) => {
                    let finished = match &codes {
                        Codes::Fixed => {
                            let fixed = fixed_tables();
                            self.decode_codes(&fixed.lit, &fixed.dist)?
                        }
                        Codes::Dynamic(tables) => self.decode_codes(&tables.0, &tables.1)?,
                    };
                    self.state = if finished {
                        self.after_block()
                    } else {
                        State::Codes(codes)
                    };
                }
                State::Trailer => {
                    self.sync_crc();
                    self.read_trailer()?;
                    self.state = if self.next_member()? {
                        State::MemberHeader
                    } else {
                        State::Done
                    };
                }
                State::Done => {
                    self.state = State::Done;
                    break;
                }
                State::Failed => return Err(corrupt("gzip stream failed earlier")),
            }
        }
        self.sync_crc();
        Ok(())
    }
}

impl<R: Read> BufRead for Inflater<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.pending_pos >= self.pending.len() && !matches!(self.state, State::Done) {
            self.pending.clear();
            self.pending_pos = 0;
            self.crc_mark = 0;
            if let Err(e) = self.decode_chunk() {
                self.state = State::Failed;
                return Err(e);
            }
        }
        Ok(&self.pending[self.pending_pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pending_pos = (self.pending_pos + amt).min(self.pending.len());
    }
}

impl<R: Read> Read for Inflater<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    fn gzip(data: &[u8], level: Compression) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), level);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Text with enough variety to produce several deflate blocks.
    fn sample_text(lines: usize) -> Vec<u8> {
        let words = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta"];
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut out = Vec::new();
        for i in 0..lines {
            write!(out, "{{\"id\":\"doc{}\",\"text\":\"", i).unwrap();
            for _ in 0..12 {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let word = words[(state >> 60) as usize % words.len()];
                write!(out, "{}{} ", word, (state >> 40) % 1000).unwrap();
            }
            out.extend_from_slice(b"\"}\n");
        }
        out
    }

    fn inflate_all(data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        Inflater::new(Cursor::new(data)).read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_fast_table_matches_canonical_codes() -> io::Result<()> {
        // Codes: symbol 1 = 0, symbol 0 = 10, symbol 2 = 110, symbol 3 = 111.
        let h = Huffman::new(&[2, 1, 3, 3])?;
        let at = |bits: usize| (h.fast[bits] >> 4, h.fast[bits] & 0xf);
        assert_eq!(at(0b000), (1, 1));
        assert_eq!(at(0b110), (1, 1));
        assert_eq!(at(0b001), (0, 2));
        assert_eq!(at(0b011), (2, 3));
        assert_eq!(at(0b111), (3, 3));
        assert!(h.fast.iter().all(|&entry| entry != 0));
        Ok(())
    }

    #[test]
    fn test_inflate_levels() -> io::Result<()> {
        let text = sample_text(2000);
        for level in [Compression::none(), Compression::fast(), Compression::best()] {
            assert_eq!(inflate_all(&gzip(&text, level))?, text);
        }
        assert_eq!(inflate_all(&gzip(b"", Compression::default()))?, b"");
        Ok(())
    }

    #[test]
    fn test_multi_member_and_trailing_garbage() -> io::Result<()> {
        let mut data = gzip(b"first\n", Compression::default());
        data.extend(gzip(b"second\n", Compression::default()));
        data.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(inflate_all(&data)?, b"first\nsecond\n");
        Ok(())
    }

    #[test]
    fn test_rejects_corruption() {
        assert!(inflate_all(b"plain text, not gzip").is_err());

        let mut data = gzip(&sample_text(50), Compression::default());
        let crc_at = data.len() - 8;
        data[crc_at] ^= 0xff;
        let err = inflate_all(&data).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let truncated = gzip(&sample_text(50), Compression::default());
        let err = inflate_all(&truncated[..truncated.len() / 2]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_resume_from_boundary() -> io::Result<()> {
        let text = sample_text(20_000);
        let data = gzip(&text, Compression::default());

        let mut inflater = Inflater::new(Cursor::new(&data[..])).track_boundaries(true);
        let target = (text.len() * 2 / 3) as u64;
        io::copy(&mut (&mut inflater).take(target), &mut io::sink())?;
        assert_eq!(inflater.position(), target);

        let boundary = inflater
            .boundary_before(target)
            .cloned()
            .expect("boundary before target");
        assert!(boundary.out_pos > 0, "expected more than one deflate block");
        assert_eq!(
            &boundary.window[..],
            &text[boundary.out_pos as usize - boundary.window.len()..boundary.out_pos as usize]
        );

        let start = (boundary.bit_pos / 8) as usize;
        let mut resumed = Inflater::resume(Cursor::new(&data[start..]), &boundary)?;
        let mut rest = Vec::new();
        resumed.read_to_end(&mut rest)?;
        assert_eq!(&rest[..], &text[boundary.out_pos as usize..]);
        Ok(())
    }

    #[test]
    fn test_prune_keeps_latest_before_position() -> io::Result<()> {
        let text = sample_text(20_000);
        let data = gzip(&text, Compression::default());
        let mut inflater = Inflater::new(Cursor::new(&data[..])).track_boundaries(true);
        io::copy(&mut inflater, &mut io::sink())?;

        let pos = (text.len() / 2) as u64;
        let before = inflater.boundary_before(pos).cloned();
        inflater.prune_boundaries(pos);
        assert_eq!(inflater.boundary_before(pos).cloned(), before);
        assert!(inflater.boundaries.front().map(|b| b.out_pos <= pos).unwrap_or(false));
        Ok(())
    }
}
