//! A growable byte buffer with a prepend reserve, modeled after the classic
//! `[prependable | readable | writable]` layout used by network framing
//! libraries: two cursors over one contiguous allocation let a reader consume
//! bytes from the front while a sender stamps headers in front of an
//! already-built payload without a copy.

use std::os::fd::RawFd;

/// Bytes reserved at the front of every `Buffer` so headers can be prepended
/// without shifting the readable content.
pub const CHEAP_PREPEND: usize = 8;
/// Initial size of the writable region, not counting the prepend reserve.
pub const INITIAL_SIZE: usize = 1024;
/// Size of the on-stack scratch segment used by [`Buffer::read_fd`] to absorb
/// reads larger than the current writable tail without growing the buffer first.
const EXTRA_BUF_SIZE: usize = 65536;

const CRLF: &[u8; 2] = b"\r\n";

/// A resizable byte buffer with `read`/`write` cursors and a small prepend reserve.
///
/// Invariant: `0 <= CHEAP_PREPEND <= read <= write <= storage.len()`.
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read: usize,
    write: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    /// A buffer with the default prepend reserve and initial writable capacity.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// A buffer whose writable region starts out able to hold at least `capacity`
    /// bytes without growing.
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            storage: vec![0u8; CHEAP_PREPEND + capacity],
            read: CHEAP_PREPEND,
            write: CHEAP_PREPEND,
        }
    }

    /// Bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write - self.read
    }

    /// Bytes that can be appended before the backing storage must grow or compact.
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write
    }

    /// Bytes available in the prepend reserve (i.e. `prepend` payloads up to this size
    /// can be written without shifting readable content).
    pub fn prependable_bytes(&self) -> usize {
        self.read
    }

    /// A pointer to the first readable byte's slice; never advances `read`.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read..self.write]
    }

    fn begin_write_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.write..]
    }

    /// Advances `read` by `n`. `n` must be `<= readable_bytes()`.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Advances `read` up to (but not past) the readable region ending at `end`,
    /// an index into the same coordinate space as [`Buffer::peek`].
    pub fn retrieve_until(&mut self, end: usize) {
        assert!(end <= self.readable_bytes());
        self.retrieve(end);
    }

    /// Resets both cursors to the prepend reserve, discarding all readable content.
    pub fn retrieve_all(&mut self) {
        self.read = CHEAP_PREPEND;
        self.write = CHEAP_PREPEND;
    }

    /// Copies out and retrieves `n` readable bytes.
    pub fn retrieve_as_vec(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes());
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    /// Copies out and retrieves every readable byte.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    /// Appends `data` to the readable region, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.begin_write_mut()[..data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Ensures at least `len` writable bytes without disturbing readable content.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Advances `write` by `len` after the caller has filled that many bytes
    /// via [`Buffer::writable_slice`].
    pub fn has_written(&mut self, len: usize) {
        self.write += len;
    }

    /// The writable tail as a mutable slice, for callers that fill it directly
    /// (e.g. a scatter/gather read) before calling [`Buffer::has_written`].
    pub fn writable_slice(&mut self) -> &mut [u8] {
        self.begin_write_mut()
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.storage.resize(self.write + len, 0);
        } else {
            // Shift the readable region down to the reserve boundary rather than growing.
            let readable = self.readable_bytes();
            self.storage.copy_within(self.read..self.write, CHEAP_PREPEND);
            self.read = CHEAP_PREPEND;
            self.write = self.read + readable;
        }
    }

    /// Writes `data` into the freed prefix just before the current readable
    /// content. `data.len()` must be `<= prependable_bytes()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read -= data.len();
        self.storage[self.read..self.read + data.len()].copy_from_slice(data);
    }

    /// Searches `[start, write)` for `\r\n`, returning the index (in the same
    /// coordinate space as [`Buffer::peek`]) of its first byte.
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        let hay = &self.peek()[start..];
        hay.windows(2).position(|w| w == CRLF).map(|i| start + i)
    }

    /// Searches the entire readable region for `\r\n`.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Reads from `fd` directly into the buffer.
    ///
    /// Uses a scatter/gather read across the buffer's writable tail and a
    /// 64 KiB on-stack scratch segment, so a single large read does not force
    /// a pre-emptive grow via an `ioctl(FIONREAD)` round trip: most reads fit
    /// in the tail, and the rare large one spills into the scratch buffer and
    /// is appended (which *does* grow the buffer, exactly once).
    ///
    /// Returns the number of bytes read, or the `io::Error` from the syscall.
    pub fn read_fd(&mut self, fd: RawFd) -> std::io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.begin_write_mut().as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra_buf.len(),
            },
        ];

        let n = syscall!(readv(fd, iov.as_mut_ptr(), iov.len() as i32))?;
        let n = n as usize;
        if n <= writable {
            self.has_written(n);
        } else {
            self.has_written(writable);
            self.append(&extra_buf[..n - writable]);
        }
        Ok(n)
    }

    // -- network byte order integer helpers --

    pub fn append_u32(&mut self, x: u32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_u16(&mut self, x: u16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_u8(&mut self, x: u8) {
        self.append(&[x]);
    }

    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_u16(&self) -> u16 {
        assert!(self.readable_bytes() >= 2);
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_u8(&self) -> u8 {
        assert!(!self.peek().is_empty());
        self.peek()[0]
    }

    pub fn read_u32(&mut self) -> u32 {
        let x = self.peek_u32();
        self.retrieve(4);
        x
    }

    pub fn read_u16(&mut self) -> u16 {
        let x = self.peek_u16();
        self.retrieve(2);
        x
    }

    pub fn read_u8(&mut self) -> u8 {
        let x = self.peek_u8();
        self.retrieve(1);
        x
    }

    pub fn prepend_u32(&mut self, x: u32) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_u16(&mut self, x: u16) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_u8(&mut self, x: u8) {
        self.prepend(&[x]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_with_full_reserve() {
        let b = Buffer::new();
        assert_eq!(b.readable_bytes(), 0);
        assert_eq!(b.writable_bytes(), INITIAL_SIZE);
        assert_eq!(b.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut b = Buffer::new();
        b.append(b"hello");
        assert_eq!(b.readable_bytes(), 5);
        assert_eq!(b.peek(), b"hello");
        let s = b.retrieve_as_vec(5);
        assert_eq!(s, b"hello");
        assert_eq!(b.readable_bytes(), 0);
        // retrieving everything resets to the reserve boundary.
        assert_eq!(b.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn prepend_stamps_header_in_front_of_content() {
        let mut b = Buffer::new();
        b.append(b"world");
        b.prepend_u32(5);
        assert_eq!(b.readable_bytes(), 9);
        assert_eq!(&b.peek()[..4], &5u32.to_be_bytes());
        assert_eq!(&b.peek()[4..], b"world");
    }

    #[test]
    fn int32_round_trip() {
        for x in [0u32, 1, 42, u32::MAX, 1 << 31] {
            let mut b = Buffer::new();
            b.append_u32(x);
            assert_eq!(b.read_u32(), x);
        }
    }

    #[test]
    fn grows_when_compaction_is_insufficient() {
        let mut b = Buffer::with_capacity(16);
        b.append(&[0u8; 16]);
        // Nothing has been retrieved, so compaction can't help; must grow.
        b.append(&[1u8; 16]);
        assert_eq!(b.readable_bytes(), 32);
    }

    #[test]
    fn compacts_instead_of_growing_when_possible() {
        let mut b = Buffer::with_capacity(16);
        b.append(&[0u8; 16]);
        b.retrieve(16);
        let cap_before = b.writable_bytes() + b.prependable_bytes();
        b.append(&[1u8; 16]);
        let cap_after = b.writable_bytes() + b.prependable_bytes();
        // total slack is conserved across a pure compaction (no grow occurred).
        assert_eq!(cap_before, cap_after + 16);
        assert_eq!(b.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn find_crlf_locates_delimiter() {
        let mut b = Buffer::new();
        b.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        let first = b.find_crlf().unwrap();
        assert_eq!(&b.peek()[..first], b"GET / HTTP/1.1");
        let second = b.find_crlf_from(first + 2).unwrap();
        assert_eq!(&b.peek()[first + 2..second], b"Host: x");
    }

    #[test]
    fn find_crlf_absent_returns_none() {
        let mut b = Buffer::new();
        b.append(b"no newline here");
        assert_eq!(b.find_crlf(), None);
    }
}
