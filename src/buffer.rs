//! Module with the byte buffer used for connection I/O.

use std::cmp::{max, min};
use std::io::{self, Read, Write};

use crate::{HEAD_TERMINATOR, MIN_READ_SIZE};

/// Growable byte buffer that knows how to exchange bytes with a non-blocking
/// socket.
///
/// [`ingest_from`] pulls as much as the socket will give without blocking,
/// [`drain_to`] pushes as much as the socket will take. Failure is sticky:
/// once an allocation or I/O error occurred every mutating operation becomes
/// a no-op and the owner must check [`failed`] and discard the buffer.
///
/// The position of the first `"\r\n\r\n"` is memoized across repeated
/// [`seek`]s. The memo is dropped by every operation that shifts or removes
/// live bytes, but deliberately not by appends: a memoized hit still points
/// at the same bytes, and a memoized miss is indistinguishable from "not yet
/// computed", so the next `seek` simply searches again.
///
/// [`ingest_from`]: Buffer::ingest_from
/// [`drain_to`]: Buffer::drain_to
/// [`failed`]: Buffer::failed
/// [`seek`]: Buffer::seek
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    failed: bool,
    /// Memoized result of `seek(b"\r\n\r\n")`, only kept when found.
    crlfcrlf: Option<usize>,
}

impl Buffer {
    /// Create an empty buffer. No memory is allocated until the first byte
    /// is stored.
    pub const fn new() -> Buffer {
        Buffer {
            data: Vec::new(),
            failed: false,
            crlfcrlf: None,
        }
    }

    /// Returns the number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` once an allocation or I/O error occurred.
    pub const fn failed(&self) -> bool {
        self.failed
    }

    /// Returns the buffered bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Grow the buffer so at least `extra` bytes can be stored without
    /// another allocation. Doubles the capacity, starting at 256 bytes.
    fn ensure_unused_space(&mut self, extra: usize) -> bool {
        debug_assert!(!self.failed);
        let used = self.data.len();
        let needed = match used.checked_add(extra) {
            Some(needed) => needed,
            None => {
                self.failed = true;
                return false;
            }
        };
        if needed > self.data.capacity() {
            let target = max(max(256, 2 * self.data.capacity()), needed);
            if self.data.try_reserve_exact(target - used).is_err() {
                self.failed = true;
                return false;
            }
        }
        true
    }

    /// Append `src` at the end of the buffer.
    ///
    /// Does nothing once the buffer [`failed`]; an allocation failure sets
    /// the flag and leaves the previous contents intact.
    ///
    /// [`failed`]: Buffer::failed
    pub fn append(&mut self, src: &[u8]) {
        if self.failed {
            return;
        }
        if !self.ensure_unused_space(src.len()) {
            return;
        }
        self.data.extend_from_slice(src);
    }

    /// Overwrite the bytes at `off` with `src`, in place.
    ///
    /// The destination must lie entirely within the buffered bytes,
    /// otherwise the buffer is marked failed.
    pub fn overwrite(&mut self, off: usize, src: &[u8]) {
        if self.failed {
            return;
        }
        let end = match off.checked_add(src.len()) {
            Some(end) if end <= self.data.len() => end,
            _ => {
                self.failed = true;
                return;
            }
        };
        self.data[off..end].copy_from_slice(src);
    }

    /// Copy up to `dst.len()` bytes from the front of the buffer into `dst`
    /// and remove them. Returns the number of bytes copied.
    pub fn read_out(&mut self, dst: &mut [u8]) -> usize {
        if self.failed {
            return 0;
        }
        self.crlfcrlf = None;
        let copy = min(self.data.len(), dst.len());
        dst[..copy].copy_from_slice(&self.data[..copy]);
        self.data.drain(..copy);
        copy
    }

    /// Move bytes from `sock` into the buffer until the socket would block.
    ///
    /// Returns `true` if the peer closed the connection. A read error marks
    /// the buffer failed.
    pub fn ingest_from<R: Read>(&mut self, sock: &mut R) -> bool {
        if self.failed {
            return false;
        }
        let mut closed = false;
        loop {
            if !self.ensure_unused_space(MIN_READ_SIZE) {
                break;
            }
            let used = self.data.len();
            let capacity = self.data.capacity();
            // Make the spare capacity readable, then cut back to what the
            // socket actually delivered.
            self.data.resize(capacity, 0);
            match sock.read(&mut self.data[used..]) {
                Ok(0) => {
                    self.data.truncate(used);
                    closed = true;
                    break;
                }
                Ok(n) => self.data.truncate(used + n),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.data.truncate(used);
                    break;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.data.truncate(used);
                }
                Err(_) => {
                    self.data.truncate(used);
                    self.failed = true;
                    return false;
                }
            }
        }
        closed
    }

    /// Move bytes from the buffer to `sock` until the socket would block or
    /// the buffer is empty. Returns the number of bytes written.
    ///
    /// A write error, including a zero-byte write, marks the buffer failed.
    pub fn drain_to<W: Write>(&mut self, sock: &mut W) -> usize {
        if self.failed {
            return 0;
        }
        let mut copied = 0;
        while copied < self.data.len() {
            match sock.write(&self.data[copied..]) {
                Ok(0) => {
                    self.failed = true;
                    return 0;
                }
                Ok(n) => copied += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.failed = true;
                    return 0;
                }
            }
        }
        self.crlfcrlf = None;
        self.data.drain(..copied);
        copied
    }

    /// Returns the index of the first occurrence of `needle`, or `None` if
    /// it doesn't appear in the buffered bytes.
    pub fn seek(&mut self, needle: &[u8]) -> Option<usize> {
        let is_terminator = needle == HEAD_TERMINATOR;
        if is_terminator {
            if let Some(index) = self.crlfcrlf {
                return Some(index);
            }
        }
        let index = find(&self.data, needle);
        if is_terminator {
            self.crlfcrlf = index;
        }
        index
    }

    /// Returns `true` if `needle` appears in the buffered bytes.
    pub fn contains(&mut self, needle: &[u8]) -> bool {
        self.seek(needle).is_some()
    }

    /// Remove the first `num` bytes from the buffer.
    ///
    /// `num` must not exceed [`len`].
    ///
    /// [`len`]: Buffer::len
    pub fn consume(&mut self, num: usize) {
        debug_assert!(num <= self.data.len());
        let num = min(num, self.data.len());
        self.data.drain(..num);
        self.crlfcrlf = None;
    }

    /// Returns the bytes in `off..end`, or an empty slice if the range
    /// doesn't lie within the buffered bytes.
    pub fn slice(&self, off: usize, end: usize) -> &[u8] {
        if end < off || end > self.data.len() {
            return &[];
        }
        &self.data[off..end]
    }

    /// Returns the bytes from the front of the buffer up to the first
    /// occurrence of `token`, including the token itself if `include_token`
    /// is set. Returns an empty slice if the token doesn't appear.
    pub fn slice_until(&mut self, token: &[u8], include_token: bool) -> &[u8] {
        match self.seek(token) {
            None => &[],
            Some(mut end) => {
                if include_token {
                    end += token.len();
                }
                &self.data[..end]
            }
        }
    }
}

/// Naive substring search over `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
