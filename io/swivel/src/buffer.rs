//! Growable read/write byte buffer with prependable head space.
//!
//! Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0        <=       reader      <=     writer      <=     len
//! ```
//!
//! Invariants: `readable = writer - reader`, `writable = len - writer`,
//! `prependable = reader`. Draining past the last readable byte resets both
//! cursors to the prepend offset so the space is reused.

use std::io;
use std::os::fd::RawFd;

/// Head space reserved in front of the readable region.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack scratch used by [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new(initial_size: usize) -> Self {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial_size],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Advance the reader past `len` consumed bytes. Consuming everything
    /// (or more) resets both cursors to the prepend offset.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Copy out up to `len` bytes and consume them.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Lossy-UTF-8 convenience over [`Buffer::retrieve_as_bytes`].
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(len)).into_owned()
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Compact when the dead prepend space covers the request, otherwise
    /// resize to exactly `writer + len`.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Drain a readable fd with a single scatter read against the writable
    /// region plus a 64 KiB stack scratch. Overflow into the scratch is
    /// appended through the normal grow path, so a small buffer still takes
    /// a large burst in one syscall.
    ///
    /// `Ok(0)` means the peer closed its write side.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::fd::AsRawFd;

    fn check_balance(buf: &Buffer) {
        assert_eq!(
            buf.prependable_bytes() + buf.readable_bytes() + buf.writable_bytes(),
            buf.buf.len()
        );
        assert!(buf.reader <= buf.writer);
        assert!(buf.writer <= buf.buf.len());
    }

    #[test]
    fn fresh_buffer_layout() {
        let buf = Buffer::default();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        check_balance(&buf);
    }

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::default();
        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        buf.append(&payload);
        check_balance(&buf);
        assert_eq!(buf.retrieve_as_bytes(payload.len()), payload);
        assert_eq!(buf.readable_bytes(), 0);
        check_balance(&buf);
    }

    #[test]
    fn partial_retrieve_moves_reader() {
        let mut buf = Buffer::default();
        buf.append(b"hello world");
        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 6);
        check_balance(&buf);
    }

    #[test]
    fn retrieve_clamps_to_readable() {
        let mut buf = Buffer::default();
        buf.append(b"abc");
        assert_eq!(buf.retrieve_as_bytes(100), b"abc".to_vec());
        assert_eq!(buf.readable_bytes(), 0);
        // Over-consuming resets the cursors.
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn compaction_reuses_dead_prepend_space() {
        let mut buf = Buffer::default();
        buf.append(&vec![b'x'; 800]);
        buf.retrieve(600);
        let capacity_before = buf.buf.len();
        // 600 dead bytes in front; 224 writable. A 500-byte append fits after
        // compaction, so the backing store must not grow.
        buf.append(&vec![b'y'; 500]);
        assert_eq!(buf.buf.len(), capacity_before);
        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        check_balance(&buf);
    }

    #[test]
    fn grows_exactly_when_compaction_insufficient() {
        let mut buf = Buffer::default();
        buf.append(&vec![b'x'; 100]);
        buf.append(&vec![b'y'; 2000]);
        assert_eq!(buf.readable_bytes(), 2100);
        check_balance(&buf);
        assert_eq!(buf.retrieve_as_bytes(100), vec![b'x'; 100]);
        assert_eq!(buf.retrieve_all_as_bytes(), vec![b'y'; 2000]);
    }

    #[test]
    fn string_retrieval_is_lossy_utf8() {
        let mut buf = Buffer::default();
        buf.append(b"ping");
        assert_eq!(buf.retrieve_all_as_string(), "ping");
    }

    #[test]
    fn read_fd_fills_writable_region() {
        let mut file = tmpfile("swivel-buffer-small");
        file.write_all(&vec![7u8; 100]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = Buffer::default();
        let n = buf.read_fd(file.as_raw_fd()).unwrap();
        assert_eq!(n, 100);
        assert_eq!(buf.readable_bytes(), 100);
        assert_eq!(buf.peek(), &vec![7u8; 100][..]);
        check_balance(&buf);
    }

    #[test]
    fn read_fd_overflows_into_scratch() {
        // One readv against [1024 writable, 64 KiB scratch] moves 66560
        // bytes; the overflow lands through the append path.
        let total = INITIAL_SIZE + EXTRA_BUF_SIZE + 4096;
        let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let mut file = tmpfile("swivel-buffer-burst");
        file.write_all(&payload).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = Buffer::default();
        let n = buf.read_fd(file.as_raw_fd()).unwrap();
        assert_eq!(n, INITIAL_SIZE + EXTRA_BUF_SIZE);
        assert_eq!(buf.readable_bytes(), n);
        assert_eq!(buf.peek(), &payload[..n]);
        check_balance(&buf);
    }

    #[test]
    fn read_fd_reports_eof_as_zero() {
        let mut file = tmpfile("swivel-buffer-eof");
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = Buffer::default();
        assert_eq!(buf.read_fd(file.as_raw_fd()).unwrap(), 0);
    }

    fn tmpfile(tag: &str) -> File {
        let path = std::env::temp_dir().join(format!("{tag}-{}", std::process::id()));
        let file = File::options()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }
}
