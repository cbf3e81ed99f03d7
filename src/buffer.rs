use std::io;
use std::os::fd::RawFd;

/// Number of bytes reserved at the front of every buffer so a fixed-size
/// header can be prepended without copying.
const CHEAP_PREPEND: usize = 8;
/// Initial size of the readable/writable portion.
const INITIAL_SIZE: usize = 1024;

/// Size of the stack-allocated spill buffer used by [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

/// A growable read/write byte buffer.
///
/// The backing storage is partitioned by two indices, `reader <= writer`,
/// into three regions:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (content)    |                  |
/// +-------------------+------------------+------------------+
/// 0       <=       reader     <=      writer      <=      len
/// ```
///
/// Incoming socket data is appended at `writer`; the application consumes
/// from `reader`. When the buffer drains completely both indices snap back
/// to the prepend reserve, so a long-lived connection does not creep
/// rightwards through its storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    storage: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    /// Creates an empty buffer with the default initial capacity.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Creates an empty buffer with room for `initial` bytes before the
    /// first growth.
    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            storage: vec![0; CHEAP_PREPEND + initial],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available for reading.
    pub fn readable(&self) -> usize {
        self.writer - self.reader
    }

    /// Number of bytes that can be written without growing.
    pub fn writable(&self) -> usize {
        self.storage.len() - self.writer
    }

    /// Number of bytes in front of the readable region.
    pub fn prependable(&self) -> usize {
        self.reader
    }

    /// Borrows the readable region. Invalidated by any mutating call.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.reader..self.writer]
    }

    /// Marks `len` readable bytes as consumed.
    ///
    /// Consuming the entire readable region resets both indices to the
    /// prepend reserve.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`readable`](Buffer::readable).
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable());
        if len < self.readable() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Discards all readable bytes and resets the indices.
    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Copies the entire readable region out as a `String`, then resets.
    ///
    /// Invalid UTF-8 is replaced, as the byte stream carries no encoding
    /// guarantee.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable())
    }

    /// Copies the first `len` readable bytes out as a `String`, consuming
    /// them.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable());
        let result = String::from_utf8_lossy(&self.storage[self.reader..self.reader + len])
            .into_owned();
        self.retrieve(len);
        result
    }

    /// Appends `data` to the buffer, growing storage if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Writes `data` into the prepend reserve, immediately in front of the
    /// readable region.
    ///
    /// # Panics
    ///
    /// Panics if the reserve holds fewer than `data.len()` bytes.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable());
        self.reader -= data.len();
        self.storage[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// Guarantees at least `len` writable bytes.
    ///
    /// If the slack in front of the readable region plus the writable tail
    /// already covers `len`, the readable bytes are compacted back to the
    /// prepend reserve instead of growing the allocation.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable() + self.prependable() < len + CHEAP_PREPEND {
            self.storage.resize(self.writer + len, 0);
        } else {
            let readable = self.readable();
            self.storage.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Reads from `fd` directly into the buffer using a scatter read.
    ///
    /// A 64 KiB stack buffer is passed as a second `iovec` whenever the
    /// writable region is smaller than that, so one `readv` drains a bursty
    /// socket without pre-growing every connection's buffer; whatever lands
    /// in the spill is appended afterwards. Returns the total number of
    /// bytes read.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable();

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.storage.as_mut_ptr().add(self.writer) } as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra_buf.len(),
            },
        ];
        let iovcnt = if writable < extra_buf.len() { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.storage.len();
            self.append(&extra_buf[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region to `fd` with a single `write`.
    ///
    /// The consumed prefix is *not* retrieved; the caller calls
    /// [`retrieve`](Buffer::retrieve) with the returned count.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscall!(write(
            fd,
            unsafe { self.storage.as_ptr().add(self.reader) } as *const libc::c_void,
            self.readable(),
        ))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};

    fn invariants(buf: &Buffer) {
        assert!(buf.reader <= buf.writer);
        assert!(buf.writer <= buf.storage.len());
        assert_eq!(
            buf.readable() + buf.writable() + buf.prependable(),
            buf.storage.len()
        );
    }

    #[test]
    fn initial_layout() {
        let buf = Buffer::new();
        assert_eq!(buf.readable(), 0);
        assert_eq!(buf.writable(), INITIAL_SIZE);
        assert_eq!(buf.prependable(), CHEAP_PREPEND);
        invariants(&buf);
    }

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable(), 5);
        assert_eq!(buf.peek(), b"hello");
        invariants(&buf);

        buf.retrieve(2);
        assert_eq!(buf.peek(), b"llo");
        assert_eq!(buf.prependable(), CHEAP_PREPEND + 2);
        invariants(&buf);

        buf.retrieve(3);
        assert_eq!(buf.readable(), 0);
        assert_eq!(buf.prependable(), CHEAP_PREPEND);
        invariants(&buf);
    }

    #[test]
    fn round_trip_concatenation() {
        let mut buf = Buffer::new();
        for chunk in [&b"one"[..], b"", b"two", b"three"] {
            buf.append(chunk);
        }
        assert_eq!(buf.retrieve_all_as_string(), "onetwothree");
        assert_eq!(buf.readable(), 0);
        invariants(&buf);
    }

    #[test]
    fn grows_when_needed() {
        let mut buf = Buffer::new();
        let data = vec![b'x'; INITIAL_SIZE + 100];
        buf.append(&data);
        assert_eq!(buf.readable(), data.len());
        invariants(&buf);
        assert_eq!(buf.retrieve_all_as_string().len(), data.len());
    }

    #[test]
    fn compacts_instead_of_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(700);
        // 100 readable; slack in front is 700. Appending 400 fits after a
        // compaction without touching the allocation.
        let len_before = buf.storage.len();
        buf.append(&vec![b'b'; 400]);
        assert_eq!(buf.storage.len(), len_before);
        assert_eq!(buf.readable(), 500);
        let s = buf.retrieve_all_as_string();
        assert_eq!(&s[..100], "a".repeat(100));
        assert_eq!(&s[100..], "b".repeat(400));
        invariants(&buf);
    }

    #[test]
    fn ensure_writable_preserves_content() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.ensure_writable(4096);
        assert!(buf.writable() >= 4096);
        assert_eq!(buf.peek(), b"payload");
        invariants(&buf);
    }

    #[test]
    fn prepend_into_reserve() {
        let mut buf = Buffer::new();
        buf.append(b"body");
        let header = 4u32.to_be_bytes();
        buf.prepend(&header);
        assert_eq!(buf.prependable(), CHEAP_PREPEND - 4);
        assert_eq!(buf.peek(), b"\x00\x00\x00\x04body");
        invariants(&buf);
    }

    #[test]
    fn read_fd_spills_into_extra_buf() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let payload = vec![b'z'; 5000];
        let n = unsafe {
            libc::write(wr, payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(n as usize, payload.len());

        // A fresh buffer has only INITIAL_SIZE writable, so this exercises
        // both iovecs.
        let mut buf = Buffer::new();
        let read = buf.read_fd(rd).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(buf.peek(), &payload[..]);
        invariants(&buf);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn write_fd_then_retrieve() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let mut buf = Buffer::new();
        buf.append(b"over the wire");
        let n = buf.write_fd(wr).unwrap();
        buf.retrieve(n);
        assert_eq!(n, 13);
        assert_eq!(buf.readable(), 0);

        let mut out = [0u8; 32];
        let read = unsafe { libc::read(rd, out.as_mut_ptr() as *mut libc::c_void, out.len()) };
        assert_eq!(&out[..read as usize], b"over the wire");

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
