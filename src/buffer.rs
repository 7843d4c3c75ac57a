// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Growable byte buffer with reader/writer cursors and a scatter-read helper.
//!
//! Layout is `[prepend][readable][writable]`, where `prepend` is a small
//! reserved prefix (`CHEAP_PREPEND` bytes) that lets a caller stitch a length
//! prefix or similar onto an already-filled buffer without copying the body.

use std::alloc::{self, Layout};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

/// Reserved prefix, mirroring the reference implementation's `kCheapPrepend`.
const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity past the prepend region.
const INITIAL_SIZE: usize = 1024;
/// Stack scratch space used to avoid a second syscall when a read overflows
/// the buffer's writable region.
const EXTRA_BUF_SIZE: usize = 65536;

/// A contiguous, growable byte buffer with reader/writer cursors.
///
/// Invariant: `0 <= CHEAP_PREPEND <= read <= write <= cap`.
pub struct Buffer {
    ptr: NonNull<u8>,
    cap: usize,
    read: usize,
    write: usize,
}

// Safety: Buffer owns its allocation exclusively and contains no interior
// mutability or non-Send/Sync pointers besides the raw allocation itself.
unsafe impl Send for Buffer {}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Creates a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with at least `initial_size` writable bytes past the
    /// prepend region.
    pub fn with_capacity(initial_size: usize) -> Self {
        let cap = (CHEAP_PREPEND + initial_size).next_power_of_two();
        let layout = Layout::array::<u8>(cap).unwrap();
        // Safety: layout is non-zero-sized; allocation failure is handled below.
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };

        Buffer {
            ptr,
            cap,
            read: CHEAP_PREPEND,
            write: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable(&self) -> usize {
        self.write - self.read
    }

    /// Number of bytes that can be written without growing.
    pub fn writable(&self) -> usize {
        self.cap - self.write
    }

    /// Number of bytes free before the read cursor (the prepend region, plus
    /// anything already consumed).
    pub fn prependable(&self) -> usize {
        self.read
    }

    /// Borrow of the unread bytes.
    pub fn peek(&self) -> &[u8] {
        // Safety: `[read, write)` is always within the allocation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(self.read), self.readable()) }
    }

    /// Borrow of the first `n` unread bytes. Panics if fewer than `n` bytes
    /// are readable.
    pub fn peek_n(&self, n: usize) -> &[u8] {
        assert!(n <= self.readable());
        &self.peek()[..n]
    }

    /// Interprets the first `n` unread bytes as UTF-8, if valid.
    pub fn peek_str(&self, n: usize) -> Option<&str> {
        std::str::from_utf8(self.peek_n(n)).ok()
    }

    /// Advances the read cursor by `n` bytes, discarding them.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.readable());
        self.read += n;
        if self.read == self.write {
            // Nothing left to read: reclaim the whole region for writing.
            self.read = CHEAP_PREPEND;
            self.write = CHEAP_PREPEND;
        }
    }

    /// Discards all readable bytes.
    pub fn consume_all(&mut self) {
        self.read = CHEAP_PREPEND;
        self.write = CHEAP_PREPEND;
    }

    /// Index of the first `\r\n` in the readable region, relative to the
    /// start of that region, if present.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find(b"\r\n")
    }

    /// Index of the first occurrence of `needle` in the readable region,
    /// relative to the start of that region, if present.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        self.peek()
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Appends `data` to the writable region, growing or compacting as
    /// required. Never fails short of an allocator abort.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        // Safety: `ensure_writable` guarantees `data.len() <= writable()`.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(self.write), data.len());
        }
        self.write += data.len();
    }

    /// Ensures at least `len` bytes are writable, compacting in place when
    /// the combination of prepend and writable space suffices, else growing.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() >= len {
            return;
        }

        if self.prependable() - CHEAP_PREPEND + self.writable() >= len {
            self.compact();
        } else {
            self.grow_to_capacity(self.write + len);
        }
    }

    /// Shifts the readable region down to the fixed prepend offset, freeing
    /// space at the end without allocating.
    fn compact(&mut self) {
        let readable = self.readable();
        if readable > 0 {
            // Safety: source and destination are both within the allocation;
            // regions may overlap so `copy` (not `copy_nonoverlapping`) is used.
            unsafe {
                ptr::copy(
                    self.ptr.as_ptr().add(self.read),
                    self.ptr.as_ptr().add(CHEAP_PREPEND),
                    readable,
                );
            }
        }
        self.read = CHEAP_PREPEND;
        self.write = CHEAP_PREPEND + readable;
    }

    fn grow_to_capacity(&mut self, capacity: usize) {
        assert!(capacity <= isize::MAX as usize);
        let new_cap = capacity.next_power_of_two().min(isize::MAX as usize);

        let old_layout = Layout::array::<u8>(self.cap).unwrap();
        let new_layout = Layout::array::<u8>(new_cap).unwrap();

        // Safety: `old_layout` matches the layout used for the current
        // allocation; allocation failure is handled below.
        let new_ptr = unsafe { alloc::realloc(self.ptr.as_ptr(), old_layout, new_layout.size()) };
        self.ptr = match NonNull::new(new_ptr) {
            Some(p) => p,
            None => alloc::handle_alloc_error(new_layout),
        };
        self.cap = new_cap;
    }

    /// Reads available bytes from `fd` directly into the buffer using a
    /// single scatter read (`readv`) across the buffer's writable region and
    /// a 64 KiB stack extra buffer, so a single big read doesn't force
    /// repeated reallocation. Returns the number of bytes read, `0` on EOF,
    /// and propagates any I/O error other than "would block" to the caller.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable();

        let mut iov = [
            libc::iovec {
                iov_base: self.write_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra_buf.len(),
            },
        ];

        // Safety: both iovecs point to valid, writable memory for their
        // declared lengths for the duration of this call.
        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iov.len() as i32) };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;

        if n <= writable {
            self.write += n;
        } else {
            self.write = self.cap;
            let overflow = n - writable;
            self.append(&extra_buf[..overflow]);
        }

        Ok(n)
    }

    fn write_ptr(&self) -> *mut u8 {
        // Safety: offset stays within the allocation by construction.
        unsafe { self.ptr.as_ptr().add(self.write) }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let layout = Layout::array::<u8>(self.cap).unwrap();
        // Safety: `self.ptr`/`self.cap` describe the buffer's one live allocation.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("cap", &self.cap)
            .field("read", &self.read)
            .field("write", &self.write)
            .field("readable", &self.readable())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_buffer_has_no_readable_bytes() {
        let buf = Buffer::new();
        assert_eq!(0, buf.readable());
        assert_eq!(CHEAP_PREPEND, buf.prependable());
    }

    #[test]
    fn append_then_peek_returns_written_bytes() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(b"hello", buf.peek());
    }

    #[test]
    fn consume_advances_read_cursor() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        buf.consume(6);
        assert_eq!(b"world", buf.peek());
    }

    #[test]
    fn consuming_everything_resets_cursors_to_prepend() {
        let mut buf = Buffer::new();
        buf.append(b"hi");
        buf.consume(2);
        assert_eq!(0, buf.readable());
        assert_eq!(CHEAP_PREPEND, buf.prependable());
    }

    #[test]
    fn find_crlf_locates_terminator() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(Some(14), buf.find_crlf());
    }

    #[test]
    fn find_crlf_returns_none_when_absent() {
        let mut buf = Buffer::new();
        buf.append(b"no terminator here");
        assert_eq!(None, buf.find_crlf());
    }

    #[test]
    fn append_beyond_capacity_grows_without_losing_data() {
        let mut buf = Buffer::with_capacity(4);
        let data = vec![b'x'; 10_000];
        buf.append(&data);
        assert_eq!(data.len(), buf.readable());
        assert_eq!(&data[..], buf.peek());
    }

    #[test]
    fn compaction_reuses_space_instead_of_growing() {
        let mut buf = Buffer::with_capacity(64);
        buf.append(&vec![b'a'; 40]);
        buf.consume(40);
        let cap_before = buf.cap;
        // Enough room once compacted (prepend + writable), so no growth should occur.
        buf.append(&vec![b'b'; 40]);
        assert_eq!(cap_before, buf.cap);
        assert_eq!(&vec![b'b'; 40][..], buf.peek());
    }

    #[test]
    fn readable_plus_prependable_plus_writable_equals_capacity() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"some bytes");
        buf.consume(3);
        assert_eq!(buf.cap, buf.prependable() + buf.readable() + buf.writable());
    }
}
