//! Zero-copy byte aggregate used across the cache API.
//!
//! An [`IOBuffer`] is a logical byte sequence assembled from segments that
//! are either borrowed from the caller, owned by the buffer, or owned by
//! user code with a custom deleter.  Writes hand the cache borrowed
//! segments; reads hand the caller owned ones.  Copies are always explicit.

use std::sync::Arc;

/// A single contiguous span of bytes inside an [`IOBuffer`].
pub enum Segment<'a> {
    /// A read-only view whose lifetime is owned by the caller.
    Borrowed(&'a [u8]),
    /// Bytes owned by the buffer itself.
    Owned(Box<[u8]>),
    /// Bytes owned by user code, released through the attached deleter.
    UserOwned(UserData),
}

impl<'a> Segment<'a> {
    fn as_slice(&self) -> &[u8] {
        match self {
            Segment::Borrowed(s) => s,
            Segment::Owned(b) => b,
            Segment::UserOwned(u) => u.as_slice(),
        }
    }
}

/// A foreign allocation handed to the buffer together with its deleter.
pub struct UserData {
    ptr: *const u8,
    len: usize,
    deleter: Option<Box<dyn FnOnce() + Send>>,
}

// SAFETY: the bytes behind `ptr` are immutable for the lifetime of the
// segment and released only by the deleter, which runs exactly once on drop.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` bytes until the deleter runs;
        // the deleter only runs on drop.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for UserData {
    fn drop(&mut self) {
        if let Some(deleter) = self.deleter.take() {
            deleter();
        }
    }
}

/// A byte sequence composed of zero or more segments.
///
/// The buffer is movable but never implicitly copied; [`IOBuffer::clone`]
/// performs a deep copy into owned segments.
#[derive(Default)]
pub struct IOBuffer<'a> {
    segments: Vec<Segment<'a>>,
    len: usize,
}

impl<'a> IOBuffer<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of logical bytes across all segments.
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, segment: Segment<'a>) {
        self.len += segment.as_slice().len();
        self.segments.push(segment);
    }

    pub fn append_slice(&mut self, data: &'a [u8]) {
        self.append(Segment::Borrowed(data));
    }

    pub fn append_owned(&mut self, data: Box<[u8]>) {
        self.append(Segment::Owned(data));
    }

    /// Append a foreign allocation.  The deleter is invoked exactly once
    /// when the segment is dropped.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes, and the bytes must not
    /// be mutated or freed before the deleter runs.
    pub unsafe fn append_user_data(
        &mut self,
        ptr: *const u8,
        len: usize,
        deleter: Option<Box<dyn FnOnce() + Send>>,
    ) {
        self.append(Segment::UserOwned(UserData { ptr, len, deleter }));
    }

    /// Append a sub-range of a shared allocation without copying it.  The
    /// segment keeps the `Arc` alive for as long as the buffer holds it.
    pub fn append_shared(&mut self, data: Arc<[u8]>, offset: usize, len: usize) {
        assert!(offset + len <= data.len());
        let ptr = data[offset..].as_ptr();
        // SAFETY: the closure owns a clone of `data`, so the allocation
        // outlives the segment; `Arc<[u8]>` contents are immutable.
        unsafe {
            self.append_user_data(ptr, len, Some(Box::new(move || drop(data))));
        }
    }

    /// Move every segment of `other` onto the end of this buffer.
    pub fn append_buffer(&mut self, mut other: IOBuffer<'a>) {
        self.len += other.len;
        self.segments.append(&mut other.segments);
    }

    /// Copy the logical byte sequence into `dst`, returning the number of
    /// bytes written.  `dst` must be at least [`IOBuffer::size`] bytes.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        assert!(
            dst.len() >= self.len,
            "destination holds {} bytes, buffer holds {}",
            dst.len(),
            self.len
        );
        let mut written = 0;
        for segment in &self.segments {
            let src = segment.as_slice();
            dst[written..written + src.len()].copy_from_slice(src);
            written += src.len();
        }
        written
    }

    /// Copy out into a fresh contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.copy_to(&mut out);
        out
    }
}

impl Clone for IOBuffer<'_> {
    /// Deep copy: every segment is materialized into an owned allocation.
    fn clone(&self) -> Self {
        let mut out = IOBuffer::new();
        for segment in &self.segments {
            out.append_owned(segment.as_slice().to_vec().into_boxed_slice());
        }
        out
    }
}

impl From<Vec<u8>> for IOBuffer<'static> {
    fn from(data: Vec<u8>) -> Self {
        let mut buf = IOBuffer::new();
        buf.append_owned(data.into_boxed_slice());
        buf
    }
}

impl<'a> From<&'a [u8]> for IOBuffer<'a> {
    fn from(data: &'a [u8]) -> Self {
        let mut buf = IOBuffer::new();
        buf.append_slice(data);
        buf
    }
}

impl std::fmt::Debug for IOBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IOBuffer")
            .field("segments", &self.segments.len())
            .field("len", &self.len)
            .finish()
    }
}
