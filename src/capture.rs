//! Bounded capture of compiler output streams.

/// Default number of trailing bytes retained from a compiler stream.
pub const DEFAULT_LOG_CAP: usize = 4096;

/// Keeps the last `cap` bytes fed to it, in arrival order.
///
/// Compiler logs are unbounded in principle; diagnostics live at the end
/// (the first error aborts the run), so the tail is what's worth keeping.
#[derive(Debug, Clone)]
pub struct LogTail {
    buf: Vec<u8>,
    cap: usize,
    total: u64,
}

impl LogTail {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            total: 0,
        }
    }

    /// Appends a chunk, discarding from the front once over capacity.
    pub fn append(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        if self.cap == 0 {
            return;
        }
        if chunk.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.cap..]);
            return;
        }
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            self.buf.drain(..excess);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Total bytes observed, including bytes already discarded.
    pub fn total_seen(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Consumes the tail into a lossily-decoded string for logging and
    /// response bodies.
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

impl Default for LogTail {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAP)
    }
}
