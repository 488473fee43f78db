pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Per-connection receive state: a fixed-size chunk that each read fills,
/// and the accumulator every chunk is appended to.
#[derive(Debug)]
pub struct ConnectionBuffer {
    chunk: Box<[u8]>,
    accumulated: Vec<u8>,
}

impl ConnectionBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunk: vec![0u8; capacity.max(1)].into_boxed_slice(),
            accumulated: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.chunk.len()
    }

    pub(crate) fn chunk_mut(&mut self) -> &mut [u8] {
        &mut self.chunk
    }

    /// Appends the first `n` bytes of the chunk to the accumulator.
    pub(crate) fn commit(&mut self, n: usize) {
        self.accumulated.extend_from_slice(&self.chunk[..n]);
    }

    pub fn accumulated(&self) -> &[u8] {
        &self.accumulated
    }

    pub fn len(&self) -> usize {
        self.accumulated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulated.is_empty()
    }

    pub fn into_accumulated(self) -> Vec<u8> {
        self.accumulated
    }
}

impl Default for ConnectionBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}
