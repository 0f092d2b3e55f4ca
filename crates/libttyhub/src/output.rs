use std::collections::VecDeque;
use std::time::SystemTime;

/// Replay history cap. Oldest chunks are silently dropped past this.
pub const MAX_CHUNKS: usize = 1000;

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub seq: u64,
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
}

/// Bounded FIFO of the most recent output chunks for one session.
///
/// Mutated only by the session's own output path and read during
/// attach-replay; both run under the registry lock.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    max_chunks: usize,
    next_seq: u64,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_CHUNKS)
    }

    pub fn with_capacity(max_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(max_chunks.max(1).min(MAX_CHUNKS)),
            max_chunks: max_chunks.max(1),
            next_seq: 1,
        }
    }

    pub fn push(&mut self, data: Vec<u8>) -> OutputChunk {
        let chunk = OutputChunk {
            seq: self.next_seq,
            data,
            timestamp: SystemTime::now(),
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.chunks.push_back(chunk.clone());
        while self.chunks.len() > self.max_chunks {
            let _ = self.chunks.pop_front();
        }
        chunk
    }

    /// All retained chunks, in production order.
    pub fn replay(&self) -> Vec<OutputChunk> {
        self.chunks.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}
