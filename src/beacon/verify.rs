//! Echo verification.
//!
//! The bytes a client sends back are compared against the payload repeated
//! forever. Reads may split or coalesce payloads arbitrarily, so the cursor
//! into the expected stream is carried across calls to [`EchoVerifier::feed`].

use bytes::Bytes;

/// Counters produced by the verifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EchoStats {
    /// Bytes that matched the expected stream.
    pub matched: u64,
    /// Bytes that did not.
    pub mismatched: u64,
    /// Whole payloads seen back to back without a mismatch.
    pub complete: u64,
}

impl EchoStats {
    fn add(&mut self, other: EchoStats) {
        self.matched += other.matched;
        self.mismatched += other.mismatched;
        self.complete += other.complete;
    }
}

/// Tracks position in the cyclic payload stream.
#[derive(Debug)]
pub struct EchoVerifier {
    payload: Bytes,
    cursor: usize,
    totals: EchoStats,
}

impl EchoVerifier {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            cursor: 0,
            totals: EchoStats::default(),
        }
    }

    /// Check a chunk of echoed bytes, returning the counts for this chunk.
    pub fn feed(&mut self, data: &[u8]) -> EchoStats {
        let mut delta = EchoStats::default();
        if self.payload.is_empty() {
            delta.mismatched = data.len() as u64;
            self.totals.add(delta);
            return delta;
        }

        for &byte in data {
            if byte == self.payload[self.cursor] {
                delta.matched += 1;
                self.cursor += 1;
                if self.cursor == self.payload.len() {
                    delta.complete += 1;
                    self.cursor = 0;
                }
            } else {
                delta.mismatched += 1;
                // Resync: the stray byte may itself start a new payload
                self.cursor = usize::from(byte == self.payload[0]);
            }
        }

        self.totals.add(delta);
        delta
    }

    /// Counts accumulated over the life of the verifier.
    pub fn totals(&self) -> EchoStats {
        self.totals
    }

    /// Offset into the payload of the next expected byte.
    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}
