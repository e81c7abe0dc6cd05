//! Small shared helpers: stable hashing and string trimming.

/// Incremental FNV-1a 64-bit hasher.
///
/// Used for the source-tree fingerprint, where the manifest is streamed in
/// piece by piece instead of being concatenated into one buffer first.
#[derive(Debug, Clone)]
pub struct StreamingHash {
    state: u64,
}

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

impl StreamingHash {
    pub fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state ^= *byte as u64;
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn update_u64(&mut self, value: u64) {
        self.update(&value.to_le_bytes());
    }

    /// Finish and render as a fixed-width hex digest.
    pub fn digest(&self) -> String {
        format!("{:016x}", self.state)
    }
}

impl Default for StreamingHash {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot hash of a byte slice.
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = StreamingHash::new();
    hasher.update(content);
    hasher.digest()
}

/// Trim a string to `max` characters, marking the cut with an ellipsis.
/// Used for note fields and command output tails, which are unbounded.
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }
    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}
