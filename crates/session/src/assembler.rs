use std::time::{Duration, Instant};

pub const DEFAULT_FLUSH_MIN_CHARS: usize = 10;

/// When buffered stream text is released into the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub min_chars: usize,
    /// Also flush once this much time passed since the previous flush.
    pub max_interval: Option<Duration>,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            min_chars: DEFAULT_FLUSH_MIN_CHARS,
            max_interval: None,
        }
    }
}

impl FlushPolicy {
    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }
}

/// Coalesces streamed text deltas so each flush is a single state mutation.
#[derive(Debug)]
pub struct ChunkAssembler {
    policy: FlushPolicy,
    buffer: String,
    buffered_chars: usize,
    last_flush: Instant,
}

impl ChunkAssembler {
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            buffer: String::new(),
            buffered_chars: 0,
            last_flush: Instant::now(),
        }
    }

    /// Buffers `text` and returns the coalesced delta once the policy allows a flush.
    pub fn push(&mut self, text: &str) -> Option<String> {
        self.buffer.push_str(text);
        self.buffered_chars += text.chars().count();

        if self.should_flush(Instant::now()) {
            return self.take();
        }
        None
    }

    /// Leftover text at the end of the stream.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn should_flush(&self, now: Instant) -> bool {
        if self.buffer.is_empty() {
            return false;
        }

        self.buffered_chars >= self.policy.min_chars
            || self
                .policy
                .max_interval
                .is_some_and(|interval| now.duration_since(self.last_flush) >= interval)
    }

    fn take(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }

        self.buffered_chars = 0;
        self.last_flush = Instant::now();
        Some(std::mem::take(&mut self.buffer))
    }
}
