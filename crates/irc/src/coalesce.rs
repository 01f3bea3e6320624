//! Coalesce streamed response fragments into larger blocks.
//!
//! A block is flushed when the buffered text reaches `minChars` or when no
//! fragment arrived for `idleMs`, whichever comes first. Completion always
//! flushes a final block. Cancellation drops whatever is still buffered.

use {
    moltis_channels::plugin::{StreamEvent, StreamReceiver},
    tokio::time::{Duration, Instant},
    tokio_util::sync::CancellationToken,
};

use crate::config::CoalesceConfig;

/// A unit of text ready for chunking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedBlock {
    /// Position within the response, starting at 0.
    pub index: usize,
    pub text: String,
    /// Set on the block emitted at completion.
    pub is_final: bool,
}

/// Buffering and size-trigger logic, free of any timer.
#[derive(Debug)]
pub struct CoalesceBuffer {
    pending: String,
    pending_chars: usize,
    min_chars: usize,
    /// When off, nothing is flushed before completion.
    streaming: bool,
    next_index: usize,
}

impl CoalesceBuffer {
    pub fn new(config: CoalesceConfig, streaming: bool) -> Self {
        Self {
            pending: String::new(),
            pending_chars: 0,
            min_chars: config.min_chars.max(1),
            streaming,
            next_index: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Append a fragment. Returns a block when the size trigger fires.
    pub fn push(&mut self, fragment: &str) -> Option<CoalescedBlock> {
        self.pending.push_str(fragment);
        self.pending_chars += fragment.chars().count();
        if self.streaming && self.pending_chars >= self.min_chars {
            Some(self.take(false))
        } else {
            None
        }
    }

    /// Idle trigger. Returns nothing when the buffer is empty or streaming
    /// is off.
    pub fn flush_idle(&mut self) -> Option<CoalescedBlock> {
        (self.streaming && self.has_pending()).then(|| self.take(false))
    }

    /// Completion: always yields exactly one final block, possibly empty.
    pub fn finish(&mut self) -> CoalescedBlock {
        self.take(true)
    }

    /// Cancellation: drop buffered text without emitting it.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.pending_chars = 0;
    }

    fn take(&mut self, is_final: bool) -> CoalescedBlock {
        let block = CoalescedBlock {
            index: self.next_index,
            text: std::mem::take(&mut self.pending),
            is_final,
        };
        self.pending_chars = 0;
        self.next_index += 1;
        block
    }
}

/// Drives a [`CoalesceBuffer`] from a response stream with an idle timer.
#[derive(Debug)]
pub struct StreamCoalescer {
    buffer: CoalesceBuffer,
    idle: Duration,
    deadline: Option<Instant>,
    finished: bool,
}

impl StreamCoalescer {
    pub fn new(config: CoalesceConfig, streaming: bool) -> Self {
        Self {
            buffer: CoalesceBuffer::new(config, streaming),
            idle: config.idle(),
            deadline: None,
            finished: false,
        }
    }

    /// Wait for the next block.
    ///
    /// Returns `None` once the final block has been returned, or when the
    /// response was cancelled (explicitly, through `cancel`, or by the
    /// sender going away without `Done`).
    pub async fn next_block(
        &mut self,
        stream: &mut StreamReceiver,
        cancel: &CancellationToken,
    ) -> Option<CoalescedBlock> {
        if self.finished {
            return None;
        }
        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                () = cancel.cancelled() => return self.abort(),
                event = stream.recv() => match event {
                    Some(StreamEvent::Delta(fragment)) => {
                        if let Some(block) = self.buffer.push(&fragment) {
                            self.deadline = None;
                            return Some(block);
                        }
                        if self.buffer.streaming && self.buffer.has_pending() {
                            self.deadline = Some(Instant::now() + self.idle);
                        }
                    },
                    Some(StreamEvent::Done) => {
                        self.finished = true;
                        self.deadline = None;
                        return Some(self.buffer.finish());
                    },
                    Some(StreamEvent::Cancelled) | None => return self.abort(),
                },
                () = sleep_until(deadline) => {
                    self.deadline = None;
                    if let Some(block) = self.buffer.flush_idle() {
                        return Some(block);
                    }
                },
            }
        }
    }

    fn abort(&mut self) -> Option<CoalescedBlock> {
        self.finished = true;
        self.deadline = None;
        self.buffer.discard();
        None
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
