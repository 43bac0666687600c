//! The per-connection pending-command queue: commands that can't be
//! dispatched inline wait here until the dispatch side drains them.
//! `PipelineMessage` owns a copy of its argument bytes since the input
//! buffer they were parsed from keeps moving, and completed messages are
//! recycled through a thread-local freelist to avoid reallocating the
//! argument vector on every pipelined burst.

use std::cell::RefCell;
use std::collections::VecDeque;

/// A parsed-but-not-yet-dispatched command, queued because pipelining was
/// evident when it arrived.
pub struct PipelineMessage {
    pub args: Vec<Vec<u8>>,
    byte_len: usize,
}

impl PipelineMessage {
    pub fn new(args: Vec<Vec<u8>>) -> Self {
        let byte_len = args.iter().map(|a| a.len()).sum();
        PipelineMessage { args, byte_len }
    }

    /// Builds a message from `parsed`, reusing a pooled message's backing
    /// vector when one is available.
    pub fn acquire(mut parsed: Vec<Vec<u8>>) -> Self {
        POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            match pool.free.pop() {
                Some(mut msg) => {
                    pool.pooled_bytes = pool.pooled_bytes.saturating_sub(msg.byte_len);
                    msg.args.clear();
                    msg.args.append(&mut parsed);
                    msg.byte_len = msg.args.iter().map(|a| a.len()).sum();
                    msg
                }
                None => PipelineMessage::new(parsed),
            }
        })
    }

    /// Returns a completed message to the thread-local pool, unless the
    /// pool is already at `cache_limit` bytes.
    pub fn recycle(self, cache_limit: usize) {
        POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.pooled_bytes + self.byte_len <= cache_limit {
                pool.pooled_bytes += self.byte_len;
                pool.free.push(self);
            }
        });
    }

    /// Called on every inline dispatch. When a thread's connections are
    /// predominantly inline, the pool is idle capital; this releases one
    /// pooled message per `connections_on_thread` inline dispatches so the
    /// freelist drains gradually instead of all at once.
    pub fn note_inline_dispatch(connections_on_thread: usize) {
        POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            pool.inline_streak += 1;
            if pool.inline_streak as usize >= connections_on_thread.max(1) {
                pool.inline_streak = 0;
                if let Some(msg) = pool.free.pop() {
                    pool.pooled_bytes = pool.pooled_bytes.saturating_sub(msg.byte_len);
                }
            }
        });
    }

    #[cfg(test)]
    fn pooled_count() -> usize {
        POOL.with(|pool| pool.borrow().free.len())
    }
}

struct MessagePool {
    free: Vec<PipelineMessage>,
    pooled_bytes: usize,
    inline_streak: u32,
}

thread_local! {
    static POOL: RefCell<MessagePool> = RefCell::new(MessagePool {
        free: Vec::new(),
        pooled_bytes: 0,
        inline_streak: 0,
    });
}

/// Default queue memory ceiling before the input side is asked to pause.
pub const DEFAULT_QUEUE_BYTE_CEILING: usize = 5 * 1024 * 1024;

/// Queue length above which the input fiber yields one round-trip before
/// reading further.
pub const YIELD_QUEUE_LEN: usize = 10;

pub struct PendingQueue {
    messages: VecDeque<PipelineMessage>,
    queued_bytes: usize,
    byte_ceiling: usize,
}

impl PendingQueue {
    pub fn new(byte_ceiling: usize) -> Self {
        PendingQueue { messages: VecDeque::new(), queued_bytes: 0, byte_ceiling }
    }

    pub fn push(&mut self, msg: PipelineMessage) {
        self.queued_bytes += msg.byte_len;
        self.messages.push_back(msg);
    }

    pub fn pop(&mut self) -> Option<PipelineMessage> {
        let msg = self.messages.pop_front()?;
        self.queued_bytes -= msg.byte_len;
        Some(msg)
    }

    pub fn peek(&self) -> Option<&PipelineMessage> {
        self.messages.front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn over_byte_ceiling(&self) -> bool {
        self.queued_bytes > self.byte_ceiling
    }

    pub fn should_yield(&self) -> bool {
        self.messages.len() > YIELD_QUEUE_LEN
    }
}

/// The inline-vs-async decision: dispatch inline iff there's no unparsed
/// tail in the read buffer, no async dispatch already in flight, the
/// pending queue is empty, and the connection has no active subscriptions
/// that might interleave out-of-band push frames.
pub fn should_dispatch_inline(
    has_unparsed_tail: bool,
    async_dispatch_in_flight: bool,
    queue: &PendingQueue,
    has_active_subscriptions: bool,
) -> bool {
    !has_unparsed_tail && !async_dispatch_in_flight && queue.is_empty() && !has_active_subscriptions
}
