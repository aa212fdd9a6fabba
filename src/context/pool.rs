use crossbeam::queue::SegQueue;

use super::Context;

/// Free list of Contexts shared by all connections.
///
/// Capacity is unbounded; the pool grows to the peak number of concurrent
/// requests and never shrinks.
#[derive(Default)]
pub struct ContextPool {
    free: SegQueue<Box<Context>>,
}

impl ContextPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> Box<Context> {
        self.free.pop().unwrap_or_else(|| Box::new(Context::new()))
    }

    /// Clears `ctx` and keeps it for reuse, unless it was detached.
    pub fn release(&self, mut ctx: Box<Context>) {
        if ctx.is_detached() {
            return;
        }
        ctx.clear();
        self.free.push(ctx);
    }

    /// Contexts currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_contexts_are_reused_and_cleared() {
        let pool = ContextPool::new();
        let mut ctx = pool.acquire();
        ctx.set_param("id", "7");
        ctx.set_value("k", 1u8);
        pool.release(ctx);
        assert_eq!(pool.idle(), 1);

        let ctx = pool.acquire();
        assert_eq!(pool.idle(), 0);
        assert_eq!(ctx.get_param("id"), None);
        assert!(ctx.value::<u8>("k").is_none());
    }

    #[test]
    fn detached_contexts_are_dropped() {
        let pool = ContextPool::new();
        let mut ctx = pool.acquire();
        ctx.detach();
        pool.release(ctx);
        assert_eq!(pool.idle(), 0);
    }
}
