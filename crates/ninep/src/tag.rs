//! Request tag allocation for the client.
//!
//! A tag identifies one outstanding request on a connection. The pool hands out
//! values from `[0, 0xFFFE)`; when it is empty `acquire` waits until some other
//! request gives its tag back.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;

use crate::{error::Error, fcall::NUM_TAGS, utils::Result};

/// Bounded pool of request tags.
#[derive(Debug)]
pub struct TagPool {
    permits: Semaphore,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    free: VecDeque<u16>,
    in_use: Vec<bool>,
}

impl TagPool {
    /// A pool holding all `NUM_TAGS` tags.
    pub fn new() -> TagPool {
        Self::with_capacity(NUM_TAGS)
    }

    /// A pool holding tags `0..capacity`, capped at `NUM_TAGS`.
    pub fn with_capacity(capacity: usize) -> TagPool {
        let capacity = capacity.min(NUM_TAGS);
        TagPool {
            permits: Semaphore::new(capacity),
            state: Mutex::new(PoolState {
                free: (0..capacity).map(|t| t as u16).collect(),
                in_use: vec![false; capacity],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a tag, waiting while every tag is outstanding.
    ///
    /// Fails with `Error::Dead` once the pool has been closed.
    pub async fn acquire(&self) -> Result<u16> {
        let permit = self.permits.acquire().await.map_err(|_| Error::Dead)?;
        permit.forget();

        let mut state = self.lock();
        let tag = match state.free.pop_front() {
            Some(tag) => tag,
            None => unreachable!("tag permits out of step with the free list"),
        };
        state.in_use[tag as usize] = true;
        Ok(tag)
    }

    /// Give a tag back to the pool.
    ///
    /// # Panics
    /// If `tag` is not currently outstanding, including a second release of the same tag.
    pub fn release(&self, tag: u16) {
        {
            let mut state = self.lock();
            match state.in_use.get_mut(tag as usize) {
                Some(slot) if *slot => *slot = false,
                _ => panic!("release of tag {:#06x} which is not outstanding", tag),
            }
            state.free.push_back(tag);
        }
        self.permits.add_permits(1);
    }

    /// Wake every waiter with `Error::Dead` and refuse further acquires.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Number of tags that can be acquired without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for TagPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn full_pool_never_hands_out_notag() {
        let pool = TagPool::new();
        assert_eq!(pool.available(), NUM_TAGS);

        let mut seen = vec![false; 1 << 16];
        for _ in 0..NUM_TAGS {
            let tag = pool.acquire().await.unwrap();
            assert!(!seen[tag as usize], "tag {} handed out twice", tag);
            seen[tag as usize] = true;
        }
        assert!(!seen[crate::NOTAG as usize]);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn exhausted_pool_blocks_until_release() {
        let pool = Arc::new(TagPool::new());
        let mut held = Vec::with_capacity(NUM_TAGS);
        for _ in 0..NUM_TAGS {
            held.push(pool.acquire().await.unwrap());
        }

        assert!(timeout(WAIT, pool.acquire()).await.is_err());

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(WAIT).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        let released = held.pop().unwrap();
        pool.release(released);
        tokio::time::sleep(WAIT).await;

        let finished = [first.is_finished(), second.is_finished()];
        assert_eq!(finished.iter().filter(|f| **f).count(), 1);

        let (done, waiting) = if finished[0] {
            (first, second)
        } else {
            (second, first)
        };
        assert_eq!(done.await.unwrap().unwrap(), released);
        waiting.abort();
    }

    #[tokio::test]
    async fn released_tags_are_reused() {
        let pool = TagPool::with_capacity(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a, b);
        pool.release(a);
        assert_eq!(pool.acquire().await.unwrap(), a);
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let pool = Arc::new(TagPool::with_capacity(1));
        let _held = pool.acquire().await.unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(WAIT).await;
        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Dead)));
    }

    #[test]
    #[should_panic(expected = "not outstanding")]
    fn double_release_panics() {
        let pool = TagPool::with_capacity(4);
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let tag = rt.block_on(pool.acquire()).unwrap();
        pool.release(tag);
        pool.release(tag);
    }

    #[test]
    #[should_panic(expected = "not outstanding")]
    fn releasing_unacquired_tag_panics() {
        TagPool::with_capacity(4).release(3);
    }
}
