// Shared helpers for the scraping sources and the worker pool.

use std::future::Future;
use std::time::Duration;

/// Browser identities handed to workers so parallel sessions don't look alike.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36 Edg/122.0.0.0",
];

/// Distinct user-agent for worker `index`. Distinct for every index, even
/// past the size of the built-in list.
pub fn worker_user_agent(index: usize) -> String {
    let base = USER_AGENTS[index % USER_AGENTS.len()];
    format!("{base} cepgeo-worker/{index}")
}

/// How often and how long to re-check a condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    /// Multiplier applied to the interval after each miss. 1.0 = fixed.
    pub backoff: f64,
}

impl PollPolicy {
    pub const fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff: 1.0,
        }
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Run `probe` until it yields a value or the attempt budget runs out.
/// `probe` receives the zero-based attempt number. No sleep follows the
/// final attempt.
pub async fn poll_until<T, F, Fut>(policy: PollPolicy, mut probe: F) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let mut delay = policy.interval;
    for attempt in 0..policy.max_attempts {
        if let Some(value) = probe(attempt).await {
            return Some(value);
        }
        if attempt + 1 < policy.max_attempts {
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(policy.backoff.max(1.0));
        }
    }
    None
}

/// Round-robin split of `items` into `shards` disjoint lists, by position.
/// Item `i` lands in shard `i % shards`; order within a shard is preserved.
pub fn partition<T: Clone>(items: &[T], shards: usize) -> Vec<Vec<T>> {
    let shards = shards.max(1);
    let mut out: Vec<Vec<T>> = (0..shards)
        .map(|_| Vec::with_capacity(items.len() / shards + 1))
        .collect();
    for (i, item) in items.iter().enumerate() {
        out[i % shards].push(item.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn worker_user_agents_are_distinct() {
        let agents: HashSet<String> = (0..10).map(worker_user_agent).collect();
        assert_eq!(agents.len(), 10);
    }

    #[test]
    fn partition_covers_every_item_exactly_once() {
        let items: Vec<u32> = (0..23).collect();
        for n in 1..=7 {
            let shards = partition(&items, n);
            assert_eq!(shards.len(), n);
            let mut seen: Vec<u32> = shards.iter().flatten().copied().collect();
            seen.sort();
            assert_eq!(seen, items, "n = {n}");
        }
    }

    #[test]
    fn partition_is_round_robin_by_position() {
        let items = vec!["a", "b", "c", "d", "e"];
        let shards = partition(&items, 2);
        assert_eq!(shards[0], vec!["a", "c", "e"]);
        assert_eq!(shards[1], vec!["b", "d"]);
    }

    #[test]
    fn partition_with_more_shards_than_items_leaves_empties() {
        let shards = partition(&[1, 2], 4);
        assert_eq!(shards.iter().filter(|s| s.is_empty()).count(), 2);
    }

    #[test]
    fn partition_zero_shards_means_one() {
        let shards = partition(&[1, 2, 3], 0);
        assert_eq!(shards, vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn poll_until_returns_first_hit() {
        let calls = AtomicU32::new(0);
        let got = poll_until(PollPolicy::fixed(5, Duration::ZERO), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { (attempt == 2).then_some("ready") }
        })
        .await;
        assert_eq!(got, Some("ready"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let got: Option<()> = poll_until(PollPolicy::fixed(4, Duration::ZERO), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { None }
        })
        .await;
        assert!(got.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_applies_backoff() {
        let start = tokio::time::Instant::now();
        let policy = PollPolicy::fixed(3, Duration::from_millis(100)).with_backoff(2.0);
        let got: Option<()> = poll_until(policy, |_| async { None }).await;
        assert!(got.is_none());
        // 100ms + 200ms, no sleep after the last attempt
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }
}
