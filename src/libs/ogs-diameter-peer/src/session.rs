//! Session-Id generation (RFC 6733 Section 8.8)
//!
//! Identifiers have the form `<DiameterIdentity>;<high 32 bits>;<low 32 bits>`.
//! The high part is drawn at random once per generator. The low part is an
//! atomic counter starting at a random offset, so every call on the same
//! generator yields a different low part until the counter wraps after 2^32
//! calls. Two generators for the same origin host collide only if they draw
//! the same high part. The correlator's pending table rejects a duplicate
//! on insertion as well, so no two pending exchanges can share an
//! identifier even in that case.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct SessionIdGenerator {
    origin_host: String,
    high: u32,
    low: AtomicU32,
}

impl SessionIdGenerator {
    pub fn new(origin_host: impl Into<String>) -> Self {
        Self {
            origin_host: origin_host.into(),
            high: rand::random(),
            low: AtomicU32::new(rand::random()),
        }
    }

    pub fn next_id(&self) -> String {
        let low = self.low.fetch_add(1, Ordering::Relaxed);
        format!("{};{};{}", self.origin_host, self.high, low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_session_id_format() {
        let generator = SessionIdGenerator::new("client");
        let id = generator.next_id();
        let parts: Vec<&str> = id.split(';').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "client");
        assert!(parts[1].parse::<u32>().is_ok());
        assert!(parts[2].parse::<u32>().is_ok());
    }

    #[test]
    fn test_concurrent_generation_unique() {
        let generator = Arc::new(SessionIdGenerator::new("client"));
        let workers: Vec<_> = (0..10)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..1000).map(|_| generator.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.join().unwrap() {
                assert!(seen.insert(id), "duplicate session id");
            }
        }
        assert_eq!(seen.len(), 10_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_unique() {
        let generator = Arc::new(SessionIdGenerator::new("client"));
        let tasks: Vec<_> = (0..10_000)
            .map(|_| {
                let generator = generator.clone();
                tokio::spawn(async move { generator.next_id() })
            })
            .collect();

        let mut seen = HashSet::new();
        for task in tasks {
            seen.insert(task.await.unwrap());
        }
        assert_eq!(seen.len(), 10_000);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_counter_wraps_without_repeating(start in any::<u32>(), count in 1usize..512) {
            let generator = SessionIdGenerator {
                origin_host: "client".to_string(),
                high: 7,
                low: AtomicU32::new(start),
            };
            let ids: HashSet<String> = (0..count).map(|_| generator.next_id()).collect();
            prop_assert_eq!(ids.len(), count);
        }
    }
}
