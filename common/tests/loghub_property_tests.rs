// Property-based tests for the log hub: publication order and ring windows

use common::loghub::LogHub;
use proptest::prelude::*;
use std::sync::Arc;

fn hub(capacity: usize) -> (Arc<LogHub>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    (
        Arc::new(LogHub::new(dir.path().to_path_buf(), capacity)),
        dir,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // Every subscriber observes chunks in publication order; the
    // concatenation equals the concatenation of everything published
    #[test]
    fn prop_subscriber_sees_publication_order(
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..64), 1..20)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let (hub, _dir) = hub(1 << 20);
            hub.begin("k");
            let mut rx = hub.subscribe("k").unwrap();
            let expected: Vec<u8> = chunks.iter().flatten().copied().collect();
            for chunk in &chunks {
                hub.publish("k", chunk);
            }
            let mut seen = Vec::new();
            while seen.len() < expected.len() {
                match rx.try_recv() {
                    Ok(chunk) => seen.extend_from_slice(&chunk),
                    Err(_) => break,
                }
            }
            prop_assert_eq!(seen, expected);
            Ok(())
        })?;
    }

    // The ring always holds exactly the trailing window of published bytes
    #[test]
    fn prop_ring_is_trailing_window(
        capacity in 1usize..128,
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..64), 1..20)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let (hub, _dir) = hub(capacity);
            hub.begin("k");
            let mut all = Vec::new();
            for chunk in &chunks {
                hub.publish("k", chunk);
                all.extend_from_slice(chunk);
            }
            let expected_start = all.len().saturating_sub(capacity);
            prop_assert_eq!(hub.tail("k", usize::MAX).unwrap(), all[expected_start..].to_vec());
            Ok(())
        })?;
    }

    // tail(max) returns at most max bytes, from the end
    #[test]
    fn prop_tail_respects_bound(
        payload in proptest::collection::vec(any::<u8>(), 0..512),
        max in 0usize..600,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let (hub, _dir) = hub(1 << 20);
            hub.begin("k");
            hub.publish("k", &payload);
            let tail = hub.tail("k", max).unwrap();
            prop_assert!(tail.len() <= max);
            let expected_start = payload.len().saturating_sub(max);
            prop_assert_eq!(tail, payload[expected_start..].to_vec());
            Ok(())
        })?;
    }
}
