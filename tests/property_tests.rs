//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs, helping catch
//! edge cases that might be missed by example-based testing.

use model_delivery::codec::{self, CompressionType};
use model_delivery::config::DeliveryConfig;
use model_delivery::delta::patch;
use model_delivery::health::{MonitorConfig, NetworkHealthMonitor, health_score, latency_score};
use model_delivery::models::ModelMetadata;
use model_delivery::storage::{CacheLimits, StorageManager};
use proptest::prelude::*;
use model_delivery::{DeliveryError, DeliveryResult, FetchResponse, FetchTransport};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Strategies
// =============================================================================

fn arb_compression() -> impl Strategy<Value = CompressionType> {
    prop::sample::select(CompressionType::ALL.to_vec())
}

/// Random bytes, or a short pattern repeated many times
fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..4096),
        (prop::collection::vec(any::<u8>(), 1..16), 1usize..2048)
            .prop_map(|(pattern, times)| pattern.repeat(times)),
    ]
}

#[derive(Debug, Clone)]
struct SaveOp {
    id: usize,
    size: usize,
    pin: bool,
}

fn arb_save_ops() -> impl Strategy<Value = Vec<SaveOp>> {
    prop::collection::vec(
        (0usize..6, 1usize..4000, prop::bool::weighted(0.2))
            .prop_map(|(id, size, pin)| SaveOp { id, size, pin }),
        1..24,
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

// =============================================================================
// Codec Round-Trip
// =============================================================================

proptest! {
    /// Every codec restores its input exactly
    #[test]
    fn codec_roundtrip(payload in arb_payload(), compression in arb_compression()) {
        let encoded = codec::compress(&payload, compression).expect("compress failed");
        let decoded = codec::decompress(&encoded, compression).expect("decompress failed");
        prop_assert_eq!(decoded, payload);
    }

    /// Compression tags survive Display/FromStr in any case
    #[test]
    fn compression_tag_parse(compression in arb_compression(), upper in any::<bool>()) {
        let tag = if upper {
            compression.as_str().to_uppercase()
        } else {
            compression.to_string()
        };
        prop_assert_eq!(tag.parse::<CompressionType>().unwrap(), compression);
    }
}

// =============================================================================
// Health Score Bounds
// =============================================================================

proptest! {
    /// Score stays within [0, 100] for any latency and success rate
    #[test]
    fn health_score_bounded(latency_ms in 0u64..120_000, success_rate in -1.0f64..2.0) {
        let score = health_score(Duration::from_millis(latency_ms), success_rate);
        prop_assert!(score <= 100);
    }

    /// Higher latency never scores better
    #[test]
    fn latency_score_monotonic(a in 0u64..20_000, b in 0u64..20_000) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(
            latency_score(Duration::from_millis(low)) >= latency_score(Duration::from_millis(high))
        );
    }
}

// =============================================================================
// Monitor Sliding Window
// =============================================================================

struct OfflineTransport;

#[async_trait::async_trait]
impl FetchTransport for OfflineTransport {
    async fn fetch(&self, _locator: &str) -> DeliveryResult<FetchResponse> {
        Err(DeliveryError::NetworkFailure("offline".into()))
    }

    async fn probe(&self, _locator: &str) -> DeliveryResult<u16> {
        Err(DeliveryError::NetworkFailure("offline".into()))
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any sequence of samples keeps the monitor's metrics in range, and the
    /// score always reflects only the most recent window
    #[test]
    fn monitor_metrics_track_window(
        samples in prop::collection::vec((0u64..12_000, any::<bool>()), 0..320),
        window in 1usize..120,
    ) {
        let monitor = NetworkHealthMonitor::new(
            MonitorConfig { window_capacity: window, ..Default::default() },
            Arc::new(OfflineTransport),
        );

        runtime().block_on(async {
            for (latency_ms, success) in &samples {
                let latency = Duration::from_millis(*latency_ms);
                if *success {
                    monitor.record_success(latency).await;
                } else {
                    monitor.record_failure(latency).await;
                }

                let metrics = monitor.metrics();
                prop_assert!(metrics.health_score <= 100);
                prop_assert!((0.0..=1.0).contains(&metrics.success_rate));
                prop_assert!((metrics.success_rate + metrics.error_rate - 1.0).abs() < 1e-9);
                prop_assert!(metrics.sample_count <= window);
            }
            Ok(())
        })?;

        let metrics = monitor.metrics();
        let recent = &samples[samples.len().saturating_sub(window)..];
        prop_assert_eq!(metrics.sample_count, recent.len());
        if !recent.is_empty() {
            let average = recent
                .iter()
                .map(|(ms, _)| Duration::from_millis(*ms))
                .sum::<Duration>()
                / recent.len() as u32;
            let success_rate =
                recent.iter().filter(|(_, ok)| *ok).count() as f64 / recent.len() as f64;
            prop_assert_eq!(metrics.average_latency, average);
            prop_assert_eq!(metrics.health_score, health_score(average, success_rate));
        }
    }
}

// =============================================================================
// Patch Format
// =============================================================================

proptest! {
    /// Applying diff(base, target) to base yields target
    #[test]
    fn patch_reconstructs_target(base in arb_payload(), target in arb_payload()) {
        let patch_bytes = patch::diff(&base, &target);
        prop_assert_eq!(patch::apply(&base, &patch_bytes).unwrap(), target);
    }

    /// Small edits to a large base produce patches much smaller than the target
    #[test]
    fn patch_of_small_edit_is_small(
        base in prop::collection::vec(any::<u8>(), 8192..16384),
        at in 0usize..8192,
        edit in prop::collection::vec(any::<u8>(), 1..32),
    ) {
        let mut target = base.clone();
        let end = (at + edit.len()).min(target.len());
        target[at..end].copy_from_slice(&edit[..end - at]);

        let patch_bytes = patch::diff(&base, &target);
        prop_assert!(patch_bytes.len() < target.len() / 4);
        prop_assert_eq!(patch::apply(&base, &patch_bytes).unwrap(), target);
    }

    /// Arbitrary bytes never panic the patch reader
    #[test]
    fn patch_apply_never_panics(base in arb_payload(), garbage in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut patch_bytes = b"MDP1".to_vec();
        patch_bytes.extend_from_slice(&(base.len() as u64).to_le_bytes());
        patch_bytes.extend_from_slice(&garbage);
        let _ = patch::apply(&base, &patch_bytes);
    }
}

// =============================================================================
// Storage Capacity Invariant
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After any sequence of saves the cache fits its limits and pinned
    /// models are never evicted
    #[test]
    fn storage_respects_limits(ops in arb_save_ops()) {
        let limits = CacheLimits { max_size: 10_000, max_models: 4 };

        runtime().block_on(async {
            let temp_dir = tempfile::tempdir().unwrap();
            let storage = StorageManager::open(temp_dir.path(), limits).await.unwrap();

            for op in ops {
                let id = format!("m{}", op.id);
                let payload = vec![op.id as u8; op.size];
                let pinned_before: HashSet<String> = pinned_ids(&storage).await;
                let listed_before = storage.list().await;

                let metadata = ModelMetadata::for_payload(&id, "1.0.0", CompressionType::None, &payload);
                match storage.save(&id, &payload, metadata).await {
                    Ok(()) => {
                        prop_assert!(storage.contains(&id).await);
                        if op.pin {
                            storage.pin(&id).await.unwrap();
                        }
                    }
                    Err(e) => {
                        prop_assert_eq!(e.kind(), "capacity_exceeded");
                        prop_assert_eq!(storage.list().await, listed_before);
                    }
                }

                let stats = storage.statistics().await;
                prop_assert!(stats.total_size <= stats.max_size);
                prop_assert!(stats.model_count <= stats.max_models);
                for pinned in &pinned_before {
                    prop_assert!(storage.contains(pinned).await, "pinned {} evicted", pinned);
                }
            }
            Ok(())
        })?;
    }
}

async fn pinned_ids(storage: &StorageManager) -> HashSet<String> {
    let mut pinned = HashSet::new();
    for metadata in storage.list().await {
        if storage.is_pinned(&metadata.id).await {
            pinned.insert(metadata.id);
        }
    }
    pinned
}

// =============================================================================
// Config Serialization Round-Trip
// =============================================================================

proptest! {
    /// DeliveryConfig serializes to TOML and deserializes back to an equal value
    #[test]
    fn delivery_config_roundtrip(
        max_cache_bytes in 1u64..(1 << 40),
        max_models in 1usize..1024,
        sample_window in 1usize..1000,
        threshold in 0.0f64..=1.0,
        high_bandwidth in any::<bool>(),
    ) {
        let config = DeliveryConfig {
            cache_dir: "/var/cache/model-delivery".into(),
            max_cache_bytes,
            max_models,
            sample_window,
            download_error_rate_threshold: threshold,
            high_bandwidth,
            ..Default::default()
        };
        prop_assert!(config.validate().is_ok());

        let toml_str = toml::to_string(&config).expect("Failed to serialize to TOML");
        let parsed: DeliveryConfig = toml::from_str(&toml_str).expect("Failed to parse TOML");
        prop_assert_eq!(config, parsed);
    }
}
