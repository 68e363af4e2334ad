//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs, helping catch
//! edge cases that might be missed by example-based testing.

use model_manager::budget::{MemoryBudget, StorageBudget};
use model_manager::config::{ManagerConfig, UpstreamConfig};
use model_manager::models::{
    MemoryTier, MemoryTiers, ModelCatalog, ModelDescriptor, PerformanceTargets,
};
use proptest::prelude::*;
use std::path::PathBuf;

// =============================================================================
// Arbitrary Implementations
// =============================================================================

fn arb_tier() -> impl Strategy<Value = MemoryTier> {
    prop_oneof![
        Just(MemoryTier::Base),
        Just(MemoryTier::Optimized),
        Just(MemoryTier::Minimum),
    ]
}

/// Tier sizes in quarter-GB steps so they survive a TOML round trip exactly
fn arb_tiers() -> impl Strategy<Value = MemoryTiers> {
    (1u32..64, 0u32..64, 0u32..64).prop_map(|(minimum, extra_opt, extra_base)| {
        let minimum = f64::from(minimum) / 4.0;
        let optimized = minimum + f64::from(extra_opt) / 4.0;
        MemoryTiers {
            base: optimized + f64::from(extra_base) / 4.0,
            optimized,
            minimum,
        }
    })
}

fn arb_descriptor() -> impl Strategy<Value = ModelDescriptor> {
    (
        "[a-z][a-z0-9-]{0,15}",                              // id
        "[A-Za-z0-9]{1,10}/[A-Za-z0-9._-]{1,20}",            // source_name like "Qwen/Qwen2.5-7B"
        arb_tiers(),
        prop::collection::btree_set("[a-z-]{1,10}", 0..4), // content_affinities
        -5i32..20,                                           // priority
    )
        .prop_map(|(id, source_name, memory_tiers, content_affinities, priority)| ModelDescriptor {
            id,
            source_name,
            display_name: String::new(),
            memory_tiers,
            content_affinities,
            priority,
            performance_targets: PerformanceTargets::default(),
        })
}

/// Descriptors with unique ids
fn arb_catalog_models() -> impl Strategy<Value = Vec<ModelDescriptor>> {
    prop::collection::vec(arb_descriptor(), 0..8).prop_map(|mut models| {
        let mut seen = std::collections::HashSet::new();
        models.retain(|m| seen.insert(m.id.clone()));
        models
    })
}

fn arb_manager_config() -> impl Strategy<Value = ManagerConfig> {
    (
        1024u16..60000,                      // api_port
        prop::option::of(1u32..512),         // total_memory_gb
        1u32..=20,                           // safety_threshold in 5% steps
        1u32..2000,                          // max_cache_gb
        1u32..365,                           // cleanup_age_days
        1usize..8,                           // max_concurrent_downloads
        arb_tier(),                          // preferred_tier
        any::<bool>(),                       // mirror upstream
        arb_catalog_models(),
    )
        .prop_map(
            |(
                api_port,
                total_memory_gb,
                safety_steps,
                max_cache_gb,
                cleanup_age_days,
                max_concurrent_downloads,
                preferred_tier,
                mirror,
                models,
            )| {
                let upstream = if mirror {
                    UpstreamConfig::Mirror {
                        path: PathBuf::from("/srv/mirror"),
                    }
                } else {
                    UpstreamConfig::default()
                };
                ManagerConfig {
                    api_port,
                    cache_root: PathBuf::from("/var/cache/models"),
                    total_memory_gb: total_memory_gb.map(f64::from),
                    safety_threshold: f64::from(safety_steps) / 20.0,
                    max_cache_gb: f64::from(max_cache_gb),
                    cleanup_age_days,
                    max_concurrent_downloads,
                    preferred_tier,
                    upstream,
                    preload: models.iter().take(2).map(|m| m.id.clone()).collect(),
                    models,
                    ..Default::default()
                }
            },
        )
}

#[derive(Debug, Clone)]
enum BudgetOp {
    Reserve { model: usize, gb: f64 },
    Release { model: usize },
    Claim { model: usize, gb: f64 },
    Commit { model: usize },
}

fn arb_budget_ops() -> impl Strategy<Value = Vec<BudgetOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => (0usize..6, 0.25f64..40.0).prop_map(|(model, gb)| BudgetOp::Reserve { model, gb }),
            1 => (0usize..6).prop_map(|model| BudgetOp::Release { model }),
            1 => (0usize..6, 0.25f64..40.0).prop_map(|(model, gb)| BudgetOp::Claim { model, gb }),
            1 => (0usize..6).prop_map(|model| BudgetOp::Commit { model }),
        ],
        1..60,
    )
}

// =============================================================================
// Config Serialization Round-Trip Tests
// =============================================================================

proptest! {
    /// ManagerConfig serializes to TOML and deserializes back to an equal value
    #[test]
    fn manager_config_roundtrip(config in arb_manager_config()) {
        let toml_str = toml::to_string(&config).expect("Failed to serialize to TOML");
        let parsed: ManagerConfig = toml::from_str(&toml_str).expect("Failed to parse TOML");
        prop_assert_eq!(config, parsed);
    }

    /// Generated configs pass validation
    #[test]
    fn generated_config_is_valid(config in arb_manager_config()) {
        prop_assert!(config.validate().is_ok());
    }

    /// ModelDescriptor serializes to JSON and back (API compatibility)
    #[test]
    fn descriptor_json_roundtrip(descriptor in arb_descriptor()) {
        let json_str = serde_json::to_string(&descriptor).expect("Failed to serialize to JSON");
        let parsed: ModelDescriptor = serde_json::from_str(&json_str).expect("Failed to parse JSON");
        prop_assert_eq!(descriptor, parsed);
    }
}

// =============================================================================
// Budget Invariants
// =============================================================================

proptest! {
    /// Charged memory never exceeds the safety-adjusted limit
    #[test]
    fn memory_budget_never_exceeds_limit(
        total in 1.0f64..200.0,
        threshold in 0.1f64..=1.0,
        ops in arb_budget_ops(),
    ) {
        let mut budget = MemoryBudget::new(total, threshold);

        for op in ops {
            let before = budget.loaded_gb();
            match op {
                BudgetOp::Reserve { model, gb } => {
                    let id = format!("m{}", model);
                    match budget.try_reserve(&id, MemoryTier::Optimized, gb) {
                        Ok(()) => prop_assert_eq!(budget.reservation(&id).map(|r| r.gb), Some(gb)),
                        Err(shortfall) => {
                            prop_assert!(shortfall > 0.0);
                            prop_assert!((budget.loaded_gb() - before).abs() < 1e-9);
                        }
                    }
                }
                BudgetOp::Release { model } => {
                    budget.release(&format!("m{}", model));
                    prop_assert!(budget.loaded_gb() <= before + 1e-9);
                }
                BudgetOp::Claim { model, gb } => {
                    budget.claim(&format!("m{}", model), MemoryTier::Minimum, gb);
                    prop_assert!((budget.loaded_gb() - before).abs() < 1e-9);
                }
                BudgetOp::Commit { model } => {
                    let id = format!("m{}", model);
                    if budget.commit_claim(&id).is_err() {
                        prop_assert!((budget.loaded_gb() - before).abs() < 1e-9);
                    }
                    prop_assert!(budget.drop_claim(&id).is_none());
                }
            }

            prop_assert!(budget.loaded_gb() <= budget.limit_gb() + 1e-6);
            prop_assert!(budget.available_gb() >= 0.0);
        }
    }

    /// Recorded usage plus in-flight reservations never exceeds the quota
    #[test]
    fn storage_budget_respects_quota(
        max_bytes in 1u64..1_000_000,
        used in 0u64..1_000_000,
        requests in prop::collection::vec((0usize..6, 1u64..400_000), 1..30),
    ) {
        let mut ledger = StorageBudget::new(max_bytes);

        for (model, bytes) in requests {
            let id = format!("m{}", model);
            if ledger.is_reserved(&id) {
                ledger.release(&id);
                continue;
            }
            let fits = ledger.shortfall(used, bytes) == 0;
            prop_assert_eq!(ledger.try_reserve(&id, used, bytes), fits);
            if fits {
                prop_assert!(used + ledger.reserved_bytes() <= max_bytes);
            }
        }
    }
}

// =============================================================================
// Catalog Invariants
// =============================================================================

proptest! {
    /// Affinity listings contain only tagged models, most protected first
    #[test]
    fn affinity_listing_is_priority_ordered(
        models in arb_catalog_models(),
        tag in "[a-z-]{1,10}",
    ) {
        let catalog = ModelCatalog::new(models.clone()).expect("unique ids are valid");
        let listed = catalog.list_by_content_affinity(&tag);

        prop_assert_eq!(listed.len(), models.iter().filter(|m| m.has_affinity(&tag)).count());
        for pair in listed.windows(2) {
            prop_assert!((pair[0].priority, &pair[0].id) <= (pair[1].priority, &pair[1].id));
        }
        prop_assert!(listed.iter().all(|m| m.has_affinity(&tag)));
    }

    /// Tier fallback order always ends at minimum and never climbs
    #[test]
    fn tier_fallback_descends(tier in arb_tier(), tiers in arb_tiers()) {
        let order = tier.and_lower();
        prop_assert_eq!(order[0], tier);
        prop_assert_eq!(*order.last().unwrap(), MemoryTier::Minimum);
        for pair in order.windows(2) {
            prop_assert!(tiers.gb(pair[0]) >= tiers.gb(pair[1]));
        }
    }
}
