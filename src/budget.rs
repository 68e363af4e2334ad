//! Memory and disk budgets
//!
//! Both ledgers are plain data structures; their owners wrap each in a single
//! lock so every check-and-reserve happens atomically.

use crate::models::MemoryTier;
use serde::Serialize;
use std::collections::HashMap;

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Slack for floating point sums of GB figures
pub(crate) const GB_EPSILON: f64 = 1e-9;

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

pub fn gb_to_bytes(gb: f64) -> u64 {
    (gb * BYTES_PER_GB).round() as u64
}

/// Memory charged to one model
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryReservation {
    pub tier: MemoryTier,
    pub gb: f64,
}

/// Ledger of memory charged to loading and loaded models
///
/// A claim earmarks memory for a model while other models are being evicted
/// to make room for it. Claimed memory is not loaded, but no other
/// reservation may take it.
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    total_gb: f64,
    safety_threshold: f64,
    reservations: HashMap<String, MemoryReservation>,
    claims: HashMap<String, MemoryReservation>,
}

impl MemoryBudget {
    pub fn new(total_gb: f64, safety_threshold: f64) -> Self {
        Self {
            total_gb,
            safety_threshold,
            reservations: HashMap::new(),
            claims: HashMap::new(),
        }
    }

    pub fn total_gb(&self) -> f64 {
        self.total_gb
    }

    pub fn safety_threshold(&self) -> f64 {
        self.safety_threshold
    }

    /// Maximum memory the manager may charge
    pub fn limit_gb(&self) -> f64 {
        self.total_gb * self.safety_threshold
    }

    pub fn loaded_gb(&self) -> f64 {
        self.reservations.values().map(|r| r.gb).sum()
    }

    pub fn claimed_gb(&self) -> f64 {
        self.claims.values().map(|c| c.gb).sum()
    }

    /// Memory neither loaded nor claimed
    pub fn available_gb(&self) -> f64 {
        (self.limit_gb() - self.loaded_gb() - self.claimed_gb()).max(0.0)
    }

    /// Charge `gb` to `model_id` if it fits under the limit
    ///
    /// The model's own reservation and claim are replaced. On failure returns
    /// the shortfall in GB and leaves the ledger untouched.
    pub fn try_reserve(&mut self, model_id: &str, tier: MemoryTier, gb: f64) -> Result<(), f64> {
        let existing = self.reservations.get(model_id).map_or(0.0, |r| r.gb);
        let own_claim = self.claims.get(model_id).map_or(0.0, |c| c.gb);
        let projected = self.loaded_gb() - existing + self.claimed_gb() - own_claim + gb;
        if projected > self.limit_gb() + GB_EPSILON {
            return Err(projected - self.limit_gb());
        }
        self.claims.remove(model_id);
        self.reservations
            .insert(model_id.to_string(), MemoryReservation { tier, gb });
        Ok(())
    }

    /// Earmark `gb` for `model_id` until it is reserved or the claim is dropped
    pub fn claim(&mut self, model_id: &str, tier: MemoryTier, gb: f64) {
        self.claims
            .insert(model_id.to_string(), MemoryReservation { tier, gb });
    }

    /// Turn a claim into a reservation once the evicted memory is released
    ///
    /// The claim is dropped either way; on failure returns the shortfall in GB.
    pub fn commit_claim(&mut self, model_id: &str) -> Result<MemoryTier, f64> {
        let Some(claim) = self.claims.get(model_id).copied() else {
            return Err(f64::INFINITY);
        };
        let result = self.try_reserve(model_id, claim.tier, claim.gb);
        self.claims.remove(model_id);
        result.map(|()| claim.tier)
    }

    pub fn drop_claim(&mut self, model_id: &str) -> Option<MemoryReservation> {
        self.claims.remove(model_id)
    }

    pub fn release(&mut self, model_id: &str) -> Option<MemoryReservation> {
        self.reservations.remove(model_id)
    }

    pub fn reservation(&self, model_id: &str) -> Option<MemoryReservation> {
        self.reservations.get(model_id).copied()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }
}

/// Ledger of disk space promised to in-flight downloads
///
/// Usage of completed artifacts comes from the metadata store; this only
/// tracks bytes that are being transferred and not yet recorded.
#[derive(Debug, Clone)]
pub struct StorageBudget {
    max_bytes: u64,
    reserved: HashMap<String, u64>,
}

impl StorageBudget {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            reserved: HashMap::new(),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved.values().sum()
    }

    pub fn is_reserved(&self, model_id: &str) -> bool {
        self.reserved.contains_key(model_id)
    }

    /// Bytes still free given the recorded usage
    pub fn available_bytes(&self, used_bytes: u64) -> u64 {
        self.max_bytes
            .saturating_sub(used_bytes.saturating_add(self.reserved_bytes()))
    }

    /// Bytes that must be freed before `bytes` more fit
    pub fn shortfall(&self, used_bytes: u64, bytes: u64) -> u64 {
        used_bytes
            .saturating_add(self.reserved_bytes())
            .saturating_add(bytes)
            .saturating_sub(self.max_bytes)
    }

    /// Reserve `bytes` for `model_id` if they fit
    pub fn try_reserve(&mut self, model_id: &str, used_bytes: u64, bytes: u64) -> bool {
        if self.shortfall(used_bytes, bytes) > 0 {
            return false;
        }
        self.reserved.insert(model_id.to_string(), bytes);
        true
    }

    pub fn release(&mut self, model_id: &str) -> Option<u64> {
        self.reserved.remove(model_id)
    }
}
