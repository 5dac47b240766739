//! RoutingPolicy: selects one worker from the healthy set for a capability.
//!
//! The shipped policy is round-robin. The contract is written so SLO filtering,
//! policy evaluation, and budget-aware selection can be added later without
//! changing the HTTPService endpoint shape or the registry API — see the
//! commented seams below.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::worker::WorkerRecord;

/// Optional request-scoped context threaded through to the policy. The shipped
/// policy accepts and ignores all of these; the API contract is stable so a
/// future policy can start consuming them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slo_constraints: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Round-robin cursor over the healthy workers for one capability key.
///
/// The registry owns one of these per capability key, behind the same lock that
/// guards `workers`/`index`, so cursor advancement is atomic with the lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinCursor {
    next: usize,
}

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Select one worker from `healthy`, advancing the cursor. `healthy` must be
    /// in insertion order (Invariant I3) so ties are broken deterministically.
    ///
    /// Reserved extension points, not implemented by this policy:
    /// - SLO filter: drop workers whose declared `slo` can't meet `slo_constraints`.
    /// - Policy evaluation: call an external decision engine with
    ///   `{requester_identity, verb, capability}`; deny -> 403.
    /// - Budget filter: drop workers whose `cost_tokens_per_invocation` exceeds
    ///   `budget_tokens`; order remaining cheapest-first.
    /// - Idempotency: if `idempotency_key` has a cached response, return it directly.
    pub fn select<'a>(
        &mut self,
        healthy: &'a [WorkerRecord],
        _ctx: &RouteContext,
    ) -> Option<&'a WorkerRecord> {
        if healthy.is_empty() {
            return None;
        }

        let idx = self.next % healthy.len();
        self.next = (self.next + 1) % healthy.len();
        healthy.get(idx)
    }
}
