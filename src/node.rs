//! Node state machine (spec §4.3) — the core hard part.
//!
//! Pure function: given a name's ordered change history and a target
//! height, replays every change chronologically, tracking activation
//! delays, expirations, and takeovers exactly as a block validator would
//! have observed them the first time, and reports the resulting node state.

use std::collections::BTreeSet;

use crate::config::Params;
use crate::types::{Change, ChangeType, Claim, ClaimId, Support};

/// Derived state for one name at one height.
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Claims not yet spent as of the target height (both pending and
    /// active).
    pub claims: Vec<Claim>,
    /// Supports not yet spent as of the target height.
    pub supports: Vec<Support>,
    pub controller: Option<ClaimId>,
    pub takeover_height: i32,
    /// Smallest future height at which this node's state will change, or 0
    /// if nothing is scheduled.
    pub next_update_height: i32,
}

impl Node {
    /// Height at which `accepted_height` expires under `params`.
    fn expiration_height(accepted_height: i32, params: &Params) -> i32 {
        accepted_height + params.expiration_at(accepted_height)
    }

    fn is_expired(accepted_height: i32, at_height: i32, params: &Params) -> bool {
        at_height >= Self::expiration_height(accepted_height, params)
    }

    fn is_active(active_height: i32, accepted_height: i32, at_height: i32, params: &Params) -> bool {
        active_height <= at_height && !Self::is_expired(accepted_height, at_height, params)
    }

    fn support_sum(claim_id: ClaimId, supports: &[Support], at_height: i32, params: &Params) -> i64 {
        supports
            .iter()
            .filter(|s| s.supported_claim_id == claim_id)
            .filter(|s| Self::is_active(s.active_height, s.accepted_height, at_height, params))
            .map(|s| s.amount)
            .sum()
    }

    fn effective_amount(claim: &Claim, supports: &[Support], at_height: i32, params: &Params) -> i64 {
        claim.amount + Self::support_sum(claim.claim_id, supports, at_height, params)
    }

    /// True if `a` beats `b` under spec §4.3 step 4's bid rule: strictly
    /// greater effective amount; ties by earlier `accepted_height`; then by
    /// lexicographically smaller outpoint.
    fn beats(a: &Claim, a_eff: i64, b: &Claim, b_eff: i64) -> bool {
        if a_eff != b_eff {
            return a_eff > b_eff;
        }
        if a.accepted_height != b.accepted_height {
            return a.accepted_height < b.accepted_height;
        }
        a.outpoint < b.outpoint
    }

    /// Highest-bidding active claim at `at_height`, or `None` if no claim is
    /// active.
    fn compute_winner(claims: &[Claim], supports: &[Support], at_height: i32, params: &Params) -> Option<Claim> {
        let mut winner: Option<(Claim, i64)> = None;
        for claim in claims {
            if !Self::is_active(claim.active_height, claim.accepted_height, at_height, params) {
                continue;
            }
            let eff = Self::effective_amount(claim, supports, at_height, params);
            winner = match winner {
                None => Some((*claim, eff)),
                Some((best, best_eff)) => {
                    if Self::beats(claim, eff, &best, best_eff) {
                        Some((*claim, eff))
                    } else {
                        Some((best, best_eff))
                    }
                }
            };
        }
        winner.map(|(c, _)| c)
    }

    fn effective_amount_of(claim_id: ClaimId, claims: &[Claim], supports: &[Support], at_height: i32, params: &Params) -> i64 {
        claims
            .iter()
            .find(|c| c.claim_id == claim_id)
            .map(|c| Self::effective_amount(c, supports, at_height, params))
            .unwrap_or_else(|| Self::support_sum(claim_id, supports, at_height, params))
    }

    /// Delay (spec §4.3 step 2) for a claim/support being accepted at
    /// `height`, given the claim id it concerns and its prospective
    /// effective amount, evaluated against the current controller.
    fn activation_delay(
        concerns_claim_id: ClaimId,
        prospective_effective: i64,
        controller: Option<ClaimId>,
        takeover_height: i32,
        claims: &[Claim],
        supports: &[Support],
        height: i32,
        params: &Params,
    ) -> i32 {
        let controller_id = match controller {
            Some(id) if id != concerns_claim_id => id,
            _ => return 0,
        };
        let controller_effective = Self::effective_amount_of(controller_id, claims, supports, height, params);
        if prospective_effective > controller_effective {
            std::cmp::min(params.max_activation_delay, (height - takeover_height) / params.activation_delay_divisor)
        } else {
            0
        }
    }

    /// Rebuild a node from its full change history, replaying only changes
    /// with `height <= target_height`.
    pub fn rebuild(history: &[Change], target_height: i32, params: &Params) -> Node {
        let mut claims: Vec<Claim> = Vec::new();
        let mut supports: Vec<Support> = Vec::new();
        let mut controller: Option<ClaimId> = None;
        let mut takeover_height: i32 = 0;

        let relevant: Vec<&Change> = history.iter().filter(|c| c.height <= target_height).collect();

        let mut checkpoints: BTreeSet<i32> = relevant.iter().map(|c| c.height).collect();
        let mut change_idx = 0usize;

        while let Some(&h) = checkpoints.iter().next() {
            if h > target_height {
                break;
            }
            checkpoints.remove(&h);

            while change_idx < relevant.len() && relevant[change_idx].height == h {
                let change = relevant[change_idx];
                apply_change(change, h, &mut claims, &mut supports, controller, takeover_height, params);
                change_idx += 1;
            }

            let winner = Self::compute_winner(&claims, &supports, h, params).map(|c| c.claim_id);
            if winner != controller {
                controller = winner;
                takeover_height = h;
            }

            for claim in &claims {
                if claim.active_height > h && claim.active_height <= target_height {
                    checkpoints.insert(claim.active_height);
                }
                let exp = Self::expiration_height(claim.accepted_height, params);
                if exp > h && exp <= target_height {
                    checkpoints.insert(exp);
                }
            }
            for support in &supports {
                if support.active_height > h && support.active_height <= target_height {
                    checkpoints.insert(support.active_height);
                }
                let exp = Self::expiration_height(support.accepted_height, params);
                if exp > h && exp <= target_height {
                    checkpoints.insert(exp);
                }
            }
        }

        // Drain any changes left beyond the last checkpoint <= target_height
        // (possible if target_height itself has no checkpoint but equals a
        // change height already consumed above; nothing further to do).

        let mut next_update_height = 0;
        for claim in &claims {
            if claim.active_height > target_height {
                next_update_height = min_positive(next_update_height, claim.active_height);
            }
            let exp = Self::expiration_height(claim.accepted_height, params);
            if exp > target_height {
                next_update_height = min_positive(next_update_height, exp);
            }
        }
        for support in &supports {
            if support.active_height > target_height {
                next_update_height = min_positive(next_update_height, support.active_height);
            }
            let exp = Self::expiration_height(support.accepted_height, params);
            if exp > target_height {
                next_update_height = min_positive(next_update_height, exp);
            }
        }

        Node { claims, supports, controller, takeover_height, next_update_height }
    }

    pub fn active_claims(&self, at_height: i32, params: &Params) -> Vec<Claim> {
        self.claims
            .iter()
            .filter(|c| Self::is_active(c.active_height, c.accepted_height, at_height, params))
            .copied()
            .collect()
    }

    pub fn active_supports_for(&self, claim_id: ClaimId, at_height: i32, params: &Params) -> Vec<Support> {
        self.supports
            .iter()
            .filter(|s| s.supported_claim_id == claim_id)
            .filter(|s| Self::is_active(s.active_height, s.accepted_height, at_height, params))
            .copied()
            .collect()
    }
}

fn min_positive(current: i32, candidate: i32) -> i32 {
    if current == 0 || candidate < current {
        candidate
    } else {
        current
    }
}

fn apply_change(
    change: &Change,
    height: i32,
    claims: &mut Vec<Claim>,
    supports: &mut Vec<Support>,
    controller: Option<ClaimId>,
    takeover_height: i32,
    params: &Params,
) {
    match change.kind {
        ChangeType::AddClaim => {
            let accepted_height = height;
            let prospective = change.amount + Node::support_sum(change.claim_id, supports, height, params);
            let delay = Node::activation_delay(
                change.claim_id,
                prospective,
                controller,
                takeover_height,
                claims,
                supports,
                height,
                params,
            );
            claims.push(Claim {
                claim_id: change.claim_id,
                outpoint: change.outpoint,
                amount: change.amount,
                accepted_height,
                active_height: accepted_height + delay,
            });
        }
        ChangeType::UpdateClaim => {
            let inherited = claims.iter().position(|c| c.claim_id == change.claim_id);
            let accepted_height = inherited.map(|i| claims[i].accepted_height).unwrap_or(height);
            if let Some(i) = inherited {
                claims.remove(i);
            }
            let prospective = change.amount + Node::support_sum(change.claim_id, supports, height, params);
            let delay = Node::activation_delay(
                change.claim_id,
                prospective,
                controller,
                takeover_height,
                claims,
                supports,
                height,
                params,
            );
            claims.push(Claim {
                claim_id: change.claim_id,
                outpoint: change.outpoint,
                amount: change.amount,
                accepted_height,
                active_height: accepted_height + delay,
            });
        }
        ChangeType::SpendClaim => {
            claims.retain(|c| !(c.claim_id == change.claim_id && c.outpoint == change.outpoint));
        }
        ChangeType::AddSupport => {
            let accepted_height = height;
            let prospective = Node::effective_amount_of(change.claim_id, claims, supports, height, params) + change.amount;
            let delay = Node::activation_delay(
                change.claim_id,
                prospective,
                controller,
                takeover_height,
                claims,
                supports,
                height,
                params,
            );
            supports.push(Support {
                supported_claim_id: change.claim_id,
                outpoint: change.outpoint,
                amount: change.amount,
                accepted_height,
                active_height: accepted_height + delay,
            });
        }
        ChangeType::SpendSupport => {
            supports.retain(|s| !(s.supported_claim_id == change.claim_id && s.outpoint == change.outpoint));
        }
    }
}
