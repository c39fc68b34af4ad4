//! The policy evaluator.
//!
//! A pure function from (policy slots, current keys, now) to what should
//! change about the zone's key set: which slots need a fresh key, which
//! bindings have outlived their slot and must retire, and when the next
//! lifetime-driven rollover is due.

use warden_store::RowId;

use crate::datetime::UnixTime;
use crate::db::KeyRole;
use crate::db::policy::PolicyKey;

use super::KeyEntry;

//----------- Evaluation -------------------------------------------------------

/// What the key set should change into.
#[derive(Clone, Debug, Default)]
pub struct Evaluation {
    /// Slots that need a fresh key from the factory.
    pub requests: Vec<SlotRequest>,

    /// Bindings to stop introducing; the state machine retires them.
    pub retire: Vec<RowId>,

    /// The earliest lifetime expiry per role, for reporting and wakeups.
    pub next_rolls: Vec<(KeyRole, UnixTime)>,
}

/// A request for one key in one slot.
#[derive(Clone, Debug)]
pub struct SlotRequest {
    /// The slot to fill.
    pub policy_key: PolicyKey,

    /// Whether the key fills a standby position.
    pub standby: bool,
}

/// Compute the target key set for a zone.
pub fn evaluate(policy_keys: &[PolicyKey], keys: &[KeyEntry], now: UnixTime) -> Evaluation {
    let mut eval = Evaluation::default();
    let mut matched = vec![false; keys.len()];

    for pk in policy_keys {
        let needed = 1 + pk.standby as usize;
        let mut satisfiers = Vec::new();

        for (idx, key) in keys.iter().enumerate() {
            if !fits_slot(key, pk) {
                continue;
            }
            matched[idx] = true;
            if !key.data.introducing || !key.hsm.state.is_live() {
                continue;
            }
            if expired(key, pk, now) {
                // Past its lifetime: start a successor and retire it.
                eval.retire.push(key.data.id);
                continue;
            }
            satisfiers.push(key);
        }

        // Report when the oldest current key runs out.
        if !pk.manual_rollover && !pk.lifetime.is_zero() {
            if let Some(expiry) = satisfiers
                .iter()
                .map(|k| k.data.inception + pk.lifetime)
                .min()
            {
                note_roll(&mut eval.next_rolls, pk.role, expiry);
            }
        }

        // Fill the deficit, the active position first.
        let mut active_covered = satisfiers.iter().any(|k| !k.data.standby);
        for _ in satisfiers.len()..needed {
            eval.requests.push(SlotRequest {
                policy_key: pk.clone(),
                standby: active_covered,
            });
            active_covered = true;
        }
    }

    // Bindings no slot accounts for are on their way out.
    for (idx, key) in keys.iter().enumerate() {
        if !matched[idx] && key.data.introducing {
            eval.retire.push(key.data.id);
        }
    }

    eval
}

/// Whether a binding belongs to a slot.
fn fits_slot(key: &KeyEntry, pk: &PolicyKey) -> bool {
    key.data.role == pk.role
        && key.hsm.algorithm == pk.algorithm
        && key.hsm.bits == pk.bits
        && key.hsm.repository == pk.repository
}

/// Whether a binding has outlived its slot's lifetime.
fn expired(key: &KeyEntry, pk: &PolicyKey, now: UnixTime) -> bool {
    if pk.manual_rollover || pk.lifetime.is_zero() {
        return false;
    }
    now >= key.data.inception + pk.lifetime
}

fn note_roll(rolls: &mut Vec<(KeyRole, UnixTime)>, role: KeyRole, at: UnixTime) {
    match rolls.iter_mut().find(|(r, _)| *r == role) {
        Some((_, t)) => *t = (*t).min(at),
        None => rolls.push((role, at)),
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{KeyRole, Minimize};
    use crate::enforcer::tests::entry;
    use std::time::Duration;
    use warden_store::RowId;

    fn slot(role: KeyRole, standby: u32, lifetime_secs: u64) -> PolicyKey {
        PolicyKey {
            id: RowId::from_raw(0),
            rev: 0,
            policy_id: RowId::from_raw(1),
            role,
            algorithm: 13,
            bits: 256,
            lifetime: Duration::from_secs(lifetime_secs),
            repository: "default".into(),
            standby,
            manual_rollover: false,
            rfc5011: false,
            minimize: Minimize::NONE,
        }
    }

    #[test]
    fn empty_zone_requests_every_slot() {
        let slots = [slot(KeyRole::KSK, 0, 0), slot(KeyRole::ZSK, 1, 0)];
        let eval = evaluate(&slots, &[], UnixTime::from_secs(0));

        assert_eq!(eval.requests.len(), 3);
        assert!(!eval.requests[0].standby);
        assert!(!eval.requests[1].standby);
        assert!(eval.requests[2].standby);
        assert!(eval.retire.is_empty());
    }

    #[test]
    fn satisfied_slot_requests_nothing() {
        let slots = [slot(KeyRole::ZSK, 0, 0)];
        let keys = vec![entry(1, KeyRole::ZSK, 0, true)];
        let eval = evaluate(&slots, &keys, UnixTime::from_secs(100));
        assert!(eval.requests.is_empty());
        assert!(eval.retire.is_empty());
    }

    #[test]
    fn expired_key_starts_a_successor() {
        let lifetime = 90 * 24 * 3600;
        let slots = [slot(KeyRole::ZSK, 0, lifetime)];
        let keys = vec![entry(1, KeyRole::ZSK, 0, true)];

        // Before expiry: nothing happens, but the roll is scheduled.
        let eval = evaluate(&slots, &keys, UnixTime::from_secs(100));
        assert!(eval.requests.is_empty());
        assert_eq!(
            eval.next_rolls,
            vec![(KeyRole::ZSK, UnixTime::from_secs(lifetime as i64))]
        );

        // At expiry: a successor is requested and the key retires.
        let eval = evaluate(&slots, &keys, UnixTime::from_secs(lifetime as i64));
        assert_eq!(eval.requests.len(), 1);
        assert!(!eval.requests[0].standby);
        assert_eq!(eval.retire, vec![keys[0].data.id]);
    }

    #[test]
    fn unmatched_keys_retire() {
        // The policy has no KSK slot any more.
        let slots = [slot(KeyRole::ZSK, 0, 0)];
        let keys = vec![
            entry(1, KeyRole::KSK, 0, true),
            entry(2, KeyRole::ZSK, 0, true),
        ];
        let eval = evaluate(&slots, &keys, UnixTime::from_secs(0));
        assert_eq!(eval.retire, vec![keys[0].data.id]);
        assert!(eval.requests.is_empty());
    }
}
