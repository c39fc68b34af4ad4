//! The per-key, per-record state machine.
//!
//! Given a zone's keys, their record states and the rollover dependencies
//! between them, compute and apply every transition that is allowed, safe
//! and desired right now, and report the earliest moment another transition
//! can become eligible.
//!
//! A record state only ever moves forward along HIDDEN → RUMOURED →
//! OMNIPRESENT → UNRETENTIVE → HIDDEN.  Which step is *desired* follows from
//! the key's `introducing` flag; whether it is *allowed* follows from timing
//! gates and the DS choreography with the parent; whether it is *safe*
//! follows from the chain-of-trust predicate.

use std::time::Duration;

use crate::datetime::UnixTime;
use crate::db::keydata::{DsAtParent, RecordState, RecordType};
use crate::db::policy::Policy;

use super::{Deps, KeyEntry};

//----------- Outcome ----------------------------------------------------------

/// The result of running the state machine to a fixed point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Whether any record state changed.
    pub changed: bool,

    /// The earliest future moment a further transition becomes eligible.
    pub next_gate: Option<UnixTime>,

    /// Whether a DS interaction is waiting on the operator.
    pub waiting_operator: bool,

    /// Whether desired transitions exist that no gate or operator action
    /// will unblock.  Surfaced to operators as a stuck zone.
    pub blocked: bool,
}

impl Outcome {
    fn note_gate(&mut self, at: UnixTime) {
        self.next_gate = Some(match self.next_gate {
            Some(t) => t.min(at),
            None => at,
        });
    }
}

//----------- The state machine ------------------------------------------------

/// One verdict on a candidate transition.
enum Verdict {
    /// Nothing to do for this record.
    Settled,

    /// Apply the transition to this state.
    Apply(RecordState),

    /// Eligible once the clock reaches the given moment.
    WaitUntil(UnixTime),

    /// Eligible once the operator performs a DS action.
    WaitOperator,

    /// Waiting for another record's progress; no gate of its own.
    Defer,

    /// The safety predicate forbids the step and nothing scheduled will
    /// change that.
    Blocked,
}

/// Run the state machine for one zone until no transition commits.
pub fn enforce(
    policy: &Policy,
    keys: &mut [KeyEntry],
    deps: &mut Deps,
    now: UnixTime,
) -> Outcome {
    let mut outcome = Outcome::default();

    loop {
        let mut progressed = false;

        // Gates and stalls are only meaningful on the final pass; earlier
        // passes may still unblock them.
        outcome.next_gate = None;
        outcome.blocked = false;
        outcome.waiting_operator = false;

        // Candidate order is deterministic: record types in processing
        // order, then keys by introduction time and key tag (the key lists
        // are loaded in that order).
        for rt in RecordType::ALL {
            for idx in 0..keys.len() {
                match consider(policy, keys, deps, idx, rt, now, &mut outcome) {
                    Verdict::Settled | Verdict::Defer => {}
                    Verdict::Apply(next) => {
                        apply(keys, deps, idx, rt, next, now);
                        outcome.changed = true;
                        progressed = true;
                    }
                    Verdict::WaitUntil(at) => outcome.note_gate(at),
                    Verdict::WaitOperator => outcome.waiting_operator = true,
                    Verdict::Blocked => outcome.blocked = true,
                }
            }
        }

        if !progressed {
            break;
        }
    }

    // A zone with a pending operator action or a future gate is not stuck.
    if outcome.waiting_operator || outcome.next_gate.is_some() {
        outcome.blocked = false;
    }

    outcome
}

/// Evaluate one candidate without applying it.
fn consider(
    policy: &Policy,
    keys: &mut [KeyEntry],
    deps: &Deps,
    idx: usize,
    rt: RecordType,
    now: UnixTime,
    outcome: &mut Outcome,
) -> Verdict {
    let cur = keys[idx].record_state(rt);
    // A standby key only pre-publishes its DNSKEY; it neither signs nor
    // appears at the parent until promoted into a regular slot.
    let wanted = keys[idx].data.introducing
        && (!keys[idx].data.standby || rt == RecordType::Dnskey);
    let desired = if wanted {
        RecordState::Omnipresent
    } else {
        RecordState::Hidden
    };

    let Some(next) = next_step(cur, desired) else {
        // Tidy up a DS choreography that never completed: a key withdrawn
        // while its DS was still on the way to the parent.
        if rt == RecordType::Ds && cur == RecordState::Hidden && !keys[idx].data.introducing {
            match keys[idx].data.ds_at_parent {
                DsAtParent::Submit => {
                    keys[idx].set_ds_at_parent(DsAtParent::Unsubmitted);
                }
                DsAtParent::Submitted | DsAtParent::Seen => {
                    keys[idx].set_ds_at_parent(DsAtParent::Retract);
                    outcome.waiting_operator = true;
                }
                _ => {}
            }
        }
        return Verdict::Settled;
    };

    match (cur, next) {
        (RecordState::Hidden, RecordState::Rumoured) => {
            introduction_verdict(keys, idx, rt)
        }
        (RecordState::Rumoured, RecordState::Omnipresent) => {
            let gate = publish_gate(policy, &keys[idx], rt);
            if rt == RecordType::Ds && keys[idx].data.ds_at_parent != DsAtParent::Seen {
                // The parent withdrew underneath us; wait for the operator.
                return Verdict::WaitOperator;
            }
            if now < gate {
                Verdict::WaitUntil(gate)
            } else {
                Verdict::Apply(RecordState::Omnipresent)
            }
        }
        (RecordState::Omnipresent, RecordState::Unretentive) => {
            withdrawal_verdict(keys, deps, idx, rt)
        }
        (RecordState::Unretentive, RecordState::Hidden) => {
            if rt == RecordType::Ds && keys[idx].data.ds_at_parent != DsAtParent::Unsubmitted {
                // `ds-gone` has not confirmed removal at the parent yet.
                return Verdict::WaitOperator;
            }
            let gate = retire_gate(policy, &keys[idx], rt);
            if now < gate {
                Verdict::WaitUntil(gate)
            } else {
                Verdict::Apply(RecordState::Hidden)
            }
        }
        _ => Verdict::Settled,
    }
}

/// The next state on the forward cycle, or `None` when settled.
fn next_step(cur: RecordState, desired: RecordState) -> Option<RecordState> {
    match (cur, desired) {
        (RecordState::Na, _) => None,
        (cur, desired) if cur == desired => None,
        (RecordState::Hidden, RecordState::Omnipresent) => Some(RecordState::Rumoured),
        // Keep moving forward; a retired key that only reached RUMOURED
        // still has to pass OMNIPRESENT before it may be withdrawn.
        (RecordState::Rumoured, _) => Some(RecordState::Omnipresent),
        (RecordState::Omnipresent, RecordState::Hidden) => Some(RecordState::Unretentive),
        (RecordState::Unretentive, _) => Some(RecordState::Hidden),
        _ => None,
    }
}

/// Decide an introduction (HIDDEN → RUMOURED).
fn introduction_verdict(keys: &mut [KeyEntry], idx: usize, rt: RecordType) -> Verdict {
    match rt {
        RecordType::Ds => {
            // A DS only goes to the parent once the DNSKEY it points at is
            // known to every cache.
            let dnskey_ready = keys[idx].record_state(RecordType::Dnskey).propagated()
                && keys[idx]
                    .record_state(RecordType::RrsigDnskey)
                    .propagated();
            match keys[idx].data.ds_at_parent {
                DsAtParent::Unsubmitted => {
                    if dnskey_ready {
                        keys[idx].set_ds_at_parent(DsAtParent::Submit);
                        Verdict::WaitOperator
                    } else {
                        Verdict::Defer
                    }
                }
                DsAtParent::Submit | DsAtParent::Submitted => Verdict::WaitOperator,
                DsAtParent::Seen => Verdict::Apply(RecordState::Rumoured),
                // A retract cycle is still finishing; pick the intro up
                // after `ds-gone`.
                DsAtParent::Retract | DsAtParent::Retracted => Verdict::WaitOperator,
            }
        }
        RecordType::Rrsig if keys[idx].minimize_for(rt) => {
            // Minimized signatures avoid the double-signature period: they
            // appear only once this key's DNSKEY is known to every cache.
            if keys[idx].record_state(RecordType::Dnskey).propagated() {
                Verdict::Apply(RecordState::Rumoured)
            } else {
                Verdict::Defer
            }
        }
        _ => Verdict::Apply(RecordState::Rumoured),
    }
}

/// Decide a withdrawal (OMNIPRESENT → UNRETENTIVE).
fn withdrawal_verdict(
    keys: &mut [KeyEntry],
    deps: &Deps,
    idx: usize,
    rt: RecordType,
) -> Verdict {
    // Records of one key leave in a fixed order: the DS goes first and must
    // be fully gone (caches may hold a DS long after the parent dropped it,
    // and it must never point at a vanished DNSKEY), then the signatures,
    // then the DNSKEY itself.
    let ordered = match rt {
        RecordType::Ds | RecordType::Rrsig => true,
        RecordType::RrsigDnskey => ds_gone(keys, idx),
        RecordType::Dnskey => {
            ds_gone(keys, idx)
                && !still_out(keys, idx, RecordType::RrsigDnskey)
                && !(keys[idx].data.role.signs_data() && still_out(keys, idx, RecordType::Rrsig))
        }
    };
    if !ordered {
        return Verdict::Defer;
    }

    // Every successor recorded against this record must have taken over.
    if !successors_ready(keys, deps, idx, rt) {
        return Verdict::Defer;
    }

    // The step must not sever the chain of trust.
    if !withdrawal_is_safe(keys, idx, rt) {
        return Verdict::Blocked;
    }

    if rt == RecordType::Ds {
        return match keys[idx].data.ds_at_parent {
            DsAtParent::Seen => {
                keys[idx].set_ds_at_parent(DsAtParent::Retract);
                Verdict::WaitOperator
            }
            DsAtParent::Retract => Verdict::WaitOperator,
            DsAtParent::Retracted => Verdict::Apply(RecordState::Unretentive),
            // The record cannot be OMNIPRESENT without having been seen.
            _ => Verdict::Blocked,
        };
    }

    Verdict::Apply(RecordState::Unretentive)
}

/// Whether the given record of a key is still being served or introduced.
fn still_out(keys: &[KeyEntry], idx: usize, rt: RecordType) -> bool {
    matches!(
        keys[idx].record_state(rt),
        RecordState::Rumoured | RecordState::Omnipresent
    )
}

/// Whether a key's DS has fully left every cache (or never applied).
fn ds_gone(keys: &[KeyEntry], idx: usize) -> bool {
    matches!(
        keys[idx].record_state(RecordType::Ds),
        RecordState::Hidden | RecordState::Na
    )
}

/// Whether every dependency edge from this key's record is satisfied.
fn successors_ready(keys: &[KeyEntry], deps: &Deps, idx: usize, rt: RecordType) -> bool {
    let from = keys[idx].data.id;
    let minimized = keys[idx].minimize_for(rt);

    deps.edges_from(from, rt).iter().all(|edge| {
        let Some(succ) = keys.iter().find(|k| k.data.id == edge.to_key_data_id) else {
            // The successor is gone; the edge no longer constrains.
            return true;
        };
        let succ_state = succ.record_state(rt);
        if succ_state.propagated() {
            return true;
        }
        // The minimize preference skips the both-visible phase: the
        // successor only has to be on its way, provided its DNSKEY is
        // already known to every cache.  Never applied to the DNSKEY
        // record itself.
        minimized
            && rt != RecordType::Dnskey
            && succ_state.possibly_visible()
            && succ.record_state(RecordType::Dnskey).propagated()
    })
}

/// Whether withdrawing `rt` of key `idx` keeps the chain of trust intact.
fn withdrawal_is_safe(keys: &[KeyEntry], idx: usize, rt: RecordType) -> bool {
    // A zone being taken unsigned has no chain left to preserve; the timing
    // gates alone sequence the teardown.
    if !keys.iter().any(|k| k.data.introducing) {
        return true;
    }

    let hypo = (idx, rt, RecordState::Unretentive);

    // Never sever the last fully-propagated chain, and never leave the zone
    // without even a possibly-visible chain.
    (!chain_exists(keys, None, true) || chain_exists(keys, Some(hypo), true))
        && (!chain_exists(keys, None, false) || chain_exists(keys, Some(hypo), false))
}

/// Whether a chain of trust exists over the (hypothetical) record states.
///
/// A chain needs one keyset-signing key whose DS, DNSKEY and DNSKEY-RRset
/// signature all qualify, and one data-signing key whose DNSKEY and data
/// signatures qualify.  `firm` restricts qualification to OMNIPRESENT;
/// otherwise any possibly-visible state qualifies.
fn chain_exists(
    keys: &[KeyEntry],
    hypo: Option<(usize, RecordType, RecordState)>,
    firm: bool,
) -> bool {
    let state = |i: usize, rt: RecordType| match hypo {
        Some((hi, hrt, hs)) if hi == i && hrt == rt => hs,
        _ => keys[i].record_state(rt),
    };
    let ok = |s: RecordState| {
        if firm {
            s.propagated()
        } else {
            s.possibly_visible()
        }
    };

    let keyset_path = keys.iter().enumerate().any(|(i, k)| {
        k.data.role.signs_keyset()
            && ok(state(i, RecordType::Ds))
            && ok(state(i, RecordType::Dnskey))
            && ok(state(i, RecordType::RrsigDnskey))
    });
    let data_path = keys.iter().enumerate().any(|(i, k)| {
        k.data.role.signs_data()
            && ok(state(i, RecordType::Dnskey))
            && ok(state(i, RecordType::Rrsig))
    });

    keyset_path && data_path
}

/// When a record may leave RUMOURED.
fn publish_gate(policy: &Policy, key: &KeyEntry, rt: RecordType) -> UnixTime {
    let Some(state) = key.record(rt) else {
        return UnixTime::FAR_FUTURE;
    };
    match rt {
        RecordType::Ds => {
            state.last_change
                + policy.parent.ds_ttl
                + policy.parent.propagation_delay
                + policy.parent.registration_delay
        }
        _ => {
            state.last_change
                + state.ttl
                + policy.zone.propagation_delay
                + policy.keys.publish_safety
        }
    }
}

/// When a record may leave UNRETENTIVE.
fn retire_gate(policy: &Policy, key: &KeyEntry, rt: RecordType) -> UnixTime {
    let Some(state) = key.record(rt) else {
        return UnixTime::FAR_FUTURE;
    };
    match rt {
        RecordType::Ds => {
            state.last_change
                + policy.parent.ds_ttl
                + policy.parent.propagation_delay
                + policy.keys.retire_safety
        }
        _ => {
            state.last_change
                + state.ttl
                + policy.zone.propagation_delay
                + policy.keys.retire_safety
        }
    }
}

/// Commit a transition.
fn apply(
    keys: &mut [KeyEntry],
    deps: &mut Deps,
    idx: usize,
    rt: RecordType,
    next: RecordState,
    now: UnixTime,
) {
    log::debug!(
        "key {} (tag {}): {} {} -> {}",
        keys[idx].data.id,
        keys[idx].data.keytag,
        rt,
        keys[idx].record_state(rt),
        next,
    );
    keys[idx].set_record(rt, next, now);

    // An edge has done its job once its from-side record is gone.
    if next == RecordState::Hidden {
        deps.remove_from(keys[idx].data.id, rt);
    }
}

/// The TTL a freshly-created record state should carry.
pub fn initial_ttl(policy: &Policy, rt: RecordType) -> Duration {
    match rt {
        RecordType::Ds => policy.parent.ds_ttl,
        RecordType::Dnskey | RecordType::RrsigDnskey => policy.keys.ttl,
        // Data signatures are observed for as long as the longest TTL in
        // the zone allows.
        RecordType::Rrsig => policy.signatures.max_zone_ttl,
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::KeyRole;
    use crate::enforcer::tests::{entry, policy};

    fn times(keys: &[KeyEntry], rt: RecordType) -> Vec<RecordState> {
        keys.iter().map(|k| k.record_state(rt)).collect()
    }

    #[test]
    fn fresh_keys_become_rumoured_immediately() {
        let policy = policy();
        let mut keys = vec![
            entry(1, KeyRole::KSK, 0, true),
            entry(2, KeyRole::ZSK, 0, true),
        ];
        let mut deps = Deps::new(Vec::new());

        let outcome = enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(0));

        assert!(outcome.changed);
        assert_eq!(keys[0].record_state(RecordType::Dnskey), RecordState::Rumoured);
        assert_eq!(
            keys[0].record_state(RecordType::RrsigDnskey),
            RecordState::Rumoured
        );
        assert_eq!(keys[1].record_state(RecordType::Rrsig), RecordState::Rumoured);
        // The DS stays hidden until the DNSKEY has fully propagated.
        assert_eq!(keys[0].record_state(RecordType::Ds), RecordState::Hidden);
        // DNSKEY gate: ttl 3600 + propagation 300 + publish safety 3600.
        assert_eq!(outcome.next_gate, Some(UnixTime::from_secs(7500)));
    }

    #[test]
    fn publication_respects_the_timing_gate() {
        let policy = policy();
        let mut keys = vec![
            entry(1, KeyRole::KSK, 0, true),
            entry(2, KeyRole::ZSK, 0, true),
        ];
        let mut deps = Deps::new(Vec::new());

        enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(0));
        let outcome = enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(7499));
        assert!(!outcome.changed);
        assert_eq!(outcome.next_gate, Some(UnixTime::from_secs(7500)));

        let outcome = enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(7500));
        assert!(outcome.changed);
        assert_eq!(
            times(&keys, RecordType::Dnskey),
            vec![RecordState::Omnipresent, RecordState::Omnipresent]
        );
        // The KSK's DNSKEY is now everywhere, so the DS moves to SUBMIT and
        // waits for the operator.
        assert_eq!(keys[0].data.ds_at_parent, DsAtParent::Submit);
        assert!(outcome.waiting_operator);
    }

    #[test]
    fn ds_advances_only_after_seen() {
        let policy = policy();
        let mut keys = vec![
            entry(1, KeyRole::KSK, 0, true),
            entry(2, KeyRole::ZSK, 0, true),
        ];
        let mut deps = Deps::new(Vec::new());

        enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(0));
        enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(7500));

        // ds-submit; ds-seen at t=20000.
        keys[0].set_ds_at_parent(DsAtParent::Submitted);
        enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(8000));
        assert_eq!(keys[0].record_state(RecordType::Ds), RecordState::Hidden);

        keys[0].set_ds_at_parent(DsAtParent::Seen);
        let outcome = enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(20000));
        assert_eq!(keys[0].record_state(RecordType::Ds), RecordState::Rumoured);
        // DS gate: parent ds ttl 3600 + parent propagation 300 +
        // registration delay 86400.
        assert_eq!(
            outcome.next_gate,
            Some(UnixTime::from_secs(20000 + 3600 + 300 + 86400))
        );

        let outcome = enforce(
            &policy,
            &mut keys,
            &mut deps,
            UnixTime::from_secs(20000 + 3600 + 300 + 86400),
        );
        assert!(outcome.changed);
        assert_eq!(
            keys[0].record_state(RecordType::Ds),
            RecordState::Omnipresent
        );
        assert!(!outcome.waiting_operator);
    }

    #[test]
    fn retiring_the_only_zsk_is_blocked() {
        let policy = policy();
        let mut keys = vec![
            entry(1, KeyRole::KSK, 0, true),
            entry(2, KeyRole::ZSK, 0, true),
        ];
        let mut deps = Deps::new(Vec::new());

        // Establish the full chain.
        run_to_stable(&policy, &mut keys, &mut deps);

        // Retire the only ZSK with no successor.
        keys[1].data.introducing = false;
        let outcome = enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(1_000_000));
        assert!(outcome.blocked);
        assert_eq!(keys[1].record_state(RecordType::Rrsig), RecordState::Omnipresent);
    }

    #[test]
    fn zsk_rollover_sequences_correctly() {
        let policy = policy();
        let mut keys = vec![
            entry(1, KeyRole::KSK, 0, true),
            entry(2, KeyRole::ZSK, 0, true),
        ];
        let mut deps = Deps::new(Vec::new());
        run_to_stable(&policy, &mut keys, &mut deps);

        // A successor appears; the old ZSK retires.
        let t0 = 1_000_000;
        keys.push(entry(3, KeyRole::ZSK, t0, true));
        keys[1].data.introducing = false;
        deps.add(keys[1].data.zone_id, keys[1].data.id, keys[2].data.id, RecordType::Dnskey);
        deps.add(keys[1].data.zone_id, keys[1].data.id, keys[2].data.id, RecordType::Rrsig);

        let outcome = enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(t0));
        // New DNSKEY and RRSIG are on their way in; nothing of the old key
        // may leave yet.
        assert_eq!(keys[2].record_state(RecordType::Dnskey), RecordState::Rumoured);
        assert_eq!(keys[2].record_state(RecordType::Rrsig), RecordState::Rumoured);
        assert_eq!(keys[1].record_state(RecordType::Rrsig), RecordState::Omnipresent);
        assert!(!outcome.blocked);

        // Once the successor is fully propagated, the old signatures and
        // then the old DNSKEY withdraw.
        let t1 = t0 + 7500;
        enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(t1));
        assert_eq!(
            keys[2].record_state(RecordType::Rrsig),
            RecordState::Omnipresent
        );
        assert_eq!(
            keys[1].record_state(RecordType::Rrsig),
            RecordState::Unretentive
        );
        assert_eq!(
            keys[1].record_state(RecordType::Dnskey),
            RecordState::Unretentive
        );

        // After the retire gate both reach HIDDEN and the edges are gone.
        let t2 = t1 + 3600 + 300 + 3600;
        let outcome = enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(t2));
        assert!(outcome.changed);
        assert_eq!(keys[1].record_state(RecordType::Rrsig), RecordState::Hidden);
        assert_eq!(keys[1].record_state(RecordType::Dnskey), RecordState::Hidden);
        assert!(deps.edges_from(keys[1].data.id, RecordType::Rrsig).is_empty());
        assert!(deps.edges_from(keys[1].data.id, RecordType::Dnskey).is_empty());
    }

    #[test]
    fn teardown_of_an_unsigned_zone_is_permitted() {
        let policy = policy();
        let mut keys = vec![
            entry(1, KeyRole::KSK, 0, true),
            entry(2, KeyRole::ZSK, 0, true),
        ];
        let mut deps = Deps::new(Vec::new());
        run_to_stable(&policy, &mut keys, &mut deps);

        keys[0].data.introducing = false;
        keys[1].data.introducing = false;

        // The DS goes first, via the operator.
        let t = 2_000_000;
        enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(t));
        assert_eq!(keys[0].data.ds_at_parent, DsAtParent::Retract);
        keys[0].set_ds_at_parent(DsAtParent::Retracted);

        let outcome = enforce(&policy, &mut keys, &mut deps, UnixTime::from_secs(t));
        assert!(outcome.changed);
        assert_eq!(
            keys[0].record_state(RecordType::Ds),
            RecordState::Unretentive
        );
    }

    /// Drive a fresh KSK+ZSK pair to a fully-propagated chain.
    fn run_to_stable(policy: &Policy, keys: &mut Vec<KeyEntry>, deps: &mut Deps) {
        enforce(policy, keys, deps, UnixTime::from_secs(0));
        enforce(policy, keys, deps, UnixTime::from_secs(7500));
        keys[0].set_ds_at_parent(DsAtParent::Seen);
        enforce(policy, keys, deps, UnixTime::from_secs(20_000));
        enforce(
            policy,
            keys,
            deps,
            UnixTime::from_secs(20_000 + 3600 + 300 + 86_400),
        );
        assert!(chain_exists(keys, None, true));
    }
}
