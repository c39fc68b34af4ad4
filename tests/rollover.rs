//! End-to-end rollover scenarios.
//!
//! These tests drive whole enforcement ticks against the in-memory store
//! and the soft token, playing the operator where the DS choreography asks
//! for one.  Time never advances on its own; every tick gets an explicit
//! `now`.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use warden_store::{Backend, RowId};
use wardend::api::ZoneStatus;
use wardend::control;
use wardend::datetime::UnixTime;
use wardend::db::hsmkey::{BackupState, HsmKey, HsmKeyState};
use wardend::db::keydata::{DsAtParent, KeyData, KeyState, RecordState, RecordType};
use wardend::db::policy::{Policy, PolicyKey};
use wardend::db::zone::{Adapter, Zone};
use wardend::db::{KeyRole, Minimize};
use wardend::enforcer::{self, TickOutcome};
use wardend::factory::{KeyFactory, KeySlot};
use wardend::hsm::Hsm;
use wardend::hsm::soft::SoftHsm;

//----------- Harness ----------------------------------------------------------

struct Harness {
    store: Arc<warden_store::MemoryBackend>,
    factory: Arc<KeyFactory>,
    gen_rx: tokio::sync::mpsc::UnboundedReceiver<KeySlot>,
    hsm: Arc<SoftHsm>,
    zone_id: RowId,
    zone_name: String,
    _tmp: tempfile::TempDir,
}

/// The timing parameters of the reference scenarios: TTL 3600, propagation
/// 300, safeties 3600, registration delay one day.
fn scenario_policy() -> Policy {
    let mut policy = Policy::new("default");
    policy.keys.ttl = Duration::from_secs(3600);
    policy.keys.publish_safety = Duration::from_secs(3600);
    policy.keys.retire_safety = Duration::from_secs(3600);
    policy.keys.purge_after = Duration::from_secs(24 * 3600);
    policy.zone.propagation_delay = Duration::from_secs(300);
    policy.parent.ds_ttl = Duration::from_secs(3600);
    policy.parent.propagation_delay = Duration::from_secs(300);
    policy.parent.registration_delay = Duration::from_secs(86400);
    policy.signatures.max_zone_ttl = Duration::from_secs(3600);
    policy.denial.resalt = Duration::from_secs(7 * 24 * 3600);
    policy
}

fn slot(policy_id: RowId, role: KeyRole, lifetime_secs: u64) -> PolicyKey {
    PolicyKey {
        id: RowId::from_raw(0),
        rev: 0,
        policy_id,
        role,
        algorithm: 13,
        bits: 256,
        lifetime: Duration::from_secs(lifetime_secs),
        repository: "default".into(),
        standby: 0,
        manual_rollover: false,
        rfc5011: false,
        minimize: Minimize::NONE,
    }
}

impl Harness {
    /// A zone under the scenario policy with a KSK (1y) and a ZSK (90d).
    fn new() -> Self {
        Self::with_policy(scenario_policy())
    }

    fn with_policy(policy: Policy) -> Self {
        let store = Arc::new(warden_store::MemoryBackend::new());
        let tmp = tempfile::tempdir().unwrap();
        let signconf =
            Utf8PathBuf::from_path_buf(tmp.path().join("example.com.json")).unwrap();

        {
            let mut txn = store.begin().unwrap();
            let policy = policy.create(&mut *txn).unwrap();
            slot(policy.id, KeyRole::KSK, 365 * 24 * 3600)
                .create(&mut *txn)
                .unwrap();
            slot(policy.id, KeyRole::ZSK, 90 * 24 * 3600)
                .create(&mut *txn)
                .unwrap();
            txn.commit().unwrap();
        }

        let hsm = Arc::new(SoftHsm::new(vec!["default".into()]));
        let (factory, gen_rx) = KeyFactory::load(&*store, hsm.clone()).unwrap();

        let zone = control::zone_add(
            &*store,
            "example.com",
            "default",
            signconf,
            Adapter::file("example.com.zone"),
            Adapter::file("example.com.zone.signed"),
        )
        .unwrap();

        let mut harness = Self {
            store,
            factory,
            gen_rx,
            hsm,
            zone_id: zone.id,
            zone_name: zone.name,
            _tmp: tmp,
        };

        // Pregenerate the pool so the first tick can bind immediately.
        harness.provision();
        harness
    }

    /// Run one enforcement tick at `t`.
    fn tick(&self, t: i64) -> TickOutcome {
        enforcer::tick(
            &*self.store,
            &self.factory,
            self.zone_id,
            UnixTime::from_secs(t),
            None,
        )
        .unwrap()
    }

    /// Queue and immediately fulfil replenishment for the zone's policy.
    fn provision(&mut self) {
        {
            let txn = self.store.begin().unwrap();
            let policy = Policy::get_by_name(&*txn, "default").unwrap().unwrap();
            let slots = PolicyKey::list_for_policy(&*txn, policy.id).unwrap();
            self.factory
                .schedule_replenishment(&*txn, &policy, &slots)
                .unwrap();
        }
        self.fulfil_generation();
    }

    /// Play the HSM: turn queued generation requests into pooled keys.
    fn fulfil_generation(&mut self) {
        while let Ok(slot) = self.gen_rx.try_recv() {
            let generated = self
                .hsm
                .generate_key(&slot.repository, slot.algorithm, slot.bits)
                .unwrap();
            let key = HsmKey {
                id: RowId::from_raw(0),
                rev: 0,
                policy_id: slot.policy_id,
                locator: generated.locator,
                state: HsmKeyState::Generate,
                bits: slot.bits,
                algorithm: slot.algorithm,
                role: slot.role,
                inception: UnixTime::from_secs(0),
                key_type: generated.key_type,
                repository: slot.repository.clone(),
                backup: BackupState::None,
            };
            let mut txn = self.store.begin().unwrap();
            let key = key.create(&mut *txn).unwrap();
            txn.commit().unwrap();
            self.factory.fold_in(key);
        }
    }

    /// The zone's bindings, with their record states.
    fn keys(&self) -> Vec<(KeyData, Vec<KeyState>)> {
        let txn = self.store.begin().unwrap();
        KeyData::list_for_zone(&*txn, self.zone_id)
            .unwrap()
            .into_iter()
            .map(|data| {
                let states = KeyState::list_for_key(&*txn, data.id).unwrap();
                (data, states)
            })
            .collect()
    }

    fn zone(&self) -> Zone {
        let txn = self.store.begin().unwrap();
        Zone::get(&*txn, self.zone_id).unwrap()
    }

    fn state_of(&self, data: &KeyData, rt: RecordType) -> RecordState {
        self.keys()
            .iter()
            .find(|(d, _)| d.id == data.id)
            .and_then(|(_, states)| {
                states
                    .iter()
                    .find(|s| s.record_type == rt)
                    .map(|s| s.state)
            })
            .unwrap_or(RecordState::Na)
    }

    fn key_of_role(&self, role: KeyRole) -> KeyData {
        self.keys()
            .into_iter()
            .map(|(data, _)| data)
            .find(|data| data.role == role && data.introducing)
            .expect("an introducing key of the role exists")
    }

    /// Play a prompt operator: confirm every pending DS interaction at `t`.
    fn confirm_ds(&self, t: i64) -> Option<TickOutcome> {
        let now = UnixTime::from_secs(t);
        let mut last = None;
        let pending: Vec<KeyData> = self
            .keys()
            .into_iter()
            .map(|(data, _)| data)
            .filter(|data| {
                matches!(data.ds_at_parent, DsAtParent::Submit | DsAtParent::Retract)
            })
            .collect();
        for data in pending {
            match data.ds_at_parent {
                DsAtParent::Submit => {
                    control::ds_submit(
                        &*self.store,
                        &self.factory,
                        &self.zone_name,
                        data.keytag,
                        now,
                    )
                    .unwrap();
                    last = Some(
                        control::ds_seen(
                            &*self.store,
                            &self.factory,
                            &self.zone_name,
                            data.keytag,
                            now,
                        )
                        .unwrap(),
                    );
                }
                DsAtParent::Retract => {
                    control::ds_retract(
                        &*self.store,
                        &self.factory,
                        &self.zone_name,
                        data.keytag,
                        now,
                    )
                    .unwrap();
                    last = Some(
                        control::ds_gone(
                            &*self.store,
                            &self.factory,
                            &self.zone_name,
                            data.keytag,
                            now,
                        )
                        .unwrap(),
                    );
                }
                _ => {}
            }
        }
        last
    }

    /// Whether a fully-propagated chain of trust exists.
    fn chain_is_firm(&self) -> bool {
        let keys = self.keys();
        let omni = |states: &[KeyState], rt: RecordType| {
            states
                .iter()
                .find(|s| s.record_type == rt)
                .is_some_and(|s| s.state == RecordState::Omnipresent)
        };
        let keyset = keys.iter().any(|(data, states)| {
            data.role.signs_keyset()
                && omni(states, RecordType::Ds)
                && omni(states, RecordType::Dnskey)
                && omni(states, RecordType::RrsigDnskey)
        });
        let data_path = keys.iter().any(|(data, states)| {
            data.role.signs_data()
                && omni(states, RecordType::Dnskey)
                && omni(states, RecordType::Rrsig)
        });
        keyset && data_path
    }

    /// Advance the zone, confirming DS actions promptly, until nothing is
    /// scheduled before `until`.  Returns the time of the last tick.  After
    /// the chain first becomes firm it must never break again.
    fn drive(&mut self, mut t: i64, until: i64) -> i64 {
        let mut was_firm = false;
        for _ in 0..100 {
            let mut outcome = self.tick(t);
            self.fulfil_generation();
            if let Some(last) = self.confirm_ds(t) {
                outcome = last;
            }

            if was_firm {
                assert!(
                    self.chain_is_firm(),
                    "the chain of trust broke at t={t}"
                );
            }
            was_firm = was_firm || self.chain_is_firm();

            if outcome.next == UnixTime::FAR_FUTURE {
                return t;
            }
            let next = outcome.next.as_secs();
            if next > until {
                return t;
            }
            // A deficit tick retries at the same moment once the pool has
            // been refilled.
            t = next.max(t);
        }
        panic!("the zone did not settle within 100 ticks");
    }

    /// Every row of every table, for idempotence comparisons.
    fn snapshot(&self) -> Vec<(String, Vec<warden_store::Row>)> {
        let txn = self.store.begin().unwrap();
        warden_store::table::ALL
            .iter()
            .copied()
            .map(|name| {
                (
                    name.to_string(),
                    txn.read(name, &[], &warden_store::ClauseList::new()).unwrap(),
                )
            })
            .collect()
    }
}

//----------- Scenario 1: KSK and ZSK introduction -----------------------------

#[test]
fn initial_signing_ceremony() {
    let h = Harness::new();

    // t=0: both keys bind and their DNSKEYs become visible.
    let outcome = h.tick(0);
    let ksk = h.key_of_role(KeyRole::KSK);
    let zsk = h.key_of_role(KeyRole::ZSK);
    assert_eq!(h.state_of(&ksk, RecordType::Dnskey), RecordState::Rumoured);
    assert_eq!(h.state_of(&zsk, RecordType::Dnskey), RecordState::Rumoured);
    assert_eq!(h.state_of(&zsk, RecordType::Rrsig), RecordState::Rumoured);
    // TTL 3600 + propagation 300 + publish safety 3600.
    assert_eq!(outcome.next, UnixTime::from_secs(7500));

    // t=7500: everything zone-side is omnipresent; the DS may go out.
    let outcome = h.tick(7500);
    let ksk = h.key_of_role(KeyRole::KSK);
    assert_eq!(
        h.state_of(&ksk, RecordType::Dnskey),
        RecordState::Omnipresent
    );
    assert_eq!(ksk.ds_at_parent, DsAtParent::Submit);
    assert_eq!(outcome.status, ZoneStatus::WaitingForOperator);

    // The operator submits, and the parent shows the DS at t=20000.
    control::ds_submit(&*h.store, &h.factory, "example.com", ksk.keytag, UnixTime::from_secs(8000))
        .unwrap();
    let outcome = control::ds_seen(
        &*h.store,
        &h.factory,
        "example.com",
        ksk.keytag,
        UnixTime::from_secs(20000),
    )
    .unwrap();
    let ksk = h.key_of_role(KeyRole::KSK);
    assert_eq!(h.state_of(&ksk, RecordType::Ds), RecordState::Rumoured);
    // Parent DS TTL 3600 + parent propagation 300 + registration delay 86400.
    assert_eq!(outcome.next, UnixTime::from_secs(20000 + 3600 + 300 + 86400));

    // Once the DS has propagated, the chain is complete.
    let outcome = h.tick(20000 + 3600 + 300 + 86400);
    assert_eq!(outcome.status, ZoneStatus::Ok);
    assert!(h.chain_is_firm());

    let ksk = h.key_of_role(KeyRole::KSK);
    let zsk = h.key_of_role(KeyRole::ZSK);
    assert!(ksk.active_ksk);
    assert!(zsk.active_zsk);

    // The signer configuration reflects the active pair.
    let zone = h.zone();
    assert!(!zone.signconf_needs_writing);
    let signconf: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&zone.signconf_path).unwrap()).unwrap();
    assert_eq!(signconf["keys"].as_array().unwrap().len(), 2);
    assert_eq!(signconf["passthrough"], serde_json::Value::Bool(false));
}

//----------- Idempotence ------------------------------------------------------

#[test]
fn a_tick_without_time_advance_writes_nothing() {
    let mut h = Harness::new();
    h.drive(0, 30000);

    let t = 30000;
    h.tick(t);
    let before = h.snapshot();
    let outcome_a = h.tick(t);
    let outcome_b = h.tick(t);
    assert_eq!(before, h.snapshot());
    assert_eq!(outcome_a, outcome_b);
}

//----------- Scenario 2: ZSK lifetime rollover --------------------------------

#[test]
fn zsk_rolls_over_at_end_of_lifetime() {
    let mut h = Harness::new();

    // Reach the steady state.
    h.drive(0, 200_000);
    let old_zsk = h.key_of_role(KeyRole::ZSK);
    assert!(h.chain_is_firm());

    // The ZSK lifetime (90 days) expires; a successor takes over.
    let expiry = 90 * 24 * 3600;
    let end = expiry + 14 * 24 * 3600;
    h.drive(expiry, end);

    let new_zsk = h.key_of_role(KeyRole::ZSK);
    assert_ne!(new_zsk.id, old_zsk.id);
    assert!(new_zsk.active_zsk);
    assert!(h.chain_is_firm());

    // The old binding was purged and its HSM key returned to the pool.
    let txn = h.store.begin().unwrap();
    assert!(
        KeyData::list_for_zone(&*txn, h.zone_id)
            .unwrap()
            .iter()
            .all(|d| d.id != old_zsk.id)
    );
    let old_hsm = HsmKey::get(&*txn, old_zsk.hsm_key_id).unwrap();
    assert_eq!(old_hsm.state, HsmKeyState::Unused);
}

//----------- Scenario 3: operator-initiated KSK roll --------------------------

#[test]
fn roll_ksk_now_hands_over_the_ds() {
    let mut h = Harness::new();
    h.drive(0, 200_000);
    let old_ksk = h.key_of_role(KeyRole::KSK);

    // The operator asks for a roll; the successor is driven through the
    // full DS handover.
    let t = 300_000;
    control::roll_now(&*h.store, &h.factory, "example.com", KeyRole::KSK, UnixTime::from_secs(t))
        .unwrap();
    h.fulfil_generation();
    h.drive(t, t + 40 * 24 * 3600);

    let new_ksk = h.key_of_role(KeyRole::KSK);
    assert_ne!(new_ksk.id, old_ksk.id);
    assert!(new_ksk.active_ksk);
    assert_eq!(new_ksk.ds_at_parent, DsAtParent::Seen);
    assert!(h.chain_is_firm());

    // The old key is fully withdrawn (or already purged), and its DS cycle
    // completed with ds-gone.
    let txn = h.store.begin().unwrap();
    let old = KeyData::list_for_zone(&*txn, h.zone_id)
        .unwrap()
        .into_iter()
        .find(|d| d.id == old_ksk.id);
    if let Some(old) = old {
        assert_eq!(old.ds_at_parent, DsAtParent::Unsubmitted);
        let states = KeyState::list_for_key(&*txn, old.id).unwrap();
        for state in states {
            if state.record_type.applies_to(KeyRole::KSK) {
                assert_eq!(state.state, RecordState::Hidden);
            }
        }
    }
}

//----------- Scenario 4: conflicting writers ----------------------------------

#[test]
fn a_stale_revision_never_double_applies() {
    let h = Harness::new();

    // Two views of the same zone row.
    let txn = h.store.begin().unwrap();
    let mut first = Zone::get(&*txn, h.zone_id).unwrap();
    let mut second = Zone::get(&*txn, h.zone_id).unwrap();
    drop(txn);

    let mut txn = h.store.begin().unwrap();
    first.roll_zsk_now = true;
    first.update(&mut *txn).unwrap();
    txn.commit().unwrap();

    // The second writer holds the old revision and must fail.
    let mut txn = h.store.begin().unwrap();
    second.roll_zsk_now = true;
    let err = second.update(&mut *txn).unwrap_err();
    assert!(err.is_transient());
    txn.rollback();
}

//----------- Scenario 5: NSEC3 resalt -----------------------------------------

#[test]
fn the_salt_is_regenerated_on_schedule() {
    let mut h = Harness::new();
    h.drive(0, 30_000);

    let salt_before = {
        let txn = h.store.begin().unwrap();
        let policy = Policy::get_by_name(&*txn, "default").unwrap().unwrap();
        policy.denial.salt.clone().expect("the first tick salted")
    };
    let signconf_before =
        std::fs::read_to_string(&h.zone().signconf_path).unwrap();

    // A week later the salt ages out.
    let t = 8 * 24 * 3600;
    h.tick(t);

    let txn = h.store.begin().unwrap();
    let policy = Policy::get_by_name(&*txn, "default").unwrap().unwrap();
    let salt_after = policy.denial.salt.clone().unwrap();
    assert_ne!(salt_before, salt_after);
    assert_eq!(policy.denial.salt_last_change, Some(UnixTime::from_secs(t)));

    // The signer sees the new salt.
    let signconf_after = std::fs::read_to_string(&h.zone().signconf_path).unwrap();
    assert_ne!(signconf_before, signconf_after);
    assert!(signconf_after.contains(&salt_after));
}

//----------- Scenario 6: passthrough ------------------------------------------

#[test]
fn passthrough_zones_never_sign() {
    let mut policy = scenario_policy();
    policy.passthrough = true;
    let h = Harness::with_policy(policy);

    let outcome = h.tick(0);
    assert_eq!(outcome.next, UnixTime::FAR_FUTURE);
    assert!(h.keys().is_empty());

    let zone = h.zone();
    assert!(!zone.signconf_needs_writing);
    let signconf: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&zone.signconf_path).unwrap()).unwrap();
    assert_eq!(signconf["passthrough"], serde_json::Value::Bool(true));

    // The marker is written exactly once.
    std::fs::remove_file(&zone.signconf_path).unwrap();
    let outcome = h.tick(1000);
    assert_eq!(outcome.next, UnixTime::FAR_FUTURE);
    assert!(!zone.signconf_path.exists());
}
