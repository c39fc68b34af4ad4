//! The per-zone enforcement loop.
//!
//! One tick of one zone: load the zone's keys inside a transaction, work
//! out what the key set should look like, bind fresh keys from the factory,
//! run the record state machine to a fixed point, emit the signer
//! configuration if anything changed, garbage-collect spent keys, and
//! report when the zone next needs attention.  Either the whole tick
//! commits or none of it does.

use std::time::Duration;

use ring::rand::{SecureRandom, SystemRandom};
use warden_store::{Backend, RowId, Transaction};

use crate::api::ZoneStatus;
use crate::datetime::UnixTime;
use crate::db::hsmkey::{HsmKey, HsmKeyState};
use crate::db::keydata::{
    DsAtParent, KeyData, KeyDependency, KeyState, RecordState, RecordType,
};
use crate::db::policy::{Policy, PolicyKey};
use crate::db::zone::Zone;
use crate::db::KeyRole;
use crate::error::Error;
use crate::factory::{KeyFactory, KeySlot};
use crate::hsm::keytag_for_locator;
use crate::signconf;
use crate::util::hex_encode;

pub mod evaluate;
pub mod lifecycle;

/// How often a tick retries after a stale revision before giving up.
const MAX_TICK_ATTEMPTS: u32 = 3;

/// How long a zone backs off when a key slot cannot be filled yet.
const DEFICIT_BACKOFF: Duration = Duration::from_secs(300);

/// How often a zone waiting on the operator is re-examined.
const OPERATOR_POLL: Duration = Duration::from_secs(900);

//----------- KeyEntry ---------------------------------------------------------

/// One record state row, with its write-back flag.
#[derive(Clone, Debug)]
pub struct StateSlot {
    pub row: KeyState,
    pub dirty: bool,
}

/// A zone's key binding with everything the engine needs in one place.
#[derive(Clone, Debug)]
pub struct KeyEntry {
    /// The binding row.
    pub data: KeyData,

    /// The backing HSM key row.
    pub hsm: HsmKey,

    /// The record states, in processing order.
    pub states: Vec<StateSlot>,

    /// Whether the binding row needs writing back.
    pub data_dirty: bool,

    /// Whether the HSM key row needs writing back.
    pub hsm_dirty: bool,
}

impl KeyEntry {
    /// The state row for a record type.
    pub fn record(&self, rt: RecordType) -> Option<&KeyState> {
        self.states
            .iter()
            .map(|slot| &slot.row)
            .find(|row| row.record_type == rt)
    }

    /// The current state of a record type; NA when the row is absent.
    pub fn record_state(&self, rt: RecordType) -> RecordState {
        self.record(rt).map(|row| row.state).unwrap_or(RecordState::Na)
    }

    /// The minimize flag of a record type.
    pub fn minimize_for(&self, rt: RecordType) -> bool {
        self.record(rt).map(|row| row.minimize).unwrap_or(false)
    }

    /// Commit a record state change.
    pub fn set_record(&mut self, rt: RecordType, state: RecordState, now: UnixTime) {
        if let Some(slot) = self
            .states
            .iter_mut()
            .find(|slot| slot.row.record_type == rt)
        {
            slot.row.state = state;
            slot.row.last_change = now;
            slot.dirty = true;
        }
    }

    /// Change the DS choreography state.
    pub fn set_ds_at_parent(&mut self, state: DsAtParent) {
        if self.data.ds_at_parent != state {
            self.data.ds_at_parent = state;
            self.data_dirty = true;
        }
    }

    /// The record types this key's role uses.
    pub fn applicable(&self) -> impl Iterator<Item = RecordType> + '_ {
        RecordType::ALL
            .into_iter()
            .filter(|rt| rt.applies_to(self.data.role))
    }

    /// Whether every applicable record is HIDDEN.
    pub fn all_hidden(&self) -> bool {
        self.applicable()
            .all(|rt| self.record_state(rt) == RecordState::Hidden)
    }

    /// Whether every applicable record is OMNIPRESENT.
    pub fn all_propagated(&self) -> bool {
        self.applicable().all(|rt| self.record_state(rt).propagated())
    }

    /// The most recent state change across applicable records.
    pub fn last_change(&self) -> UnixTime {
        self.applicable()
            .filter_map(|rt| self.record(rt))
            .map(|row| row.last_change)
            .max()
            .unwrap_or(UnixTime::from_secs(0))
    }

    /// Whether the key currently performs its role.
    pub fn is_active(&self) -> bool {
        self.data.active_ksk || self.data.active_zsk
    }

    fn set_hsm_state(&mut self, state: HsmKeyState) {
        // The HSM key lifecycle only moves forward.  Under a key-sharing
        // policy several zones drive the same row; a zone still publishing
        // must not pull an already-active key back.
        fn rank(state: HsmKeyState) -> u8 {
            match state {
                HsmKeyState::Unused => 0,
                HsmKeyState::Generate => 1,
                HsmKeyState::Publish => 2,
                HsmKeyState::Ready => 3,
                HsmKeyState::Active => 4,
                HsmKeyState::Retire => 5,
                HsmKeyState::Dead => 6,
            }
        }
        if rank(state) > rank(self.hsm.state) {
            self.hsm.state = state;
            self.hsm_dirty = true;
        }
    }

    fn set_active(&mut self, ksk: bool, zsk: bool) {
        if self.data.active_ksk != ksk || self.data.active_zsk != zsk {
            self.data.active_ksk = ksk;
            self.data.active_zsk = zsk;
            self.data_dirty = true;
        }
    }
}

//----------- Deps -------------------------------------------------------------

struct DepEntry {
    row: KeyDependency,
    deleted: bool,
}

/// The dependency edges of one zone, with creations and removals tracked
/// for write-back.
pub struct Deps {
    entries: Vec<DepEntry>,
}

impl Deps {
    /// Wrap the stored edges of a zone.
    pub fn new(rows: Vec<KeyDependency>) -> Self {
        Self {
            entries: rows
                .into_iter()
                .map(|row| DepEntry {
                    row,
                    deleted: false,
                })
                .collect(),
        }
    }

    /// Record that `to` is taking over `rt` from `from`.
    pub fn add(&mut self, zone_id: RowId, from: RowId, to: RowId, rt: RecordType) {
        let exists = self.entries.iter().any(|e| {
            !e.deleted
                && e.row.from_key_data_id == from
                && e.row.to_key_data_id == to
                && e.row.record_type == rt
        });
        if exists {
            return;
        }
        self.entries.push(DepEntry {
            row: KeyDependency {
                id: RowId::from_raw(0),
                rev: 0,
                zone_id,
                from_key_data_id: from,
                to_key_data_id: to,
                record_type: rt,
            },
            deleted: false,
        });
    }

    /// The live edges leaving `from` for record type `rt`.
    pub fn edges_from(&self, from: RowId, rt: RecordType) -> Vec<&KeyDependency> {
        self.entries
            .iter()
            .filter(|e| {
                !e.deleted && e.row.from_key_data_id == from && e.row.record_type == rt
            })
            .map(|e| &e.row)
            .collect()
    }

    /// Drop every edge leaving `from` for record type `rt`.
    pub fn remove_from(&mut self, from: RowId, rt: RecordType) {
        for entry in &mut self.entries {
            if entry.row.from_key_data_id == from && entry.row.record_type == rt {
                entry.deleted = true;
            }
        }
    }

    /// Whether any live edge references the key, on either side.
    pub fn references(&self, key: RowId) -> bool {
        self.entries.iter().any(|e| {
            !e.deleted && (e.row.from_key_data_id == key || e.row.to_key_data_id == key)
        })
    }

    fn persist(self, txn: &mut dyn Transaction) -> Result<(), Error> {
        for entry in self.entries {
            match (entry.deleted, entry.row.rev) {
                // Never stored and already gone: nothing to do.
                (true, 0) => {}
                (true, _) => entry.row.delete(txn)?,
                (false, 0) => {
                    entry.row.create(txn)?;
                }
                (false, _) => {}
            }
        }
        Ok(())
    }
}

//----------- TickOutcome ------------------------------------------------------

/// What one zone tick reports back to the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickOutcome {
    /// When the zone next needs attention.
    pub next: UnixTime,

    /// The operator-visible condition of the zone.
    pub status: ZoneStatus,
}

//----------- tick -------------------------------------------------------------

/// Run one enforcement tick for a zone, retrying stale revisions.
///
/// The optional deadline is soft: it is checked between attempts, so an
/// expired tick gives up without committing rather than being interrupted.
pub fn tick(
    store: &dyn Backend,
    factory: &KeyFactory,
    zone_id: RowId,
    now: UnixTime,
    deadline: Option<std::time::Instant>,
) -> Result<TickOutcome, Error> {
    let mut attempt = 0;
    loop {
        if attempt > 0 && deadline.is_some_and(|d| std::time::Instant::now() >= d) {
            return Err(Error::Transient("the tick deadline expired".into()));
        }
        attempt += 1;
        let mut allocated = Vec::new();
        let mut recycled = Vec::new();

        let result = run_transaction(store, factory, zone_id, now, &mut allocated, &mut recycled);
        match result {
            Ok(outcome) => {
                // Spent keys only re-enter the pool once their UNUSED state
                // is durable.
                for key in recycled {
                    factory.fold_in(key);
                }
                return Ok(outcome);
            }
            Err(err) => {
                // The transaction rolled back; bindings that were handed
                // out return to the free list.
                for key in allocated {
                    factory.restore(key);
                }
                if err.is_transient() && attempt < MAX_TICK_ATTEMPTS {
                    log::warn!("Zone tick conflicted ({err}), retrying");
                    continue;
                }
                return Err(err);
            }
        }
    }
}

fn run_transaction(
    store: &dyn Backend,
    factory: &KeyFactory,
    zone_id: RowId,
    now: UnixTime,
    allocated: &mut Vec<HsmKey>,
    recycled: &mut Vec<HsmKey>,
) -> Result<TickOutcome, Error> {
    let mut txn = store.begin()?;
    let outcome = update(&mut *txn, factory, zone_id, now, allocated, recycled)?;
    txn.commit()?;
    Ok(outcome)
}

//----------- update -----------------------------------------------------------

/// One enforcement pass over one zone, inside the caller's transaction.
pub fn update(
    txn: &mut dyn Transaction,
    factory: &KeyFactory,
    zone_id: RowId,
    now: UnixTime,
    allocated: &mut Vec<HsmKey>,
    recycled: &mut Vec<HsmKey>,
) -> Result<TickOutcome, Error> {
    let mut zone = Zone::get(&*txn, zone_id)?;
    let zone_snapshot = zone.clone();
    let mut policy = Policy::get(&*txn, zone.policy_id)?;
    let policy_snapshot = policy.clone();
    let policy_keys = PolicyKey::list_for_policy(&*txn, policy.id)?;

    // A passthrough policy disables everything; the marker configuration is
    // written exactly once.
    if policy.passthrough {
        if zone.signconf_needs_writing {
            signconf::write_passthrough(&zone)?;
            zone.signconf_needs_writing = false;
        }
        zone.next_change = None;
        if zone != zone_snapshot {
            zone.update(txn)?;
        }
        return Ok(TickOutcome {
            next: UnixTime::FAR_FUTURE,
            status: ZoneStatus::Ok,
        });
    }

    let mut keys = load_keys(&*txn, zone_id)?;
    let mut deps = Deps::new(KeyDependency::list_for_zone(&*txn, zone_id)?);
    let mut signconf_dirty = zone.signconf_needs_writing;

    // NSEC3 salts age out.
    if let Some(due) = policy.denial.next_resalt() {
        if now >= due {
            policy.denial.salt = Some(new_salt(policy.denial.salt_length)?);
            policy.denial.salt_last_change = Some(now);
            signconf_dirty = true;
            log::info!("Generated a fresh NSEC3 salt for policy '{}'", policy.name);
        }
    }

    // Operator-requested rollovers: retire the currently active keys of the
    // role and let the evaluator start successors.
    for role in [KeyRole::KSK, KeyRole::ZSK, KeyRole::CSK] {
        if !zone.roll_now(role) {
            continue;
        }
        for key in keys.iter_mut().filter(|k| k.data.role == role) {
            if key.data.introducing && key.is_active() {
                key.data.introducing = false;
                key.data_dirty = true;
                key.set_active(false, false);
            }
        }
        zone.set_roll_now(role, false);
        log::info!("Starting an operator-requested {role} roll for zone '{}'", zone.name);
    }

    // What should the key set look like?
    let eval = evaluate::evaluate(&policy_keys, &keys, now);
    let mut next_rolls = eval.next_rolls.clone();
    for id in &eval.retire {
        if let Some(key) = keys.iter_mut().find(|k| k.data.id == *id) {
            key.data.introducing = false;
            key.data_dirty = true;
        }
    }

    // Bind fresh keys for unfilled slots.  Under a key-sharing policy a key
    // already serving a sibling zone is preferred over the pool.
    let mut deficit = false;
    for request in &eval.requests {
        let pk = &request.policy_key;
        let slot = KeySlot::of(policy.id, pk);
        let shared = if policy.keys.shared {
            find_shared_key(&*txn, &slot, &keys)?
        } else {
            None
        };
        let from_pool = shared.is_none();
        let Some(pool_key) = shared.or_else(|| factory.allocate(&slot)) else {
            log::warn!(
                "No pregenerated key for zone '{}' ({} alg {} {} bits in '{}')",
                zone.name,
                pk.role,
                pk.algorithm,
                pk.bits,
                pk.repository,
            );
            deficit = true;
            continue;
        };
        if from_pool {
            allocated.push(pool_key.clone());
        }
        keys.push(bind_key(txn, &zone, &policy, pk, pool_key, request.standby, now)?);
        if !pk.manual_rollover && !pk.lifetime.is_zero() {
            note_roll(&mut next_rolls, pk.role, now + pk.lifetime);
        }
    }

    // Record which successors take over from retiring keys.
    record_dependencies(&mut deps, zone_id, &keys);

    // Advance the state machine to a fixed point.
    let outcome = lifecycle::enforce(&policy, &mut keys, &mut deps, now);

    // Derive the runtime flags from the record states.
    sync_runtime(&mut keys);

    // Garbage-collect keys whose records are all hidden and stale.
    let next_purge = collect_garbage(txn, &mut keys, &deps, &policy, now, recycled)?;

    // Emit the signer configuration when the observable key set changed.
    if outcome.changed || signconf_dirty {
        signconf::write(&zone, &policy, &keys)?;
        zone.signconf_needs_writing = false;
        zone.ttl_end_ds = now + policy.parent.ds_ttl;
        zone.ttl_end_dk = now + policy.keys.ttl;
        zone.ttl_end_rs = now + policy.signatures.max_zone_ttl;
    }

    // Reporting: when each role next rolls.
    for role in [KeyRole::KSK, KeyRole::ZSK, KeyRole::CSK] {
        let at = next_rolls
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, t)| *t);
        zone.set_next_roll(role, at);
    }

    // The next wakeup is the earliest of every pending gate.
    let mut next = UnixTime::FAR_FUTURE;
    if let Some(gate) = outcome.next_gate {
        next = next.min(gate);
    }
    for (_, at) in &next_rolls {
        next = next.min(*at);
    }
    if let Some(at) = next_purge {
        next = next.min(at);
    }
    if let Some(at) = policy.denial.next_resalt() {
        next = next.min(at);
    }
    if deficit {
        next = next.min(now + DEFICIT_BACKOFF);
    }

    let status = if deficit || outcome.blocked {
        ZoneStatus::Blocked
    } else if outcome.waiting_operator {
        ZoneStatus::WaitingForOperator
    } else {
        ZoneStatus::Ok
    };

    // A zone waiting on the operator or stuck on safety has no gate of its
    // own; poll it so confirmations written behind our back are picked up.
    if status != ZoneStatus::Ok && next == UnixTime::FAR_FUTURE {
        next = now + OPERATOR_POLL;
    }

    zone.next_change = (next != UnixTime::FAR_FUTURE).then_some(next);

    // Keep the pregenerated pool topped up for this policy.
    factory.schedule_replenishment(&*txn, &policy, &policy_keys)?;

    // Write everything back.
    persist_keys(txn, &mut keys)?;
    deps.persist(txn)?;
    if policy != policy_snapshot {
        policy.update(txn)?;
    }
    if zone != zone_snapshot {
        zone.update(txn)?;
    }

    Ok(TickOutcome { next, status })
}

//----------- Helpers ----------------------------------------------------------

fn load_keys(txn: &dyn Transaction, zone_id: RowId) -> Result<Vec<KeyEntry>, Error> {
    let mut keys = Vec::new();
    for data in KeyData::list_for_zone(txn, zone_id)? {
        let hsm = HsmKey::get(txn, data.hsm_key_id)?;
        let states = KeyState::list_for_key(txn, data.id)?
            .into_iter()
            .map(|row| StateSlot { row, dirty: false })
            .collect();
        keys.push(KeyEntry {
            data,
            hsm,
            states,
            data_dirty: false,
            hsm_dirty: false,
        });
    }
    Ok(keys)
}

fn persist_keys(txn: &mut dyn Transaction, keys: &mut [KeyEntry]) -> Result<(), Error> {
    for key in keys {
        if key.data_dirty {
            key.data.update(txn)?;
            key.data_dirty = false;
        }
        if key.hsm_dirty {
            key.hsm.update(txn)?;
            key.hsm_dirty = false;
        }
        for slot in &mut key.states {
            if slot.dirty {
                slot.row.update(txn)?;
                slot.dirty = false;
            }
        }
    }
    Ok(())
}

/// An HSM key of the slot already serving another zone, if any.
///
/// Only consulted for key-sharing policies.  Keys already bound into this
/// zone were counted as satisfiers by the evaluator and are excluded.
fn find_shared_key(
    txn: &dyn Transaction,
    slot: &KeySlot,
    keys: &[KeyEntry],
) -> Result<Option<HsmKey>, Error> {
    let candidates = HsmKey::list_for_policy(txn, slot.policy_id)?;
    Ok(candidates.into_iter().find(|key| {
        matches!(
            key.state,
            HsmKeyState::Publish | HsmKeyState::Ready | HsmKeyState::Active
        ) && key.role == slot.role
            && key.algorithm == slot.algorithm
            && key.bits == slot.bits
            && key.repository == slot.repository
            && !keys.iter().any(|k| k.data.hsm_key_id == key.id)
    }))
}

/// Bind a pool key into the zone.
fn bind_key(
    txn: &mut dyn Transaction,
    zone: &Zone,
    policy: &Policy,
    pk: &PolicyKey,
    mut hsm: HsmKey,
    standby: bool,
    now: UnixTime,
) -> Result<KeyEntry, Error> {
    // A shared key may already be live elsewhere; only fresh pool keys
    // enter PUBLISH here.
    if matches!(hsm.state, HsmKeyState::Generate | HsmKeyState::Unused) {
        hsm.state = HsmKeyState::Publish;
        hsm.update(txn)?;
    }

    let data = KeyData {
        id: RowId::from_raw(0),
        rev: 0,
        zone_id: zone.id,
        hsm_key_id: hsm.id,
        algorithm: pk.algorithm,
        inception: now,
        role: pk.role,
        introducing: true,
        should_revoke: false,
        standby,
        active_zsk: false,
        active_ksk: false,
        ds_at_parent: DsAtParent::Unsubmitted,
        keytag: keytag_for_locator(&hsm.locator),
        minimize: pk.minimize,
    }
    .create(txn)?;

    let mut states = Vec::new();
    for rt in RecordType::ALL {
        let applies = rt.applies_to(pk.role);
        let row = KeyState {
            id: RowId::from_raw(0),
            rev: 0,
            key_data_id: data.id,
            record_type: rt,
            state: if applies {
                RecordState::Hidden
            } else {
                RecordState::Na
            },
            last_change: now,
            minimize: applies && pk.minimize.contains(rt.minimize_bit()),
            ttl: lifecycle::initial_ttl(policy, rt),
        }
        .create(txn)?;
        states.push(StateSlot { row, dirty: false });
    }

    log::info!(
        "Bound {} key {} (tag {}) into zone '{}'",
        data.role,
        hsm.locator,
        data.keytag,
        zone.name,
    );

    Ok(KeyEntry {
        data,
        hsm,
        states,
        data_dirty: false,
        hsm_dirty: false,
    })
}

/// Create dependency edges from retiring keys to their successors.
fn record_dependencies(deps: &mut Deps, zone_id: RowId, keys: &[KeyEntry]) {
    for pred in keys {
        if pred.data.introducing || pred.all_hidden() {
            continue;
        }
        // The newest introducing key of the same role and algorithm takes
        // over.  Standby keys only pre-publish and cannot take anything
        // over.
        let succ = keys
            .iter()
            .filter(|k| {
                k.data.id != pred.data.id
                    && k.data.introducing
                    && !k.data.standby
                    && k.data.role == pred.data.role
                    && k.data.algorithm == pred.data.algorithm
            })
            .max_by_key(|k| (k.data.inception, k.data.id));
        let Some(succ) = succ else {
            continue;
        };
        for rt in pred.applicable() {
            // A record already gone needs no takeover; re-adding its edge
            // would never be cleaned up and would pin the key forever.
            if rt.applies_to(succ.data.role) && pred.record_state(rt).possibly_visible() {
                deps.add(zone_id, pred.data.id, succ.data.id, rt);
            }
        }
    }
}

/// Derive active flags and HSM key states from the record states.
fn sync_runtime(keys: &mut [KeyEntry]) {
    for key in keys {
        if key.data.introducing {
            if key.all_propagated() {
                key.set_active(
                    key.data.role.signs_keyset(),
                    key.data.role.signs_data(),
                );
                key.set_hsm_state(HsmKeyState::Active);
            } else {
                key.set_active(false, false);
                if key.record_state(RecordType::Dnskey).propagated() {
                    key.set_hsm_state(HsmKeyState::Ready);
                } else {
                    key.set_hsm_state(HsmKeyState::Publish);
                }
            }
        } else {
            key.set_active(false, false);
            if key.all_hidden() {
                key.set_hsm_state(HsmKeyState::Dead);
            } else {
                key.set_hsm_state(HsmKeyState::Retire);
            }
        }
    }
}

/// Delete spent bindings; returns when the next one becomes collectable.
fn collect_garbage(
    txn: &mut dyn Transaction,
    keys: &mut Vec<KeyEntry>,
    deps: &Deps,
    policy: &Policy,
    now: UnixTime,
    recycled: &mut Vec<HsmKey>,
) -> Result<Option<UnixTime>, Error> {
    let mut next_purge = None;
    let mut kept = Vec::new();

    for mut key in keys.drain(..) {
        let collectable =
            !key.data.introducing && key.all_hidden() && !deps.references(key.data.id);
        if !collectable {
            kept.push(key);
            continue;
        }

        let due = key.last_change() + policy.keys.purge_after;
        if now < due {
            next_purge = Some(match next_purge {
                Some(t) => due.min(t),
                None => due,
            });
            kept.push(key);
            continue;
        }

        log::info!(
            "Purging spent key {} (tag {})",
            key.hsm.locator,
            key.data.keytag
        );
        for slot in key.states.drain(..) {
            slot.row.delete(txn)?;
        }
        key.data.delete(txn)?;
        key.hsm.state = HsmKeyState::Unused;
        key.hsm.update(txn)?;
        recycled.push(key.hsm);
    }

    *keys = kept;
    Ok(next_purge)
}

/// Generate a fresh NSEC3 salt.
fn new_salt(length: u32) -> Result<String, Error> {
    let mut raw = vec![0u8; length as usize];
    SystemRandom::new()
        .fill(&mut raw)
        .map_err(|_| Error::External("no entropy available for salt generation".into()))?;
    Ok(hex_encode(&raw))
}

fn note_roll(rolls: &mut Vec<(KeyRole, UnixTime)>, role: KeyRole, at: UnixTime) {
    match rolls.iter_mut().find(|(r, _)| *r == role) {
        Some((_, t)) => *t = (*t).min(at),
        None => rolls.push((role, at)),
    }
}

//============ Test support ====================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Minimize;
    use crate::db::hsmkey::BackupState;
    use std::time::Duration;

    /// The timing parameters of the reference scenarios: TTL 3600,
    /// propagation 300, safeties 3600, registration delay one day.
    pub(crate) fn policy() -> Policy {
        let mut policy = Policy::new("default");
        policy.id = RowId::from_raw(1);
        policy.keys.ttl = Duration::from_secs(3600);
        policy.keys.publish_safety = Duration::from_secs(3600);
        policy.keys.retire_safety = Duration::from_secs(3600);
        policy.keys.purge_after = Duration::from_secs(24 * 3600);
        policy.zone.propagation_delay = Duration::from_secs(300);
        policy.parent.ds_ttl = Duration::from_secs(3600);
        policy.parent.propagation_delay = Duration::from_secs(300);
        policy.parent.registration_delay = Duration::from_secs(86400);
        policy.signatures.max_zone_ttl = Duration::from_secs(3600);
        policy
    }

    /// A key entry with all applicable records HIDDEN.
    pub(crate) fn entry(id: u64, role: KeyRole, inception: i64, introducing: bool) -> KeyEntry {
        let policy = policy();
        let data = KeyData {
            id: RowId::from_raw(id),
            rev: 1,
            zone_id: RowId::from_raw(900),
            hsm_key_id: RowId::from_raw(id + 100),
            algorithm: 13,
            inception: UnixTime::from_secs(inception),
            role,
            introducing,
            should_revoke: false,
            standby: false,
            active_zsk: false,
            active_ksk: false,
            ds_at_parent: DsAtParent::Unsubmitted,
            keytag: id as u16,
            minimize: Minimize::NONE,
        };
        let hsm = HsmKey {
            id: RowId::from_raw(id + 100),
            rev: 1,
            policy_id: policy.id,
            locator: format!("key-{id}"),
            state: HsmKeyState::Publish,
            bits: 256,
            algorithm: 13,
            role,
            inception: UnixTime::from_secs(inception),
            key_type: "EC".into(),
            repository: "default".into(),
            backup: BackupState::None,
        };
        let states = RecordType::ALL
            .into_iter()
            .map(|rt| StateSlot {
                row: KeyState {
                    id: RowId::from_raw(id * 10 + rt as u64),
                    rev: 1,
                    key_data_id: data.id,
                    record_type: rt,
                    state: if rt.applies_to(role) {
                        RecordState::Hidden
                    } else {
                        RecordState::Na
                    },
                    last_change: UnixTime::from_secs(inception),
                    minimize: false,
                    ttl: lifecycle::initial_ttl(&policy, rt),
                },
                dirty: false,
            })
            .collect();
        KeyEntry {
            data,
            hsm,
            states,
            data_dirty: false,
            hsm_dirty: false,
        }
    }
}
