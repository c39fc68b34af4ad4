//! The HSM key factory.
//!
//! Key generation is slow, so the enforcer never generates on demand.  The
//! factory keeps an in-memory free list of pregenerated, unallocated keys
//! (loaded from the store at startup) and replenishes it asynchronously: at
//! the end of every zone tick the per-slot deficit is computed and queued,
//! and a generator task turns queued requests into fresh `GENERATE` rows
//! that are folded back into the list.
//!
//! The list mutex is never held across an HSM call.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::datetime::UnixTime;
use crate::db::hsmkey::{BackupState, HsmKey, HsmKeyState};
use crate::db::policy::{Policy, PolicyKey};
use crate::db::KeyRole;
use crate::error::Error;
use crate::hsm::Hsm;
use warden_store::{Backend, ClauseList, Clause, Compare, RowId, Transaction, Value, table};

/// How many keys beyond the required set to keep pregenerated per slot.
const LOOK_AHEAD: u32 = 1;

//----------- KeySlot ----------------------------------------------------------

/// The identity of a key slot, as the factory pools by it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeySlot {
    /// The policy the keys belong to.
    pub policy_id: RowId,

    /// The role keys in this slot play.
    pub role: KeyRole,

    /// The DNSSEC algorithm number.
    pub algorithm: u32,

    /// The key size, in bits.
    pub bits: u32,

    /// The HSM repository.
    pub repository: String,
}

impl KeySlot {
    /// The slot a policy key describes.
    pub fn of(policy_id: RowId, pk: &PolicyKey) -> Self {
        Self {
            policy_id,
            role: pk.role,
            algorithm: pk.algorithm,
            bits: pk.bits,
            repository: pk.repository.clone(),
        }
    }

    fn admits(&self, key: &HsmKey) -> bool {
        key.policy_id == self.policy_id
            && key.role == self.role
            && key.algorithm == self.algorithm
            && key.bits == self.bits
            && key.repository == self.repository
    }
}

//----------- KeyFactory -------------------------------------------------------

struct PoolState {
    /// Unallocated keys, ready to hand out.
    pool: Vec<HsmKey>,

    /// Generation requests sent but not yet resolved, per slot.
    pending: foldhash::HashMap<KeySlot, u32>,
}

/// The factory and its free list.
pub struct KeyFactory {
    hsm: Arc<dyn Hsm>,
    inner: Mutex<PoolState>,
    gen_tx: mpsc::UnboundedSender<KeySlot>,
}

impl KeyFactory {
    /// Build the factory, loading every unallocated key from the store.
    ///
    /// Returns the factory together with the receiving end of its
    /// generation queue; hand that to [`run_generator`].
    pub fn load(
        store: &dyn Backend,
        hsm: Arc<dyn Hsm>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<KeySlot>), Error> {
        let txn = store.begin()?;
        let mut pool = HsmKey::list_by_state(&*txn, HsmKeyState::Unused)?;
        pool.extend(HsmKey::list_by_state(&*txn, HsmKeyState::Generate)?);
        txn.rollback();

        log::info!("Key factory loaded {} pregenerated keys", pool.len());

        let (gen_tx, gen_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(Self {
            hsm,
            inner: Mutex::new(PoolState {
                pool,
                pending: Default::default(),
            }),
            gen_tx,
        });
        Ok((factory, gen_rx))
    }

    /// Take a pregenerated key matching the slot, if one is available.
    ///
    /// The returned row is removed from the free list but unchanged in the
    /// store; the caller binds it (and must [`restore`][Self::restore] it if
    /// the surrounding transaction does not commit).
    pub fn allocate(&self, slot: &KeySlot) -> Option<HsmKey> {
        let mut inner = self.inner.lock().expect("factory lock is never poisoned");
        let pos = inner
            .pool
            .iter()
            .position(|key| slot.admits(key) && key.backup.allows_use())?;
        Some(inner.pool.swap_remove(pos))
    }

    /// Return a key whose allocation did not commit.
    pub fn restore(&self, key: HsmKey) {
        let mut inner = self.inner.lock().expect("factory lock is never poisoned");
        inner.pool.push(key);
    }

    /// Fold a recycled or freshly generated key into the free list.
    pub fn fold_in(&self, key: HsmKey) {
        let mut inner = self.inner.lock().expect("factory lock is never poisoned");
        inner.pool.push(key);
    }

    /// Queue generation requests for every under-provisioned slot.
    ///
    /// The deficit per slot is `(required + standby + look-ahead) − (pool +
    /// pending + live)`; generation itself happens asynchronously on the
    /// generator task.
    pub fn schedule_replenishment(
        &self,
        txn: &dyn Transaction,
        policy: &Policy,
        policy_keys: &[PolicyKey],
    ) -> Result<(), Error> {
        for pk in policy_keys {
            let slot = KeySlot::of(policy.id, pk);
            let live = self.count_live(txn, &slot)?;

            let mut inner = self.inner.lock().expect("factory lock is never poisoned");
            let pooled = inner.pool.iter().filter(|k| slot.admits(k)).count() as u32;
            let pending = inner.pending.get(&slot).copied().unwrap_or(0);
            let required = 1 + pk.standby + LOOK_AHEAD;
            let supply = pooled + pending + live;

            for _ in supply..required {
                log::debug!(
                    "Requesting key generation for policy {} ({} alg {} {} bits in '{}')",
                    policy.name,
                    pk.role,
                    pk.algorithm,
                    pk.bits,
                    pk.repository,
                );
                *inner.pending.entry(slot.clone()).or_insert(0) += 1;
                if self.gen_tx.send(slot.clone()).is_err() {
                    return Err(Error::External(
                        "the key generator task is gone".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Allocated keys of a slot, excluding pool and terminal states.
    fn count_live(&self, txn: &dyn Transaction, slot: &KeySlot) -> Result<u32, Error> {
        let live_states = [
            HsmKeyState::Publish,
            HsmKeyState::Ready,
            HsmKeyState::Active,
            HsmKeyState::Retire,
        ]
        .iter()
        .map(|s| Clause::Field {
            table: None,
            field: "state".into(),
            op: Compare::Equal,
            value: Value::Enum(s.as_token().into()),
        })
        .collect();

        let count = txn.count(
            table::HSM_KEY,
            &[],
            &ClauseList::new()
                .eq("policyId", slot.policy_id)
                .eq("role", Value::Enum(slot.role.as_token().into()))
                .eq("algorithm", slot.algorithm)
                .eq("bits", slot.bits)
                .eq("repository", slot.repository.clone())
                .any(live_states),
        )?;
        Ok(count as u32)
    }

    fn generation_done(&self, slot: &KeySlot, key: Option<HsmKey>) {
        let mut inner = self.inner.lock().expect("factory lock is never poisoned");
        if let Some(pending) = inner.pending.get_mut(slot) {
            *pending = pending.saturating_sub(1);
        }
        if let Some(key) = key {
            inner.pool.push(key);
        }
    }
}

//----------- run_generator ----------------------------------------------------

/// Drain the generation queue, one HSM call at a time.
///
/// Runs until the factory is dropped.  Each fulfilled request becomes a
/// fresh `GENERATE` row and a free-list entry; failures are logged and the
/// request is forgotten (the next tick recomputes the deficit).
pub async fn run_generator(
    factory: Arc<KeyFactory>,
    store: Arc<dyn Backend>,
    mut gen_rx: mpsc::UnboundedReceiver<KeySlot>,
) {
    while let Some(slot) = gen_rx.recv().await {
        let hsm = factory.hsm.clone();
        let blocking_slot = slot.clone();
        let generated = tokio::task::spawn_blocking(move || {
            hsm.generate_key(
                &blocking_slot.repository,
                blocking_slot.algorithm,
                blocking_slot.bits,
            )
        })
        .await;

        let generated = match generated {
            Ok(Ok(generated)) => generated,
            Ok(Err(err)) => {
                log::error!("Key generation failed: {err}");
                factory.generation_done(&slot, None);
                continue;
            }
            Err(err) => {
                log::error!("Key generation task failed: {err}");
                factory.generation_done(&slot, None);
                continue;
            }
        };

        let key = HsmKey {
            id: RowId::from_raw(0),
            rev: 0,
            policy_id: slot.policy_id,
            locator: generated.locator,
            state: HsmKeyState::Generate,
            bits: slot.bits,
            algorithm: slot.algorithm,
            role: slot.role,
            inception: UnixTime::now(),
            key_type: generated.key_type,
            repository: slot.repository.clone(),
            backup: BackupState::None,
        };

        let stored = store.begin().map_err(Error::from).and_then(|mut txn| {
            let key = key.create(&mut *txn)?;
            txn.commit()?;
            Ok(key)
        });

        match stored {
            Ok(key) => {
                log::info!(
                    "Generated {} key {} in repository '{}'",
                    key.role,
                    key.locator,
                    key.repository
                );
                factory.generation_done(&slot, Some(key));
            }
            Err(err) => {
                log::error!("Failed to store a generated key: {err}");
                factory.generation_done(&slot, None);
            }
        }
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::soft::SoftHsm;
    use std::time::Duration;
    use warden_store::MemoryBackend;

    fn policy_with_slot(store: &dyn Backend) -> (Policy, PolicyKey) {
        let mut txn = store.begin().unwrap();
        let policy = Policy::new("default").create(&mut *txn).unwrap();
        let pk = PolicyKey {
            id: RowId::from_raw(0),
            rev: 0,
            policy_id: policy.id,
            role: KeyRole::ZSK,
            algorithm: 13,
            bits: 256,
            lifetime: Duration::from_secs(90 * 24 * 3600),
            repository: "default".into(),
            standby: 0,
            manual_rollover: false,
            rfc5011: false,
            minimize: crate::db::Minimize::NONE,
        }
        .create(&mut *txn)
        .unwrap();
        txn.commit().unwrap();
        (policy, pk)
    }

    fn pooled_key(policy_id: RowId) -> HsmKey {
        HsmKey {
            id: RowId::from_raw(0),
            rev: 0,
            policy_id,
            locator: "aabbccdd".into(),
            state: HsmKeyState::Generate,
            bits: 256,
            algorithm: 13,
            role: KeyRole::ZSK,
            inception: UnixTime::from_secs(0),
            key_type: "EC".into(),
            repository: "default".into(),
            backup: BackupState::None,
        }
    }

    #[test]
    fn loads_the_free_list_from_the_store() {
        let store = MemoryBackend::new();
        let (policy, pk) = policy_with_slot(&store);
        {
            let mut txn = store.begin().unwrap();
            pooled_key(policy.id).create(&mut *txn).unwrap();
            txn.commit().unwrap();
        }

        let hsm = Arc::new(SoftHsm::new(vec!["default".into()]));
        let (factory, _rx) = KeyFactory::load(&store, hsm).unwrap();

        let slot = KeySlot::of(policy.id, &pk);
        let key = factory.allocate(&slot).expect("a key is pooled");
        assert_eq!(key.locator, "aabbccdd");
        assert!(factory.allocate(&slot).is_none());

        // A failed allocation goes back into the list.
        factory.restore(key);
        assert!(factory.allocate(&slot).is_some());
    }

    #[test]
    fn replenishment_counts_pool_pending_and_live() {
        let store = MemoryBackend::new();
        let (policy, pk) = policy_with_slot(&store);

        let hsm = Arc::new(SoftHsm::new(vec!["default".into()]));
        let (factory, mut rx) = KeyFactory::load(&store, hsm).unwrap();

        // Empty slot: required = 1 active + 1 look-ahead.
        let txn = store.begin().unwrap();
        factory
            .schedule_replenishment(&*txn, &policy, &[pk.clone()])
            .unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // Pending requests are not re-queued.
        factory
            .schedule_replenishment(&*txn, &policy, &[pk.clone()])
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn keys_requiring_backup_are_not_allocated() {
        let store = MemoryBackend::new();
        let (policy, pk) = policy_with_slot(&store);
        let hsm = Arc::new(SoftHsm::new(vec!["default".into()]));
        let (factory, _rx) = KeyFactory::load(&store, hsm).unwrap();

        let mut key = pooled_key(policy.id);
        key.backup = BackupState::Required;
        factory.fold_in(key);

        assert!(factory.allocate(&KeySlot::of(policy.id, &pk)).is_none());
    }
}
