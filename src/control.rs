//! Operator-driven operations.
//!
//! The DS choreography with the parent zone is not automated: the enforcer
//! announces what it wants (SUBMIT, RETRACT) and the operator confirms what
//! happened at the parent with the four `ds-*` commands.  Each confirmation
//! immediately re-runs the zone's enforcement tick so the state machine can
//! pick the change up.

use std::fmt;

use camino::Utf8PathBuf;

use crate::api::{RolloverReport, ZoneStatus, exit};
use crate::datetime::UnixTime;
use crate::db::KeyRole;
use crate::db::keydata::{self, DsAtParent};
use crate::db::policy::Policy;
use crate::db::zone::{Adapter, Zone};
use crate::enforcer::{self, TickOutcome};
use crate::error::Error;
use crate::factory::KeyFactory;
use warden_store::Backend;

//----------- ControlError -----------------------------------------------------

/// An error from an operator operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlError {
    /// The named zone does not exist.
    NoSuchZone(String),

    /// The zone has no key with the given tag.
    NoSuchKey { zone: String, keytag: u16 },

    /// Several keys of the zone share the given tag.
    AmbiguousKey { zone: String, keytag: u16 },

    /// The named policy does not exist.
    NoSuchPolicy(String),

    /// The zone already exists.
    ZoneExists(String),

    /// The key is not in a state the command applies to.
    WrongState {
        expected: DsAtParent,
        found: DsAtParent,
    },

    /// The command does not apply to keys of this role.
    WrongRole(KeyRole),

    /// The store or the enforcement tick failed.
    Failed(String),
}

impl ControlError {
    /// The process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ControlError::NoSuchZone(_)
            | ControlError::NoSuchKey { .. }
            | ControlError::NoSuchPolicy(_) => exit::NOT_FOUND,
            ControlError::AmbiguousKey { .. }
            | ControlError::ZoneExists(_)
            | ControlError::WrongState { .. }
            | ControlError::WrongRole(_) => exit::WRONG_STATE,
            ControlError::Failed(_) => exit::STORAGE,
        }
    }
}

impl std::error::Error for ControlError {}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::NoSuchZone(zone) => write!(f, "no such zone '{zone}'"),
            ControlError::NoSuchKey { zone, keytag } => {
                write!(f, "zone '{zone}' has no key with tag {keytag}")
            }
            ControlError::AmbiguousKey { zone, keytag } => {
                write!(
                    f,
                    "zone '{zone}' has several keys with tag {keytag}; cannot resolve"
                )
            }
            ControlError::NoSuchPolicy(policy) => write!(f, "no such policy '{policy}'"),
            ControlError::ZoneExists(zone) => write!(f, "zone '{zone}' already exists"),
            ControlError::WrongState { expected, found } => {
                write!(f, "the key's DS is {found}, expected {expected}")
            }
            ControlError::WrongRole(role) => {
                write!(f, "{role} keys have no DS at the parent")
            }
            ControlError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl From<Error> for ControlError {
    fn from(err: Error) -> Self {
        ControlError::Failed(err.to_string())
    }
}

impl From<warden_store::Error> for ControlError {
    fn from(err: warden_store::Error) -> Self {
        ControlError::Failed(err.to_string())
    }
}

//----------- DS commands ------------------------------------------------------

/// `ds-submit`: the DS has been handed to the parent.
pub fn ds_submit(
    store: &dyn Backend,
    factory: &KeyFactory,
    zone: &str,
    keytag: u16,
    now: UnixTime,
) -> Result<TickOutcome, ControlError> {
    ds_transition(store, factory, zone, keytag, DsAtParent::Submit, DsAtParent::Submitted, now)
}

/// `ds-seen`: the parent publishes the DS.
pub fn ds_seen(
    store: &dyn Backend,
    factory: &KeyFactory,
    zone: &str,
    keytag: u16,
    now: UnixTime,
) -> Result<TickOutcome, ControlError> {
    ds_transition(store, factory, zone, keytag, DsAtParent::Submitted, DsAtParent::Seen, now)
}

/// `ds-retract`: the DS removal has been handed to the parent.
pub fn ds_retract(
    store: &dyn Backend,
    factory: &KeyFactory,
    zone: &str,
    keytag: u16,
    now: UnixTime,
) -> Result<TickOutcome, ControlError> {
    ds_transition(store, factory, zone, keytag, DsAtParent::Retract, DsAtParent::Retracted, now)
}

/// `ds-gone`: the parent no longer serves the DS.
pub fn ds_gone(
    store: &dyn Backend,
    factory: &KeyFactory,
    zone: &str,
    keytag: u16,
    now: UnixTime,
) -> Result<TickOutcome, ControlError> {
    ds_transition(
        store,
        factory,
        zone,
        keytag,
        DsAtParent::Retracted,
        DsAtParent::Unsubmitted,
        now,
    )
}

fn ds_transition(
    store: &dyn Backend,
    factory: &KeyFactory,
    zone_name: &str,
    keytag: u16,
    expected: DsAtParent,
    to: DsAtParent,
    now: UnixTime,
) -> Result<TickOutcome, ControlError> {
    let zone_id;
    {
        let mut txn = store.begin()?;
        let zone = Zone::get_by_name(&*txn, zone_name)?
            .ok_or_else(|| ControlError::NoSuchZone(zone_name.into()))?;
        zone_id = zone.id;

        let mut matches = keydata::list_by_keytag(&*txn, zone.id, keytag)?;
        let mut key = match matches.len() {
            0 => {
                return Err(ControlError::NoSuchKey {
                    zone: zone_name.into(),
                    keytag,
                });
            }
            1 => matches.pop().expect("checked length"),
            _ => {
                return Err(ControlError::AmbiguousKey {
                    zone: zone_name.into(),
                    keytag,
                });
            }
        };

        if !key.role.signs_keyset() {
            return Err(ControlError::WrongRole(key.role));
        }
        if key.ds_at_parent != expected {
            return Err(ControlError::WrongState {
                expected,
                found: key.ds_at_parent,
            });
        }

        key.ds_at_parent = to;
        key.update(&mut *txn)?;
        txn.commit()?;
    }

    log::info!("Zone '{zone_name}' key tag {keytag}: DS now {to}");

    // Let the state machine act on the confirmation right away.
    enforcer::tick(store, factory, zone_id, now, None).map_err(ControlError::from)
}

//----------- Roll-now commands ------------------------------------------------

/// Request an immediate rollover of a role's keys.
pub fn roll_now(
    store: &dyn Backend,
    factory: &KeyFactory,
    zone_name: &str,
    role: KeyRole,
    now: UnixTime,
) -> Result<TickOutcome, ControlError> {
    let zone_id;
    {
        let mut txn = store.begin()?;
        let mut zone = Zone::get_by_name(&*txn, zone_name)?
            .ok_or_else(|| ControlError::NoSuchZone(zone_name.into()))?;
        zone_id = zone.id;
        zone.set_roll_now(role, true);
        zone.update(&mut *txn)?;
        txn.commit()?;
    }

    enforcer::tick(store, factory, zone_id, now, None).map_err(ControlError::from)
}

//----------- Zone management --------------------------------------------------

/// Put a zone under enforcement.
pub fn zone_add(
    store: &dyn Backend,
    name: &str,
    policy_name: &str,
    signconf_path: Utf8PathBuf,
    input: Adapter,
    output: Adapter,
) -> Result<Zone, ControlError> {
    let mut txn = store.begin()?;
    if Zone::get_by_name(&*txn, name)?.is_some() {
        return Err(ControlError::ZoneExists(name.into()));
    }
    let policy = Policy::get_by_name(&*txn, policy_name)?
        .ok_or_else(|| ControlError::NoSuchPolicy(policy_name.into()))?;

    let zone = Zone::new(name, policy.id, signconf_path, input, output).create(&mut *txn)?;
    txn.commit()?;

    log::info!("Zone '{name}' added under policy '{policy_name}'");
    Ok(zone)
}

/// Remove a zone and everything bound to it.
pub fn zone_remove(store: &dyn Backend, name: &str) -> Result<(), ControlError> {
    let mut txn = store.begin()?;
    let zone = Zone::get_by_name(&*txn, name)?
        .ok_or_else(|| ControlError::NoSuchZone(name.into()))?;

    for data in keydata::KeyData::list_for_zone(&*txn, zone.id)? {
        for state in keydata::KeyState::list_for_key(&*txn, data.id)? {
            state.delete(&mut *txn)?;
        }
        data.delete(&mut *txn)?;
    }
    for dep in keydata::KeyDependency::list_for_zone(&*txn, zone.id)? {
        dep.delete(&mut *txn)?;
    }
    zone.delete(&mut *txn)?;
    txn.commit()?;

    log::info!("Zone '{name}' removed");
    Ok(())
}

/// The zones under enforcement, with their status.
pub fn zone_list(store: &dyn Backend) -> Result<Vec<(Zone, ZoneStatus)>, ControlError> {
    let txn = store.begin()?;
    let zones = Zone::list(&*txn)?;
    let mut out = Vec::with_capacity(zones.len());
    for zone in zones {
        // The persisted state answers coarsely: a zone whose keys all wait
        // on a DS action reports as waiting.
        let waiting = keydata::KeyData::list_for_zone(&*txn, zone.id)?
            .iter()
            .any(|k| {
                matches!(
                    k.ds_at_parent,
                    DsAtParent::Submit | DsAtParent::Retract
                )
            });
        let status = if waiting {
            ZoneStatus::WaitingForOperator
        } else {
            ZoneStatus::Ok
        };
        out.push((zone, status));
    }
    Ok(out)
}

/// The scheduled rollovers of every zone.
pub fn rollover_list(
    store: &dyn Backend,
    zone_filter: Option<&str>,
) -> Result<Vec<RolloverReport>, ControlError> {
    let txn = store.begin()?;
    let zones = match zone_filter {
        Some(name) => vec![
            Zone::get_by_name(&*txn, name)?
                .ok_or_else(|| ControlError::NoSuchZone(name.into()))?,
        ],
        None => Zone::list(&*txn)?,
    };

    let mut out = Vec::new();
    for zone in zones {
        let slots = crate::db::policy::PolicyKey::list_for_policy(&*txn, zone.policy_id)?;
        for (role, at) in [
            (KeyRole::KSK, zone.next_ksk_roll),
            (KeyRole::ZSK, zone.next_zsk_roll),
            (KeyRole::CSK, zone.next_csk_roll),
        ] {
            if slots.iter().any(|pk| pk.role == role) {
                out.push(RolloverReport {
                    zone: zone.name.clone(),
                    role,
                    at,
                });
            }
        }
    }
    Ok(out)
}
