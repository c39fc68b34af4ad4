//! The HSM key entity.

use warden_store::{
    ClauseList, RowId, Transaction, Value, delete_row, read_one, table, update_row,
};

use super::{KeyRole, get_id, get_text, get_time, get_token, get_u32, time_value};
use crate::datetime::UnixTime;
use crate::error::Error;

//----------- HsmKey -----------------------------------------------------------

/// A reference to key material held by an HSM.
///
/// The key material itself never leaves the HSM; this row is the only
/// persistent handle the enforcer holds, keyed by the HSM's opaque locator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HsmKey {
    pub id: RowId,
    pub rev: u64,

    /// The policy whose zones may use this key.
    ///
    /// When the policy shares keys, one key may serve several zones; the
    /// allocation still records the owning policy.
    pub policy_id: RowId,

    /// The HSM's opaque identifier for the key material.
    pub locator: String,

    /// Where the key is in its life.
    pub state: HsmKeyState,

    /// The key size, in bits.
    pub bits: u32,

    /// The DNSSEC algorithm number.
    pub algorithm: u32,

    /// The role this key was generated for.
    pub role: KeyRole,

    /// When the key was generated.
    pub inception: UnixTime,

    /// The cryptographic family of the key (e.g. "RSA", "EC").
    pub key_type: String,

    /// The HSM repository holding the key.
    pub repository: String,

    /// Where the key is in the backup cycle.
    pub backup: BackupState,
}

//----------- HsmKeyState ------------------------------------------------------

/// The lifecycle state of an HSM key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HsmKeyState {
    /// Created by the factory; not yet bound to any zone.
    Generate,

    /// Bound into a zone and being published.
    Publish,

    /// Fully published; waiting to become the signing key.
    Ready,

    /// The signing key.
    Active,

    /// Being withdrawn.
    Retire,

    /// Fully withdrawn; only the row remains.
    Dead,

    /// Returned to the pregenerated pool, eligible for purge.
    Unused,
}

impl HsmKeyState {
    /// Whether the key still occupies a slot of its policy.
    pub fn is_live(&self) -> bool {
        !matches!(self, HsmKeyState::Dead | HsmKeyState::Unused)
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            HsmKeyState::Generate => "GENERATE",
            HsmKeyState::Publish => "PUBLISH",
            HsmKeyState::Ready => "READY",
            HsmKeyState::Active => "ACTIVE",
            HsmKeyState::Retire => "RETIRE",
            HsmKeyState::Dead => "DEAD",
            HsmKeyState::Unused => "UNUSED",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, Error> {
        match token {
            "GENERATE" => Ok(HsmKeyState::Generate),
            "PUBLISH" => Ok(HsmKeyState::Publish),
            "READY" => Ok(HsmKeyState::Ready),
            "ACTIVE" => Ok(HsmKeyState::Active),
            "RETIRE" => Ok(HsmKeyState::Retire),
            "DEAD" => Ok(HsmKeyState::Dead),
            "UNUSED" => Ok(HsmKeyState::Unused),
            _ => Err(Error::Configuration(format!(
                "unknown HSM key state '{token}'"
            ))),
        }
    }
}

//----------- BackupState ------------------------------------------------------

/// Where an HSM key is in the backup cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackupState {
    /// The repository does not require backups.
    None,

    /// A backup is required before the key may be used.
    Required,

    /// A backup has been requested but not confirmed.
    Requested,

    /// The key is backed up.
    Done,
}

impl BackupState {
    /// Whether the key may be allocated to a zone.
    pub fn allows_use(&self) -> bool {
        matches!(self, BackupState::None | BackupState::Done)
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            BackupState::None => "NONE",
            BackupState::Required => "REQUIRED",
            BackupState::Requested => "REQUESTED",
            BackupState::Done => "DONE",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, Error> {
        match token {
            "NONE" => Ok(BackupState::None),
            "REQUIRED" => Ok(BackupState::Required),
            "REQUESTED" => Ok(BackupState::Requested),
            "DONE" => Ok(BackupState::Done),
            _ => Err(Error::Configuration(format!(
                "unknown backup state '{token}'"
            ))),
        }
    }
}

//--- Storage

impl HsmKey {
    /// Insert this key as a fresh row.
    pub fn create(mut self, txn: &mut dyn Transaction) -> Result<Self, Error> {
        self.id = txn.create(table::HSM_KEY, self.fields())?;
        self.rev = 1;
        Ok(self)
    }

    /// Write this key back under its revision.
    pub fn update(&mut self, txn: &mut dyn Transaction) -> Result<(), Error> {
        update_row(txn, table::HSM_KEY, self.id, self.rev, self.fields())?;
        self.rev += 1;
        Ok(())
    }

    /// Delete this key row.
    pub fn delete(self, txn: &mut dyn Transaction) -> Result<(), Error> {
        delete_row(txn, table::HSM_KEY, self.id, self.rev)?;
        Ok(())
    }

    /// Look a key up by its row identifier.
    pub fn get(txn: &dyn Transaction, id: RowId) -> Result<Self, Error> {
        let row = read_one(txn, table::HSM_KEY, &[], &ClauseList::new().eq("id", id))?;
        Self::from_row(&row)
    }

    /// All keys in a given state.
    pub fn list_by_state(
        txn: &dyn Transaction,
        state: HsmKeyState,
    ) -> Result<Vec<Self>, Error> {
        txn.read(
            table::HSM_KEY,
            &[],
            &ClauseList::new().eq("state", Value::Enum(state.as_token().into())),
        )?
        .iter()
        .map(Self::from_row)
        .collect()
    }

    /// All keys allocated to a policy.
    pub fn list_for_policy(
        txn: &dyn Transaction,
        policy_id: RowId,
    ) -> Result<Vec<Self>, Error> {
        txn.read(
            table::HSM_KEY,
            &[],
            &ClauseList::new().eq("policyId", policy_id),
        )?
        .iter()
        .map(Self::from_row)
        .collect()
    }

    fn from_row(row: &warden_store::Row) -> Result<Self, Error> {
        const T: &str = table::HSM_KEY;
        Ok(Self {
            id: row.id,
            rev: row.rev,
            policy_id: get_id(row, T, "policyId")?,
            locator: get_text(row, T, "locator")?,
            state: HsmKeyState::from_token(&get_token(row, T, "state")?)?,
            bits: get_u32(row, T, "bits")?,
            algorithm: get_u32(row, T, "algorithm")?,
            role: KeyRole::from_token(&get_token(row, T, "role")?)?,
            inception: get_time(row, T, "inception")?,
            key_type: get_text(row, T, "keyType")?,
            repository: get_text(row, T, "repository")?,
            backup: BackupState::from_token(&get_token(row, T, "backup")?)?,
        })
    }

    fn fields(&self) -> Vec<(String, Value)> {
        vec![
            ("policyId".into(), self.policy_id.into()),
            ("locator".into(), self.locator.clone().into()),
            ("state".into(), Value::Enum(self.state.as_token().into())),
            ("bits".into(), self.bits.into()),
            ("algorithm".into(), self.algorithm.into()),
            ("role".into(), Value::Enum(self.role.as_token().into())),
            ("inception".into(), time_value(self.inception)),
            ("keyType".into(), self.key_type.clone().into()),
            ("repository".into(), self.repository.clone().into()),
            ("backup".into(), Value::Enum(self.backup.as_token().into())),
        ]
    }
}
