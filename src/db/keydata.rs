//! Key bindings, their record states, and rollover dependencies.

use warden_store::{
    ClauseList, RowId, Transaction, Value, delete_row, table, update_row,
};

use super::{
    KeyRole, Minimize, get_bool, get_id, get_secs, get_time, get_token, get_u32, secs_value,
    time_value,
};
use crate::datetime::UnixTime;
use crate::error::Error;

//----------- RecordType -------------------------------------------------------

/// The record types whose visibility the enforcer tracks per key.
///
/// The order of the variants is the deterministic processing order of the
/// state machine: parent-side records advance before child-side ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordType {
    /// The DS record at the parent.
    Ds,

    /// The key's entry in the apex DNSKEY RRset.
    Dnskey,

    /// A KSK-made signature over the DNSKEY RRset.
    RrsigDnskey,

    /// ZSK-made signatures over zone data.
    Rrsig,
}

impl RecordType {
    /// All record types, in processing order.
    pub const ALL: [RecordType; 4] = [
        RecordType::Ds,
        RecordType::Dnskey,
        RecordType::RrsigDnskey,
        RecordType::Rrsig,
    ];

    /// Whether keys of `role` use this record type.
    pub fn applies_to(&self, role: KeyRole) -> bool {
        match self {
            RecordType::Ds | RecordType::RrsigDnskey => role.signs_keyset(),
            RecordType::Dnskey => true,
            RecordType::Rrsig => role.signs_data(),
        }
    }

    /// The minimize bit covering this record type.
    pub fn minimize_bit(&self) -> Minimize {
        match self {
            RecordType::Ds => Minimize::DS,
            RecordType::Dnskey | RecordType::RrsigDnskey => Minimize::DNSKEY,
            RecordType::Rrsig => Minimize::RRSIG,
        }
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            RecordType::Ds => "DS",
            RecordType::Dnskey => "DNSKEY",
            RecordType::RrsigDnskey => "RRSIGDNSKEY",
            RecordType::Rrsig => "RRSIG",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, Error> {
        match token {
            "DS" => Ok(RecordType::Ds),
            "DNSKEY" => Ok(RecordType::Dnskey),
            "RRSIGDNSKEY" => Ok(RecordType::RrsigDnskey),
            "RRSIG" => Ok(RecordType::Rrsig),
            _ => Err(Error::Configuration(format!(
                "unknown key state type '{token}'"
            ))),
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

//----------- RecordState ------------------------------------------------------

/// How visible a record may be to validating resolvers.
///
/// Legal transitions run HIDDEN → RUMOURED → OMNIPRESENT → UNRETENTIVE →
/// HIDDEN.  NA is terminal and marks record types a key's role does not use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordState {
    /// Absent everywhere.
    Hidden,

    /// Being introduced; some caches may have it, some may not.
    Rumoured,

    /// Present in every cache that matters.
    Omnipresent,

    /// Being withdrawn; stale copies may linger in caches.
    Unretentive,

    /// Not applicable to this key's role.
    Na,
}

impl RecordState {
    /// Whether a validator might currently observe the record.
    pub fn possibly_visible(&self) -> bool {
        matches!(
            self,
            RecordState::Rumoured | RecordState::Omnipresent | RecordState::Unretentive
        )
    }

    /// Whether every relevant cache is guaranteed to hold the record.
    pub fn propagated(&self) -> bool {
        matches!(self, RecordState::Omnipresent)
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            RecordState::Hidden => "HIDDEN",
            RecordState::Rumoured => "RUMOURED",
            RecordState::Omnipresent => "OMNIPRESENT",
            RecordState::Unretentive => "UNRETENTIVE",
            RecordState::Na => "NA",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, Error> {
        match token {
            "HIDDEN" => Ok(RecordState::Hidden),
            "RUMOURED" => Ok(RecordState::Rumoured),
            "OMNIPRESENT" => Ok(RecordState::Omnipresent),
            "UNRETENTIVE" => Ok(RecordState::Unretentive),
            "NA" => Ok(RecordState::Na),
            _ => Err(Error::Configuration(format!(
                "unknown key state '{token}'"
            ))),
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

//----------- DsAtParent -------------------------------------------------------

/// Where the key's DS stands in the interaction with the parent.
///
/// The enforcer only ever sets SUBMIT and RETRACT; the operator-driven
/// `ds-submit`/`ds-seen`/`ds-retract`/`ds-gone` commands advance the rest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DsAtParent {
    /// No DS interaction is pending or active.
    Unsubmitted,

    /// The DS should be submitted to the parent.
    Submit,

    /// The operator has submitted the DS.
    Submitted,

    /// The parent has published the DS.
    Seen,

    /// The DS should be retracted from the parent.
    Retract,

    /// The operator has retracted the DS.
    Retracted,
}

impl DsAtParent {
    pub fn as_token(&self) -> &'static str {
        match self {
            DsAtParent::Unsubmitted => "UNSUBMITTED",
            DsAtParent::Submit => "SUBMIT",
            DsAtParent::Submitted => "SUBMITTED",
            DsAtParent::Seen => "SEEN",
            DsAtParent::Retract => "RETRACT",
            DsAtParent::Retracted => "RETRACTED",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, Error> {
        match token {
            "UNSUBMITTED" => Ok(DsAtParent::Unsubmitted),
            "SUBMIT" => Ok(DsAtParent::Submit),
            "SUBMITTED" => Ok(DsAtParent::Submitted),
            "SEEN" => Ok(DsAtParent::Seen),
            "RETRACT" => Ok(DsAtParent::Retract),
            "RETRACTED" => Ok(DsAtParent::Retracted),
            _ => Err(Error::Configuration(format!(
                "unknown DS-at-parent state '{token}'"
            ))),
        }
    }
}

impl std::fmt::Display for DsAtParent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

//----------- KeyData ----------------------------------------------------------

/// A key bound into a zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyData {
    pub id: RowId,
    pub rev: u64,

    /// The zone the key is bound into.
    pub zone_id: RowId,

    /// The HSM key backing this binding.
    pub hsm_key_id: RowId,

    /// The DNSSEC algorithm number.
    pub algorithm: u32,

    /// When the key entered service in this zone.
    pub inception: UnixTime,

    /// The role the key plays here.
    pub role: KeyRole,

    /// Whether the key is on its way in (true) or out (false).
    pub introducing: bool,

    /// Whether the REVOKE bit must be set (RFC 5011 rollovers).
    pub should_revoke: bool,

    /// Whether this is a standby key.
    pub standby: bool,

    /// Whether the key currently signs zone data.
    pub active_zsk: bool,

    /// Whether the key currently signs the DNSKEY RRset.
    pub active_ksk: bool,

    /// The DS interaction state at the parent.
    pub ds_at_parent: DsAtParent,

    /// The key tag, for operator reference.
    pub keytag: u16,

    /// The minimize preference, copied from the policy slot at allocation.
    pub minimize: Minimize,
}

impl KeyData {
    /// Insert this binding as a fresh row.
    pub fn create(mut self, txn: &mut dyn Transaction) -> Result<Self, Error> {
        self.id = txn.create(table::KEY_DATA, self.fields())?;
        self.rev = 1;
        Ok(self)
    }

    /// Write this binding back under its revision.
    pub fn update(&mut self, txn: &mut dyn Transaction) -> Result<(), Error> {
        update_row(txn, table::KEY_DATA, self.id, self.rev, self.fields())?;
        self.rev += 1;
        Ok(())
    }

    /// Delete this binding row.
    pub fn delete(self, txn: &mut dyn Transaction) -> Result<(), Error> {
        delete_row(txn, table::KEY_DATA, self.id, self.rev)?;
        Ok(())
    }

    /// All bindings of a zone.
    pub fn list_for_zone(txn: &dyn Transaction, zone_id: RowId) -> Result<Vec<Self>, Error> {
        let mut keys = txn
            .read(
                table::KEY_DATA,
                &[],
                &ClauseList::new().eq("zoneId", zone_id),
            )?
            .iter()
            .map(Self::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        keys.sort_by_key(|k| (k.inception, k.keytag, k.id));
        Ok(keys)
    }

    /// All bindings backed by an HSM key.
    pub fn list_for_hsm_key(
        txn: &dyn Transaction,
        hsm_key_id: RowId,
    ) -> Result<Vec<Self>, Error> {
        txn.read(
            table::KEY_DATA,
            &[],
            &ClauseList::new().eq("hsmKeyId", hsm_key_id),
        )?
        .iter()
        .map(Self::from_row)
        .collect()
    }

    fn from_row(row: &warden_store::Row) -> Result<Self, Error> {
        const T: &str = table::KEY_DATA;
        Ok(Self {
            id: row.id,
            rev: row.rev,
            zone_id: get_id(row, T, "zoneId")?,
            hsm_key_id: get_id(row, T, "hsmKeyId")?,
            algorithm: get_u32(row, T, "algorithm")?,
            inception: get_time(row, T, "inception")?,
            role: KeyRole::from_token(&get_token(row, T, "role")?)?,
            introducing: get_bool(row, T, "introducing")?,
            should_revoke: get_bool(row, T, "shouldRevoke")?,
            standby: get_bool(row, T, "standby")?,
            active_zsk: get_bool(row, T, "activeZsk")?,
            active_ksk: get_bool(row, T, "activeKsk")?,
            ds_at_parent: DsAtParent::from_token(&get_token(row, T, "dsAtParent")?)?,
            keytag: get_u32(row, T, "keytag")? as u16,
            minimize: Minimize::from_bits(get_u32(row, T, "minimize")? as u8),
        })
    }

    fn fields(&self) -> Vec<(String, Value)> {
        vec![
            ("zoneId".into(), self.zone_id.into()),
            ("hsmKeyId".into(), self.hsm_key_id.into()),
            ("algorithm".into(), self.algorithm.into()),
            ("inception".into(), time_value(self.inception)),
            ("role".into(), Value::Enum(self.role.as_token().into())),
            ("introducing".into(), self.introducing.into()),
            ("shouldRevoke".into(), self.should_revoke.into()),
            ("standby".into(), self.standby.into()),
            ("activeZsk".into(), self.active_zsk.into()),
            ("activeKsk".into(), self.active_ksk.into()),
            (
                "dsAtParent".into(),
                Value::Enum(self.ds_at_parent.as_token().into()),
            ),
            ("keytag".into(), Value::UInt32(self.keytag.into())),
            ("minimize".into(), Value::UInt32(self.minimize.bits().into())),
        ]
    }
}

//----------- KeyState ---------------------------------------------------------

/// The visibility state of one record type of one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyState {
    pub id: RowId,
    pub rev: u64,

    /// The key binding this state belongs to.
    pub key_data_id: RowId,

    /// The record type tracked.
    pub record_type: RecordType,

    /// The current visibility.
    pub state: RecordState,

    /// When the state last changed.
    pub last_change: UnixTime,

    /// The minimize flag, derived from the binding's mask for this type.
    pub minimize: bool,

    /// The TTL the record is (or would be) served with.
    pub ttl: std::time::Duration,
}

impl KeyState {
    /// Insert this state as a fresh row.
    pub fn create(mut self, txn: &mut dyn Transaction) -> Result<Self, Error> {
        self.id = txn.create(table::KEY_STATE, self.fields())?;
        self.rev = 1;
        Ok(self)
    }

    /// Write this state back under its revision.
    pub fn update(&mut self, txn: &mut dyn Transaction) -> Result<(), Error> {
        update_row(txn, table::KEY_STATE, self.id, self.rev, self.fields())?;
        self.rev += 1;
        Ok(())
    }

    /// Delete this state row.
    pub fn delete(self, txn: &mut dyn Transaction) -> Result<(), Error> {
        delete_row(txn, table::KEY_STATE, self.id, self.rev)?;
        Ok(())
    }

    /// The four states of a binding, in processing order.
    pub fn list_for_key(txn: &dyn Transaction, key_data_id: RowId) -> Result<Vec<Self>, Error> {
        let mut states = txn
            .read(
                table::KEY_STATE,
                &[],
                &ClauseList::new().eq("keyDataId", key_data_id),
            )?
            .iter()
            .map(Self::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        states.sort_by_key(|s| s.record_type);
        Ok(states)
    }

    fn from_row(row: &warden_store::Row) -> Result<Self, Error> {
        const T: &str = table::KEY_STATE;
        Ok(Self {
            id: row.id,
            rev: row.rev,
            key_data_id: get_id(row, T, "keyDataId")?,
            record_type: RecordType::from_token(&get_token(row, T, "type")?)?,
            state: RecordState::from_token(&get_token(row, T, "state")?)?,
            last_change: get_time(row, T, "lastChange")?,
            minimize: get_bool(row, T, "minimize")?,
            ttl: get_secs(row, T, "ttl")?,
        })
    }

    fn fields(&self) -> Vec<(String, Value)> {
        vec![
            ("keyDataId".into(), self.key_data_id.into()),
            ("type".into(), Value::Enum(self.record_type.as_token().into())),
            ("state".into(), Value::Enum(self.state.as_token().into())),
            ("lastChange".into(), time_value(self.last_change)),
            ("minimize".into(), self.minimize.into()),
            ("ttl".into(), secs_value(self.ttl)),
        ]
    }
}

//----------- KeyDependency ----------------------------------------------------

/// A rollover dependency edge.
///
/// Records that a record of `from_key` must remain visible until the same
/// record type of `to_key` has taken over.  Deleted once the from-side
/// record reaches HIDDEN.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDependency {
    pub id: RowId,
    pub rev: u64,

    /// The zone both keys belong to.
    pub zone_id: RowId,

    /// The predecessor.
    pub from_key_data_id: RowId,

    /// The successor.
    pub to_key_data_id: RowId,

    /// The record type the edge covers.
    pub record_type: RecordType,
}

impl KeyDependency {
    /// Insert this edge as a fresh row.
    pub fn create(mut self, txn: &mut dyn Transaction) -> Result<Self, Error> {
        self.id = txn.create(table::KEY_DEPENDENCY, self.fields())?;
        self.rev = 1;
        Ok(self)
    }

    /// Delete this edge row.
    pub fn delete(self, txn: &mut dyn Transaction) -> Result<(), Error> {
        delete_row(txn, table::KEY_DEPENDENCY, self.id, self.rev)?;
        Ok(())
    }

    /// All edges of a zone.
    pub fn list_for_zone(txn: &dyn Transaction, zone_id: RowId) -> Result<Vec<Self>, Error> {
        txn.read(
            table::KEY_DEPENDENCY,
            &[],
            &ClauseList::new().eq("zoneId", zone_id),
        )?
        .iter()
        .map(Self::from_row)
        .collect()
    }

    fn from_row(row: &warden_store::Row) -> Result<Self, Error> {
        const T: &str = table::KEY_DEPENDENCY;
        Ok(Self {
            id: row.id,
            rev: row.rev,
            zone_id: get_id(row, T, "zoneId")?,
            from_key_data_id: get_id(row, T, "fromKeyDataId")?,
            to_key_data_id: get_id(row, T, "toKeyDataId")?,
            record_type: RecordType::from_token(&get_token(row, T, "type")?)?,
        })
    }

    fn fields(&self) -> Vec<(String, Value)> {
        vec![
            ("zoneId".into(), self.zone_id.into()),
            ("fromKeyDataId".into(), self.from_key_data_id.into()),
            ("toKeyDataId".into(), self.to_key_data_id.into()),
            ("type".into(), Value::Enum(self.record_type.as_token().into())),
        ]
    }
}

/// Look up a zone's key bindings by key tag.
///
/// Key tags are 16-bit and can collide, so this returns every match; the
/// caller decides how to treat ambiguity.
pub fn list_by_keytag(
    txn: &dyn Transaction,
    zone_id: RowId,
    keytag: u16,
) -> Result<Vec<KeyData>, Error> {
    txn.read(
        table::KEY_DATA,
        &[],
        &ClauseList::new()
            .eq("zoneId", zone_id)
            .eq("keytag", Value::UInt32(keytag.into())),
    )?
    .iter()
    .map(KeyData::from_row)
    .collect()
}
