//! The zone entity.

use camino::Utf8PathBuf;
use warden_store::{
    ClauseList, RowId, Transaction, Value, delete_row, read_one, table, update_row,
};

use super::{KeyRole, get_bool, get_id, get_opt_time, get_text, get_time, opt_time_value, time_value};
use crate::datetime::UnixTime;
use crate::error::Error;

//----------- Zone -------------------------------------------------------------

/// A zone under enforcement.
#[derive(Clone, Debug, PartialEq)]
pub struct Zone {
    pub id: RowId,
    pub rev: u64,

    /// The zone name.
    pub name: String,

    /// The policy governing this zone.
    pub policy_id: RowId,

    /// Whether the signer configuration must be (re)written.
    pub signconf_needs_writing: bool,

    /// Where the signer configuration is written.
    pub signconf_path: Utf8PathBuf,

    /// When this zone next needs attention; `None` means never.
    pub next_change: Option<UnixTime>,

    /// Until when a previously-served DS TTL may still be cached.
    pub ttl_end_ds: UnixTime,

    /// Until when a previously-served DNSKEY TTL may still be cached.
    pub ttl_end_dk: UnixTime,

    /// Until when a previously-served RRSIG TTL may still be cached.
    pub ttl_end_rs: UnixTime,

    /// Operator-requested KSK rollover.
    pub roll_ksk_now: bool,

    /// Operator-requested ZSK rollover.
    pub roll_zsk_now: bool,

    /// Operator-requested CSK rollover.
    pub roll_csk_now: bool,

    /// How the unsigned zone is obtained.
    pub input_adapter: Adapter,

    /// How the signed zone is delivered.
    pub output_adapter: Adapter,

    /// The next scheduled KSK roll, for reporting.
    pub next_ksk_roll: Option<UnixTime>,

    /// The next scheduled ZSK roll, for reporting.
    pub next_zsk_roll: Option<UnixTime>,

    /// The next scheduled CSK roll, for reporting.
    pub next_csk_roll: Option<UnixTime>,
}

/// An input or output adapter reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Adapter {
    /// The adapter type (e.g. "File", "DNS").
    pub adapter_type: String,

    /// Where the adapter reads from or writes to.
    pub uri: String,
}

impl Adapter {
    /// A file adapter for the given path.
    pub fn file(uri: impl Into<String>) -> Self {
        Self {
            adapter_type: "File".into(),
            uri: uri.into(),
        }
    }
}

impl Zone {
    /// A fresh zone under the given policy.
    ///
    /// The zone needs immediate attention: its `next_change` is the epoch and
    /// its signer configuration is marked for writing.
    pub fn new(
        name: impl Into<String>,
        policy_id: RowId,
        signconf_path: Utf8PathBuf,
        input_adapter: Adapter,
        output_adapter: Adapter,
    ) -> Self {
        Self {
            id: RowId::from_raw(0),
            rev: 0,
            name: name.into(),
            policy_id,
            signconf_needs_writing: true,
            signconf_path,
            next_change: Some(UnixTime::from_secs(0)),
            ttl_end_ds: UnixTime::from_secs(0),
            ttl_end_dk: UnixTime::from_secs(0),
            ttl_end_rs: UnixTime::from_secs(0),
            roll_ksk_now: false,
            roll_zsk_now: false,
            roll_csk_now: false,
            input_adapter,
            output_adapter,
            next_ksk_roll: None,
            next_zsk_roll: None,
            next_csk_roll: None,
        }
    }

    /// The manual-roll flag for a role.
    pub fn roll_now(&self, role: KeyRole) -> bool {
        match role {
            KeyRole::KSK => self.roll_ksk_now,
            KeyRole::ZSK => self.roll_zsk_now,
            KeyRole::CSK => self.roll_csk_now,
        }
    }

    /// Set or clear the manual-roll flag for a role.
    pub fn set_roll_now(&mut self, role: KeyRole, value: bool) {
        match role {
            KeyRole::KSK => self.roll_ksk_now = value,
            KeyRole::ZSK => self.roll_zsk_now = value,
            KeyRole::CSK => self.roll_csk_now = value,
        }
    }

    /// Record the next scheduled roll for a role, for reporting.
    pub fn set_next_roll(&mut self, role: KeyRole, when: Option<UnixTime>) {
        match role {
            KeyRole::KSK => self.next_ksk_roll = when,
            KeyRole::ZSK => self.next_zsk_roll = when,
            KeyRole::CSK => self.next_csk_roll = when,
        }
    }

    /// Insert this zone as a fresh row.
    pub fn create(mut self, txn: &mut dyn Transaction) -> Result<Self, Error> {
        self.id = txn.create(table::ZONE, self.fields())?;
        self.rev = 1;
        Ok(self)
    }

    /// Write this zone back under its revision.
    pub fn update(&mut self, txn: &mut dyn Transaction) -> Result<(), Error> {
        update_row(txn, table::ZONE, self.id, self.rev, self.fields())?;
        self.rev += 1;
        Ok(())
    }

    /// Delete this zone row.
    pub fn delete(self, txn: &mut dyn Transaction) -> Result<(), Error> {
        delete_row(txn, table::ZONE, self.id, self.rev)?;
        Ok(())
    }

    /// Look a zone up by its row identifier.
    pub fn get(txn: &dyn Transaction, id: RowId) -> Result<Self, Error> {
        let row = read_one(txn, table::ZONE, &[], &ClauseList::new().eq("id", id))?;
        Self::from_row(&row)
    }

    /// Look a zone up by name.
    pub fn get_by_name(txn: &dyn Transaction, name: &str) -> Result<Option<Self>, Error> {
        let rows = txn.read(table::ZONE, &[], &ClauseList::new().eq("name", name))?;
        rows.first().map(Self::from_row).transpose()
    }

    /// All zones, by name.
    pub fn list(txn: &dyn Transaction) -> Result<Vec<Self>, Error> {
        let mut zones = txn
            .read(table::ZONE, &[], &ClauseList::new())?
            .iter()
            .map(Self::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        zones.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(zones)
    }

    /// All zones under a policy.
    pub fn list_for_policy(
        txn: &dyn Transaction,
        policy_id: RowId,
    ) -> Result<Vec<Self>, Error> {
        txn.read(
            table::ZONE,
            &[],
            &ClauseList::new().eq("policyId", policy_id),
        )?
        .iter()
        .map(Self::from_row)
        .collect()
    }

    fn from_row(row: &warden_store::Row) -> Result<Self, Error> {
        const T: &str = table::ZONE;
        Ok(Self {
            id: row.id,
            rev: row.rev,
            name: get_text(row, T, "name")?,
            policy_id: get_id(row, T, "policyId")?,
            signconf_needs_writing: get_bool(row, T, "signconfNeedsWriting")?,
            signconf_path: get_text(row, T, "signconfPath")?.into(),
            next_change: get_opt_time(row, T, "nextChange")?,
            ttl_end_ds: get_time(row, T, "ttlEndDs")?,
            ttl_end_dk: get_time(row, T, "ttlEndDk")?,
            ttl_end_rs: get_time(row, T, "ttlEndRs")?,
            roll_ksk_now: get_bool(row, T, "rollKskNow")?,
            roll_zsk_now: get_bool(row, T, "rollZskNow")?,
            roll_csk_now: get_bool(row, T, "rollCskNow")?,
            input_adapter: Adapter {
                adapter_type: get_text(row, T, "inputAdapterType")?,
                uri: get_text(row, T, "inputAdapterUri")?,
            },
            output_adapter: Adapter {
                adapter_type: get_text(row, T, "outputAdapterType")?,
                uri: get_text(row, T, "outputAdapterUri")?,
            },
            next_ksk_roll: get_opt_time(row, T, "nextKskRoll")?,
            next_zsk_roll: get_opt_time(row, T, "nextZskRoll")?,
            next_csk_roll: get_opt_time(row, T, "nextCskRoll")?,
        })
    }

    fn fields(&self) -> Vec<(String, Value)> {
        vec![
            ("name".into(), self.name.clone().into()),
            ("policyId".into(), self.policy_id.into()),
            (
                "signconfNeedsWriting".into(),
                self.signconf_needs_writing.into(),
            ),
            (
                "signconfPath".into(),
                self.signconf_path.as_str().to_owned().into(),
            ),
            ("nextChange".into(), opt_time_value(self.next_change)),
            ("ttlEndDs".into(), time_value(self.ttl_end_ds)),
            ("ttlEndDk".into(), time_value(self.ttl_end_dk)),
            ("ttlEndRs".into(), time_value(self.ttl_end_rs)),
            ("rollKskNow".into(), self.roll_ksk_now.into()),
            ("rollZskNow".into(), self.roll_zsk_now.into()),
            ("rollCskNow".into(), self.roll_csk_now.into()),
            (
                "inputAdapterType".into(),
                self.input_adapter.adapter_type.clone().into(),
            ),
            (
                "inputAdapterUri".into(),
                self.input_adapter.uri.clone().into(),
            ),
            (
                "outputAdapterType".into(),
                self.output_adapter.adapter_type.clone().into(),
            ),
            (
                "outputAdapterUri".into(),
                self.output_adapter.uri.clone().into(),
            ),
            ("nextKskRoll".into(), opt_time_value(self.next_ksk_roll)),
            ("nextZskRoll".into(), opt_time_value(self.next_zsk_roll)),
            ("nextCskRoll".into(), opt_time_value(self.next_csk_roll)),
        ]
    }
}
