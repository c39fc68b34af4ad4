//! The typed entity layer over the row store.
//!
//! Each entity module maps one table of the schema to a Rust type and owns
//! the bijective textual encoding of its enumerated fields.  All writes go
//! through the revision-checked helpers of `warden-store`, so a concurrent
//! change to any row surfaces as a transient stale-revision error.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_store::{Row, RowId, Value};

use crate::datetime::UnixTime;
use crate::error::Error;

pub mod hsmkey;
pub mod keydata;
pub mod policy;
pub mod zone;

//----------- KeyRole ----------------------------------------------------------

/// The role a key plays in a zone.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum KeyRole {
    /// A key-signing key: signs the DNSKEY RRset only.
    KSK,

    /// A zone-signing key: signs the zone data.
    ZSK,

    /// A combined-signing key: does both.
    CSK,
}

impl KeyRole {
    /// Whether keys of this role sign the DNSKEY RRset (and carry a DS).
    pub fn signs_keyset(&self) -> bool {
        matches!(self, KeyRole::KSK | KeyRole::CSK)
    }

    /// Whether keys of this role sign zone data.
    pub fn signs_data(&self) -> bool {
        matches!(self, KeyRole::ZSK | KeyRole::CSK)
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            KeyRole::KSK => "KSK",
            KeyRole::ZSK => "ZSK",
            KeyRole::CSK => "CSK",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, Error> {
        match token {
            "KSK" => Ok(KeyRole::KSK),
            "ZSK" => Ok(KeyRole::ZSK),
            "CSK" => Ok(KeyRole::CSK),
            _ => Err(Error::Configuration(format!("unknown key role '{token}'"))),
        }
    }
}

impl std::fmt::Display for KeyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

//----------- Minimize ---------------------------------------------------------

/// The per-slot minimize preference, as a bitmask over record types.
///
/// A set bit asks the enforcer to skip the both-keys-visible phase for that
/// record type during a rollover, where it can do so safely.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Minimize(u8);

impl Minimize {
    pub const NONE: Minimize = Minimize(0);
    pub const RRSIG: Minimize = Minimize(1);
    pub const DNSKEY: Minimize = Minimize(2);
    pub const DS: Minimize = Minimize(4);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Minimize) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Minimize) -> Self {
        Self(self.0 | other.0)
    }
}

//----------- Row field helpers ------------------------------------------------

fn missing(table: &str, field: &str) -> Error {
    Error::Configuration(format!("row of '{table}' lacks a usable '{field}' field"))
}

pub(crate) fn get_text(row: &Row, table: &str, field: &str) -> Result<String, Error> {
    row.get(field)
        .as_text()
        .map(str::to_owned)
        .ok_or_else(|| missing(table, field))
}

pub(crate) fn get_token(row: &Row, table: &str, field: &str) -> Result<String, Error> {
    row.get(field)
        .as_token()
        .map(str::to_owned)
        .ok_or_else(|| missing(table, field))
}

pub(crate) fn get_id(row: &Row, table: &str, field: &str) -> Result<RowId, Error> {
    row.get(field).as_id().ok_or_else(|| missing(table, field))
}

pub(crate) fn get_u32(row: &Row, table: &str, field: &str) -> Result<u32, Error> {
    row.get(field)
        .as_uint()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| missing(table, field))
}

pub(crate) fn get_bool(row: &Row, table: &str, field: &str) -> Result<bool, Error> {
    Ok(get_u32(row, table, field)? != 0)
}

pub(crate) fn get_secs(row: &Row, table: &str, field: &str) -> Result<Duration, Error> {
    Ok(Duration::from_secs(get_u32(row, table, field)?.into()))
}

pub(crate) fn get_opt_secs(row: &Row, table: &str, field: &str) -> Result<Option<Duration>, Error> {
    if row.get(field).is_empty() {
        return Ok(None);
    }
    get_secs(row, table, field).map(Some)
}

pub(crate) fn get_time(row: &Row, table: &str, field: &str) -> Result<UnixTime, Error> {
    row.get(field)
        .as_int()
        .map(UnixTime::from_secs)
        .ok_or_else(|| missing(table, field))
}

pub(crate) fn get_opt_time(
    row: &Row,
    table: &str,
    field: &str,
) -> Result<Option<UnixTime>, Error> {
    if row.get(field).is_empty() {
        return Ok(None);
    }
    get_time(row, table, field).map(Some)
}

pub(crate) fn opt_time_value(time: Option<UnixTime>) -> Value {
    match time {
        Some(t) => Value::Int64(t.as_secs()),
        None => Value::Empty,
    }
}

pub(crate) fn opt_secs_value(duration: Option<Duration>) -> Value {
    match duration {
        Some(d) => Value::UInt32(d.as_secs() as u32),
        None => Value::Empty,
    }
}

pub(crate) fn secs_value(duration: Duration) -> Value {
    Value::UInt32(duration.as_secs() as u32)
}

pub(crate) fn time_value(time: UnixTime) -> Value {
    Value::Int64(time.as_secs())
}
