//! Policy and policy-key entities.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_store::{
    ClauseList, RowId, Transaction, Value, delete_row, read_one, table, update_row,
};

use super::{
    KeyRole, Minimize, get_bool, get_id, get_opt_secs, get_opt_time, get_secs, get_text,
    get_token, get_u32, opt_secs_value, opt_time_value, secs_value,
};
use crate::datetime::UnixTime;
use crate::error::Error;

//----------- Policy -----------------------------------------------------------

/// A key and signing policy.
///
/// Zones refer to exactly one policy; the policy's key slots (see
/// [`PolicyKey`]) decide which keys its zones carry.
#[derive(Clone, Debug, PartialEq)]
pub struct Policy {
    /// The row identifier; unset until created.
    pub id: RowId,

    /// The row revision.
    pub rev: u64,

    /// The unique name of the policy.
    pub name: String,

    /// A free-form description.
    pub description: Option<String>,

    /// Whether signing is disabled entirely for zones under this policy.
    pub passthrough: bool,

    /// Signature timing parameters.
    pub signatures: SignatureTimings,

    /// The denial-of-existence regime.
    pub denial: DenialPolicy,

    /// Key timing parameters.
    pub keys: KeyTimings,

    /// Timing properties of the zones under this policy.
    pub zone: ZoneTimings,

    /// Timing properties of the parent zone.
    pub parent: ParentTimings,
}

/// Signature timing parameters of a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureTimings {
    /// How often signatures are regenerated.
    pub resign: Duration,

    /// How long before expiry a signature is refreshed.
    pub refresh: Duration,

    /// Random spread applied to signature expiry.
    pub jitter: Duration,

    /// How far in the past signature inceptions are set.
    pub inception_offset: Duration,

    /// Validity of ordinary signatures.
    pub validity_default: Duration,

    /// Validity of denial-of-existence signatures.
    pub validity_denial: Duration,

    /// Validity of DNSKEY-RRset signatures; inherits `validity_default`
    /// when unset.
    pub validity_keyset: Option<Duration>,

    /// Upper bound on TTLs occurring in the zone.
    pub max_zone_ttl: Duration,
}

impl SignatureTimings {
    /// The effective keyset signature validity.
    pub fn validity_keyset(&self) -> Duration {
        self.validity_keyset.unwrap_or(self.validity_default)
    }
}

/// The denial-of-existence regime of a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DenialPolicy {
    /// NSEC or NSEC3.
    pub denial_type: DenialType,

    /// NSEC3 opt-out.
    pub optout: bool,

    /// The TTL used for denial records.
    pub ttl: Duration,

    /// How often the NSEC3 salt is regenerated; zero disables resalting.
    pub resalt: Duration,

    /// The NSEC3 hash algorithm.
    pub algorithm: u32,

    /// The NSEC3 iteration count.
    pub iterations: u32,

    /// The length of generated salts, in bytes.
    pub salt_length: u32,

    /// The current salt, hex-encoded.
    pub salt: Option<String>,

    /// When the salt last changed.
    pub salt_last_change: Option<UnixTime>,
}

impl DenialPolicy {
    /// When the next resalt is due, if resalting applies.
    pub fn next_resalt(&self) -> Option<UnixTime> {
        if self.denial_type != DenialType::NSec3 || self.resalt.is_zero() {
            return None;
        }
        match self.salt_last_change {
            // No salt yet; one is due immediately.
            None => Some(UnixTime::from_secs(0)),
            Some(last) => Some(last + self.resalt),
        }
    }
}

/// NSEC or NSEC3.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenialType {
    NSec,
    NSec3,
}

impl DenialType {
    pub fn as_token(&self) -> &'static str {
        match self {
            DenialType::NSec => "NSEC",
            DenialType::NSec3 => "NSEC3",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, Error> {
        match token {
            "NSEC" => Ok(DenialType::NSec),
            "NSEC3" => Ok(DenialType::NSec3),
            _ => Err(Error::Configuration(format!(
                "unknown denial type '{token}'"
            ))),
        }
    }
}

/// Key timing parameters of a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyTimings {
    /// The TTL of the DNSKEY RRset.
    pub ttl: Duration,

    /// Extra safety margin on withdrawals.
    pub retire_safety: Duration,

    /// Extra safety margin on introductions.
    pub publish_safety: Duration,

    /// Whether one key set serves all zones under the policy.
    pub shared: bool,

    /// How long fully-hidden keys linger before being purged.
    pub purge_after: Duration,
}

/// Timing properties of the zones under a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneTimings {
    /// Bound on caches observing a new authoritative record.
    pub propagation_delay: Duration,

    /// The SOA TTL of the zones.
    pub soa_ttl: Duration,

    /// The SOA minimum of the zones.
    pub soa_minimum: Duration,

    /// How SOA serial numbers are generated.
    pub soa_serial: SerialStyle,
}

/// Timing properties of the parent zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentTimings {
    /// Delay between a DS submission and the parent acting on it.
    pub registration_delay: Duration,

    /// Bound on caches observing a change at the parent.
    pub propagation_delay: Duration,

    /// The TTL of the DS RRset at the parent.
    pub ds_ttl: Duration,

    /// The SOA TTL of the parent zone.
    pub soa_ttl: Duration,

    /// The SOA minimum of the parent zone.
    pub soa_minimum: Duration,
}

/// How SOA serial numbers are generated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialStyle {
    /// Increment on every change.
    Counter,

    /// `<YYYY><MM><DD><xx>`.
    DateCounter,

    /// The current Unix time, in seconds.
    UnixTime,

    /// Keep the serial of the unsigned zone.
    Keep,
}

impl SerialStyle {
    pub fn as_token(&self) -> &'static str {
        match self {
            SerialStyle::Counter => "counter",
            SerialStyle::DateCounter => "datecounter",
            SerialStyle::UnixTime => "unixtime",
            SerialStyle::Keep => "keep",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, Error> {
        match token {
            "counter" => Ok(SerialStyle::Counter),
            "datecounter" => Ok(SerialStyle::DateCounter),
            "unixtime" => Ok(SerialStyle::UnixTime),
            "keep" => Ok(SerialStyle::Keep),
            _ => Err(Error::Configuration(format!(
                "unknown serial style '{token}'"
            ))),
        }
    }
}

//--- Storage

impl Policy {
    /// A policy with conservative defaults and the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: RowId::from_raw(0),
            rev: 0,
            name: name.into(),
            description: None,
            passthrough: false,
            signatures: SignatureTimings {
                resign: Duration::from_secs(2 * 3600),
                refresh: Duration::from_secs(3 * 24 * 3600),
                jitter: Duration::from_secs(12 * 3600),
                inception_offset: Duration::from_secs(3600),
                validity_default: Duration::from_secs(14 * 24 * 3600),
                validity_denial: Duration::from_secs(14 * 24 * 3600),
                validity_keyset: None,
                max_zone_ttl: Duration::from_secs(24 * 3600),
            },
            denial: DenialPolicy {
                denial_type: DenialType::NSec3,
                optout: false,
                ttl: Duration::from_secs(3600),
                resalt: Duration::from_secs(90 * 24 * 3600),
                algorithm: 1,
                iterations: 0,
                salt_length: 8,
                salt: None,
                salt_last_change: None,
            },
            keys: KeyTimings {
                ttl: Duration::from_secs(3600),
                retire_safety: Duration::from_secs(3600),
                publish_safety: Duration::from_secs(3600),
                shared: false,
                purge_after: Duration::from_secs(14 * 24 * 3600),
            },
            zone: ZoneTimings {
                propagation_delay: Duration::from_secs(9 * 3600),
                soa_ttl: Duration::from_secs(3600),
                soa_minimum: Duration::from_secs(3600),
                soa_serial: SerialStyle::UnixTime,
            },
            parent: ParentTimings {
                registration_delay: Duration::from_secs(24 * 3600),
                propagation_delay: Duration::from_secs(9 * 3600),
                ds_ttl: Duration::from_secs(3600),
                soa_ttl: Duration::from_secs(3600),
                soa_minimum: Duration::from_secs(3600),
            },
        }
    }

    /// Insert this policy as a fresh row.
    pub fn create(mut self, txn: &mut dyn Transaction) -> Result<Self, Error> {
        self.id = txn.create(table::POLICY, self.fields())?;
        self.rev = 1;
        Ok(self)
    }

    /// Write this policy back under its revision.
    pub fn update(&mut self, txn: &mut dyn Transaction) -> Result<(), Error> {
        update_row(txn, table::POLICY, self.id, self.rev, self.fields())?;
        self.rev += 1;
        Ok(())
    }

    /// Delete this policy row.
    pub fn delete(self, txn: &mut dyn Transaction) -> Result<(), Error> {
        delete_row(txn, table::POLICY, self.id, self.rev)?;
        Ok(())
    }

    /// Look a policy up by its row identifier.
    pub fn get(txn: &dyn Transaction, id: RowId) -> Result<Self, Error> {
        let row = read_one(txn, table::POLICY, &[], &ClauseList::new().eq("id", id))?;
        Self::from_row(&row)
    }

    /// Look a policy up by name.
    pub fn get_by_name(txn: &dyn Transaction, name: &str) -> Result<Option<Self>, Error> {
        let rows = txn.read(table::POLICY, &[], &ClauseList::new().eq("name", name))?;
        rows.first().map(Self::from_row).transpose()
    }

    /// All policies, by name.
    pub fn list(txn: &dyn Transaction) -> Result<Vec<Self>, Error> {
        let mut policies = txn
            .read(table::POLICY, &[], &ClauseList::new())?
            .iter()
            .map(Self::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(policies)
    }

    fn from_row(row: &warden_store::Row) -> Result<Self, Error> {
        const T: &str = table::POLICY;
        Ok(Self {
            id: row.id,
            rev: row.rev,
            name: get_text(row, T, "name")?,
            description: row.get("description").as_text().map(str::to_owned),
            passthrough: get_bool(row, T, "passthrough")?,
            signatures: SignatureTimings {
                resign: get_secs(row, T, "signaturesResign")?,
                refresh: get_secs(row, T, "signaturesRefresh")?,
                jitter: get_secs(row, T, "signaturesJitter")?,
                inception_offset: get_secs(row, T, "signaturesInceptionOffset")?,
                validity_default: get_secs(row, T, "signaturesValidityDefault")?,
                validity_denial: get_secs(row, T, "signaturesValidityDenial")?,
                validity_keyset: get_opt_secs(row, T, "signaturesValidityKeyset")?,
                max_zone_ttl: get_secs(row, T, "signaturesMaxZoneTtl")?,
            },
            denial: DenialPolicy {
                denial_type: DenialType::from_token(&get_token(row, T, "denialType")?)?,
                optout: get_bool(row, T, "denialOptout")?,
                ttl: get_secs(row, T, "denialTtl")?,
                resalt: get_secs(row, T, "denialResalt")?,
                algorithm: get_u32(row, T, "denialAlgorithm")?,
                iterations: get_u32(row, T, "denialIterations")?,
                salt_length: get_u32(row, T, "denialSaltLength")?,
                salt: row.get("denialSalt").as_text().map(str::to_owned),
                salt_last_change: get_opt_time(row, T, "denialSaltLastChange")?,
            },
            keys: KeyTimings {
                ttl: get_secs(row, T, "keysTtl")?,
                retire_safety: get_secs(row, T, "keysRetireSafety")?,
                publish_safety: get_secs(row, T, "keysPublishSafety")?,
                shared: get_bool(row, T, "keysShared")?,
                purge_after: get_secs(row, T, "keysPurgeAfter")?,
            },
            zone: ZoneTimings {
                propagation_delay: get_secs(row, T, "zonePropagationDelay")?,
                soa_ttl: get_secs(row, T, "zoneSoaTtl")?,
                soa_minimum: get_secs(row, T, "zoneSoaMinimum")?,
                soa_serial: SerialStyle::from_token(&get_token(row, T, "zoneSoaSerial")?)?,
            },
            parent: ParentTimings {
                registration_delay: get_secs(row, T, "parentRegistrationDelay")?,
                propagation_delay: get_secs(row, T, "parentPropagationDelay")?,
                ds_ttl: get_secs(row, T, "parentDsTtl")?,
                soa_ttl: get_secs(row, T, "parentSoaTtl")?,
                soa_minimum: get_secs(row, T, "parentSoaMinimum")?,
            },
        })
    }

    fn fields(&self) -> Vec<(String, Value)> {
        vec![
            ("name".into(), self.name.clone().into()),
            (
                "description".into(),
                match &self.description {
                    Some(d) => d.clone().into(),
                    None => Value::Empty,
                },
            ),
            ("passthrough".into(), self.passthrough.into()),
            ("signaturesResign".into(), secs_value(self.signatures.resign)),
            (
                "signaturesRefresh".into(),
                secs_value(self.signatures.refresh),
            ),
            ("signaturesJitter".into(), secs_value(self.signatures.jitter)),
            (
                "signaturesInceptionOffset".into(),
                secs_value(self.signatures.inception_offset),
            ),
            (
                "signaturesValidityDefault".into(),
                secs_value(self.signatures.validity_default),
            ),
            (
                "signaturesValidityDenial".into(),
                secs_value(self.signatures.validity_denial),
            ),
            (
                "signaturesValidityKeyset".into(),
                opt_secs_value(self.signatures.validity_keyset),
            ),
            (
                "signaturesMaxZoneTtl".into(),
                secs_value(self.signatures.max_zone_ttl),
            ),
            (
                "denialType".into(),
                Value::Enum(self.denial.denial_type.as_token().into()),
            ),
            ("denialOptout".into(), self.denial.optout.into()),
            ("denialTtl".into(), secs_value(self.denial.ttl)),
            ("denialResalt".into(), secs_value(self.denial.resalt)),
            ("denialAlgorithm".into(), self.denial.algorithm.into()),
            ("denialIterations".into(), self.denial.iterations.into()),
            ("denialSaltLength".into(), self.denial.salt_length.into()),
            (
                "denialSalt".into(),
                match &self.denial.salt {
                    Some(s) => s.clone().into(),
                    None => Value::Empty,
                },
            ),
            (
                "denialSaltLastChange".into(),
                opt_time_value(self.denial.salt_last_change),
            ),
            ("keysTtl".into(), secs_value(self.keys.ttl)),
            ("keysRetireSafety".into(), secs_value(self.keys.retire_safety)),
            (
                "keysPublishSafety".into(),
                secs_value(self.keys.publish_safety),
            ),
            ("keysShared".into(), self.keys.shared.into()),
            ("keysPurgeAfter".into(), secs_value(self.keys.purge_after)),
            (
                "zonePropagationDelay".into(),
                secs_value(self.zone.propagation_delay),
            ),
            ("zoneSoaTtl".into(), secs_value(self.zone.soa_ttl)),
            ("zoneSoaMinimum".into(), secs_value(self.zone.soa_minimum)),
            (
                "zoneSoaSerial".into(),
                Value::Enum(self.zone.soa_serial.as_token().into()),
            ),
            (
                "parentRegistrationDelay".into(),
                secs_value(self.parent.registration_delay),
            ),
            (
                "parentPropagationDelay".into(),
                secs_value(self.parent.propagation_delay),
            ),
            ("parentDsTtl".into(), secs_value(self.parent.ds_ttl)),
            ("parentSoaTtl".into(), secs_value(self.parent.soa_ttl)),
            ("parentSoaMinimum".into(), secs_value(self.parent.soa_minimum)),
        ]
    }
}

//----------- PolicyKey --------------------------------------------------------

/// A key slot of a policy.
///
/// Role and algorithm together identify a slot within one policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyKey {
    pub id: RowId,
    pub rev: u64,

    /// The policy this slot belongs to.
    pub policy_id: RowId,

    /// The role of keys in this slot.
    pub role: KeyRole,

    /// The DNSSEC algorithm number.
    pub algorithm: u32,

    /// The key size, in bits.
    pub bits: u32,

    /// How long a key serves before a successor is started.
    pub lifetime: Duration,

    /// The HSM repository keys are generated in.
    pub repository: String,

    /// How many standby keys to keep alongside the active one.
    pub standby: u32,

    /// Whether rollovers only happen on operator request.
    pub manual_rollover: bool,

    /// Whether to roll as an RFC 5011 trust anchor.
    pub rfc5011: bool,

    /// The minimize preference for this slot.
    pub minimize: Minimize,
}

impl PolicyKey {
    /// Insert this slot as a fresh row.
    pub fn create(mut self, txn: &mut dyn Transaction) -> Result<Self, Error> {
        self.id = txn.create(table::POLICY_KEY, self.fields())?;
        self.rev = 1;
        Ok(self)
    }

    /// Write this slot back under its revision.
    pub fn update(&mut self, txn: &mut dyn Transaction) -> Result<(), Error> {
        update_row(txn, table::POLICY_KEY, self.id, self.rev, self.fields())?;
        self.rev += 1;
        Ok(())
    }

    /// Delete this slot row.
    pub fn delete(self, txn: &mut dyn Transaction) -> Result<(), Error> {
        delete_row(txn, table::POLICY_KEY, self.id, self.rev)?;
        Ok(())
    }

    /// All slots of a policy, in deterministic order.
    pub fn list_for_policy(
        txn: &dyn Transaction,
        policy_id: RowId,
    ) -> Result<Vec<Self>, Error> {
        let mut keys = txn
            .read(
                table::POLICY_KEY,
                &[],
                &ClauseList::new().eq("policyId", policy_id),
            )?
            .iter()
            .map(Self::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        keys.sort_by_key(|k| (k.role, k.algorithm, k.bits));
        Ok(keys)
    }

    fn from_row(row: &warden_store::Row) -> Result<Self, Error> {
        const T: &str = table::POLICY_KEY;
        Ok(Self {
            id: row.id,
            rev: row.rev,
            policy_id: get_id(row, T, "policyId")?,
            role: KeyRole::from_token(&get_token(row, T, "role")?)?,
            algorithm: get_u32(row, T, "algorithm")?,
            bits: get_u32(row, T, "bits")?,
            lifetime: get_secs(row, T, "lifetime")?,
            repository: get_text(row, T, "repository")?,
            standby: get_u32(row, T, "standby")?,
            manual_rollover: get_bool(row, T, "manualRollover")?,
            rfc5011: get_bool(row, T, "rfc5011")?,
            minimize: Minimize::from_bits(get_u32(row, T, "minimize")? as u8),
        })
    }

    fn fields(&self) -> Vec<(String, Value)> {
        vec![
            ("policyId".into(), self.policy_id.into()),
            ("role".into(), Value::Enum(self.role.as_token().into())),
            ("algorithm".into(), self.algorithm.into()),
            ("bits".into(), self.bits.into()),
            ("lifetime".into(), secs_value(self.lifetime)),
            ("repository".into(), self.repository.clone().into()),
            ("standby".into(), self.standby.into()),
            ("manualRollover".into(), self.manual_rollover.into()),
            ("rfc5011".into(), self.rfc5011.into()),
            ("minimize".into(), Value::UInt32(self.minimize.bits().into())),
        ]
    }
}
