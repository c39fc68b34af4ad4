//! Loading key and signing policies from TOML files.
//!
//! Policies live as `<name>.toml` files in the policy directory and are
//! synced into store rows at startup (and on demand via `policy load`).
//! The salt and its age are runtime state owned by the enforcer, not by the
//! file: reloading a policy never touches them.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use warden_store::Backend;

use crate::datetime::TimeSpan;
use crate::db::policy::{
    DenialPolicy, DenialType, KeyTimings, ParentTimings, Policy, PolicyKey, SerialStyle,
    SignatureTimings, ZoneTimings,
};
use crate::db::{KeyRole, Minimize};
use crate::error::Error;

//----------- Spec -------------------------------------------------------------

/// A policy file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Spec {
    /// A free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether signing is disabled entirely.
    #[serde(default)]
    pub passthrough: bool,

    /// Signature timing parameters.
    pub signatures: SignaturesSpec,

    /// The denial-of-existence regime.
    pub denial: DenialSpec,

    /// Key timing parameters.
    pub keys: KeysSpec,

    /// Timing properties of the zones under this policy.
    pub zone: ZoneSpec,

    /// Timing properties of the parent zone.
    pub parent: ParentSpec,

    /// The key slots of this policy.
    #[serde(default, rename = "key")]
    pub key_slots: Vec<KeySlotSpec>,
}

/// Signature timing parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SignaturesSpec {
    pub resign: TimeSpan,
    pub refresh: TimeSpan,
    pub jitter: TimeSpan,
    pub inception_offset: TimeSpan,
    pub validity_default: TimeSpan,
    pub validity_denial: TimeSpan,
    /// Inherits `validity-default` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_keyset: Option<TimeSpan>,
    pub max_zone_ttl: TimeSpan,
}

/// The denial-of-existence regime.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case",
    deny_unknown_fields,
    tag = "type"
)]
pub enum DenialSpec {
    /// Plain NSEC.
    #[serde(rename = "NSEC")]
    NSec {
        ttl: TimeSpan,
    },

    /// Hashed denial.
    #[serde(rename = "NSEC3")]
    NSec3 {
        #[serde(default)]
        optout: bool,
        ttl: TimeSpan,
        resalt: TimeSpan,
        algorithm: u32,
        iterations: u32,
        salt_length: u32,
    },
}

/// Key timing parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct KeysSpec {
    pub ttl: TimeSpan,
    pub retire_safety: TimeSpan,
    pub publish_safety: TimeSpan,
    #[serde(default)]
    pub shared: bool,
    pub purge_after: TimeSpan,
}

/// Timing properties of the zones under this policy.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ZoneSpec {
    pub propagation_delay: TimeSpan,
    pub soa_ttl: TimeSpan,
    pub soa_minimum: TimeSpan,
    pub soa_serial: SerialStyleSpec,
}

/// Timing properties of the parent zone.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ParentSpec {
    pub registration_delay: TimeSpan,
    pub propagation_delay: TimeSpan,
    pub ds_ttl: TimeSpan,
    pub soa_ttl: TimeSpan,
    pub soa_minimum: TimeSpan,
}

/// How SOA serial numbers are generated.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SerialStyleSpec {
    Counter,
    DateCounter,
    UnixTime,
    Keep,
}

/// One key slot.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct KeySlotSpec {
    pub role: KeyRole,
    pub algorithm: u32,
    pub bits: u32,
    /// Zero means no automatic rollover.
    pub lifetime: TimeSpan,
    pub repository: String,
    #[serde(default)]
    pub standby: u32,
    #[serde(default)]
    pub manual_rollover: bool,
    #[serde(default)]
    pub rfc5011: bool,
    #[serde(default)]
    pub minimize: Vec<MinimizeSpec>,
}

/// One record type named in a minimize list.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub enum MinimizeSpec {
    #[serde(rename = "RRSIG")]
    Rrsig,
    #[serde(rename = "DNSKEY")]
    Dnskey,
    #[serde(rename = "DS")]
    Ds,
}

//--- Conversion

impl Spec {
    /// Load a policy file.
    pub fn load(path: &Utf8Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| io::Error::other(err.to_string()))
    }

    /// Apply this specification onto a policy, leaving runtime state alone.
    pub fn parse_into(self, policy: &mut Policy) {
        policy.description = self.description;
        policy.passthrough = self.passthrough;
        policy.signatures = SignatureTimings {
            resign: self.signatures.resign.duration(),
            refresh: self.signatures.refresh.duration(),
            jitter: self.signatures.jitter.duration(),
            inception_offset: self.signatures.inception_offset.duration(),
            validity_default: self.signatures.validity_default.duration(),
            validity_denial: self.signatures.validity_denial.duration(),
            validity_keyset: self.signatures.validity_keyset.map(|v| v.duration()),
            max_zone_ttl: self.signatures.max_zone_ttl.duration(),
        };
        policy.denial = match self.denial {
            DenialSpec::NSec { ttl } => DenialPolicy {
                denial_type: DenialType::NSec,
                optout: false,
                ttl: ttl.duration(),
                resalt: std::time::Duration::ZERO,
                algorithm: 0,
                iterations: 0,
                salt_length: 0,
                salt: None,
                salt_last_change: None,
            },
            DenialSpec::NSec3 {
                optout,
                ttl,
                resalt,
                algorithm,
                iterations,
                salt_length,
            } => {
                // The salt survives reloads; only a denial-type change
                // invalidates it.
                let keep_salt = policy.denial.denial_type == DenialType::NSec3;
                DenialPolicy {
                    denial_type: DenialType::NSec3,
                    optout,
                    ttl: ttl.duration(),
                    resalt: resalt.duration(),
                    algorithm,
                    iterations,
                    salt_length,
                    salt: policy.denial.salt.take().filter(|_| keep_salt),
                    salt_last_change: policy.denial.salt_last_change.filter(|_| keep_salt),
                }
            }
        };
        policy.keys = KeyTimings {
            ttl: self.keys.ttl.duration(),
            retire_safety: self.keys.retire_safety.duration(),
            publish_safety: self.keys.publish_safety.duration(),
            shared: self.keys.shared,
            purge_after: self.keys.purge_after.duration(),
        };
        policy.zone = ZoneTimings {
            propagation_delay: self.zone.propagation_delay.duration(),
            soa_ttl: self.zone.soa_ttl.duration(),
            soa_minimum: self.zone.soa_minimum.duration(),
            soa_serial: match self.zone.soa_serial {
                SerialStyleSpec::Counter => SerialStyle::Counter,
                SerialStyleSpec::DateCounter => SerialStyle::DateCounter,
                SerialStyleSpec::UnixTime => SerialStyle::UnixTime,
                SerialStyleSpec::Keep => SerialStyle::Keep,
            },
        };
        policy.parent = ParentTimings {
            registration_delay: self.parent.registration_delay.duration(),
            propagation_delay: self.parent.propagation_delay.duration(),
            ds_ttl: self.parent.ds_ttl.duration(),
            soa_ttl: self.parent.soa_ttl.duration(),
            soa_minimum: self.parent.soa_minimum.duration(),
        };
    }
}

impl KeySlotSpec {
    /// The minimize mask this slot describes.
    pub fn minimize_mask(&self) -> Minimize {
        self.minimize
            .iter()
            .fold(Minimize::NONE, |mask, m| {
                mask.union(match m {
                    MinimizeSpec::Rrsig => Minimize::RRSIG,
                    MinimizeSpec::Dnskey => Minimize::DNSKEY,
                    MinimizeSpec::Ds => Minimize::DS,
                })
            })
    }
}

//----------- Loading a directory ----------------------------------------------

/// Sync every policy file in a directory into the store.
///
/// Returns the names of the policies seen.  Policies in the store but not
/// on disk are left untouched; zones may still be using them.
pub fn load_dir(store: &dyn Backend, dir: &Utf8Path) -> Result<Vec<String>, Error> {
    let mut seen = Vec::new();

    let entries = std::fs::read_dir(dir).map_err(|err| {
        Error::Configuration(format!("cannot read policy directory '{dir}': {err}"))
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| {
            Error::Configuration(format!("cannot read policy directory '{dir}': {err}"))
        })?;

        // Filter for UTF-8 paths.
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            log::warn!(
                "Ignoring potential policy '{}' as the path is non-UTF-8",
                entry.path().display()
            );
            continue;
        };

        // Filter hidden files.
        if path
            .file_name()
            .expect("this path has a known parent directory")
            .starts_with('.')
        {
            continue;
        }

        // Filter for '.toml' files.
        if path
            .extension()
            .is_none_or(|e| !e.eq_ignore_ascii_case("toml"))
        {
            log::warn!("Ignoring potential policy '{path}'; policies must end in '.toml'");
            continue;
        }

        let name = path
            .file_stem()
            .expect("this path points to a readable file, so it must have a file name");
        let spec = Spec::load(&path).map_err(|err| {
            Error::Configuration(format!("cannot load policy '{path}': {err}"))
        })?;

        load_one(store, name, spec)?;
        seen.push(name.to_string());
    }

    Ok(seen)
}

/// Sync one policy spec into the store.
pub fn load_one(store: &dyn Backend, name: &str, spec: Spec) -> Result<(), Error> {
    let mut txn = store.begin()?;

    let slots = spec.key_slots.clone();
    let policy = match Policy::get_by_name(&*txn, name)? {
        Some(mut policy) => {
            let before = policy.clone();
            spec.parse_into(&mut policy);
            if policy != before {
                policy.update(&mut *txn)?;
                log::info!("Updated policy '{name}'");
            }
            policy
        }
        None => {
            let mut policy = Policy::new(name);
            spec.parse_into(&mut policy);
            let policy = policy.create(&mut *txn)?;
            log::info!("Loaded new policy '{name}'");
            policy
        }
    };

    // Sync the key slots: role and algorithm identify a slot.
    let mut existing = PolicyKey::list_for_policy(&*txn, policy.id)?;
    for slot in slots {
        let wanted = PolicyKey {
            id: warden_store::RowId::from_raw(0),
            rev: 0,
            policy_id: policy.id,
            role: slot.role,
            algorithm: slot.algorithm,
            bits: slot.bits,
            lifetime: slot.lifetime.duration(),
            repository: slot.repository.clone(),
            standby: slot.standby,
            manual_rollover: slot.manual_rollover,
            rfc5011: slot.rfc5011,
            minimize: slot.minimize_mask(),
        };

        match existing
            .iter()
            .position(|pk| pk.role == wanted.role && pk.algorithm == wanted.algorithm)
        {
            Some(pos) => {
                let mut current = existing.swap_remove(pos);
                let changed = PolicyKey {
                    id: current.id,
                    rev: current.rev,
                    ..wanted
                };
                if changed != current {
                    current = changed;
                    current.update(&mut *txn)?;
                }
            }
            None => {
                wanted.create(&mut *txn)?;
            }
        }
    }

    // Slots that vanished from the file retire their keys via evaluation.
    for leftover in existing {
        log::info!(
            "Policy '{name}' no longer has a {} slot (algorithm {})",
            leftover.role,
            leftover.algorithm
        );
        leftover.delete(&mut *txn)?;
    }

    txn.commit()?;
    Ok(())
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use warden_store::MemoryBackend;

    const EXAMPLE: &str = r#"
        description = "Default signing policy"

        [signatures]
        resign = "2h"
        refresh = "3d"
        jitter = "12h"
        inception-offset = "1h"
        validity-default = "14d"
        validity-denial = "14d"
        max-zone-ttl = "1d"

        [denial]
        type = "NSEC3"
        ttl = "1h"
        resalt = "90d"
        algorithm = 1
        iterations = 0
        salt-length = 8

        [keys]
        ttl = "1h"
        retire-safety = "1h"
        publish-safety = "1h"
        purge-after = "14d"

        [zone]
        propagation-delay = "9h"
        soa-ttl = "1h"
        soa-minimum = "1h"
        soa-serial = "unix-time"

        [parent]
        registration-delay = "1d"
        propagation-delay = "9h"
        ds-ttl = "1h"
        soa-ttl = "1h"
        soa-minimum = "1h"

        [[key]]
        role = "KSK"
        algorithm = 13
        bits = 256
        lifetime = "365d"
        repository = "default"
        minimize = ["DS"]

        [[key]]
        role = "ZSK"
        algorithm = 13
        bits = 256
        lifetime = "90d"
        repository = "default"
        standby = 1
    "#;

    #[test]
    fn parse_and_sync() {
        let spec: Spec = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(spec.key_slots.len(), 2);

        let store = MemoryBackend::new();
        load_one(&store, "default", spec.clone()).unwrap();

        let txn = store.begin().unwrap();
        let policy = Policy::get_by_name(&*txn, "default").unwrap().unwrap();
        assert!(!policy.passthrough);
        assert_eq!(
            policy.signatures.validity_keyset(),
            policy.signatures.validity_default
        );
        assert_eq!(policy.denial.denial_type, DenialType::NSec3);

        let slots = PolicyKey::list_for_policy(&*txn, policy.id).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].role, KeyRole::KSK);
        assert!(slots[0].minimize.contains(Minimize::DS));
        assert_eq!(slots[1].standby, 1);
        drop(txn);

        // Reloading the identical spec writes nothing (same revisions).
        load_one(&store, "default", spec).unwrap();
        let txn = store.begin().unwrap();
        let unchanged = Policy::get_by_name(&*txn, "default").unwrap().unwrap();
        assert_eq!(unchanged.rev, policy.rev);
    }

    #[test]
    fn validity_keyset_is_optional() {
        let spec: Spec = toml::from_str(EXAMPLE).unwrap();
        assert!(spec.signatures.validity_keyset.is_none());

        let with = EXAMPLE.replace(
            "validity-denial = \"14d\"",
            "validity-denial = \"14d\"\nvalidity-keyset = \"7d\"",
        );
        let spec: Spec = toml::from_str(&with).unwrap();
        assert_eq!(
            spec.signatures.validity_keyset,
            Some(TimeSpan::from_secs(7 * 24 * 3600))
        );
    }
}
