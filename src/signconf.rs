//! Emitting signer configurations.
//!
//! Whenever a zone's key set or denial parameters change, the update loop
//! serialises the current view to the zone's configured path.  The document
//! is the signer's input contract; it is written atomically so the signer
//! only ever observes complete configurations.

use serde::Serialize;

use crate::db::keydata::RecordType;
use crate::db::policy::{DenialType, Policy};
use crate::db::zone::Zone;
use crate::enforcer::KeyEntry;
use crate::error::Error;
use crate::util::write_file;

//----------- Document types ---------------------------------------------------

/// The signer configuration for one zone.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct SignerConfig<'a> {
    /// The zone this configuration belongs to.
    zone: &'a str,

    /// Whether the zone passes through unsigned.
    passthrough: bool,

    /// Signature timing, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    signatures: Option<SignatureSpec>,

    /// Denial-of-existence parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    denial: Option<DenialSpec<'a>>,

    /// The keys the signer works with.
    keys: Vec<KeySpec<'a>>,

    /// SOA treatment.
    #[serde(skip_serializing_if = "Option::is_none")]
    soa: Option<SoaSpec>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct SignatureSpec {
    resign: u64,
    refresh: u64,
    jitter: u64,
    inception_offset: u64,
    validity_default: u64,
    validity_denial: u64,
    validity_keyset: u64,
    max_zone_ttl: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
enum DenialSpec<'a> {
    #[serde(rename = "NSEC")]
    NSec,
    #[serde(rename = "NSEC3")]
    NSec3 {
        optout: bool,
        algorithm: u32,
        iterations: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        salt: Option<&'a str>,
        ttl: u64,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct KeySpec<'a> {
    /// The HSM locator of the key material.
    locator: &'a str,

    /// The HSM repository holding the key.
    repository: &'a str,

    /// The DNSSEC algorithm number.
    algorithm: u32,

    /// The key tag, for reference.
    keytag: u16,

    /// The role of the key.
    role: &'a str,

    /// Whether the key appears in the DNSKEY RRset.
    publish: bool,

    /// Whether the key signs zone data.
    sign_data: bool,

    /// Whether the key signs the DNSKEY RRset.
    sign_keyset: bool,

    /// Whether the REVOKE bit is set.
    revoke: bool,

    /// The DNSKEY TTL, in seconds.
    ttl: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct SoaSpec {
    ttl: u64,
    minimum: u64,
    serial: &'static str,
}

//----------- Writing ----------------------------------------------------------

/// Write the signer configuration for a zone.
pub fn write(zone: &Zone, policy: &Policy, keys: &[KeyEntry]) -> Result<(), Error> {
    let document = SignerConfig {
        zone: &zone.name,
        passthrough: false,
        signatures: Some(SignatureSpec {
            resign: policy.signatures.resign.as_secs(),
            refresh: policy.signatures.refresh.as_secs(),
            jitter: policy.signatures.jitter.as_secs(),
            inception_offset: policy.signatures.inception_offset.as_secs(),
            validity_default: policy.signatures.validity_default.as_secs(),
            validity_denial: policy.signatures.validity_denial.as_secs(),
            validity_keyset: policy.signatures.validity_keyset().as_secs(),
            max_zone_ttl: policy.signatures.max_zone_ttl.as_secs(),
        }),
        denial: Some(match policy.denial.denial_type {
            DenialType::NSec => DenialSpec::NSec,
            DenialType::NSec3 => DenialSpec::NSec3 {
                optout: policy.denial.optout,
                algorithm: policy.denial.algorithm,
                iterations: policy.denial.iterations,
                salt: policy.denial.salt.as_deref(),
                ttl: policy.denial.ttl.as_secs(),
            },
        }),
        keys: keys
            .iter()
            .filter(|key| key.record_state(RecordType::Dnskey).possibly_visible())
            .map(|key| KeySpec {
                locator: &key.hsm.locator,
                repository: &key.hsm.repository,
                algorithm: key.data.algorithm,
                keytag: key.data.keytag,
                role: key.data.role.as_token(),
                publish: true,
                sign_data: key.data.active_zsk,
                sign_keyset: key.data.active_ksk,
                revoke: key.data.should_revoke,
                ttl: policy.keys.ttl.as_secs(),
            })
            .collect(),
        soa: Some(SoaSpec {
            ttl: policy.zone.soa_ttl.as_secs(),
            minimum: policy.zone.soa_minimum.as_secs(),
            serial: policy.zone.soa_serial.as_token(),
        }),
    };

    write_document(zone, &document)
}

/// Write the one-off passthrough marker for an unsigned zone.
pub fn write_passthrough(zone: &Zone) -> Result<(), Error> {
    let document = SignerConfig {
        zone: &zone.name,
        passthrough: true,
        signatures: None,
        denial: None,
        keys: Vec::new(),
        soa: None,
    };
    write_document(zone, &document)
}

fn write_document(zone: &Zone, document: &SignerConfig<'_>) -> Result<(), Error> {
    let text = serde_json::to_vec_pretty(document)
        .map_err(|err| Error::External(format!("signer configuration encoding: {err}")))?;
    write_file(&zone.signconf_path, &text).map_err(|err| {
        Error::External(format!(
            "could not write signer configuration '{}': {err}",
            zone.signconf_path
        ))
    })?;
    log::debug!(
        "Wrote signer configuration for zone '{}' to '{}'",
        zone.name,
        zone.signconf_path
    );
    Ok(())
}
