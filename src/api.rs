//! Types shared between the enforcer core and its command surface.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::datetime::UnixTime;
use crate::db::KeyRole;

//----------- ZoneStatus -------------------------------------------------------

/// The operator-visible condition of a zone.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZoneStatus {
    /// The zone is progressing (or stable) on its own.
    #[default]
    Ok,

    /// A DS interaction with the parent is pending; the zone will not
    /// progress until the operator acts.
    WaitingForOperator,

    /// Desired transitions exist but the safety predicate forbids all of
    /// them; operator attention is needed.
    Blocked,
}

impl fmt::Display for ZoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ZoneStatus::Ok => "ok",
            ZoneStatus::WaitingForOperator => "waiting-for-operator",
            ZoneStatus::Blocked => "blocked",
        })
    }
}

//----------- RolloverReport ---------------------------------------------------

/// One row of the rollover report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverReport {
    /// The zone the roll belongs to.
    pub zone: String,

    /// The role that will roll.
    pub role: KeyRole,

    /// When the roll is scheduled; `None` for manual-only slots.
    pub at: Option<UnixTime>,
}

//----------- Exit codes -------------------------------------------------------

/// Exit codes of the command surface.
///
/// Zero is success; each failure class has a stable non-zero code so
/// wrapping scripts can tell them apart.
pub mod exit {
    /// The named zone or key does not exist.
    pub const NOT_FOUND: u8 = 2;

    /// The key is not in a state the command applies to.
    pub const WRONG_STATE: u8 = 3;

    /// The store failed.
    pub const STORAGE: u8 = 4;
}
