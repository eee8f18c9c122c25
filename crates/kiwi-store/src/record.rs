//! Lease record and its wire encoding
//!
//! A record is a single line of four whitespace-separated fields:
//! `<owner> <job_id> <start> <duration>`. The owner field encodes the lease
//! state: `[idle]`, `init:<user>` while the daemon has not yet confirmed, or
//! the bare user name once it has. Nothing outside this module sees those
//! prefixes.

use kiwi_util::Username;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Owner field of an unoccupied node
pub const IDLE_OWNER: &str = "[idle]";

/// Owner prefix while a lease is claimed but not yet confirmed
pub const INIT_PREFIX: &str = "init:";

const FIELD_COUNT: usize = 4;

/// Why a record line could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RecordFormatError(String);

/// Who occupies a node and in which phase
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeaseState {
    Idle,
    /// Claimed by a client, enforcement daemon not yet running
    Initializing(Username),
    /// Confirmed by the enforcement daemon
    Active(Username),
}

impl LeaseState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// The user holding the node in either phase
    pub fn holder(&self) -> Option<&Username> {
        match self {
            Self::Idle => None,
            Self::Initializing(user) | Self::Active(user) => Some(user),
        }
    }

    /// Whether a login by `user` belongs to this lease
    pub fn is_held_by(&self, user: &Username) -> bool {
        self.holder() == Some(user)
    }

    fn owner_field(&self) -> String {
        match self {
            Self::Idle => IDLE_OWNER.to_string(),
            Self::Initializing(user) => format!("{}{}", INIT_PREFIX, user),
            Self::Active(user) => user.to_string(),
        }
    }

    fn from_owner_field(field: &str) -> Result<Self, RecordFormatError> {
        if field == IDLE_OWNER {
            return Ok(Self::Idle);
        }
        match field.strip_prefix(INIT_PREFIX) {
            Some("") => Err(RecordFormatError("initializing owner has no user".into())),
            Some(user) => Ok(Self::Initializing(Username::new(user))),
            None => Ok(Self::Active(Username::new(field))),
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.owner_field())
    }
}

/// One node's lease record
///
/// Equality over all four fields is the fencing token: an actor that
/// captured a record may only act on it while the stored record still
/// compares equal.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRecord {
    pub state: LeaseState,
    /// Generation counter, bumped on every allocation attempt
    pub job_id: u64,
    /// Epoch seconds when the current occupancy began
    pub start: f64,
    /// Granted seconds
    pub duration: u64,
}

impl LeaseRecord {
    /// The record a node is registered with
    pub fn idle() -> Self {
        Self {
            state: LeaseState::Idle,
            job_id: 0,
            start: 0.0,
            duration: 0,
        }
    }

    /// Same job fields, different state
    pub fn with_state(&self, state: LeaseState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {}",
            self.state.owner_field(),
            self.job_id,
            self.start,
            self.duration
        )
    }
}

impl fmt::Display for LeaseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for LeaseRecord {
    type Err = RecordFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != FIELD_COUNT {
            return Err(RecordFormatError(format!(
                "expected {} fields, found {}",
                FIELD_COUNT,
                fields.len()
            )));
        }

        let state = LeaseState::from_owner_field(fields[0])?;
        let job_id = fields[1]
            .parse()
            .map_err(|_| RecordFormatError(format!("bad job id '{}'", fields[1])))?;
        let start: f64 = fields[2]
            .parse()
            .map_err(|_| RecordFormatError(format!("bad start '{}'", fields[2])))?;
        if !start.is_finite() {
            return Err(RecordFormatError(format!("bad start '{}'", fields[2])));
        }
        let duration = fields[3]
            .parse()
            .map_err(|_| RecordFormatError(format!("bad duration '{}'", fields[3])))?;

        Ok(Self {
            state,
            job_id,
            start,
            duration,
        })
    }
}
