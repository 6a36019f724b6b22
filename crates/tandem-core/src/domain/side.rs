//! The two replicas kept in sync

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// One of the two replicas being synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The local filesystem tree
    Local,
    /// The remote hosting service
    Remote,
}

impl Side {
    /// Both sides, local first
    pub const ALL: [Side; 2] = [Side::Local, Side::Remote];

    /// The opposite replica
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Side::Local),
            "remote" => Ok(Side::Remote),
            other => Err(DomainError::InvalidSide(other.to_string())),
        }
    }
}

/// One value per side
#[derive(Debug, Clone, Default)]
pub struct SidePair<T> {
    pub local: T,
    pub remote: T,
}

impl<T> SidePair<T> {
    pub fn new(local: T, remote: T) -> Self {
        Self { local, remote }
    }

    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        }
    }
}
