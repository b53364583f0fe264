use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Exclusive upper bound for contribution ids.
///
/// Ids double as non-hardened BIP32 child indexes, so they must stay below the
/// hardened boundary.
pub const CONTRIBUTION_ID_LIMIT: i64 = 1 << 31;

/// Identifier of a single pledge, assigned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct ContributionId(u32);

impl ContributionId {
    /// Validate a raw id from the wire
    pub fn new(raw: i64) -> Result<Self> {
        if !(0..CONTRIBUTION_ID_LIMIT).contains(&raw) {
            return Err(Error::InvalidContributionId(raw));
        }
        Ok(Self(raw as u32))
    }

    /// The id as a derivation index
    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for ContributionId {
    type Error = Error;

    fn try_from(raw: i64) -> Result<Self> {
        Self::new(raw)
    }
}

impl From<ContributionId> for u32 {
    fn from(id: ContributionId) -> Self {
        id.0
    }
}

impl FromStr for ContributionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw: i64 = s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidInput(format!("'{}' is not a contribution id", s)))?;
        Self::new(raw)
    }
}

impl fmt::Display for ContributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
