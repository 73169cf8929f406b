use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CloudError;

/// The IaaS regions the broker is allowed to allocate in.
///
/// The free lists are sharded by this enum; instances never migrate
/// between regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Region {
    #[serde(rename = "ap-northeast-1")]
    ApNortheast1,
    #[serde(rename = "ap-southeast-1")]
    ApSoutheast1,
    #[serde(rename = "ap-southeast-2")]
    ApSoutheast2,
    #[serde(rename = "eu-west-1")]
    EuWest1,
    #[serde(rename = "sa-east-1")]
    SaEast1,
    #[serde(rename = "us-east-1")]
    UsEast1,
    #[serde(rename = "us-west-1")]
    UsWest1,
    #[serde(rename = "us-west-2")]
    UsWest2,
}

impl Region {
    /// All supported regions, in recovery sweep order
    pub fn all() -> &'static [Region] {
        &[
            Region::ApNortheast1,
            Region::ApSoutheast1,
            Region::ApSoutheast2,
            Region::EuWest1,
            Region::SaEast1,
            Region::UsEast1,
            Region::UsWest1,
            Region::UsWest2,
        ]
    }

    /// The region name as the IaaS knows it
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::ApNortheast1 => "ap-northeast-1",
            Region::ApSoutheast1 => "ap-southeast-1",
            Region::ApSoutheast2 => "ap-southeast-2",
            Region::EuWest1 => "eu-west-1",
            Region::SaEast1 => "sa-east-1",
            Region::UsEast1 => "us-east-1",
            Region::UsWest1 => "us-west-1",
            Region::UsWest2 => "us-west-2",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::all()
            .iter()
            .find(|region| region.as_str() == s)
            .copied()
            .ok_or_else(|| CloudError::InvalidRegion {
                region: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_names_round_trip() {
        for region in Region::all() {
            assert_eq!(&region.as_str().parse::<Region>().unwrap(), region);
        }
    }

    #[test]
    fn unknown_region_is_rejected() {
        assert!("mars-north-1".parse::<Region>().is_err());
    }
}
