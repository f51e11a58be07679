use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Canonical provider identifiers used in status maps, cache keys and envelopes.
///
/// Variants are declared in id order so the derived `Ord` matches sorting by
/// `as_str()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Exoplanets,
    Iss,
    Mars,
}

impl ProviderId {
    pub const ALL: [Self; 3] = [Self::Exoplanets, Self::Iss, Self::Mars];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exoplanets => "exoplanets",
            Self::Iss => "iss",
            Self::Mars => "mars",
        }
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "exoplanets" => Ok(Self::Exoplanets),
            "iss" => Ok(Self::Iss),
            "mars" => Ok(Self::Mars),
            other => Err(ValidationError::InvalidSource {
                value: other.to_owned(),
            }),
        }
    }
}
