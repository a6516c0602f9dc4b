//! Supported Student Information System providers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An external SIS provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SisProvider {
    PowerSchool,
    InfiniteCampus,
    Skyward,
}

impl SisProvider {
    /// All known providers.
    pub const ALL: [SisProvider; 3] = [
        SisProvider::PowerSchool,
        SisProvider::InfiniteCampus,
        SisProvider::Skyward,
    ];

    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SisProvider::PowerSchool => "power_school",
            SisProvider::InfiniteCampus => "infinite_campus",
            SisProvider::Skyward => "skyward",
        }
    }

    /// Prefix used for environment overrides (`ROLLCALL_<PREFIX>_...`).
    #[must_use]
    pub fn env_prefix(&self) -> &'static str {
        match self {
            SisProvider::PowerSchool => "POWERSCHOOL",
            SisProvider::InfiniteCampus => "INFINITE_CAMPUS",
            SisProvider::Skyward => "SKYWARD",
        }
    }
}

impl fmt::Display for SisProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SisProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "power_school" | "powerschool" => Ok(SisProvider::PowerSchool),
            "infinite_campus" | "infinitecampus" => Ok(SisProvider::InfiniteCampus),
            "skyward" => Ok(SisProvider::Skyward),
            _ => Err(format!("Unknown SIS provider: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trip_names() {
        for provider in SisProvider::ALL {
            assert_eq!(provider.as_str().parse::<SisProvider>(), Ok(provider));
        }
        assert_eq!("PowerSchool".parse(), Ok(SisProvider::PowerSchool));
        assert_eq!("infinite-campus".parse(), Ok(SisProvider::InfiniteCampus));
        assert!("blackbaud".parse::<SisProvider>().is_err());
    }

    #[test]
    fn test_provider_serde_uses_snake_case() {
        let json = serde_json::to_string(&SisProvider::InfiniteCampus).unwrap();
        assert_eq!(json, "\"infinite_campus\"");
    }
}
