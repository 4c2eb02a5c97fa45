use std::fmt;
use std::str::FromStr;

use crate::WireError;

/// Response header of the websocket upgrade carrying the engine version.
pub const ENGINE_VERSION_HEADER: &str = "engine-version";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for EngineVersion {
    type Err = WireError;

    /// Accepts `major.minor.patch`, ignoring a leading `v` and any
    /// pre-release or build suffix.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let core = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = core.split(['-', '+']).next().unwrap_or(core);
        let mut parts = core.split('.').map(str::parse::<u32>);
        let invalid = || WireError::InvalidVersion(raw.to_string());
        let major = parts.next().ok_or_else(invalid)?.map_err(|_| invalid())?;
        let minor = parts.next().ok_or_else(invalid)?.map_err(|_| invalid())?;
        let patch = match parts.next() {
            Some(part) => part.map_err(|_| invalid())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Accepted engine versions: `min` inclusive, `max` exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionRange {
    pub min: EngineVersion,
    pub max: EngineVersion,
}

impl VersionRange {
    pub const fn new(min: EngineVersion, max: EngineVersion) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, version: EngineVersion) -> bool {
        version >= self.min && version < self.max
    }

    pub fn check(&self, raw: &str) -> Result<EngineVersion, WireError> {
        let actual: EngineVersion = raw.parse()?;
        if !self.contains(actual) {
            return Err(WireError::VersionMismatch {
                actual,
                required: *self,
            });
        }
        Ok(actual)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ">={}, <{}", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE: VersionRange =
        VersionRange::new(EngineVersion::new(0, 61, 0), EngineVersion::new(1, 0, 0));

    #[test]
    fn parses_with_prefix_and_suffix() {
        assert_eq!(
            "v0.62.1-rc1".parse::<EngineVersion>().unwrap(),
            EngineVersion::new(0, 62, 1)
        );
        assert_eq!(
            "0.62".parse::<EngineVersion>().unwrap(),
            EngineVersion::new(0, 62, 0)
        );
        assert!("zero".parse::<EngineVersion>().is_err());
        assert!("1.2.3.4".parse::<EngineVersion>().is_err());
    }

    #[test]
    fn range_is_half_open() {
        assert!(RANGE.check("0.61.0").is_ok());
        assert!(RANGE.check("0.99.9").is_ok());
        assert!(matches!(
            RANGE.check("1.0.0"),
            Err(WireError::VersionMismatch { .. })
        ));
        assert!(matches!(
            RANGE.check("0.60.9"),
            Err(WireError::VersionMismatch { .. })
        ));
    }
}
