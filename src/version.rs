//! Dotted version identifiers as reported by the maintenance tool.
//!
//! Tools report versions of varying depth ("0.9", "2.3.1", "1.4.0-beta.2"),
//! so this is a list of numeric segments rather than a fixed
//! major/minor/patch triple. Comparison zero-extends the shorter side:
//! "1.0" and "1.0.0" are equal.

use std::cmp::Ordering;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A comparable dotted version with an optional prerelease suffix.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    segments: Vec<u64>,
    prerelease: Option<String>,
}

impl Version {
    /// Parse "1.2.3", "v0.9" or "1.0.0-beta.1". Returns `None` for anything
    /// that is not a dotted run of base-10 numbers.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix('v').unwrap_or(s);
        let (version_part, prerelease) = match s.split_once('-') {
            Some((_, "")) => return None,
            Some((head, tail)) => (head, Some(tail.to_string())),
            None => (s, None),
        };

        if version_part.is_empty() {
            return None;
        }
        let segments = version_part
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<u64>>>()?;

        Some(Self { segments, prerelease })
    }

    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .segments
            .iter()
            .map(|seg| seg.to_string())
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{}", joined)?;
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        // A prerelease ranks below its release.
        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equality must agree with the zero-extending order, so it cannot be derived.
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid version string '{}'", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let v = Version::parse("2.3.1").unwrap();
        assert_eq!(v.segments(), &[2, 3, 1]);
        assert!(v.prerelease.is_none());
    }

    #[test]
    fn parse_short_and_single_segment() {
        assert_eq!(Version::parse("0.9").unwrap().segments(), &[0, 9]);
        assert_eq!(Version::parse("7").unwrap().segments(), &[7]);
    }

    #[test]
    fn parse_with_v_prefix() {
        let v = Version::parse("v1.2").unwrap();
        assert_eq!(v.segments(), &[1, 2]);
    }

    #[test]
    fn parse_prerelease() {
        let v = Version::parse("1.0.0-beta.1").unwrap();
        assert!(v.is_prerelease());
        assert_eq!(v.to_string(), "1.0.0-beta.1");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Version::parse("").is_none());
        assert!(Version::parse("abc").is_none());
        assert!(Version::parse("1.x.3").is_none());
        assert!(Version::parse("1..2").is_none());
        assert!(Version::parse("1.0-").is_none());
    }

    #[test]
    fn ordering_zero_extends() {
        let short = Version::parse("1.0").unwrap();
        let long = Version::parse("1.0.0").unwrap();
        assert_eq!(short, long);
        assert!(Version::parse("1.0.1").unwrap().is_newer_than(&short));
    }

    #[test]
    fn compare_versions() {
        let v1 = Version::parse("1.9.9").unwrap();
        let v2 = Version::parse("1.10.0").unwrap();
        assert!(v2.is_newer_than(&v1));
        assert!(Version::parse("2.0").unwrap().is_newer_than(&v2));
    }

    #[test]
    fn prerelease_less_than_release() {
        let pre = Version::parse("1.0.0-rc.1").unwrap();
        let rel = Version::parse("1.0.0").unwrap();
        assert!(rel.is_newer_than(&pre));
    }

    #[test]
    fn serde_round_trips_as_string() {
        let v = Version::parse("2.3.1").unwrap();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"2.3.1\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
