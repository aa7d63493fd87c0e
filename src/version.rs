use crate::weak_error;
use itertools::Itertools;
use once_cell::sync;
use regex::Regex;
use std::fmt::{Display, Formatter};

/// GemStone/S VM version.
#[derive(Debug, PartialEq, PartialOrd, Clone, Copy)]
pub struct Version(pub (u32, u32, u32));

impl Version {
    /// Parse a VM version from strings like:
    /// "3.7.1 build 64bit-20231208 (gs64-3.7.1)" or "GemStone/S 64 Bit 3.6.5 ...".
    pub fn parse(s: &str) -> Option<Self> {
        static V_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
            Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("must compile")
        });

        let caps = V_RE.captures(s)?;
        let major = weak_error!(caps[1].parse::<u32>())?;
        let minor = weak_error!(caps[2].parse::<u32>())?;
        let patch = match caps.get(3) {
            Some(p) => weak_error!(p.as_str().parse::<u32>())?,
            None => 0,
        };
        Some(Version((major, minor, patch)))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let (major, minor, patch) = self.0;
        write!(f, "{major}.{minor}.{patch}")
    }
}

impl Default for Version {
    fn default() -> Self {
        // the first supported version is default
        Version((3, 5, 0))
    }
}

/// Supported VM version diapasons.
static SUPPORTED_VM: &[(Version, Version)] = &[
    (Version((3, 5, 0)), Version((3, 5, u32::MAX))),
    (Version((3, 6, 0)), Version((3, 6, u32::MAX))),
    (Version((3, 7, 0)), Version((3, 7, u32::MAX))),
];

pub fn supported_versions_to_string() -> String {
    format!(
        "[{}]",
        SUPPORTED_VM
            .iter()
            .map(|(v, _)| format!("{}.{}.x", v.0 .0, v.0 .1))
            .join(", ")
    )
}

/// Check a VM version, return true if a version supported, false otherwise.
pub fn probe(version: &Version) -> bool {
    SUPPORTED_VM
        .iter()
        .any(|(v_min, v_max)| version >= v_min && version <= v_max)
}
