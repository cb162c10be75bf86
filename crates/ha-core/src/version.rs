//! Calendar version reported by the hub

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for unparseable versions
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("version must have two or three '.' separated parts")]
    InvalidFormat,

    #[error("invalid year '{0}'")]
    InvalidYear(String),

    #[error("invalid month '{0}'")]
    InvalidMonth(String),

    #[error("invalid patch segment '{0}'")]
    InvalidPatch(String),
}

/// Home Assistant calendar version (e.g., "2024.3.0", "2021.12.0b3")
///
/// Versions order by year, month and patch; a version with a modifier
/// (`dev`, `b3`, `rc1`) is a pre-release and sorts before the release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CalVer {
    pub year: u16,
    pub month: u8,
    pub patch: u16,
    /// Pre-release tag, empty for releases
    pub modifier: String,
}

impl CalVer {
    pub fn new(year: u16, month: u8, patch: u16) -> Self {
        Self {
            year,
            month,
            patch,
            modifier: String::new(),
        }
    }

    pub fn is_prerelease(&self) -> bool {
        !self.modifier.is_empty()
    }

    /// First day of the release month
    pub fn release_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(i32::from(self.year), u32::from(self.month), 1)
    }
}

impl FromStr for CalVer {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let (Some(year), Some(month)) = (parts.next(), parts.next()) else {
            return Err(VersionParseError::InvalidFormat);
        };
        let year = year
            .parse()
            .map_err(|_| VersionParseError::InvalidYear(year.to_string()))?;
        let month = month
            .parse()
            .map_err(|_| VersionParseError::InvalidMonth(month.to_string()))?;

        let (patch, modifier) = match parts.next() {
            None => (0, String::new()),
            Some(rest) => {
                let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
                let (patch, modifier) = rest.split_at(digits);
                let modifier_ok = modifier
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.');
                if rest.is_empty() || !modifier_ok {
                    return Err(VersionParseError::InvalidPatch(rest.to_string()));
                }
                let patch = if patch.is_empty() {
                    0
                } else {
                    patch
                        .parse()
                        .map_err(|_| VersionParseError::InvalidPatch(rest.to_string()))?
                };
                (patch, modifier.to_string())
            }
        };

        Ok(Self {
            year,
            month,
            patch,
            modifier,
        })
    }
}

impl TryFrom<String> for CalVer {
    type Error = VersionParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CalVer> for String {
    fn from(version: CalVer) -> Self {
        version.to_string()
    }
}

impl fmt::Display for CalVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}{}", self.year, self.month, self.patch, self.modifier)
    }
}

impl Ord for CalVer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.year, self.month, self.patch)
            .cmp(&(other.year, other.month, other.patch))
            .then_with(|| match (self.is_prerelease(), other.is_prerelease()) {
                (false, false) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (true, true) => self.modifier.cmp(&other.modifier),
            })
    }
}

impl PartialOrd for CalVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
