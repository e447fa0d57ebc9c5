//! Server version detection and version-dependent SQL dialect choices.
//!
//! The server reports a free-form string (`8.0.36-28`, `8.4.3-build`,
//! `5.7.44-log`). Only the leading `major[.minor[.patch]]` is meaningful.
//! Ordering between versions is lexicographic on `(major, minor)`; patch
//! releases never change which dialect is chosen.

use std::cmp::Ordering;
use std::fmt;

/// Version assumed when the server string cannot be parsed.
pub const LEGACY_VERSION: ServerVersion = ServerVersion {
    major: 5,
    minor: 7,
    patch: 0,
};

/// Minimum major version with the instrumentation tables this agent queries.
pub const MIN_SUPPORTED_MAJOR: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// No leading digits were found in the version string.
    Unparseable(String),
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionError::Unparseable(raw) => write!(f, "unparseable server version: {:?}", raw),
        }
    }
}

impl std::error::Error for VersionError {}

/// Normalized `major.minor.patch` server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses the longest prefix matching `\d+(\.\d+)?(\.\d+)?`.
    ///
    /// Absent components default to `0`. Leading whitespace is ignored.
    /// A component that does not fit in `u32` is unparseable.
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let mut parts = [0u32; 3];
        let mut rest = raw.trim_start();

        for (idx, slot) in parts.iter_mut().enumerate() {
            if idx > 0 {
                // A component only counts when a dot is followed by a digit.
                match rest.strip_prefix('.') {
                    Some(after) if after.starts_with(|c: char| c.is_ascii_digit()) => {
                        rest = after;
                    }
                    _ => break,
                }
            }

            let digits = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            if digits == 0 {
                return Err(VersionError::Unparseable(raw.to_string()));
            }

            *slot = rest[..digits]
                .parse::<u32>()
                .map_err(|_| VersionError::Unparseable(raw.to_string()))?;
            rest = &rest[digits..];
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }

    /// Parses `raw`, substituting [`LEGACY_VERSION`] on failure.
    ///
    /// Collection continues with the conservative dialect rather than aborting.
    pub fn parse_or_legacy(raw: &str) -> Self {
        match Self::parse(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, fallback = %LEGACY_VERSION, "falling back to legacy server version");
                LEGACY_VERSION
            }
        }
    }

    pub fn is_supported(&self) -> bool {
        self.major >= MIN_SUPPORTED_MAJOR
    }

    /// Compares `(major, minor)` only; patch releases never change the dialect.
    pub fn cmp_release(&self, other: &ServerVersion) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }

    /// True when `self` is at least `major.minor`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        self.cmp_release(&ServerVersion::new(major, minor, 0)) != Ordering::Less
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Source of lock-wait pairs for the blocking-session query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWaitSource {
    /// `performance_schema.data_lock_waits` (8.0+).
    DataLockWaits,
    /// `information_schema.innodb_lock_waits` (5.7 and earlier).
    InnodbLockWaits,
}

/// Version-dependent dialect choices, derived from the version alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    version: ServerVersion,
}

impl Dialect {
    pub fn for_version(version: ServerVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> ServerVersion {
        self.version
    }

    /// Replica status statement. Part of the version contract; no collector
    /// in this crate reads replica state.
    pub fn replica_status_query(&self) -> &'static str {
        if self.version.at_least(8, 1) {
            "SHOW REPLICA STATUS"
        } else {
            "SHOW SLAVE STATUS"
        }
    }

    /// Field prefixes for (replica-side, source-side) columns of the replica status row.
    /// Part of the version contract only.
    pub fn replica_field_prefixes(&self) -> (&'static str, &'static str) {
        if self.version.at_least(8, 1) {
            ("Replica_", "Source_")
        } else {
            ("Slave_", "Master_")
        }
    }

    /// The query cache was removed in 8.0. Part of the version contract only.
    pub fn query_cache_available(&self) -> bool {
        self.version.major < 8
    }

    /// Whether statement digests expose `SUM_CPU_TIME`.
    ///
    /// The column arrived in an 8.0 patch release; since dialect choice ignores
    /// patch numbers, 8.0 servers select CPU time as NULL.
    pub fn cpu_time_available(&self) -> bool {
        self.version.at_least(8, 1)
    }

    pub fn lock_wait_source(&self) -> LockWaitSource {
        if self.version.at_least(8, 0) {
            LockWaitSource::DataLockWaits
        } else {
            LockWaitSource::InnodbLockWaits
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_suffix() {
        assert_eq!(ServerVersion::parse("8.4.3-build"), Ok(ServerVersion::new(8, 4, 3)));
        assert_eq!(
            ServerVersion::parse("8.0.36-28.1"),
            Ok(ServerVersion::new(8, 0, 36))
        );
    }

    #[test]
    fn missing_components_default_to_zero() {
        assert_eq!(ServerVersion::parse("8"), Ok(ServerVersion::new(8, 0, 0)));
        assert_eq!(ServerVersion::parse("8.1"), Ok(ServerVersion::new(8, 1, 0)));
        assert_eq!(ServerVersion::parse("8.1-rc"), Ok(ServerVersion::new(8, 1, 0)));
        assert_eq!(ServerVersion::parse("8."), Ok(ServerVersion::new(8, 0, 0)));
    }

    #[test]
    fn empty_or_non_numeric_fails() {
        assert!(ServerVersion::parse("").is_err());
        assert!(ServerVersion::parse("MariaDB").is_err());
        assert!(ServerVersion::parse("v8.0.1").is_err());
    }

    #[test]
    fn overflowing_component_fails() {
        assert_eq!(
            ServerVersion::parse("8.99999999999.1"),
            Err(VersionError::Unparseable("8.99999999999.1".to_string()))
        );
        assert_eq!(
            ServerVersion::parse_or_legacy("99999999999"),
            LEGACY_VERSION
        );
    }

    #[test]
    fn fallback_is_legacy() {
        assert_eq!(ServerVersion::parse_or_legacy(""), ServerVersion::new(5, 7, 0));
        assert_eq!(
            ServerVersion::parse_or_legacy("unknown"),
            ServerVersion::new(5, 7, 0)
        );
        assert_eq!(
            ServerVersion::parse_or_legacy("8.0.1"),
            ServerVersion::new(8, 0, 1)
        );
    }

    #[test]
    fn ordering_ignores_patch() {
        let a = ServerVersion::new(8, 0, 1);
        let b = ServerVersion::new(8, 0, 40);
        assert_eq!(a.cmp_release(&b), Ordering::Equal);
        assert_eq!(ServerVersion::new(8, 1, 0).cmp_release(&b), Ordering::Greater);
        assert_eq!(ServerVersion::new(5, 7, 44).cmp_release(&a), Ordering::Less);
        assert!(a.at_least(8, 0));
        assert!(!a.at_least(8, 1));
    }

    #[test]
    fn support_requires_major_eight() {
        assert!(!ServerVersion::new(5, 7, 31).is_supported());
        assert!(ServerVersion::new(8, 0, 0).is_supported());
        assert!(ServerVersion::new(9, 1, 0).is_supported());
    }

    #[test]
    fn dialect_branches_on_minor() {
        let old = Dialect::for_version(ServerVersion::new(8, 0, 36));
        let new = Dialect::for_version(ServerVersion::new(8, 4, 0));
        let legacy = Dialect::for_version(LEGACY_VERSION);

        assert_eq!(old.replica_status_query(), "SHOW SLAVE STATUS");
        assert_eq!(new.replica_status_query(), "SHOW REPLICA STATUS");
        assert_eq!(old.replica_field_prefixes(), ("Slave_", "Master_"));
        assert_eq!(new.replica_field_prefixes(), ("Replica_", "Source_"));

        assert!(!old.cpu_time_available());
        assert!(new.cpu_time_available());

        assert!(legacy.query_cache_available());
        assert!(!old.query_cache_available());

        assert_eq!(legacy.lock_wait_source(), LockWaitSource::InnodbLockWaits);
        assert_eq!(old.lock_wait_source(), LockWaitSource::DataLockWaits);
    }
}
