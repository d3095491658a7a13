//! Release version names.

use chrono::Utc;

/// A release directory name, formatted `YYYYMMDD-HHMMSS` in UTC.
///
/// Lexicographic order equals chronological order; retention and rollback
/// both sort release names as plain strings and rely on this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReleaseVersion(String);

impl ReleaseVersion {
    /// Generate a release version from the current UTC time.
    #[must_use]
    pub fn generate() -> Self {
        Self(Utc::now().format("%Y%m%d-%H%M%S").to_string())
    }

    /// View the version as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
