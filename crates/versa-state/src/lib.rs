//! deploy.lock state store.
//!
//! `deploy.lock` lives at the root of the remote layout and is the
//! authoritative record of what was deployed last: the commit, the release
//! directory and a content hash for every non-skipped file of the previous
//! snapshot. The change detector diffs the next snapshot against it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use versa_core::{DeployError, DeployResult};

/// Schema version this engine reads and writes.
pub const LOCK_FILE_VERSION: &str = "1.0";

/// The persisted deploy.lock structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployLock {
    /// Schema version string.
    pub version: String,

    /// Record of the last successful deployment.
    pub last_deploy: LastDeploy,
}

/// Fingerprint of the last successful deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastDeploy {
    /// When the deployment finished, UTC.
    pub timestamp: DateTime<Utc>,

    /// Full commit identifier of the deployed snapshot.
    pub commit_hash: String,

    /// Release directory name under releases/.
    pub release_dir: String,

    /// Relative POSIX path -> `sha256:<hex>` for every non-skipped file.
    pub file_hashes: BTreeMap<String, String>,

    /// Hash of the PHP dependency manifest (composer.json), if present.
    #[serde(default)]
    pub composer_hash: String,

    /// Hash of the JS package manifest (package.json), if present.
    #[serde(default)]
    pub package_json_hash: String,

    /// Hash of the Go module file (go.mod), if present.
    #[serde(default)]
    pub go_mod_hash: String,
}

impl DeployLock {
    /// Build a lock describing a deployment that just finished.
    #[must_use]
    pub fn new(
        commit_hash: impl Into<String>,
        release_dir: impl Into<String>,
        file_hashes: BTreeMap<String, String>,
        composer_hash: impl Into<String>,
        package_json_hash: impl Into<String>,
        go_mod_hash: impl Into<String>,
    ) -> Self {
        Self {
            version: LOCK_FILE_VERSION.to_owned(),
            last_deploy: LastDeploy {
                timestamp: Utc::now(),
                commit_hash: commit_hash.into(),
                release_dir: release_dir.into(),
                file_hashes,
                composer_hash: composer_hash.into(),
                package_json_hash: package_json_hash.into(),
                go_mod_hash: go_mod_hash.into(),
            },
        }
    }

    /// The recorded hash for a path, when one exists.
    #[must_use]
    pub fn file_hash(&self, path: &str) -> Option<&str> {
        self.last_deploy.file_hashes.get(path).map(String::as_str)
    }
}

/// Parse deploy.lock bytes.
///
/// Distinguishes an empty file, malformed JSON and an unsupported schema
/// version; callers surface all three as `STATE_INVALID`.
pub fn parse(data: &[u8]) -> DeployResult<DeployLock> {
    if data.is_empty() {
        return Err(DeployError::StateEmpty);
    }

    let lock: DeployLock =
        serde_json::from_slice(data).map_err(|e| DeployError::StateMalformed(e.to_string()))?;

    if lock.version != LOCK_FILE_VERSION {
        return Err(DeployError::StateUnsupportedVersion {
            found: lock.version,
            expected: LOCK_FILE_VERSION.to_owned(),
        });
    }

    Ok(lock)
}

/// Serialize a lock to indented UTF-8 JSON.
pub fn serialize(lock: &DeployLock) -> DeployResult<Vec<u8>> {
    serde_json::to_vec_pretty(lock)
        .map_err(|e| DeployError::Internal(format!("failed to serialize deploy.lock: {e}")))
}

/// True when no previous deploy exists: no lock at all, or an empty hash map.
#[must_use]
pub fn is_first(lock: Option<&DeployLock>) -> bool {
    lock.is_none_or(|l| l.last_deploy.file_hashes.is_empty())
}

/// Sort release names newest first.
///
/// Plain string comparison is a total order here because release names are
/// `YYYYMMDD-HHMMSS` timestamps; seconds resolution plus the deployment lock
/// make ties impossible.
pub fn release_sort(releases: &mut [String]) {
    releases.sort_unstable_by(|a, b| b.cmp(a));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lock() -> DeployLock {
        let mut hashes = BTreeMap::new();
        hashes.insert("index.php".to_owned(), "sha256:aa11".to_owned());
        hashes.insert("composer.json".to_owned(), "sha256:bb22".to_owned());
        DeployLock::new(
            "0123456789abcdef0123456789abcdef01234567",
            "20260131-120000",
            hashes,
            "sha256:bb22",
            "",
            "",
        )
    }

    #[test]
    fn round_trips_through_json() {
        let lock = sample_lock();
        let bytes = serialize(&lock).unwrap();
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, lock);
    }

    #[test]
    fn serialized_form_is_indented_utf8_with_utc_timestamp() {
        let lock = sample_lock();
        let text = String::from_utf8(serialize(&lock).unwrap()).unwrap();
        assert!(text.contains("\n  \"last_deploy\""));
        assert!(text.contains('Z'), "timestamp must carry a Z suffix: {text}");
    }

    #[test]
    fn empty_input_is_its_own_error() {
        assert!(matches!(parse(b"").unwrap_err(), DeployError::StateEmpty));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            parse(b"{ nope").unwrap_err(),
            DeployError::StateMalformed(_)
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut lock = sample_lock();
        lock.version = "2.0".to_owned();
        let bytes = serde_json::to_vec(&lock).unwrap();
        match parse(&bytes).unwrap_err() {
            DeployError::StateUnsupportedVersion { found, expected } => {
                assert_eq!(found, "2.0");
                assert_eq!(expected, LOCK_FILE_VERSION);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn first_deploy_predicate() {
        assert!(is_first(None));

        let empty = DeployLock::new("c", "r", BTreeMap::new(), "", "", "");
        assert!(is_first(Some(&empty)));

        assert!(!is_first(Some(&sample_lock())));
    }

    #[test]
    fn release_sort_is_descending_and_chronological() {
        let mut releases = vec![
            "20260130-100000".to_owned(),
            "20260201-000001".to_owned(),
            "20251231-235959".to_owned(),
            "20260131-120000".to_owned(),
        ];
        release_sort(&mut releases);
        assert_eq!(
            releases,
            vec![
                "20260201-000001",
                "20260131-120000",
                "20260130-100000",
                "20251231-235959",
            ]
        );
    }

    #[test]
    fn file_hash_lookup() {
        let lock = sample_lock();
        assert_eq!(lock.file_hash("index.php"), Some("sha256:aa11"));
        assert_eq!(lock.file_hash("missing.php"), None);
    }
}
