//! Local pipeline of the versa deployment engine.
//!
//! Everything that happens on the developer workstation before bytes leave
//! for the remote host lives here:
//!
//! - [`source`] snapshots the committed tree into a temporary directory
//! - [`changeset`] hashes the snapshot and diffs it against the last deploy
//! - [`engine`] mirrors the snapshot and runs the build engines on it
//! - [`artifact`] writes the manifest and packs the chunked tar.gz stream

pub mod artifact;
pub mod changeset;
pub mod engine;
pub mod source;

pub use artifact::{
    directory_size, pack_chunked, write_manifest, ChangesApplied, ChunkWriter, Manifest,
    DEFAULT_CHUNK_SIZE,
};
pub use changeset::{ChangeSet, Detector};
pub use engine::{BuildReport, Orchestrator};
pub use source::Snapshot;
