//! End-to-end packing tests: pack an artifact tree into chunks, reassemble
//! by concatenation, and unpack the result the way the remote host would.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use versa_build::{pack_chunked, DEFAULT_CHUNK_SIZE};

fn build_artifact_tree(root: &Path) {
    std::fs::create_dir_all(root.join("app/src")).unwrap();
    std::fs::create_dir_all(root.join("bin")).unwrap();
    std::fs::write(root.join("manifest.json"), "{\"release_version\":\"x\"}").unwrap();
    std::fs::write(root.join("app/index.php"), "<?php echo 'hello';").unwrap();
    std::fs::write(root.join("app/src/big.bin"), vec![0xAB; 64 * 1024]).unwrap();
    std::fs::write(root.join("bin/app"), b"\x7fELF-fake").unwrap();

    #[cfg(unix)]
    {
        // In-artifact absolute target: must be rewritten relative.
        std::os::unix::fs::symlink(root.join("app/index.php"), root.join("app/alias.php"))
            .unwrap();
        // Out-of-artifact absolute target: must be preserved verbatim.
        std::os::unix::fs::symlink("/etc/hostname", root.join("app/host.link")).unwrap();
    }
}

fn reassemble(chunks: &[PathBuf]) -> Vec<u8> {
    let mut joined = Vec::new();
    for chunk in chunks {
        joined.extend(std::fs::read(chunk).unwrap());
    }
    joined
}

fn unpack(archive: &[u8], dest: &Path) {
    let decoder = GzDecoder::new(archive);
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(dest).unwrap();
}

#[tokio::test]
async fn chunked_pack_reassembles_into_identical_tree() {
    let artifact = tempfile::TempDir::new().unwrap();
    let out = tempfile::TempDir::new().unwrap();
    let unpacked = tempfile::TempDir::new().unwrap();
    build_artifact_tree(artifact.path());

    // Small chunk size to force several chunks.
    let chunks = pack_chunked(
        artifact.path(),
        &out.path().join("20260131-120000.tar.gz"),
        4 * 1024,
    )
    .await
    .unwrap();
    assert!(chunks.len() > 1, "expected multiple chunks");

    // Every chunk except the last is exactly the chunk size.
    for chunk in &chunks[..chunks.len() - 1] {
        assert_eq!(std::fs::metadata(chunk).unwrap().len(), 4 * 1024);
    }

    let archive = reassemble(&chunks);
    unpack(&archive, unpacked.path());

    for rel in ["manifest.json", "app/index.php", "app/src/big.bin", "bin/app"] {
        let original = std::fs::read(artifact.path().join(rel)).unwrap();
        let restored = std::fs::read(unpacked.path().join(rel)).unwrap();
        assert_eq!(original, restored, "content mismatch for {rel}");
    }

    #[cfg(unix)]
    {
        let alias = std::fs::read_link(unpacked.path().join("app/alias.php")).unwrap();
        assert_eq!(alias, PathBuf::from("index.php"), "in-artifact link rewritten relative");

        let host = std::fs::read_link(unpacked.path().join("app/host.link")).unwrap();
        assert_eq!(host, PathBuf::from("/etc/hostname"), "external link preserved absolute");
    }
}

#[cfg(unix)]
#[tokio::test]
async fn unpacked_modes_match_the_wire_contract() {
    use std::os::unix::fs::PermissionsExt;

    let artifact = tempfile::TempDir::new().unwrap();
    let out = tempfile::TempDir::new().unwrap();
    let unpacked = tempfile::TempDir::new().unwrap();
    build_artifact_tree(artifact.path());

    let chunks = pack_chunked(
        artifact.path(),
        &out.path().join("r.tar.gz"),
        DEFAULT_CHUNK_SIZE,
    )
    .await
    .unwrap();
    unpack(&reassemble(&chunks), unpacked.path());

    let file_mode =
        std::fs::metadata(unpacked.path().join("app/index.php")).unwrap().permissions().mode();
    assert_eq!(file_mode & 0o777, 0o664);

    let dir_mode =
        std::fs::metadata(unpacked.path().join("app/src")).unwrap().permissions().mode();
    assert_eq!(dir_mode & 0o777, 0o775);
}

#[tokio::test]
async fn chunk_size_larger_than_archive_yields_exactly_one_chunk() {
    let artifact = tempfile::TempDir::new().unwrap();
    let out = tempfile::TempDir::new().unwrap();
    std::fs::write(artifact.path().join("only.txt"), "tiny").unwrap();

    let chunks = pack_chunked(
        artifact.path(),
        &out.path().join("r.tar.gz"),
        DEFAULT_CHUNK_SIZE,
    )
    .await
    .unwrap();

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].to_string_lossy().ends_with("r.tar.gz.001"));

    let unpacked = tempfile::TempDir::new().unwrap();
    unpack(&reassemble(&chunks), unpacked.path());
    assert_eq!(
        std::fs::read_to_string(unpacked.path().join("only.txt")).unwrap(),
        "tiny"
    );
}
