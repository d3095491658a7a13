//! Chunk-splitting output writer.
//!
//! The packer streams one continuous gzipped tar through this writer, which
//! closes the current output file at exactly the chunk size and opens the
//! next one. Concatenating the chunks byte for byte reproduces the archive;
//! the remote side reassembles with `cat` before extracting.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

/// Default chunk size: 10 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Splits a byte stream into `<base>.001`, `<base>.002`, … files.
pub struct ChunkWriter {
    base: PathBuf,
    chunk_size: u64,
    current: Option<File>,
    current_len: u64,
    index: u32,
    chunks: Vec<PathBuf>,
}

impl ChunkWriter {
    /// Create a writer producing chunks next to `base`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>, chunk_size: u64) -> Self {
        Self {
            base: base.into(),
            chunk_size: chunk_size.max(1),
            current: None,
            current_len: 0,
            index: 0,
            chunks: Vec::new(),
        }
    }

    /// Close the current chunk and return the ordered chunk paths.
    pub fn finish(mut self) -> io::Result<Vec<PathBuf>> {
        if let Some(file) = self.current.take() {
            file.sync_all()?;
        }
        Ok(self.chunks)
    }

    fn roll_over(&mut self) -> io::Result<()> {
        if let Some(file) = self.current.take() {
            file.sync_all()?;
        }
        self.index += 1;
        let path = PathBuf::from(format!("{}.{:03}", self.base.display(), self.index));
        self.current = Some(File::create(&path)?);
        self.current_len = 0;
        self.chunks.push(path);
        Ok(())
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_none() || self.current_len >= self.chunk_size {
            self.roll_over()?;
        }

        let room = usize::try_from(self.chunk_size - self.current_len)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        let file = self
            .current
            .as_mut()
            .expect("roll_over always installs a file");
        file.write_all(&buf[..room])?;
        self.current_len += room as u64;
        Ok(room)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_all_chunks(dir: &std::path::Path, data: &[u8], chunk_size: u64) -> Vec<PathBuf> {
        let base = dir.join("archive.tar.gz");
        let mut writer = ChunkWriter::new(&base, chunk_size);
        writer.write_all(data).unwrap();
        writer.flush().unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn splits_at_exact_boundaries() {
        let dir = tempfile::TempDir::new().unwrap();
        let data: Vec<u8> = (0..25u8).collect();
        let chunks = write_all_chunks(dir.path(), &data, 10);

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].to_string_lossy().ends_with("archive.tar.gz.001"));
        assert!(chunks[2].to_string_lossy().ends_with("archive.tar.gz.003"));
        assert_eq!(std::fs::metadata(&chunks[0]).unwrap().len(), 10);
        assert_eq!(std::fs::metadata(&chunks[1]).unwrap().len(), 10);
        assert_eq!(std::fs::metadata(&chunks[2]).unwrap().len(), 5);
    }

    #[test]
    fn concatenation_reproduces_input() {
        let dir = tempfile::TempDir::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(3_333).collect();
        let chunks = write_all_chunks(dir.path(), &data, 512);

        let mut reassembled = Vec::new();
        for chunk in &chunks {
            reassembled.extend(std::fs::read(chunk).unwrap());
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn oversized_chunk_yields_single_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = vec![7u8; 100];
        let chunks = write_all_chunks(dir.path(), &data, 1_000_000);

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].to_string_lossy().ends_with(".001"));
        assert_eq!(std::fs::read(&chunks[0]).unwrap(), data);
    }
}
