//! Match stream: precomputed (lens, source, separation) triples grouped by lens.
//!
//! On-disk format, little-endian:
//! - 8-byte magic `SSMATCH1`
//! - `u64` total match count
//! - `count` records of `(lens_index: u64, source_index: u64, separation: f64)`
//!
//! Records of one lens are contiguous. The header alone answers
//! [`MatchSource::total_matches`]; records are read through a memory map.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use memmap2::Mmap;

use crate::error::{StackError, StackResult};

pub const MATCH_MAGIC: &[u8; 8] = b"SSMATCH1";
const HEADER_LEN: usize = 16;
const RECORD_LEN: usize = std::mem::size_of::<MatchRecord>();

#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct MatchRecord {
    pub lens_index: u64,
    pub source_index: u64,
    /// Degrees.
    pub separation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPair {
    pub source_index: usize,
    pub separation: f64,
}

/// All matches of one lens, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchGroup {
    pub lens_index: usize,
    pub pairs: Vec<MatchPair>,
}

pub type GroupIter<'a> = Box<dyn Iterator<Item = StackResult<MatchGroup>> + 'a>;

/// Ordered source of match groups with a match count known up front.
pub trait MatchSource {
    fn total_matches(&self) -> u64;

    /// Iterate every group from the start of the stream.
    fn groups(&mut self) -> StackResult<GroupIter<'_>>;
}

/// A match file on disk.
#[derive(Debug)]
pub struct MatchFile {
    path: PathBuf,
    total_matches: u64,
    /// File length implied by the header.
    byte_len: usize,
    mmap: Option<Mmap>,
}

fn read_header(path: &Path, file: &mut File) -> StackResult<u64> {
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|e| StackError::source_unavailable(path, format!("cannot read header: {}", e)))?;
    if &header[..8] != MATCH_MAGIC {
        return Err(StackError::source_unavailable(path, "not a match file (bad magic)"));
    }
    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..]);
    Ok(u64::from_le_bytes(count))
}

/// Header plus `total_matches` records, if that fits in memory at all.
fn file_len_for(total_matches: u64) -> Option<usize> {
    usize::try_from(total_matches)
        .ok()?
        .checked_mul(RECORD_LEN)?
        .checked_add(HEADER_LEN)
}

impl MatchFile {
    /// Open a match file and check its header against its length.
    pub fn open(path: &Path) -> StackResult<Self> {
        let mut file = File::open(path).map_err(|e| StackError::source_unavailable(path, e.to_string()))?;
        let total_matches = read_header(path, &mut file)?;

        let len = file
            .metadata()
            .map_err(|e| StackError::source_unavailable(path, e.to_string()))?
            .len();
        let byte_len = file_len_for(total_matches).ok_or_else(|| {
            StackError::source_unavailable(
                path,
                format!("header declares an impossible match count {}", total_matches),
            )
        })?;
        if len != byte_len as u64 {
            return Err(StackError::source_unavailable(
                path,
                format!(
                    "header declares {} matches ({} bytes) but file has {} bytes",
                    total_matches, byte_len, len
                ),
            ));
        }

        tracing::info!(path = %path.display(), total_matches, "Opened match file");
        Ok(Self {
            path: path.to_path_buf(),
            total_matches,
            byte_len,
            mmap: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn records(&mut self) -> StackResult<&[MatchRecord]> {
        if self.total_matches == 0 {
            return Ok(&[]);
        }
        let mmap = match self.mmap.take() {
            Some(mmap) => mmap,
            None => {
                let file = File::open(&self.path)
                    .map_err(|e| StackError::source_unavailable(&self.path, e.to_string()))?;
                // SAFETY: the file is treated as read-only for the lifetime of the map.
                unsafe { Mmap::map(&file) }
                    .map_err(|e| StackError::source_unavailable(&self.path, e.to_string()))?
            }
        };
        let mmap = self.mmap.insert(mmap);

        let bytes = mmap
            .get(HEADER_LEN..self.byte_len)
            .ok_or_else(|| StackError::source_unavailable(&self.path, "file shrank after open"))?;
        bytemuck::try_cast_slice(bytes)
            .map_err(|e| StackError::source_unavailable(&self.path, format!("{:?}", e)))
    }
}

impl MatchSource for MatchFile {
    fn total_matches(&self) -> u64 {
        self.total_matches
    }

    fn groups(&mut self) -> StackResult<GroupIter<'_>> {
        let records = self.records()?;
        Ok(Box::new(RecordGroups { records, pos: 0 }))
    }
}

/// Splits a record slice into runs of equal `lens_index`.
struct RecordGroups<'a> {
    records: &'a [MatchRecord],
    pos: usize,
}

impl Iterator for RecordGroups<'_> {
    type Item = StackResult<MatchGroup>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.records[self.pos..];
        let lens = rest.first()?.lens_index;
        let run = rest.iter().take_while(|r| r.lens_index == lens).count();
        self.pos += run;

        Some(Ok(MatchGroup {
            lens_index: lens as usize,
            pairs: rest[..run]
                .iter()
                .map(|r| MatchPair {
                    source_index: r.source_index as usize,
                    separation: r.separation,
                })
                .collect(),
        }))
    }
}

/// Writes or extends a match file. The header count is fixed by [`finish`](Self::finish).
pub struct MatchFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    count: u64,
}

impl MatchFileWriter {
    pub fn create(path: &Path) -> StackResult<Self> {
        let write_err = |source| StackError::WriteArray {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MATCH_MAGIC).map_err(write_err)?;
        writer.write_all(&0u64.to_le_bytes()).map_err(write_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            count: 0,
        })
    }

    /// Continue an existing file after its last record.
    pub fn append(path: &Path) -> StackResult<Self> {
        let existing = MatchFile::open(path)?;
        let write_err = |source| StackError::WriteArray {
            path: path.to_path_buf(),
            source,
        };
        let mut file = OpenOptions::new().write(true).open(path).map_err(write_err)?;
        file.seek(SeekFrom::End(0)).map_err(write_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            count: existing.total_matches,
        })
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn write_record(&mut self, record: &MatchRecord) -> StackResult<()> {
        self.writer
            .write_all(bytemuck::bytes_of(record))
            .map_err(|source| StackError::WriteArray {
                path: self.path.clone(),
                source,
            })?;
        self.count += 1;
        Ok(())
    }

    pub fn write_group(&mut self, lens_index: usize, pairs: &[MatchPair]) -> StackResult<()> {
        for pair in pairs {
            self.write_record(&MatchRecord {
                lens_index: lens_index as u64,
                source_index: pair.source_index as u64,
                separation: pair.separation,
            })?;
        }
        Ok(())
    }

    /// Rewrite the header count and sync. Returns the total record count.
    pub fn finish(mut self) -> StackResult<u64> {
        let path = self.path.clone();
        let write_err = |source| StackError::WriteArray {
            path: path.clone(),
            source,
        };
        self.writer.seek(SeekFrom::Start(8)).map_err(write_err)?;
        self.writer
            .write_all(&self.count.to_le_bytes())
            .map_err(write_err)?;
        self.writer.flush().map_err(write_err)?;
        self.writer.get_ref().sync_all().map_err(write_err)?;
        Ok(self.count)
    }
}

/// In-memory match stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VecMatchSource {
    groups: Vec<MatchGroup>,
}

impl VecMatchSource {
    pub fn new(groups: Vec<MatchGroup>) -> Self {
        Self { groups }
    }
}

impl MatchSource for VecMatchSource {
    fn total_matches(&self) -> u64 {
        self.groups.iter().map(|g| g.pairs.len() as u64).sum()
    }

    fn groups(&mut self) -> StackResult<GroupIter<'_>> {
        Ok(Box::new(self.groups.iter().cloned().map(Ok::<_, StackError>)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::test_output_dir;

    fn pair(source_index: usize, separation: f64) -> MatchPair {
        MatchPair {
            source_index,
            separation,
        }
    }

    fn write_sample(path: &Path) {
        let mut writer = MatchFileWriter::create(path).unwrap();
        writer.write_group(0, &[pair(4, 0.1), pair(7, 0.2)]).unwrap();
        writer.write_group(2, &[pair(1, 0.3)]).unwrap();
        assert_eq!(writer.finish().unwrap(), 3);
    }

    #[test]
    fn test_record_layout() {
        assert_eq!(RECORD_LEN, 24);
    }

    #[test]
    fn test_write_then_iterate_groups() {
        let dir = test_output_dir("matches_roundtrip");
        let path = dir.join("matches_r.bin");
        write_sample(&path);

        let mut file = MatchFile::open(&path).unwrap();
        assert_eq!(file.total_matches(), 3);
        let groups: Vec<MatchGroup> = file.groups().unwrap().map(Result::unwrap).collect();
        assert_eq!(
            groups,
            vec![
                MatchGroup {
                    lens_index: 0,
                    pairs: vec![pair(4, 0.1), pair(7, 0.2)],
                },
                MatchGroup {
                    lens_index: 2,
                    pairs: vec![pair(1, 0.3)],
                },
            ]
        );

        // A second pass starts over.
        assert_eq!(file.groups().unwrap().count(), 2);
    }

    #[test]
    fn test_append_extends_count() {
        let dir = test_output_dir("matches_append");
        let path = dir.join("matches_r.bin");
        write_sample(&path);

        let mut writer = MatchFileWriter::append(&path).unwrap();
        writer.write_group(3, &[pair(0, 0.5)]).unwrap();
        assert_eq!(writer.finish().unwrap(), 4);

        let mut file = MatchFile::open(&path).unwrap();
        assert_eq!(file.total_matches(), 4);
        let last = file.groups().unwrap().last().unwrap().unwrap();
        assert_eq!(last.lens_index, 3);
    }

    #[test]
    fn test_missing_or_corrupt_file_is_unavailable() {
        let dir = test_output_dir("matches_corrupt");

        let err = MatchFile::open(&dir.join("absent.bin")).unwrap_err();
        assert!(matches!(err, StackError::SourceUnavailable { .. }));

        let bad_magic = dir.join("bad_magic.bin");
        std::fs::write(&bad_magic, [0u8; 16]).unwrap();
        assert!(matches!(
            MatchFile::open(&bad_magic),
            Err(StackError::SourceUnavailable { .. })
        ));

        // Header claims more records than present.
        let truncated = dir.join("truncated.bin");
        let mut bytes = MATCH_MAGIC.to_vec();
        bytes.extend_from_slice(&5u64.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 24]);
        std::fs::write(&truncated, bytes).unwrap();
        assert!(matches!(
            MatchFile::open(&truncated),
            Err(StackError::SourceUnavailable { .. })
        ));

        // Trailing bytes past the declared records.
        let trailing = dir.join("trailing.bin");
        let mut bytes = MATCH_MAGIC.to_vec();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 30]);
        std::fs::write(&trailing, bytes).unwrap();
        assert!(matches!(
            MatchFile::open(&trailing),
            Err(StackError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn test_overflowing_header_count_is_unavailable() {
        let dir = test_output_dir("matches_overflow");

        for count in [u64::MAX / 8, u64::MAX, u64::MAX / 24 + 1] {
            let path = dir.join(format!("count_{}.bin", count));
            let mut bytes = MATCH_MAGIC.to_vec();
            bytes.extend_from_slice(&count.to_le_bytes());
            std::fs::write(&path, bytes).unwrap();

            let err = MatchFile::open(&path).unwrap_err();
            assert!(matches!(err, StackError::SourceUnavailable { .. }), "{count}: {err}");
        }
    }

    #[test]
    fn test_empty_file() {
        let dir = test_output_dir("matches_empty");
        let path = dir.join("empty.bin");
        MatchFileWriter::create(&path).unwrap().finish().unwrap();

        let mut file = MatchFile::open(&path).unwrap();
        assert_eq!(file.total_matches(), 0);
        assert_eq!(file.groups().unwrap().count(), 0);
    }

    #[test]
    fn test_vec_source_counts_pairs() {
        let mut source = VecMatchSource::new(vec![
            MatchGroup {
                lens_index: 0,
                pairs: vec![pair(0, 0.1), pair(1, 0.1)],
            },
            MatchGroup {
                lens_index: 1,
                pairs: Vec::new(),
            },
        ]);
        assert_eq!(source.total_matches(), 2);
        assert_eq!(source.groups().unwrap().count(), 2);
    }
}
