//! Pack-index cache: collapse every pack index of a folder into one sorted,
//! prefix-bucketed lookup structure.
//!
//! The on-disk form is three files in a working directory:
//!
//! | file | contents |
//! |------|----------|
//! | `cache_packlist` | pack hashes, ascending, 20 bytes each; position = 16-bit pack id |
//! | `cache_packlocation` | 38-byte records `hash(20) | pack id(2) | offset(8) | length(8)`, ascending by hash |
//! | `cache_index` | 65,536 `u32` entries; entry `p` = byte offset of the first record whose hash starts with prefix `p` |
//!
//! A lookup reads index entries `p` and `p + 1` to bound a sequential scan
//! over the sorted records; for the last prefix the location file size is the
//! bound. All integers are big-endian.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tracing::debug;

use crate::types::{PackIndex, ShaHash, SHA1_LEN};

pub const PACK_LIST_FNAME: &str = "cache_packlist";
pub const PACK_LOCATION_FNAME: &str = "cache_packlocation";
pub const INDEX_FNAME: &str = "cache_index";

/// hash(20) + pack id(2) + offset(8) + length(8).
const LOCATION_RECORD_LEN: u64 = 38;
/// One slot per two-byte hash prefix.
const PREFIX_SLOTS: u32 = 1 << 16;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("already indexed this pack index")]
    AlreadyIndexed,
    #[error("object hash not present in any indexed pack")]
    NotFound,
    #[error("pack id space exhausted (more than 65,535 packs)")]
    TooManyPacksets,
}

/// Where an object lives: which pack, and the byte range inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackLocation {
    pub pack_hash: ShaHash,
    pub offset: u64,
    pub length: u64,
}

// ── In-memory staging ────────────────────────────────────────────────────────

/// Sorted in-memory cache; the staging area of [`FileBuilder`] and a
/// searcher in its own right. BTree ordering makes the build output sorted
/// for free, and re-inserting an object hash is impossible by construction.
#[derive(Debug, Default)]
pub struct MemoryCache {
    index: BTreeMap<ShaHash, PackLocation>,
    packsets: BTreeSet<ShaHash>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, pack_hash: &ShaHash) -> bool {
        self.packsets.contains(pack_hash)
    }

    /// Stage every object of `index` under `pack_hash`. Each pack index is
    /// accepted at most once.
    pub fn add(&mut self, pack_hash: ShaHash, index: &PackIndex) -> Result<(), CacheError> {
        if !self.packsets.insert(pack_hash) {
            return Err(CacheError::AlreadyIndexed);
        }
        for obj in &index.objects {
            self.index.insert(
                obj.sha1,
                PackLocation {
                    pack_hash,
                    offset: obj.offset,
                    length: obj.length,
                },
            );
        }
        Ok(())
    }

    pub fn find(&self, hash: &ShaHash) -> Result<PackLocation, CacheError> {
        self.index.get(hash).copied().ok_or(CacheError::NotFound)
    }

    pub fn object_count(&self) -> usize {
        self.index.len()
    }

    pub fn pack_count(&self) -> usize {
        self.packsets.len()
    }
}

// ── File-backed build ────────────────────────────────────────────────────────

/// Accumulates pack indexes in memory, then writes the three cache files.
/// Single-writer: stage with [`add`](FileBuilder::add), then call
/// [`build`](FileBuilder::build) once.
pub struct FileBuilder {
    workdir: PathBuf,
    staged: MemoryCache,
}

impl FileBuilder {
    pub fn new<P: AsRef<Path>>(workdir: P) -> Self {
        Self {
            workdir: workdir.as_ref().to_owned(),
            staged: MemoryCache::new(),
        }
    }

    pub fn has(&self, pack_hash: &ShaHash) -> bool {
        self.staged.has(pack_hash)
    }

    pub fn add(&mut self, pack_hash: ShaHash, index: &PackIndex) -> Result<(), CacheError> {
        self.staged.add(pack_hash, index)
    }

    pub fn build(&self) -> Result<(), CacheError> {
        let pack_ids = self.write_packlist()?;
        self.write_locations(&pack_ids)?;
        debug!(
            packs = self.staged.pack_count(),
            objects = self.staged.object_count(),
            "built pack-index cache"
        );
        Ok(())
    }

    /// Pack hashes ascending; position in the file assigns the 16-bit id.
    fn write_packlist(&self) -> Result<BTreeMap<ShaHash, u16>, CacheError> {
        // One id is reserved so every id fits a u16.
        if self.staged.pack_count() > u16::MAX as usize {
            return Err(CacheError::TooManyPacksets);
        }
        let mut w = BufWriter::new(File::create(self.workdir.join(PACK_LIST_FNAME))?);
        let mut ids = BTreeMap::new();
        for (i, hash) in self.staged.packsets.iter().enumerate() {
            w.write_all(hash.as_bytes())?;
            ids.insert(*hash, i as u16);
        }
        w.flush()?;
        Ok(ids)
    }

    fn write_locations(&self, pack_ids: &BTreeMap<ShaHash, u16>) -> Result<(), CacheError> {
        let mut loc_w = BufWriter::new(File::create(self.workdir.join(PACK_LOCATION_FNAME))?);
        let mut idx_w = BufWriter::new(File::create(self.workdir.join(INDEX_FNAME))?);

        let mut next_prefix: u32 = 0;
        let mut offset: u32 = 0;
        for (hash, loc) in &self.staged.index {
            let Some(&pack_id) = pack_ids.get(&loc.pack_hash) else {
                return Err(CacheError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "staged object refers to an unknown pack hash",
                )));
            };

            // Every prefix up to and including this record's gets the
            // record's starting offset; skipped prefixes resolve to an
            // empty range.
            let prefix = u32::from(hash.prefix());
            while next_prefix <= prefix {
                idx_w.write_u32::<BigEndian>(offset)?;
                next_prefix += 1;
            }

            loc_w.write_all(hash.as_bytes())?;
            loc_w.write_u16::<BigEndian>(pack_id)?;
            loc_w.write_u64::<BigEndian>(loc.offset)?;
            loc_w.write_u64::<BigEndian>(loc.length)?;
            offset += LOCATION_RECORD_LEN as u32;
        }
        // Pad the remaining slots with the final offset.
        while next_prefix < PREFIX_SLOTS {
            idx_w.write_u32::<BigEndian>(offset)?;
            next_prefix += 1;
        }

        loc_w.flush()?;
        idx_w.flush()?;
        Ok(())
    }
}

// ── File-backed search ───────────────────────────────────────────────────────

/// Read-only searcher over a built cache directory. The files are immutable
/// after build, so any number of independently-opened searchers may coexist;
/// one searcher serves queries sequentially. Files close on drop.
pub struct FileSearcher {
    packlist: File,
    locations: File,
    index: File,
    location_len: u64,
}

impl FileSearcher {
    pub fn open<P: AsRef<Path>>(workdir: P) -> Result<Self, CacheError> {
        let workdir = workdir.as_ref();
        let packlist = File::open(workdir.join(PACK_LIST_FNAME))?;
        let locations = File::open(workdir.join(PACK_LOCATION_FNAME))?;
        let index = File::open(workdir.join(INDEX_FNAME))?;
        let location_len = locations.metadata()?.len();
        Ok(Self {
            packlist,
            locations,
            index,
            location_len,
        })
    }

    pub fn find(&mut self, hash: &ShaHash) -> Result<PackLocation, CacheError> {
        let (start, limit) = self.prefix_range(hash.prefix())?;
        if start == limit {
            return Err(CacheError::NotFound);
        }
        let (pack_id, offset, length) = self.scan_locations(hash, start, limit)?;
        let pack_hash = self.pack_hash_by_id(pack_id)?;
        Ok(PackLocation {
            pack_hash,
            offset,
            length,
        })
    }

    /// Byte range `[start, limit)` of `cache_packlocation` holding records
    /// with this prefix.
    fn prefix_range(&mut self, prefix: u16) -> Result<(u64, u64), CacheError> {
        self.index.seek(SeekFrom::Start(u64::from(prefix) * 4))?;
        let start = u64::from(self.index.read_u32::<BigEndian>()?);
        // The table has one entry per prefix, so the slot after the last
        // prefix does not exist; the location file length bounds it instead.
        let limit = if prefix == u16::MAX {
            self.location_len
        } else {
            u64::from(self.index.read_u32::<BigEndian>()?)
        };
        Ok((start, limit))
    }

    fn scan_locations(
        &mut self,
        hash: &ShaHash,
        start: u64,
        limit: u64,
    ) -> Result<(u16, u64, u64), CacheError> {
        self.locations.seek(SeekFrom::Start(start))?;
        let mut pos = start;
        let mut record_hash = [0u8; SHA1_LEN];
        while pos + LOCATION_RECORD_LEN <= limit {
            self.locations.read_exact(&mut record_hash)?;
            let pack_id = self.locations.read_u16::<BigEndian>()?;
            let offset = self.locations.read_u64::<BigEndian>()?;
            let length = self.locations.read_u64::<BigEndian>()?;
            match record_hash.cmp(hash.as_bytes()) {
                Ordering::Equal => return Ok((pack_id, offset, length)),
                Ordering::Less => pos += LOCATION_RECORD_LEN,
                // Records are sorted; overshooting means the hash is absent.
                Ordering::Greater => return Err(CacheError::NotFound),
            }
        }
        Err(CacheError::NotFound)
    }

    fn pack_hash_by_id(&mut self, pack_id: u16) -> Result<ShaHash, CacheError> {
        self.packlist
            .seek(SeekFrom::Start(u64::from(pack_id) * SHA1_LEN as u64))?;
        let mut hash = [0u8; SHA1_LEN];
        self.packlist.read_exact(&mut hash)?;
        Ok(ShaHash(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PackIndexObject;
    use std::fs;

    fn sha(hex_str: &str) -> ShaHash {
        ShaHash::from_hex(hex_str).unwrap()
    }

    fn index_with(objects: &[(u64, u64, &str)]) -> PackIndex {
        let objects: Vec<PackIndexObject> = objects
            .iter()
            .map(|&(offset, length, hex_str)| PackIndexObject {
                offset,
                length,
                sha1: sha(hex_str),
            })
            .collect();
        let mut fanout = [0u32; 256];
        for obj in &objects {
            for slot in fanout.iter_mut().skip(obj.sha1.as_bytes()[0] as usize) {
                *slot += 1;
            }
        }
        PackIndex {
            version: 2,
            fanout,
            objects,
            sha1: ShaHash::ZERO,
        }
    }

    const ABSENT: &str = "2d48a782b4db79027b408ef3d0276ac2d4a8b79b";

    /// Stages the given packs into both cache forms and checks every staged
    /// object resolves, plus one known-absent hash.
    fn check_with_packs(packs: &[(ShaHash, PackIndex)]) {
        // Memory-backed.
        let mut mem = MemoryCache::new();
        for (hash, index) in packs {
            assert!(!mem.has(hash));
            mem.add(*hash, index).unwrap();
        }
        for (hash, index) in packs {
            for obj in &index.objects {
                let loc = mem.find(&obj.sha1).unwrap();
                assert_eq!(loc.pack_hash, *hash);
                assert_eq!(loc.offset, obj.offset);
                assert_eq!(loc.length, obj.length);
            }
        }
        assert!(matches!(mem.find(&sha(ABSENT)), Err(CacheError::NotFound)));

        // File-backed.
        let dir = tempfile::tempdir().unwrap();
        let mut builder = FileBuilder::new(dir.path());
        for (hash, index) in packs {
            assert!(!builder.has(hash));
            builder.add(*hash, index).unwrap();
        }
        builder.build().unwrap();

        let mut searcher = FileSearcher::open(dir.path()).unwrap();
        for (hash, index) in packs {
            for obj in &index.objects {
                let loc = searcher.find(&obj.sha1).unwrap();
                assert_eq!(loc.pack_hash, *hash);
                assert_eq!(loc.offset, obj.offset);
                assert_eq!(loc.length, obj.length);
            }
        }
        assert!(matches!(
            searcher.find(&sha(ABSENT)),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn two_object_pack() {
        let index = index_with(&[
            (16, 1316, "0ed92a2ab71b2fe75a28fcd785e1c9ec51e040f2"),
            (1342, 372, "5d2d2b62a1b11b2e5977c5ea65cb4708e5f41887"),
        ]);
        let pack_hash = sha("19cec4295c1d829dfb900007a0bebeb0b3727260");
        check_with_packs(&[(pack_hash, index)]);
    }

    #[test]
    fn empty_pack_index() {
        check_with_packs(&[(sha(ABSENT), index_with(&[]))]);
    }

    #[test]
    fn adjacent_objects_within_and_across_prefixes() {
        let index = index_with(&[
            (1000, 100, "aa00000000000000000000000000000000000001"),
            (2000, 100, "aa00000000000000000000000000000000000002"),
            (3000, 100, "aa00000000000000000000000000000000000003"),
            (4000, 100, "ab00000000000000000000000000000000000001"),
        ]);
        check_with_packs(&[(sha(ABSENT), index)]);
    }

    #[test]
    fn first_and_last_possible_prefixes() {
        // 0x0000 exercises index entry zero; 0xffff has no entry after it,
        // so its scan is bounded by the location file size instead.
        let index = index_with(&[
            (1000, 100, "0000000000000000000000000000000000000001"),
            (3000, 100, "ff00000000000000000000000000000000000001"),
            (5000, 100, "ffff000000000000000000000000000000000001"),
        ]);
        check_with_packs(&[(sha(ABSENT), index)]);
    }

    #[test]
    fn multiple_packs() {
        let a = index_with(&[(16, 100, "0ed92a2ab71b2fe75a28fcd785e1c9ec51e040f2")]);
        let b = index_with(&[(32, 200, "5d2d2b62a1b11b2e5977c5ea65cb4708e5f41887")]);
        check_with_packs(&[
            (sha("19cec4295c1d829dfb900007a0bebeb0b3727260"), a),
            (sha("917ba67b0748ebbf02f12cdf2b49f536e5ddb20e"), b),
        ]);
    }

    #[test]
    fn duplicate_pack_is_rejected() {
        let index = index_with(&[(16, 100, "0ed92a2ab71b2fe75a28fcd785e1c9ec51e040f2")]);
        let pack_hash = sha("19cec4295c1d829dfb900007a0bebeb0b3727260");

        let mut mem = MemoryCache::new();
        mem.add(pack_hash, &index).unwrap();
        assert!(mem.has(&pack_hash));
        assert!(matches!(
            mem.add(pack_hash, &index),
            Err(CacheError::AlreadyIndexed)
        ));
    }

    #[test]
    fn empty_build_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        FileBuilder::new(dir.path()).build().unwrap();
        let mut searcher = FileSearcher::open(dir.path()).unwrap();
        assert!(matches!(
            searcher.find(&sha(ABSENT)),
            Err(CacheError::NotFound)
        ));
        assert!(matches!(
            searcher.find(&sha("0000000000000000000000000000000000000001")),
            Err(CacheError::NotFound)
        ));
        assert!(matches!(
            searcher.find(&sha("ff00000000000000000000000000000000000001")),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn on_disk_layout() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_with(&[
            (1000, 100, "aa00000000000000000000000000000000000002"),
            (2000, 100, "aa00000000000000000000000000000000000001"),
            (3000, 100, "ab00000000000000000000000000000000000001"),
        ]);
        let mut builder = FileBuilder::new(dir.path());
        builder
            .add(sha("19cec4295c1d829dfb900007a0bebeb0b3727260"), &index)
            .unwrap();
        builder.build().unwrap();

        // The index table is exactly one u32 per prefix.
        let idx = fs::read(dir.path().join(INDEX_FNAME)).unwrap();
        assert_eq!(idx.len(), PREFIX_SLOTS as usize * 4);

        // Records are strictly ascending by hash and the table is monotone.
        let loc = fs::read(dir.path().join(PACK_LOCATION_FNAME)).unwrap();
        assert_eq!(loc.len() as u64, 3 * LOCATION_RECORD_LEN);
        let hashes: Vec<&[u8]> = loc
            .chunks(LOCATION_RECORD_LEN as usize)
            .map(|rec| &rec[..SHA1_LEN])
            .collect();
        assert!(hashes.windows(2).all(|w| w[0] < w[1]));

        let entries: Vec<u32> = idx
            .chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert!(entries.windows(2).all(|w| w[0] <= w[1]));
        // The 0xaa00 bucket starts at record zero and holds two records.
        assert_eq!(entries[0xaa00], 0);
        assert_eq!(entries[0xaa01], 2 * LOCATION_RECORD_LEN as u32);
        // The bucket after the last record points at the end.
        assert_eq!(entries[0xab01], 3 * LOCATION_RECORD_LEN as u32);
    }
}
