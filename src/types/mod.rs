//! Archive structures and their wire decoders: trees, nodes, blob keys,
//! packs and pack indexes.
//!
//! Containers that end in a trailing SHA-1 (`Pack`, `PackIndex`) decode
//! through a [`TeeReader`] so the checksum covers exactly the bytes read
//! before it.

use std::fmt;
use std::io::Read;

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

use crate::decode::{
    read_data, read_seq, read_time_millis, ArqDecode, DecodeError, LenTag, TeeReader, TimeSpec,
};

pub const SHA1_LEN: usize = 20;

pub const TREE_HEADER: &[u8; 8] = b"TreeV022";
pub const PACK_MAGIC: &[u8; 4] = b"PACK";
pub const PACK_INDEX_MAGIC: [u8; 4] = [0xff, 0x74, 0x4f, 0x63];
pub const PACK_VERSION: u32 = 2;

// ── ShaHash ──────────────────────────────────────────────────────────────────

/// A 20-byte SHA-1, the object identity everywhere in the archive.
///
/// Ordering is byte-lexicographic, which is the sort order of the pack-index
/// cache files.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ShaHash(pub [u8; SHA1_LEN]);

impl ShaHash {
    pub const ZERO: ShaHash = ShaHash([0; SHA1_LEN]);

    pub fn from_hex(s: &str) -> Result<Self, DecodeError> {
        let mut out = [0u8; SHA1_LEN];
        if s.len() != 2 * SHA1_LEN {
            return Err(DecodeError::InvalidHash(s.to_owned()));
        }
        hex::decode_to_slice(s, &mut out)
            .map_err(|_| DecodeError::InvalidHash(s.to_owned()))?;
        Ok(ShaHash(out))
    }

    pub fn as_bytes(&self) -> &[u8; SHA1_LEN] {
        &self.0
    }

    /// First two bytes as a big-endian bucket key for the cache index.
    pub fn prefix(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }
}

impl fmt::Display for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaHash({})", self)
    }
}

impl From<[u8; SHA1_LEN]> for ShaHash {
    fn from(bytes: [u8; SHA1_LEN]) -> Self {
        ShaHash(bytes)
    }
}

impl ArqDecode for ShaHash {
    /// Wire form is a nullable string of 40 hex characters; an absent or
    /// empty string means the all-zero hash.
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let s = String::decode(r)?;
        if s.is_empty() {
            return Ok(ShaHash::ZERO);
        }
        ShaHash::from_hex(&s)
    }
}

// ── CompressionType ──────────────────────────────────────────────────────────

/// How a blob payload is compressed. Unknown values decode without error and
/// are carried through opaquely; this crate never decompresses payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Gzip,
    Lz4,
    Invalid(i32),
}

impl From<i32> for CompressionType {
    fn from(v: i32) -> Self {
        match v {
            0 => CompressionType::None,
            1 => CompressionType::Gzip,
            2 => CompressionType::Lz4,
            other => CompressionType::Invalid(other),
        }
    }
}

impl CompressionType {
    pub fn as_i32(self) -> i32 {
        match self {
            CompressionType::None => 0,
            CompressionType::Gzip => 1,
            CompressionType::Lz4 => 2,
            CompressionType::Invalid(v) => v,
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionType::None => f.write_str("None"),
            CompressionType::Gzip => f.write_str("Gzip"),
            CompressionType::Lz4 => f.write_str("LZ4"),
            CompressionType::Invalid(_) => f.write_str("INVALID"),
        }
    }
}

impl ArqDecode for CompressionType {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(CompressionType::from(i32::decode(r)?))
    }
}

// ── BlobKey ──────────────────────────────────────────────────────────────────

/// Reference to a stored blob. An all-zero hash means "no blob".
#[derive(Debug, Clone, PartialEq)]
pub struct BlobKey {
    pub hash: ShaHash,
    pub encryption_key_stretched: bool,
    pub storage_type: i32,
    pub archive_id: String,
    pub archive_size: u64,
    pub archive_upload_date: Option<DateTime<Utc>>,
}

impl ArqDecode for BlobKey {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(BlobKey {
            hash: ShaHash::decode(r)?,
            encryption_key_stretched: bool::decode(r)?,
            storage_type: i32::decode(r)?,
            archive_id: String::decode(r)?,
            archive_size: u64::decode(r)?,
            archive_upload_date: read_time_millis(r)?,
        })
    }
}

// ── Node / Tree ──────────────────────────────────────────────────────────────

/// Filesystem-entry metadata as recorded in a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub is_tree: bool,
    pub tree_contains_missing_items: bool,
    pub data_compression_type: CompressionType,
    pub xattrs_compression_type: CompressionType,
    pub acl_compression_type: CompressionType,
    pub data_blob_keys: Vec<BlobKey>,
    pub data_size: u64,
    pub xattrs_blob_key: BlobKey,
    pub xattrs_size: u64,
    pub acl_blob_key: BlobKey,
    pub uid: i32,
    pub gid: i32,
    pub mode: i32,
    pub mtime: TimeSpec,
    pub flags: i64,
    pub finder_flags: i32,
    pub extended_finder_flags: i32,
    pub finder_file_type: String,
    pub finder_file_creator: String,
    pub is_file_extension_hidden: bool,
    pub st_dev: i32,
    pub st_ino: i32,
    pub st_nlink: u32,
    pub st_rdev: i32,
    pub ctime: TimeSpec,
    pub create_time: TimeSpec,
    pub st_blocks: i64,
    pub st_blksize: u32,
}

impl ArqDecode for Node {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(Node {
            is_tree: bool::decode(r)?,
            tree_contains_missing_items: bool::decode(r)?,
            data_compression_type: CompressionType::decode(r)?,
            xattrs_compression_type: CompressionType::decode(r)?,
            acl_compression_type: CompressionType::decode(r)?,
            data_blob_keys: read_seq(r, LenTag::U32)?,
            data_size: u64::decode(r)?,
            xattrs_blob_key: BlobKey::decode(r)?,
            xattrs_size: u64::decode(r)?,
            acl_blob_key: BlobKey::decode(r)?,
            uid: i32::decode(r)?,
            gid: i32::decode(r)?,
            mode: i32::decode(r)?,
            mtime: TimeSpec::decode(r)?,
            flags: i64::decode(r)?,
            finder_flags: i32::decode(r)?,
            extended_finder_flags: i32::decode(r)?,
            finder_file_type: String::decode(r)?,
            finder_file_creator: String::decode(r)?,
            is_file_extension_hidden: bool::decode(r)?,
            st_dev: i32::decode(r)?,
            st_ino: i32::decode(r)?,
            st_nlink: u32::decode(r)?,
            st_rdev: i32::decode(r)?,
            ctime: TimeSpec::decode(r)?,
            create_time: TimeSpec::decode(r)?,
            st_blocks: i64::decode(r)?,
            st_blksize: u32::decode(r)?,
        })
    }
}

/// A named child of a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub file_name: String,
    pub node: Node,
}

impl ArqDecode for TreeNode {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(TreeNode {
            file_name: String::decode(r)?,
            node: Node::decode(r)?,
        })
    }
}

/// A directory object, headed by the literal `"TreeV022"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    pub xattrs_compression_type: CompressionType,
    pub acl_compression_type: CompressionType,
    pub xattrs_blob_key: BlobKey,
    pub xattrs_size: u64,
    pub acl_blob_key: BlobKey,
    pub uid: i32,
    pub gid: i32,
    pub mode: i32,
    pub mtime: TimeSpec,
    pub flags: i64,
    pub finder_flags: i32,
    pub extended_finder_flags: i32,
    pub st_dev: i32,
    pub st_ino: i32,
    pub st_nlink: u32,
    pub st_rdev: i32,
    pub ctime: TimeSpec,
    pub st_blocks: i64,
    pub st_blksize: u32,
    pub create_time: TimeSpec,
    pub missing_nodes: Vec<String>,
    pub nodes: Vec<TreeNode>,
}

impl ArqDecode for Tree {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let header = <[u8; 8]>::decode(r)?;
        if &header != TREE_HEADER {
            return Err(DecodeError::InvalidMagic {
                expected: TREE_HEADER,
                found: header.to_vec(),
            });
        }
        Ok(Tree {
            xattrs_compression_type: CompressionType::decode(r)?,
            acl_compression_type: CompressionType::decode(r)?,
            xattrs_blob_key: BlobKey::decode(r)?,
            xattrs_size: u64::decode(r)?,
            acl_blob_key: BlobKey::decode(r)?,
            uid: i32::decode(r)?,
            gid: i32::decode(r)?,
            mode: i32::decode(r)?,
            mtime: TimeSpec::decode(r)?,
            flags: i64::decode(r)?,
            finder_flags: i32::decode(r)?,
            extended_finder_flags: i32::decode(r)?,
            st_dev: i32::decode(r)?,
            st_ino: i32::decode(r)?,
            st_nlink: u32::decode(r)?,
            st_rdev: i32::decode(r)?,
            ctime: TimeSpec::decode(r)?,
            st_blocks: i64::decode(r)?,
            st_blksize: u32::decode(r)?,
            create_time: TimeSpec::decode(r)?,
            missing_nodes: read_seq(r, LenTag::U32)?,
            nodes: read_seq(r, LenTag::U32)?,
        })
    }
}

// ── Pack index ───────────────────────────────────────────────────────────────

/// One entry of a pack index: where an object lives inside its pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackIndexObject {
    pub offset: u64,
    pub length: u64,
    pub sha1: ShaHash,
}

impl ArqDecode for PackIndexObject {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let offset = u64::decode(r)?;
        let length = u64::decode(r)?;
        let sha1 = ShaHash(<[u8; SHA1_LEN]>::decode(r)?);
        let alignment = <[u8; 4]>::decode(r)?;
        if alignment != [0, 0, 0, 0] {
            return Err(DecodeError::InvalidAlignment);
        }
        Ok(PackIndexObject { offset, length, sha1 })
    }
}

/// The sorted index that accompanies a pack file.
///
/// `fanout[i]` counts objects whose hash starts with a byte ≤ `i`, so
/// `fanout[255]` is the object count. The trailing SHA-1 covers every byte
/// before it.
#[derive(Debug, Clone)]
pub struct PackIndex {
    pub version: u32,
    pub fanout: [u32; 256],
    pub objects: Vec<PackIndexObject>,
    pub sha1: ShaHash,
}

impl ArqDecode for PackIndex {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let mut tee = TeeReader::new(r, Sha1::new());

        let magic = <[u8; 4]>::decode(&mut tee)?;
        if magic != PACK_INDEX_MAGIC {
            return Err(DecodeError::InvalidMagic {
                expected: &PACK_INDEX_MAGIC,
                found: magic.to_vec(),
            });
        }
        let version = u32::decode(&mut tee)?;
        if version != PACK_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let mut fanout = [0u32; 256];
        for slot in fanout.iter_mut() {
            *slot = u32::decode(&mut tee)?;
        }

        let count = fanout[255] as usize;
        let mut objects = Vec::new();
        for _ in 0..count {
            objects.push(PackIndexObject::decode(&mut tee)?);
        }

        // Snapshot the digest before the trailing hash enters the stream.
        let calculated = tee.digest().clone().finalize();
        let stored = <[u8; SHA1_LEN]>::decode(&mut tee)?;
        if calculated[..] != stored[..] {
            return Err(DecodeError::ChecksumMismatch {
                stored: hex::encode(stored),
                calculated: hex::encode(calculated),
            });
        }

        Ok(PackIndex {
            version,
            fanout,
            objects,
            sha1: ShaHash(stored),
        })
    }
}

// ── Pack ─────────────────────────────────────────────────────────────────────

/// One object inside a pack. `data` is usually an encrypted object blob.
#[derive(Debug, Clone, PartialEq)]
pub struct PackObject {
    pub mimetype: String,
    pub name: String,
    pub data: Vec<u8>,
}

impl ArqDecode for PackObject {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(PackObject {
            mimetype: String::decode(r)?,
            name: String::decode(r)?,
            data: read_data(r, LenTag::U64)?,
        })
    }
}

/// A pack file: many small objects appended behind one header, with a
/// trailing SHA-1 over everything before it.
#[derive(Debug, Clone)]
pub struct Pack {
    pub version: u32,
    pub objects: Vec<PackObject>,
    pub sha1: ShaHash,
}

impl ArqDecode for Pack {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let mut tee = TeeReader::new(r, Sha1::new());

        let magic = <[u8; 4]>::decode(&mut tee)?;
        if &magic != PACK_MAGIC {
            return Err(DecodeError::InvalidMagic {
                expected: PACK_MAGIC,
                found: magic.to_vec(),
            });
        }
        let version = u32::decode(&mut tee)?;
        if version != PACK_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let object_count = u64::decode(&mut tee)?;
        let mut objects = Vec::new();
        for _ in 0..object_count {
            objects.push(PackObject::decode(&mut tee)?);
        }

        let calculated = tee.digest().clone().finalize();
        let stored = <[u8; SHA1_LEN]>::decode(&mut tee)?;
        if calculated[..] != stored[..] {
            return Err(DecodeError::ChecksumMismatch {
                stored: hex::encode(stored),
                calculated: hex::encode(calculated),
            });
        }

        Ok(Pack {
            version,
            objects,
            sha1: ShaHash(stored),
        })
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

pub fn decode_tree(bytes: &[u8]) -> Result<Tree, DecodeError> {
    let mut r = bytes;
    Tree::decode(&mut r)
}

pub fn decode_pack_index(bytes: &[u8]) -> Result<PackIndex, DecodeError> {
    let mut r = bytes;
    PackIndex::decode(&mut r)
}

pub fn decode_pack(bytes: &[u8]) -> Result<Pack, DecodeError> {
    let mut r = bytes;
    Pack::decode(&mut r)
}
