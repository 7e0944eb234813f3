//! Catalog access: computers, folders and backup refs as laid out at an
//! archive destination.
//!
//! The destination is reached through the [`ArchiveStore`] trait, which the
//! core only ever reads. Catalog records (`computerinfo`, folder
//! configurations, ref log entries) are property lists; folder
//! configurations are additionally wrapped in encrypted objects.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::crypto::{object_reader, CryptoError, Keyring};
use crate::decode::DecodeError;
use crate::types::ShaHash;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("property list error: {0}")]
    Plist(#[from] plist::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("computer is locked; open it with the passphrase first")]
    Locked,
}

// ── Store abstraction ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Read-only view of an archive destination. Paths are `/`-separated and
/// relative to the destination root; nothing here ever writes.
pub trait ArchiveStore {
    fn list(&self, dir: &str) -> Result<Vec<StoreEntry>, StoreError>;
    fn open(&self, path: &str) -> Result<Box<dyn Read>, StoreError>;
}

/// Local-directory destination, the reference backend.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_owned(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut resolved = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            resolved.push(part);
        }
        resolved
    }
}

impl ArchiveStore for LocalStore {
    fn list(&self, dir: &str) -> Result<Vec<StoreEntry>, StoreError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(dir))? {
            let entry = entry?;
            entries.push(StoreEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read>, StoreError> {
        Ok(Box::new(fs::File::open(self.resolve(path))?))
    }
}

// ── Catalog records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComputerInfo {
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "computerName")]
    pub computer_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FolderInfo {
    #[serde(rename = "Endpoint")]
    pub endpoint: String,
    #[serde(rename = "BucketUUID")]
    pub bucket_uuid: String,
    #[serde(rename = "BucketName")]
    pub bucket_name: String,
    #[serde(rename = "ComputerUUID")]
    pub computer_uuid: String,
    #[serde(rename = "LocalPath")]
    pub local_path: String,
    #[serde(rename = "LocalMountPoint")]
    pub local_mount_point: String,
    #[serde(rename = "StorageType")]
    pub storage_type: i64,
    #[serde(rename = "SkipDuringBackup")]
    pub skip_during_backup: bool,
    #[serde(rename = "ExcludeItemsWithTimeMachineExcludeMetadataFlag")]
    pub exclude_items_with_time_machine_exclude_metadata_flag: bool,
}

/// One entry of a folder's ref log.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RefEntry {
    #[serde(rename = "oldHeadStretchKey")]
    pub old_head_stretch_key: bool,
    #[serde(rename = "newHeadSHA1")]
    pub new_head_sha1: String,
    #[serde(rename = "newHeadStretchKey")]
    pub new_head_stretch_key: bool,
    #[serde(rename = "packSHA1")]
    pub pack_sha1: String,
}

fn read_plist<T, S>(store: &S, path: &str) -> Result<T, StoreError>
where
    T: serde::de::DeserializeOwned,
    S: ArchiveStore + ?Sized,
{
    let mut bytes = Vec::new();
    store.open(path)?.read_to_end(&mut bytes)?;
    Ok(plist::from_bytes(&bytes)?)
}

/// Computers and folders are stored under uppercase hyphenated UUID names.
fn is_uuid_name(name: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    let mut parts = name.split('-');
    for want in GROUPS {
        match parts.next() {
            Some(part)
                if part.len() == want
                    && part
                        .bytes()
                        .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b)) => {}
            _ => return false,
        }
    }
    parts.next().is_none()
}

fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_owned()
    } else {
        format!("{base}/{name}")
    }
}

// ── Computer ─────────────────────────────────────────────────────────────────

/// List the computers stored under `base`: every UUID-named directory with a
/// parseable `computerinfo` record.
pub fn list_computers<'s, S: ArchiveStore>(
    store: &'s S,
    base: &str,
) -> Result<Vec<Computer<'s, S>>, StoreError> {
    let mut computers = Vec::new();
    for entry in store.list(base)? {
        if !entry.is_dir || !is_uuid_name(&entry.name) {
            debug!(name = %entry.name, "skipping non-computer entry");
            continue;
        }
        computers.push(Computer::new(store, base, &entry.name)?);
    }
    Ok(computers)
}

/// Look up a computer by UUID and unlock it in one step.
pub fn open_computer<'s, S: ArchiveStore>(
    store: &'s S,
    base: &str,
    uuid: &str,
    passphrase: &str,
) -> Result<Computer<'s, S>, StoreError> {
    let mut computer = Computer::new(store, base, uuid)?;
    computer.open(passphrase)?;
    Ok(computer)
}

/// One backed-up machine. Created locked; [`open`](Computer::open) unwraps
/// the keyring, which then lives as long as the computer.
pub struct Computer<'s, S: ArchiveStore> {
    store: &'s S,
    path: String,
    pub uuid: String,
    pub info: ComputerInfo,
    keyring: Option<Keyring>,
}

impl<'s, S: ArchiveStore> Computer<'s, S> {
    pub fn new(store: &'s S, base: &str, uuid: &str) -> Result<Self, StoreError> {
        let path = join(base, uuid);
        let info = read_plist(store, &join(&path, "computerinfo"))?;
        Ok(Self {
            store,
            path,
            uuid: uuid.to_owned(),
            info,
            keyring: None,
        })
    }

    /// Unlock `encryptionv3.dat` with the passphrase.
    pub fn open(&mut self, passphrase: &str) -> Result<(), StoreError> {
        let reader = self.store.open(&join(&self.path, "encryptionv3.dat"))?;
        self.keyring = Some(Keyring::unlock(reader, passphrase)?);
        Ok(())
    }

    pub fn keyring(&self) -> Result<&Keyring, StoreError> {
        self.keyring.as_ref().ok_or(StoreError::Locked)
    }

    /// Decrypt and parse every folder configuration under `buckets/`.
    pub fn list_folders(&self) -> Result<Vec<FolderInfo>, StoreError> {
        let keys = self.keyring()?;
        let buckets = join(&self.path, "buckets");
        let mut folders = Vec::new();
        for entry in self.store.list(&buckets)? {
            if entry.is_dir || !is_uuid_name(&entry.name) {
                debug!(name = %entry.name, "skipping non-folder entry");
                continue;
            }
            let raw = self.store.open(&join(&buckets, &entry.name))?;
            let mut reader = object_reader(raw, keys)?;
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            folders.push(plist::from_bytes(&bytes)?);
        }
        Ok(folders)
    }

    pub fn folder(&self, info: FolderInfo) -> Folder<'_, 's, S> {
        Folder {
            computer: self,
            info,
        }
    }
}

// ── Folder ───────────────────────────────────────────────────────────────────

/// A ref-log entry name and where to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefListEntry {
    pub number: u64,
    pub path: String,
}

/// One backed-up folder (bucket) of an unlocked computer.
pub struct Folder<'c, 's, S: ArchiveStore> {
    computer: &'c Computer<'s, S>,
    pub info: FolderInfo,
}

impl<S: ArchiveStore> Folder<'_, '_, S> {
    fn bucket_path(&self, rest: &str) -> String {
        join(
            &self.computer.path,
            &format!("bucketdata/{}/{}", self.info.bucket_uuid, rest),
        )
    }

    /// The current head commit hash, stored as 40 hex characters.
    pub fn find_master(&self) -> Result<ShaHash, StoreError> {
        let mut reader = self.computer.store.open(&self.bucket_path("refs/heads/master"))?;
        let mut hex_buf = [0u8; 40];
        reader.read_exact(&mut hex_buf)?;
        let text = std::str::from_utf8(&hex_buf).map_err(|_| {
            DecodeError::InvalidHash(String::from_utf8_lossy(&hex_buf).into_owned())
        })?;
        Ok(ShaHash::from_hex(text)?)
    }

    /// All numbered entries of the ref log, newest (highest number) first.
    pub fn list_refs(&self) -> Result<Vec<RefListEntry>, StoreError> {
        let dir = self.bucket_path("refs/logs/master");
        let mut refs = Vec::new();
        for entry in self.computer.store.list(&dir)? {
            if entry.is_dir || !entry.name.bytes().all(|b| b.is_ascii_digit()) {
                debug!(name = %entry.name, "skipping non-numeric ref entry");
                continue;
            }
            let Ok(number) = entry.name.parse::<u64>() else {
                debug!(name = %entry.name, "skipping unparseable ref entry");
                continue;
            };
            refs.push(RefListEntry {
                number,
                path: join(&dir, &entry.name),
            });
        }
        refs.sort_by(|a, b| b.number.cmp(&a.number));
        Ok(refs)
    }

    pub fn read_ref(&self, number: u64) -> Result<RefEntry, StoreError> {
        read_plist(
            self.computer.store,
            &self.bucket_path(&format!("refs/logs/master/{number}")),
        )
    }
}
