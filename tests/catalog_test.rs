//! End-to-end catalog walk over a synthesized destination directory:
//! list computers, unlock the keyring, decrypt folder configurations, and
//! follow a folder's refs.

use std::fs;
use std::path::Path;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::Sha256;

use arqread::store::{list_computers, Computer, LocalStore, StoreError};
use arqread::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const PASSPHRASE: &str = "hunter2";
const COMPUTER_UUID: &str = "8C10C697-7DCA-4747-B92B-6900CC64CCE7";
const FOLDER_UUID: &str = "9084C9D4-B59E-4F94-A577-CF5FCFF23056";
const MASTER_SHA: &str = "917ba67b0748ebbf02f12cdf2b49f536e5ddb20e";
const PACK_SHA: &str = "19cec4295c1d829dfb900007a0bebeb0b3727260";

fn master_keys() -> ([u8; 32], [u8; 32], [u8; 32]) {
    let mut k1 = [0u8; 32];
    let mut k2 = [0u8; 32];
    let mut k3 = [0u8; 32];
    for i in 0..32 {
        k1[i] = 0x10 ^ i as u8;
        k2[i] = 0x20 ^ i as u8;
        k3[i] = 0x30 ^ i as u8;
    }
    (k1, k2, k3)
}

fn cbc_encrypt(key: &[u8], iv: &[u8; 16], plain: &[u8]) -> Vec<u8> {
    assert_eq!(plain.len() % 16, 0);
    let mut enc = Aes256CbcEnc::new_from_slices(key, iv).unwrap();
    let mut out = plain.to_vec();
    for block in out.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    out
}

fn keyring_file() -> Vec<u8> {
    let (k1, k2, k3) = master_keys();
    let salt = [0x5Au8; 8];
    let iv = [0xC3u8; 16];

    let mut plain = Vec::new();
    plain.extend_from_slice(&k1);
    plain.extend_from_slice(&k2);
    plain.extend_from_slice(&k3);
    plain.extend_from_slice(&[16u8; 16]);

    let mut derived = [0u8; 64];
    pbkdf2_hmac::<Sha1>(PASSPHRASE.as_bytes(), &salt, 200_000, &mut derived);
    let enc_keys = cbc_encrypt(&derived[..32], &iv, &plain);

    let mut mac = HmacSha256::new_from_slice(&derived[32..]).unwrap();
    mac.update(&iv);
    mac.update(&enc_keys);
    let tag = mac.finalize().into_bytes();

    let mut file = Vec::new();
    file.extend_from_slice(b"ENCRYPTIONV2");
    file.extend_from_slice(&salt);
    file.extend_from_slice(&tag);
    file.extend_from_slice(&iv);
    file.extend_from_slice(&enc_keys);
    file
}

fn encrypted_object(plain: &[u8]) -> Vec<u8> {
    let (k1, k2, _) = master_keys();
    let master_iv = [0x42u8; 16];
    let data_iv = [0x24u8; 16];
    let session_key = [0x99u8; 32];

    let mut session_blob = Vec::new();
    session_blob.extend_from_slice(&data_iv);
    session_blob.extend_from_slice(&session_key);
    session_blob.extend_from_slice(&[0u8; 16]);
    let wrapped = cbc_encrypt(&k1, &master_iv, &session_blob);

    let pad = 16 - plain.len() % 16;
    let mut padded = plain.to_vec();
    padded.extend(std::iter::repeat(pad as u8).take(pad));
    let payload = cbc_encrypt(&session_key, &data_iv, &padded);

    let mut body = Vec::new();
    body.extend_from_slice(&master_iv);
    body.extend_from_slice(&wrapped);
    body.extend_from_slice(&payload);

    let mut mac = HmacSha256::new_from_slice(&k2).unwrap();
    mac.update(&body);
    let tag = mac.finalize().into_bytes();

    let mut object = Vec::new();
    object.extend_from_slice(b"ARQO");
    object.extend_from_slice(&tag);
    object.extend_from_slice(&body);
    object
}

fn folder_plist() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Endpoint</key><string>file:///backups/t1/local</string>
    <key>BucketUUID</key><string>{FOLDER_UUID}</string>
    <key>BucketName</key><string>src</string>
    <key>ComputerUUID</key><string>{COMPUTER_UUID}</string>
    <key>LocalPath</key><string>/Users/sholiday/src</string>
    <key>LocalMountPoint</key><string>/</string>
    <key>StorageType</key><integer>1</integer>
    <key>SkipDuringBackup</key><false/>
    <key>ExcludeItemsWithTimeMachineExcludeMetadataFlag</key><false/>
</dict>
</plist>"#
    )
}

fn ref_plist(head: &str, pack: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>oldHeadStretchKey</key><true/>
    <key>newHeadSHA1</key><string>{head}</string>
    <key>newHeadStretchKey</key><true/>
    <key>packSHA1</key><string>{pack}</string>
</dict>
</plist>"#
    )
}

/// Lays out a destination with one computer and one folder.
fn write_destination(root: &Path) {
    let computer = root.join(COMPUTER_UUID);
    fs::create_dir_all(computer.join("buckets")).unwrap();
    fs::write(
        computer.join("computerinfo"),
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>userName</key><string>sholiday</string>
    <key>computerName</key><string>narrator</string>
</dict>
</plist>"#,
    )
    .unwrap();
    fs::write(computer.join("encryptionv3.dat"), keyring_file()).unwrap();
    fs::write(
        computer.join("buckets").join(FOLDER_UUID),
        encrypted_object(folder_plist().as_bytes()),
    )
    .unwrap();

    let refs = computer.join("bucketdata").join(FOLDER_UUID).join("refs");
    fs::create_dir_all(refs.join("heads")).unwrap();
    fs::create_dir_all(refs.join("logs").join("master")).unwrap();
    fs::write(refs.join("heads").join("master"), MASTER_SHA).unwrap();
    for (number, head) in [
        (644364918u64, MASTER_SHA),
        (644364917u64, "0ed92a2ab71b2fe75a28fcd785e1c9ec51e040f2"),
    ] {
        fs::write(
            refs.join("logs").join("master").join(number.to_string()),
            ref_plist(head, PACK_SHA),
        )
        .unwrap();
    }
    // Stray entries the catalog walk must skip.
    fs::create_dir_all(root.join("not-a-computer")).unwrap();
    fs::write(
        refs.join("logs").join("master").join("README"),
        "not a ref",
    )
    .unwrap();
}

#[test]
fn catalog_walk() {
    let dir = tempfile::tempdir().unwrap();
    write_destination(dir.path());
    let store = LocalStore::new(dir.path());

    let mut computers = list_computers(&store, "").unwrap();
    assert_eq!(computers.len(), 1);
    let computer = &mut computers[0];
    assert_eq!(computer.uuid, COMPUTER_UUID);
    assert_eq!(computer.info.computer_name, "narrator");
    assert_eq!(computer.info.user_name, "sholiday");

    // Folders are unreachable until the keyring is unlocked.
    assert!(matches!(computer.list_folders(), Err(StoreError::Locked)));
    computer.open(PASSPHRASE).unwrap();

    let folders = computer.list_folders().unwrap();
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].bucket_uuid, FOLDER_UUID);
    assert_eq!(folders[0].bucket_name, "src");
    assert_eq!(folders[0].computer_uuid, COMPUTER_UUID);
    assert_eq!(folders[0].local_path, "/Users/sholiday/src");

    let folder = computer.folder(folders[0].clone());
    assert_eq!(folder.find_master().unwrap().to_string(), MASTER_SHA);

    let refs = folder.list_refs().unwrap();
    let numbers: Vec<u64> = refs.iter().map(|r| r.number).collect();
    assert_eq!(numbers, vec![644364918, 644364917]);

    let entry = folder.read_ref(644364918).unwrap();
    assert_eq!(entry.new_head_sha1, MASTER_SHA);
    assert_eq!(entry.pack_sha1, PACK_SHA);
    assert!(entry.new_head_stretch_key);
}

#[test]
fn wrong_passphrase_is_rejected_before_decryption() {
    let dir = tempfile::tempdir().unwrap();
    write_destination(dir.path());
    let store = LocalStore::new(dir.path());

    let mut computer = Computer::new(&store, "", COMPUTER_UUID).unwrap();
    match computer.open("hunter3") {
        Err(StoreError::Crypto(CryptoError::WrongPassword)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}
