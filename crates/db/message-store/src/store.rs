//! Encrypted append-only message log. Backed by two files inside a
//! network's message directory: `<id>.index` (fixed-width
//! offset/length records) and `<id>.data` (IV + MAC + ciphertext per
//! entry).
//!
//! The whole store is protected by one mutex, so a failed write can never advance the visible count.

use crate::error::{Error, ErrorKind, Result};
use crate::record::MessageRecord;
use aes_ctr::stream_cipher::generic_array::GenericArray;
use aes_ctr::stream_cipher::{NewStreamCipher, SyncStreamCipher};
use aes_ctr::Aes128Ctr;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use rand::RngCore;
use sha3::{Digest, Keccak256};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;
const INDEX_RECORD_LEN: u64 = 12; // offset: u64 LE, length: u32 LE

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    length: u32,
}

struct Inner {
    index_file: File,
    data_file: File,
    index: Vec<IndexEntry>,
    cipher_key: [u8; 16],
    mac_key: [u8; 16],
}

/// One network's encrypted message log.
pub struct MessageStore {
    inner: Mutex<Inner>,
}

/// Paths of the two files backing a message store with the given id,
/// inside `{profile_folder}/messages/`.
pub fn store_paths(profile_folder: &Path, store_id: &str) -> (PathBuf, PathBuf) {
    let dir = profile_folder.join("messages");
    (
        dir.join(format!("{store_id}.index")),
        dir.join(format!("{store_id}.data")),
    )
}

/// Removes both files backing `store_id`, for network deletion. Missing files are not an error; the caller may be cleaning up
/// after a store that was never written to.
pub fn delete(profile_folder: &Path, store_id: &str) -> Result<()> {
    let (index_path, data_path) = store_paths(profile_folder, store_id);
    for path in [index_path, data_path] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::from(e)),
        }
    }
    Ok(())
}

impl MessageStore {
    /// Opens (creating if absent) the store identified by `store_id` under
    /// `profile_folder/messages/`, encrypting/decrypting entries with
    /// `message_store_key` (the first 16 bytes key the cipher, the last 16
    /// key the MAC -- mirroring `ethstore`'s derived-key split).
    pub fn open(
        profile_folder: &Path,
        store_id: &str,
        message_store_key: &[u8; 32],
    ) -> Result<MessageStore> {
        let (index_path, data_path) = store_paths(profile_folder, store_id);
        if let Some(parent) = index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut index_file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&index_path)?;
        let data_file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&data_path)?;

        let index = read_index(&mut index_file)?;

        let mut cipher_key = [0u8; 16];
        let mut mac_key = [0u8; 16];
        cipher_key.copy_from_slice(&message_store_key[0..16]);
        mac_key.copy_from_slice(&message_store_key[16..32]);

        Ok(MessageStore {
            inner: Mutex::new(Inner {
                index_file,
                data_file,
                index,
                cipher_key,
                mac_key,
            }),
        })
    }

    /// Number of entries currently in the log.
    pub fn len(&self) -> u64 {
        self.inner.lock().index.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a new entry, assigning it the next message number. On any
    /// I/O failure the log's visible length is left unchanged.
    pub fn append(&self, record: &MessageRecord) -> Result<u64> {
        let mut inner = self.inner.lock();
        let message_number = inner.index.len() as u64;
        debug_assert_eq!(record.message_number, message_number);

        let plaintext = rlp::encode(record);
        let (iv, ciphertext) = inner.encrypt(&plaintext);
        let mac = inner.mac(&ciphertext);

        let mut blob = Vec::with_capacity(IV_LEN + MAC_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&mac);
        blob.extend_from_slice(&ciphertext);

        let offset = inner.data_file.seek(SeekFrom::End(0))?;
        inner.data_file.write_all(&blob)?;
        inner.data_file.flush()?;

        inner
            .index_file
            .write_u64::<LittleEndian>(offset)?;
        inner
            .index_file
            .write_u32::<LittleEndian>(blob.len() as u32)?;
        inner.index_file.flush()?;

        inner.index.push(IndexEntry {
            offset,
            length: blob.len() as u32,
        });
        Ok(message_number)
    }

    /// Reads a single entry by message number.
    pub fn read(&self, message_number: u64) -> Result<MessageRecord> {
        let mut inner = self.inner.lock();
        let entry = *inner
            .index
            .get(message_number as usize)
            .ok_or_else(|| ErrorKind::NoSuchMessage(message_number))?;
        inner.read_at(entry)
    }

    /// Reads every entry, oldest first.
    pub fn read_all(&self) -> Result<Vec<MessageRecord>> {
        let mut inner = self.inner.lock();
        let entries: Vec<IndexEntry> = inner.index.clone();
        entries.iter().map(|e| inner.read_at(*e)).collect()
    }

    /// Rewrites a single existing entry (e.g. flipping a recipient's
    /// delivery status). The `.index` offset/length is unchanged; a fresh
    /// IV and MAC are generated so no IV is ever reused across distinct
    /// plaintexts under the same key.
    pub fn rewrite(&self, message_number: u64, record: &MessageRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = *inner
            .index
            .get(message_number as usize)
            .ok_or_else(|| ErrorKind::NoSuchMessage(message_number))?;

        let plaintext = rlp::encode(record);
        let (iv, ciphertext) = inner.encrypt(&plaintext);
        let mac = inner.mac(&ciphertext);

        let mut blob = Vec::with_capacity(IV_LEN + MAC_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&mac);
        blob.extend_from_slice(&ciphertext);

        if blob.len() as u32 != entry.length {
            return Err(ErrorKind::Corrupt(format!(
                "rewrite of message {message_number} changed encoded length from {} to {}",
                entry.length,
                blob.len()
            ))
            .into());
        }

        inner.data_file.seek(SeekFrom::Start(entry.offset))?;
        inner.data_file.write_all(&blob)?;
        inner.data_file.flush()?;
        Ok(())
    }
}

impl Inner {
    fn encrypt(&self, plaintext: &[u8]) -> ([u8; IV_LEN], Vec<u8>) {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let mut buffer = plaintext.to_vec();
        let key = GenericArray::from_slice(&self.cipher_key);
        let nonce = GenericArray::from_slice(&iv);
        let mut cipher = Aes128Ctr::new(key, nonce);
        cipher.apply_keystream(&mut buffer);
        (iv, buffer)
    }

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Vec<u8> {
        let mut buffer = ciphertext.to_vec();
        let key = GenericArray::from_slice(&self.cipher_key);
        let nonce = GenericArray::from_slice(iv);
        let mut cipher = Aes128Ctr::new(key, nonce);
        cipher.apply_keystream(&mut buffer);
        buffer
    }

    fn mac(&self, ciphertext: &[u8]) -> [u8; MAC_LEN] {
        let mut hasher = Keccak256::new();
        hasher.update(&self.mac_key);
        hasher.update(ciphertext);
        let digest = hasher.finalize();
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&digest);
        out
    }

    fn read_at(&mut self, entry: IndexEntry) -> Result<MessageRecord> {
        let mut blob = vec![0u8; entry.length as usize];
        self.data_file.seek(SeekFrom::Start(entry.offset))?;
        self.data_file.read_exact(&mut blob)?;

        if blob.len() < IV_LEN + MAC_LEN {
            return Err(ErrorKind::Corrupt("entry shorter than IV+MAC header".into()).into());
        }
        let (iv, rest) = blob.split_at(IV_LEN);
        let (mac, ciphertext) = rest.split_at(MAC_LEN);

        let expected_mac = self.mac(ciphertext);
        if expected_mac != mac {
            return Err(Error::from(ErrorKind::AuthenticationFailed));
        }

        let plaintext = self.decrypt(iv, ciphertext);
        rlp::decode(&plaintext)
            .map_err(|e| ErrorKind::Corrupt(format!("rlp decode failed: {e}")).into())
    }
}

fn read_index(file: &mut File) -> Result<Vec<IndexEntry>> {
    file.seek(SeekFrom::Start(0))?;
    let len = file.metadata()?.len();
    let count = (len / INDEX_RECORD_LEN) as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = file.read_u64::<LittleEndian>()?;
        let length = file.read_u32::<LittleEndian>()?;
        entries.push(IndexEntry { offset, length });
    }
    Ok(entries)
}
