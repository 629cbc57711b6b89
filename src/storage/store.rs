//! Minimal key/value record store over the pager.
//!
//! Page 0 is the superblock (database header); every further page holds
//! variable-length record slots. This layer is deliberately simple (no
//! index, no balancing); it exists to drive pages through the journaling
//! hooks and to make recovery observable as key/value state.
//!
//! Record page layout:
//!
//! ```text
//! [0..4)   crc32 of bytes [4..PAGE_SIZE)
//! [4..6)   slot_count: u16
//! [6..8)   free_off: u16 (offset of the next free byte; 0 = untouched page)
//! [8..)    slots: [key_len: u16][val_len: u16][flags: u8][key][value]
//! ```
//!
//! At most one live slot exists per key: an insert tombstones the previous
//! slot before appending the new one.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuillError, Result};
use crate::storage::page::PAGE_SIZE;
use crate::storage::pager::Pager;
use crate::storage::wal::Log;

/// Magic bytes identifying a quilldb data file.
pub const DB_MAGIC: &[u8; 8] = b"QUILLDB\0";

/// Current data-file format version.
pub const DB_VERSION: u32 = 1;

const RECORD_PAGE_HEADER: usize = 8;
const SLOT_OVERHEAD: usize = 5;
const SLOT_TOMBSTONE: u8 = 1;

/// Database header stored in the superblock (page 0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHeader {
    /// Magic bytes for file identification.
    pub magic: [u8; 8],
    /// Data-file format version.
    pub version: u32,
    /// Database UUID for file identity.
    pub database_id: Uuid,
    /// Number of pages in the data file, superblock included.
    pub page_count: u32,
}

impl DatabaseHeader {
    /// Creates a new header with the given database ID.
    #[must_use]
    pub fn new(database_id: Uuid) -> Self {
        Self {
            magic: *DB_MAGIC,
            version: DB_VERSION,
            database_id,
            page_count: 1,
        }
    }

    /// Validates the header.
    ///
    /// # Errors
    ///
    /// Returns an error if the magic or version is wrong.
    pub fn validate(&self) -> Result<()> {
        if self.magic != *DB_MAGIC {
            return Err(QuillError::InvalidDatabaseFile(
                "bad superblock magic".into(),
            ));
        }
        if self.version > DB_VERSION {
            return Err(QuillError::UnsupportedVersion {
                version: self.version,
                max_supported: DB_VERSION,
            });
        }
        Ok(())
    }

    /// Serializes the header into a full superblock page:
    /// `[len: u32][crc32 of payload: u32][bincode payload]`, zero padded.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the header outgrows the
    /// page.
    pub fn to_page_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| QuillError::Storage(format!("Failed to serialize superblock: {e}")))?;
        if payload.len() + 8 > PAGE_SIZE {
            return Err(QuillError::Storage(
                "superblock does not fit in one page".into(),
            ));
        }

        let mut page = vec![0u8; PAGE_SIZE];
        page[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        page[4..8].copy_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        page[8..8 + payload.len()].copy_from_slice(&payload);
        Ok(page)
    }

    /// Deserializes a header from a superblock page.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Checksum`] on a payload checksum mismatch,
    /// [`QuillError::Corrupted`] if the page cannot be parsed.
    pub fn from_page_bytes(page: &[u8]) -> Result<Self> {
        if page.len() < 8 {
            return Err(QuillError::Corrupted("superblock page too short".into()));
        }
        let len = u32::from_le_bytes(page[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(page[4..8].try_into().unwrap());
        if len == 0 || 8 + len > page.len() {
            return Err(QuillError::Corrupted(format!(
                "superblock payload length {len} out of range"
            )));
        }
        let payload = &page[8..8 + len];
        if crc32fast::hash(payload) != crc {
            return Err(QuillError::Checksum("superblock payload".into()));
        }
        bincode::deserialize(payload)
            .map_err(|e| QuillError::Corrupted(format!("Failed to deserialize superblock: {e}")))
    }
}

/// The record store.
#[derive(Debug)]
pub struct KvStore {
    header: DatabaseHeader,
}

impl KvStore {
    /// Initializes a fresh store: allocates the superblock page and writes
    /// the header through the pager (journaled as a system mutation).
    ///
    /// # Errors
    ///
    /// Returns an error if allocation or the header write fails.
    pub fn create(pager: &Pager, mut log: Option<&mut Log>) -> Result<Self> {
        let header = DatabaseHeader::new(Uuid::new_v4());
        let store = Self { header };

        let offset = pager.allocate_page(log.as_deref_mut(), 0)?;
        debug_assert_eq!(offset, 0);
        store.save_header(pager, log, 0)?;
        Ok(store)
    }

    /// Loads the store from an existing data file.
    ///
    /// # Errors
    ///
    /// Returns an error if the superblock is missing, corrupt or of an
    /// unsupported version.
    pub fn open(pager: &Pager) -> Result<Self> {
        let page = pager.fetch(0)?;
        let header = DatabaseHeader::from_page_bytes(&page)?;
        header.validate()?;
        Ok(Self { header })
    }

    /// Returns the database UUID.
    #[must_use]
    pub fn database_id(&self) -> Uuid {
        self.header.database_id
    }

    /// Returns the number of pages the store believes the file has.
    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.header.page_count
    }

    /// Inserts or overwrites a key under the given transaction.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Storage`] if the record cannot fit in a page,
    /// or any journaling/IO failure.
    pub fn insert(
        &mut self,
        pager: &Pager,
        mut log: Option<&mut Log>,
        txn_id: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let need = SLOT_OVERHEAD + key.len() + value.len();
        if need > PAGE_SIZE - RECORD_PAGE_HEADER {
            return Err(QuillError::Storage(format!(
                "record of {need} bytes does not fit in a page"
            )));
        }

        // overwrite semantics: retire the previous slot first
        if let Some(slot) = self.find_live(pager, key)? {
            self.tombstone(pager, log.as_deref_mut(), txn_id, &slot)?;
        }

        // first record page with room wins; allocate when none has any
        let mut target = None;
        for idx in 1..self.header.page_count {
            let offset = u64::from(idx) * PAGE_SIZE as u64;
            let page = self.load_record_page(pager, offset)?;
            let free_off = record_free_off(&page);
            if PAGE_SIZE - free_off >= need {
                target = Some((offset, page));
                break;
            }
        }
        let (offset, mut page) = match target {
            Some(t) => t,
            None => {
                let offset = pager.allocate_page(log.as_deref_mut(), txn_id)?;
                self.header.page_count += 1;
                self.save_header(pager, log.as_deref_mut(), txn_id)?;
                let mut page = vec![0u8; PAGE_SIZE];
                page[6..8].copy_from_slice(&(RECORD_PAGE_HEADER as u16).to_le_bytes());
                (offset, page)
            }
        };

        let free_off = record_free_off(&page);
        let slot_count = u16::from_le_bytes(page[4..6].try_into().unwrap());
        let pos = free_off;
        page[pos..pos + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        page[pos + 2..pos + 4].copy_from_slice(&(value.len() as u16).to_le_bytes());
        page[pos + 4] = 0;
        page[pos + SLOT_OVERHEAD..pos + SLOT_OVERHEAD + key.len()].copy_from_slice(key);
        page[pos + SLOT_OVERHEAD + key.len()..pos + need].copy_from_slice(value);

        page[4..6].copy_from_slice(&(slot_count + 1).to_le_bytes());
        page[6..8].copy_from_slice(&((pos + need) as u16).to_le_bytes());
        seal_record_page(&mut page);

        pager.update(log, txn_id, offset, &page)
    }

    /// Looks up a key. Reads never touch the log.
    ///
    /// # Errors
    ///
    /// Returns an error on a disk read failure or page corruption.
    pub fn lookup(&self, pager: &Pager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.find_live(pager, key)?.map(|slot| slot.value))
    }

    /// Erases a key under the given transaction. Returns whether the key
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns any journaling or IO failure.
    pub fn erase(
        &mut self,
        pager: &Pager,
        log: Option<&mut Log>,
        txn_id: u64,
        key: &[u8],
    ) -> Result<bool> {
        match self.find_live(pager, key)? {
            Some(slot) => {
                self.tombstone(pager, log, txn_id, &slot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn save_header(&self, pager: &Pager, log: Option<&mut Log>, txn_id: u64) -> Result<()> {
        let page = self.header.to_page_bytes()?;
        pager.update(log, txn_id, 0, &page)
    }

    fn tombstone(
        &self,
        pager: &Pager,
        log: Option<&mut Log>,
        txn_id: u64,
        slot: &SlotRef,
    ) -> Result<()> {
        let mut page = self.load_record_page(pager, slot.page_offset)?;
        page[slot.flag_pos] = SLOT_TOMBSTONE;
        seal_record_page(&mut page);
        pager.update(log, txn_id, slot.page_offset, &page)
    }

    fn find_live(&self, pager: &Pager, key: &[u8]) -> Result<Option<SlotRef>> {
        let mut found = None;
        for idx in 1..self.header.page_count {
            let page_offset = u64::from(idx) * PAGE_SIZE as u64;
            let page = self.load_record_page(pager, page_offset)?;
            each_slot(&page, |pos, slot_key, value, live| {
                if live && slot_key == key {
                    found = Some(SlotRef {
                        page_offset,
                        flag_pos: pos + 4,
                        value: value.to_vec(),
                    });
                }
            })?;
        }
        Ok(found)
    }

    /// Fetches a record page, verifying its checksum unless the page is
    /// still untouched (all-zero, as produced by allocation).
    fn load_record_page(&self, pager: &Pager, offset: u64) -> Result<Vec<u8>> {
        let mut page = pager.fetch(offset)?;
        let free_off = u16::from_le_bytes(page[6..8].try_into().unwrap());
        if free_off == 0 {
            page[6..8].copy_from_slice(&(RECORD_PAGE_HEADER as u16).to_le_bytes());
            return Ok(page);
        }
        let stored = u32::from_le_bytes(page[0..4].try_into().unwrap());
        if crc32fast::hash(&page[4..]) != stored {
            return Err(QuillError::Checksum(format!(
                "record page at offset {offset}"
            )));
        }
        Ok(page)
    }
}

struct SlotRef {
    page_offset: u64,
    flag_pos: usize,
    value: Vec<u8>,
}

fn record_free_off(page: &[u8]) -> usize {
    u16::from_le_bytes(page[6..8].try_into().unwrap()) as usize
}

fn seal_record_page(page: &mut [u8]) {
    let crc = crc32fast::hash(&page[4..]);
    page[0..4].copy_from_slice(&crc.to_le_bytes());
}

fn each_slot(
    page: &[u8],
    mut f: impl FnMut(usize, &[u8], &[u8], bool),
) -> Result<()> {
    let slot_count = u16::from_le_bytes(page[4..6].try_into().unwrap()) as usize;
    let free_off = record_free_off(page);
    if free_off < RECORD_PAGE_HEADER || free_off > PAGE_SIZE {
        return Err(QuillError::Corrupted(format!(
            "record page free offset {free_off} out of range"
        )));
    }

    let mut pos = RECORD_PAGE_HEADER;
    for _ in 0..slot_count {
        if pos + SLOT_OVERHEAD > free_off {
            return Err(QuillError::Corrupted("record slot past free space".into()));
        }
        let key_len = u16::from_le_bytes(page[pos..pos + 2].try_into().unwrap()) as usize;
        let val_len = u16::from_le_bytes(page[pos + 2..pos + 4].try_into().unwrap()) as usize;
        let live = page[pos + 4] != SLOT_TOMBSTONE;
        let end = pos + SLOT_OVERHEAD + key_len + val_len;
        if end > free_off {
            return Err(QuillError::Corrupted("record slot overruns page".into()));
        }
        let key = &page[pos + SLOT_OVERHEAD..pos + SLOT_OVERHEAD + key_len];
        let value = &page[pos + SLOT_OVERHEAD + key_len..end];
        f(pos, key, value, live);
        pos = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (Pager, KvStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test.db");
        let pager = Pager::create(&path).unwrap();
        let store = KvStore::create(&pager, None).unwrap();
        (pager, store, temp)
    }

    #[test]
    fn test_header_page_roundtrip() {
        let header = DatabaseHeader::new(Uuid::new_v4());
        let page = header.to_page_bytes().unwrap();
        assert_eq!(page.len(), PAGE_SIZE);

        let decoded = DatabaseHeader::from_page_bytes(&page).unwrap();
        decoded.validate().unwrap();
        assert_eq!(decoded.database_id, header.database_id);
        assert_eq!(decoded.page_count, 1);
    }

    #[test]
    fn test_header_rejects_corruption() {
        let header = DatabaseHeader::new(Uuid::new_v4());
        let mut page = header.to_page_bytes().unwrap();
        page[20] ^= 0xFF;
        assert!(matches!(
            DatabaseHeader::from_page_bytes(&page),
            Err(QuillError::Checksum(_))
        ));
    }

    #[test]
    fn test_insert_and_lookup() {
        let (pager, mut store, _temp) = setup();

        store.insert(&pager, None, 1, b"x", b"2").unwrap();
        store.insert(&pager, None, 1, b"y", b"3").unwrap();

        assert_eq!(store.lookup(&pager, b"x").unwrap().as_deref(), Some(&b"2"[..]));
        assert_eq!(store.lookup(&pager, b"y").unwrap().as_deref(), Some(&b"3"[..]));
        assert_eq!(store.lookup(&pager, b"z").unwrap(), None);
    }

    #[test]
    fn test_insert_overwrites() {
        let (pager, mut store, _temp) = setup();

        store.insert(&pager, None, 1, b"x", b"old").unwrap();
        store.insert(&pager, None, 2, b"x", b"new").unwrap();

        assert_eq!(
            store.lookup(&pager, b"x").unwrap().as_deref(),
            Some(&b"new"[..])
        );
    }

    #[test]
    fn test_erase() {
        let (pager, mut store, _temp) = setup();

        store.insert(&pager, None, 1, b"x", b"2").unwrap();
        assert!(store.erase(&pager, None, 2, b"x").unwrap());
        assert_eq!(store.lookup(&pager, b"x").unwrap(), None);
        assert!(!store.erase(&pager, None, 3, b"x").unwrap());
    }

    #[test]
    fn test_records_spill_to_new_pages() {
        let (pager, mut store, _temp) = setup();

        let value = vec![7u8; 1024];
        for i in 0..20u32 {
            store
                .insert(&pager, None, 1, &i.to_le_bytes(), &value)
                .unwrap();
        }
        assert!(store.page_count() > 2);

        for i in 0..20u32 {
            assert_eq!(
                store.lookup(&pager, &i.to_le_bytes()).unwrap().as_deref(),
                Some(&value[..])
            );
        }
    }

    #[test]
    fn test_rejects_oversized_record() {
        let (pager, mut store, _temp) = setup();
        let huge = vec![0u8; PAGE_SIZE];
        let err = store.insert(&pager, None, 1, b"k", &huge).unwrap_err();
        assert!(matches!(err, QuillError::Storage(_)));
    }

    #[test]
    fn test_store_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test.db");
        let id;
        {
            let pager = Pager::create(&path).unwrap();
            let mut store = KvStore::create(&pager, None).unwrap();
            store.insert(&pager, None, 1, b"a", b"b").unwrap();
            pager.flush_all(None).unwrap();
            pager.sync().unwrap();
            id = store.database_id();
        }
        {
            let pager = Pager::open(&path).unwrap();
            let store = KvStore::open(&pager).unwrap();
            assert_eq!(store.database_id(), id);
            assert_eq!(store.lookup(&pager, b"a").unwrap().as_deref(), Some(&b"b"[..]));
        }
    }
}
