use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use crate::errors::{ChainError, ChainResult};
use crate::types::BlockId;

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

const CF_STATES: &str = "states";
const CF_BODIES: &str = "bodies";
const CF_UNDO: &str = "undo";
const CF_METADATA: &str = "metadata";
const CF_UTXO: &str = "utxo";
const CF_KERNELS: &str = "kernels";

const TIP_KEY: &[u8] = b"tip";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const KDF_SEED_ID_KEY: &[u8] = b"kdf_seed_id";

/// Logical key families backing the chain state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    States,
    Bodies,
    Undo,
    Metadata,
    Utxo,
    Kernels,
}

impl Family {
    fn cf_name(self) -> &'static str {
        match self {
            Family::States => CF_STATES,
            Family::Bodies => CF_BODIES,
            Family::Undo => CF_UNDO,
            Family::Metadata => CF_METADATA,
            Family::Utxo => CF_UTXO,
            Family::Kernels => CF_KERNELS,
        }
    }

    fn all() -> [Family; 6] {
        [
            Family::States,
            Family::Bodies,
            Family::Undo,
            Family::Metadata,
            Family::Utxo,
            Family::Kernels,
        ]
    }
}

/// Keys under `states`, `bodies` and `undo` sort by height first.
pub fn block_key(id: &BlockId) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(&id.height.to_be_bytes());
    key.extend_from_slice(&id.hash);
    key
}

pub struct Store {
    db: DBWithThreadMode<MultiThreaded>,
}

impl Store {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = Family::all()
            .into_iter()
            .map(|family| ColumnFamilyDescriptor::new(family.cf_name(), Options::default()))
            .collect::<Vec<_>>();
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let store = Self { db };
        store.ensure_schema_supported()?;
        Ok(store)
    }

    fn cf(&self, family: Family) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db.cf_handle(family.cf_name()).ok_or_else(|| {
            ChainError::Config(format!("missing {} column family", family.cf_name()))
        })
    }

    fn ensure_schema_supported(&self) -> ChainResult<()> {
        match self.read_schema_version()? {
            Some(version) if version > STORAGE_SCHEMA_VERSION => Err(ChainError::Config(format!(
                "database schema version {version} is newer than supported {STORAGE_SCHEMA_VERSION}"
            ))),
            Some(version) if version < STORAGE_SCHEMA_VERSION => {
                Err(ChainError::MigrationRequired {
                    found: version,
                    required: STORAGE_SCHEMA_VERSION,
                })
            }
            Some(_) => Ok(()),
            None => {
                if self.is_empty()? {
                    self.write_schema_version(STORAGE_SCHEMA_VERSION)
                } else {
                    Err(ChainError::MigrationRequired {
                        found: 0,
                        required: STORAGE_SCHEMA_VERSION,
                    })
                }
            }
        }
    }

    fn is_empty(&self) -> ChainResult<bool> {
        let states = self.cf(Family::States)?;
        if self.db.iterator_cf(&states, IteratorMode::Start).next().transpose()?.is_some() {
            return Ok(false);
        }
        let metadata = self.cf(Family::Metadata)?;
        if self.db.get_cf(&metadata, TIP_KEY)?.is_some() {
            return Ok(false);
        }
        Ok(true)
    }

    fn read_schema_version(&self) -> ChainResult<Option<u32>> {
        let metadata = self.cf(Family::Metadata)?;
        match self.db.get_cf(&metadata, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid schema version encoding".into()))?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn write_schema_version(&self, version: u32) -> ChainResult<()> {
        let metadata = self.cf(Family::Metadata)?;
        self.db
            .put_cf(&metadata, SCHEMA_VERSION_KEY, version.to_be_bytes())?;
        Ok(())
    }

    pub fn schema_version(&self) -> ChainResult<u32> {
        Ok(self
            .read_schema_version()?
            .unwrap_or(STORAGE_SCHEMA_VERSION))
    }

    pub fn get(&self, family: Family, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        let cf = self.cf(family)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    /// Every row of a family, used to rebuild in-memory state on open.
    pub fn scan(&self, family: Family) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(family)?;
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = entry?;
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    pub fn read_tip(&self) -> ChainResult<Option<BlockId>> {
        match self.get(Family::Metadata, TIP_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn read_kdf_seed_id(&self) -> ChainResult<Option<Vec<u8>>> {
        self.get(Family::Metadata, KDF_SEED_ID_KEY)
    }

    /// Begin the outer transaction wrapping one externally triggered event.
    pub fn begin(&self) -> StoreTxn {
        StoreTxn {
            journal: Vec::new(),
            overlay: HashMap::new(),
        }
    }
}

/// Marker into a transaction's journal; rolling back to it discards every
/// write staged after it was taken.
#[derive(Clone, Copy, Debug)]
pub struct Savepoint(usize);

/// Staged writes for one event. Nothing touches the database until `commit`,
/// which flushes the overlay as a single atomic `WriteBatch`. The transaction
/// does not borrow the store; reads take it as an argument.
pub struct StoreTxn {
    journal: Vec<(Family, Vec<u8>, Option<Vec<u8>>)>,
    overlay: HashMap<(Family, Vec<u8>), Option<Vec<u8>>>,
}

impl StoreTxn {
    pub fn put(&mut self, family: Family, key: Vec<u8>, value: Vec<u8>) {
        self.journal
            .push((family, key.clone(), Some(value.clone())));
        self.overlay.insert((family, key), Some(value));
    }

    pub fn delete(&mut self, family: Family, key: Vec<u8>) {
        self.journal.push((family, key.clone(), None));
        self.overlay.insert((family, key), None);
    }

    pub fn get(&self, store: &Store, family: Family, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        if let Some(staged) = self.overlay.get(&(family, key.to_vec())) {
            return Ok(staged.clone());
        }
        store.get(family, key)
    }

    pub fn put_tip(&mut self, tip: &BlockId) -> ChainResult<()> {
        let bytes = bincode::serialize(tip)?;
        self.put(Family::Metadata, TIP_KEY.to_vec(), bytes);
        Ok(())
    }

    pub fn put_kdf_seed_id(&mut self, seed_id: &[u8]) {
        self.put(Family::Metadata, KDF_SEED_ID_KEY.to_vec(), seed_id.to_vec());
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.journal.len())
    }

    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        self.journal.truncate(savepoint.0);
        self.overlay.clear();
        for (family, key, value) in &self.journal {
            self.overlay.insert((*family, key.clone()), value.clone());
        }
    }

    pub fn commit(self, store: &Store) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        for ((family, key), value) in &self.overlay {
            let cf = store.cf(*family)?;
            match value {
                Some(value) => batch.put_cf(&cf, key, value),
                None => batch.delete_cf(&cf, key),
            }
        }
        store.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn staged_writes_are_invisible_until_commit() {
        let dir = tempdir().expect("temp dir");
        let store = Store::open(dir.path()).expect("open");

        let mut txn = store.begin();
        txn.put(Family::Metadata, b"a".to_vec(), vec![1]);
        assert_eq!(
            txn.get(&store, Family::Metadata, b"a").expect("get"),
            Some(vec![1])
        );
        assert_eq!(store.get(Family::Metadata, b"a").expect("get"), None);
        txn.commit(&store).expect("commit");
        assert_eq!(
            store.get(Family::Metadata, b"a").expect("get"),
            Some(vec![1])
        );
    }

    #[test]
    fn savepoints_discard_later_writes() {
        let dir = tempdir().expect("temp dir");
        let store = Store::open(dir.path()).expect("open");

        let mut txn = store.begin();
        txn.put(Family::Utxo, b"keep".to_vec(), vec![1]);
        let mark = txn.savepoint();
        txn.put(Family::Utxo, b"drop".to_vec(), vec![2]);
        txn.delete(Family::Utxo, b"keep".to_vec());
        txn.rollback_to(mark);
        assert_eq!(
            txn.get(&store, Family::Utxo, b"keep").expect("get"),
            Some(vec![1])
        );
        assert_eq!(txn.get(&store, Family::Utxo, b"drop").expect("get"), None);
        txn.commit(&store).expect("commit");
        assert_eq!(store.get(Family::Utxo, b"keep").expect("get"), Some(vec![1]));
        assert_eq!(store.get(Family::Utxo, b"drop").expect("get"), None);
    }

    #[test]
    fn schema_version_is_stamped_and_checked() {
        let dir = tempdir().expect("temp dir");
        {
            let store = Store::open(dir.path()).expect("open");
            assert_eq!(
                store.schema_version().expect("version"),
                STORAGE_SCHEMA_VERSION
            );
        }
        // reopening an already-stamped store succeeds
        Store::open(dir.path()).expect("reopen");
    }

    #[test]
    fn tip_round_trips() {
        let dir = tempdir().expect("temp dir");
        let store = Store::open(dir.path()).expect("open");
        assert!(store.read_tip().expect("tip").is_none());
        let tip = BlockId {
            height: 9,
            hash: [3u8; 32],
        };
        let mut txn = store.begin();
        txn.put_tip(&tip).expect("stage tip");
        txn.commit(&store).expect("commit");
        assert_eq!(store.read_tip().expect("tip"), Some(tip));
    }
}
