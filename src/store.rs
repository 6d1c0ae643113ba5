// Record store: JSON slot as source of truth, SQLite lookup index alongside

use crate::filter::Filter;
use crate::record::Record;
use crate::slot::{self, SlotContents, SlotLock, SlotState};
use eyre::{Context, Result, eyre};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CURRENT_VERSION: u32 = 1;
const STORE_DIR: &str = ".ufi";
const DB_FILE: &str = "ufi.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle returned by [`Store::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ChangeCallback<R> = Box<dyn FnMut(&[R])>;

/// Ordered, append-only store of one record type
///
/// Every instance is its own execution context: its writes are visible to
/// other instances opened on the same directory, which learn about them
/// through [`Store::poll_changes`].
pub struct Store<R: Record> {
    base_path: PathBuf,
    db: Connection,
    /// Slot digest as this instance last wrote or observed it
    last_seen: String,
    subscribers: Vec<(SubscriptionId, ChangeCallback<R>)>,
    next_subscription: u64,
}

impl<R: Record> Store<R> {
    /// Open or create a store at the given path
    ///
    /// The store will be created in a `.ufi` subdirectory of the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::validate_slot_name(R::slot_name())?;

        let base_path = path.as_ref().join(STORE_DIR);

        // Create directory if it doesn't exist
        fs::create_dir_all(&base_path).context("Failed to create store directory")?;

        // Open SQLite database
        let db_path = base_path.join(DB_FILE);
        let db = Connection::open(&db_path).context("Failed to open SQLite database")?;
        db.busy_timeout(BUSY_TIMEOUT)?;

        let mut store = Self {
            base_path,
            db,
            last_seen: String::new(),
            subscribers: Vec::new(),
            next_subscription: 0,
        };

        store.create_schema()?;
        store.create_gitignore()?;
        store.write_version()?;

        if store.is_stale()? {
            info!(slot = R::slot_name(), "Lookup index is stale, syncing from slot");
            store.sync()?;
        }

        store.last_seen = slot::current_digest(&store.slot_path())?;

        Ok(store)
    }

    /// Get the base path of this store
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path of the JSON file holding this store's records
    pub fn slot_path(&self) -> PathBuf {
        self.base_path.join(format!("{}.json", R::slot_name()))
    }

    fn lock_path(&self) -> PathBuf {
        self.base_path.join(format!("{}.lock", R::slot_name()))
    }

    /// Create database schema
    fn create_schema(&self) -> Result<()> {
        debug!("Creating database schema");

        self.db.execute_batch(
            r#"
            -- One row per record, in slot order
            CREATE TABLE IF NOT EXISTS records (
                slot TEXT NOT NULL,
                position INTEGER NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                PRIMARY KEY (slot, position)
            );

            CREATE INDEX IF NOT EXISTS idx_records_id ON records(slot, id, position);

            -- Indexed fields for filtering
            CREATE TABLE IF NOT EXISTS record_indexes (
                slot TEXT NOT NULL,
                position INTEGER NOT NULL,
                field_name TEXT NOT NULL,
                field_value TEXT NOT NULL,
                PRIMARY KEY (slot, position, field_name)
            );

            CREATE INDEX IF NOT EXISTS idx_record_indexes_field ON record_indexes(slot, field_name, field_value);

            -- Digest of the slot the index was last built from
            CREATE TABLE IF NOT EXISTS sync_metadata (
                slot TEXT PRIMARY KEY,
                last_sync_time INTEGER NOT NULL,
                digest TEXT NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    /// Create .gitignore file
    fn create_gitignore(&self) -> Result<()> {
        let gitignore_path = self.base_path.join(".gitignore");
        if !gitignore_path.exists() {
            fs::write(
                gitignore_path,
                "ufi.db\nufi.db-shm\nufi.db-wal\n*.lock\n*.tmp\n*.corrupt-*\n",
            )?;
        }
        Ok(())
    }

    /// Write version file
    fn write_version(&self) -> Result<()> {
        let version_path = self.base_path.join(".version");
        if !version_path.exists() {
            fs::write(version_path, CURRENT_VERSION.to_string())?;
        }
        Ok(())
    }

    fn synced_digest(&self) -> Result<Option<String>> {
        Self::synced_digest_tx(&self.db)
    }

    fn synced_digest_tx(conn: &Connection) -> Result<Option<String>> {
        let digest = conn
            .query_row(
                "SELECT digest FROM sync_metadata WHERE slot = ?1",
                [R::slot_name()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(digest)
    }

    /// Check if the lookup index needs rebuilding from the slot
    ///
    /// Returns true if the slot changed since the last sync, or was never synced.
    pub fn is_stale(&self) -> Result<bool> {
        let current = slot::current_digest(&self.slot_path())?;
        Ok(self.synced_digest()?.as_deref() != Some(current.as_str()))
    }

    // ========================================================================
    // Store operations
    // ========================================================================

    /// Append a record to the end of the sequence
    pub fn append(&mut self, record: R) -> Result<()> {
        self.append_with(|_| Ok(record))?;
        Ok(())
    }

    /// Append a record built from the latest sequence
    ///
    /// `build` runs while the slot lock is held, so nothing another context
    /// writes can slip in between what it sees and what gets written.
    pub fn append_with<F>(&mut self, build: F) -> Result<R>
    where
        F: FnOnce(&[R]) -> Result<R>,
    {
        let slot_path = self.slot_path();
        let _lock = SlotLock::acquire(&self.lock_path())?;

        let current: SlotContents<R> = slot::read_slot(&slot_path)?;

        if current.digest != self.last_seen {
            debug!(slot = R::slot_name(), "Slot changed in another context before append");
            self.notify(&current.records);
            self.last_seen = current.digest.clone();
        }

        let record = build(&current.records)?;

        if current.state == SlotState::Malformed {
            slot::backup_malformed(&slot_path)?;
        }

        let previous_digest = current.digest;
        let mut records = current.records;
        records.push(record.clone());
        let digest = slot::write_slot(&slot_path, &records)?;
        self.last_seen = digest.clone();

        // The slot is the source of truth; a stale index is rebuilt on the next read
        if let Err(e) = self.index_appended(&previous_digest, &records, &digest) {
            warn!(slot = R::slot_name(), id = record.id(), error = ?e, "Failed to update lookup index after append");
        }

        debug!(slot = R::slot_name(), id = record.id(), count = records.len(), "Appended record");
        Ok(record)
    }

    fn index_appended(&mut self, previous_digest: &str, records: &[R], digest: &str) -> Result<()> {
        // Check and update share one transaction so a concurrent rebuild cannot land in between
        let tx = self.db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if Self::synced_digest_tx(&tx)?.as_deref() == Some(previous_digest) {
            if let Some(record) = records.last() {
                Self::insert_row_tx(&tx, records.len() - 1, record)?;
            }
            Self::mark_synced_tx(&tx, digest)?;
        } else {
            Self::rebuild_tx(&tx, records, digest)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// First record in sequence order whose id equals `id`
    ///
    /// A miss is `Ok(None)`, never an error.
    pub fn find_by_id(&mut self, id: &str) -> Result<Option<R>> {
        self.refresh()?;

        let json: Option<String> = self
            .db
            .query_row(
                "SELECT data_json FROM records WHERE slot = ?1 AND id = ?2 ORDER BY position LIMIT 1",
                rusqlite::params![R::slot_name(), id],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => {
                let record: R = serde_json::from_str(&json).context("Failed to deserialize record from database")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Whether any record carries this id
    pub fn contains_id(&mut self, id: &str) -> Result<bool> {
        self.refresh()?;

        let found: Option<i64> = self
            .db
            .query_row(
                "SELECT 1 FROM records WHERE slot = ?1 AND id = ?2 LIMIT 1",
                rusqlite::params![R::slot_name(), id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The full sequence, in append order
    pub fn records(&mut self) -> Result<Vec<R>> {
        self.list(&[])
    }

    /// Number of records in the sequence
    pub fn len(&mut self) -> Result<usize> {
        self.refresh()?;

        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM records WHERE slot = ?1",
            [R::slot_name()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// List records matching every filter, in append order
    pub fn list(&mut self, filters: &[Filter]) -> Result<Vec<R>> {
        self.refresh()?;

        let mut query = String::from("SELECT r.data_json FROM records r WHERE r.slot = ?1");
        let mut params = vec![R::slot_name().to_string()];

        for (i, filter) in filters.iter().enumerate() {
            Self::validate_field_name(&filter.field)?;

            let alias = format!("idx{}", i);
            let escape = if filter.op == crate::filter::FilterOp::Contains {
                " ESCAPE '\\'"
            } else {
                ""
            };
            query.push_str(&format!(
                " AND EXISTS (
                    SELECT 1 FROM record_indexes {a}
                    WHERE {a}.slot = r.slot
                      AND {a}.position = r.position
                      AND {a}.field_name = ?{}
                      AND {a}.field_value {} ?{}{})",
                params.len() + 1,
                filter.op.to_sql(),
                params.len() + 2,
                escape,
                a = alias,
            ));

            params.push(filter.field.clone());
            params.push(filter.bind_value());
        }

        query.push_str(" ORDER BY r.position");

        let mut stmt = self.db.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for row_result in rows {
            let data_json = row_result?;
            let record: R = serde_json::from_str(&data_json).context("Failed to deserialize record")?;
            results.push(record);
        }

        Ok(results)
    }

    // ========================================================================
    // Change notification
    // ========================================================================

    /// Register a callback for slot changes made by other contexts
    ///
    /// The callback receives the whole new sequence. This instance's own
    /// writes never trigger it.
    pub fn subscribe<F>(&mut self, on_change: F) -> SubscriptionId
    where
        F: FnMut(&[R]) + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(on_change)));
        id
    }

    /// Remove a callback; returns false if it was not registered
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    /// Check the slot for writes by other contexts and notify subscribers
    ///
    /// Returns true if a change was delivered.
    pub fn poll_changes(&mut self) -> Result<bool> {
        let current: SlotContents<R> = slot::read_slot(&self.slot_path())?;
        if current.digest == self.last_seen {
            return Ok(false);
        }

        debug!(slot = R::slot_name(), count = current.records.len(), "Slot changed in another context");

        if self.synced_digest()?.as_deref() != Some(current.digest.as_str()) {
            self.rebuild_index(&current.records, &current.digest)?;
        }

        self.last_seen = current.digest;
        self.notify(&current.records);
        Ok(true)
    }

    fn notify(&mut self, records: &[R]) {
        for (_, callback) in self.subscribers.iter_mut() {
            callback(records);
        }
    }

    // ========================================================================
    // Index maintenance
    // ========================================================================

    /// Rebuild the lookup index from the slot
    pub fn sync(&mut self) -> Result<usize> {
        let current: SlotContents<R> = slot::read_slot(&self.slot_path())?;
        self.rebuild_index(&current.records, &current.digest)?;
        Ok(current.records.len())
    }

    fn refresh(&mut self) -> Result<()> {
        if self.is_stale()? {
            self.sync()?;
        }
        Ok(())
    }

    fn rebuild_index(&mut self, records: &[R], digest: &str) -> Result<()> {
        let tx = self.db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::rebuild_tx(&tx, records, digest)?;
        tx.commit()?;
        Ok(())
    }

    fn rebuild_tx(tx: &Transaction, records: &[R], digest: &str) -> Result<()> {
        let slot = R::slot_name();
        info!(slot, count = records.len(), "Rebuilding lookup index");

        tx.execute("DELETE FROM record_indexes WHERE slot = ?1", [slot])?;
        tx.execute("DELETE FROM records WHERE slot = ?1", [slot])?;

        for (position, record) in records.iter().enumerate() {
            Self::insert_row_tx(tx, position, record)?;
        }

        Self::mark_synced_tx(tx, digest)
    }

    fn insert_row_tx(tx: &Transaction, position: usize, record: &R) -> Result<()> {
        let slot = R::slot_name();
        let position = position as i64;
        let data_json = serde_json::to_string(record).context("Failed to serialize record")?;

        tx.execute(
            "INSERT OR REPLACE INTO records (slot, position, id, data_json) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![slot, position, record.id(), data_json],
        )?;

        tx.execute(
            "DELETE FROM record_indexes WHERE slot = ?1 AND position = ?2",
            rusqlite::params![slot, position],
        )?;

        for (field_name, value) in record.indexed_fields() {
            Self::validate_field_name(&field_name)?;
            tx.execute(
                "INSERT INTO record_indexes (slot, position, field_name, field_value) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![slot, position, field_name, value],
            )?;
        }

        Ok(())
    }

    fn mark_synced_tx(tx: &Transaction, digest: &str) -> Result<()> {
        tx.execute(
            "INSERT OR REPLACE INTO sync_metadata (slot, last_sync_time, digest) VALUES (?1, ?2, ?3)",
            rusqlite::params![R::slot_name(), now_ms(), digest],
        )?;
        Ok(())
    }

    fn validate_slot_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(eyre!("Slot name cannot be empty"));
        }
        if name.len() > 64 {
            return Err(eyre!("Slot name too long: {} (max 64 chars)", name));
        }
        if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(eyre!("Invalid slot name: {} (must be alphanumeric with _/-)", name));
        }
        Ok(())
    }

    fn validate_field_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(eyre!("Field name cannot be empty"));
        }
        if name.len() > 64 {
            return Err(eyre!("Field name too long: {} (max 64 chars)", name));
        }
        if !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(eyre!("Invalid field name: {} (must be alphanumeric with _)", name));
        }
        Ok(())
    }
}

// Helper function for timestamps
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FarmerRecord;
    use serde::{Deserialize, Serialize};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn farmer(id: &str, name: &str, village: &str, crop: &str) -> FarmerRecord {
        FarmerRecord {
            name: name.to_string(),
            phone: "9876543210".to_string(),
            village: village.to_string(),
            crop: crop.to_string(),
            land: "2 acres".to_string(),
            kvk: None,
            id: id.to_string(),
        }
    }

    #[test]
    fn test_store_open_creates_directory() {
        let temp = TempDir::new().unwrap();

        let _store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        let store_path = temp.path().join(".ufi");
        assert!(store_path.exists());
        assert!(store_path.join("ufi.db").exists());
        assert!(store_path.join(".gitignore").exists());
        assert!(store_path.join(".version").exists());
        // Nothing written until the first append
        assert!(!store_path.join("farmers.json").exists());
    }

    #[test]
    fn test_append_then_find() {
        let temp = TempDir::new().unwrap();
        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();

        let record = farmer("UFI-7K2M9QX1AB", "Ramesh", "X", "Wheat");
        store.append(record.clone()).unwrap();

        let found = store.find_by_id("UFI-7K2M9QX1AB").unwrap();
        assert_eq!(found, Some(record));
    }

    #[test]
    fn test_find_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        store.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();

        assert!(store.find_by_id("UFI-NOPE").unwrap().is_none());
    }

    #[test]
    fn test_sequential_appends_keep_both() {
        let temp = TempDir::new().unwrap();
        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();

        store.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();
        store.append(farmer("UFI-B", "Suresh", "Y", "Rice")).unwrap();

        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "UFI-A");
        assert_eq!(records[1].id, "UFI-B");
        assert!(store.find_by_id("UFI-A").unwrap().is_some());
    }

    #[test]
    fn test_slot_is_plain_json_array() {
        let temp = TempDir::new().unwrap();
        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        store.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();

        let raw = fs::read_to_string(store.slot_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let array = value.as_array().unwrap();
        assert_eq!(array.len(), 1);
        assert_eq!(array[0]["id"], "UFI-A");
        assert_eq!(array[0]["name"], "Ramesh");
    }

    #[test]
    fn test_duplicate_ids_first_wins() {
        let temp = TempDir::new().unwrap();
        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();

        store.append(farmer("UFI-DUP", "First", "X", "Wheat")).unwrap();
        store.append(farmer("UFI-DUP", "Second", "X", "Wheat")).unwrap();

        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.find_by_id("UFI-DUP").unwrap().unwrap().name, "First");
    }

    #[test]
    fn test_empty_array_slot() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(".ufi")).unwrap();
        fs::write(temp.path().join(".ufi/farmers.json"), "[]").unwrap();

        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        assert!(store.find_by_id("UFI-A").unwrap().is_none());

        store.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();
        assert_eq!(store.records().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_slot_reads_empty_and_is_backed_up() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join(".ufi");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("farmers.json"), "not json at all").unwrap();

        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        assert!(store.find_by_id("UFI-A").unwrap().is_none());
        assert!(store.is_empty().unwrap());

        store.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();
        let records = store.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "UFI-A");

        let backups: Vec<_> = fs::read_dir(&base)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("farmers.json.corrupt-"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(backups[0].path()).unwrap(), "not json at all");
    }

    #[test]
    fn test_external_slot_edit_is_picked_up() {
        let temp = TempDir::new().unwrap();
        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        store.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();

        // Another tool rewrites the slot directly
        let replacement = vec![farmer("UFI-Z", "Zoya", "Q", "Cotton")];
        fs::write(store.slot_path(), serde_json::to_string(&replacement).unwrap()).unwrap();

        assert!(store.is_stale().unwrap());
        assert!(store.find_by_id("UFI-A").unwrap().is_none());
        assert_eq!(store.find_by_id("UFI-Z").unwrap().unwrap().name, "Zoya");
        assert!(!store.is_stale().unwrap());
    }

    #[test]
    fn test_list_with_filters() {
        let temp = TempDir::new().unwrap();
        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();

        store.append(farmer("UFI-A", "Ramesh Patil", "Khedgaon", "Wheat")).unwrap();
        store.append(farmer("UFI-B", "Suresh", "Khedgaon", "Rice")).unwrap();
        store.append(farmer("UFI-C", "Ramesh Jadhav", "Nandgaon", "Wheat")).unwrap();

        let in_village = store.list(&[Filter::eq("village", "Khedgaon")]).unwrap();
        assert_eq!(in_village.len(), 2);

        let wheat_in_village = store
            .list(&[Filter::eq("village", "Khedgaon"), Filter::eq("crop", "Wheat")])
            .unwrap();
        assert_eq!(wheat_in_village.len(), 1);
        assert_eq!(wheat_in_village[0].id, "UFI-A");

        let named = store.list(&[Filter::contains("name", "ramesh")]).unwrap();
        let ids: Vec<_> = named.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["UFI-A", "UFI-C"]);

        let not_wheat = store
            .list(&[Filter::ne("crop", "Wheat")])
            .unwrap();
        assert_eq!(not_wheat.len(), 1);
        assert_eq!(not_wheat[0].id, "UFI-B");
    }

    #[test]
    fn test_list_rejects_bad_field_name() {
        let temp = TempDir::new().unwrap();
        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();

        assert!(store.list(&[Filter::eq("village; DROP TABLE records", "x")]).is_err());
    }

    #[test]
    fn test_own_writes_do_not_notify() {
        let temp = TempDir::new().unwrap();
        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();

        let calls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&calls);
        store.subscribe(move |_| *counter.borrow_mut() += 1);

        store.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();
        assert!(!store.poll_changes().unwrap());
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn test_other_context_write_notifies() {
        let temp = TempDir::new().unwrap();
        let mut watcher: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        let mut writer: Store<FarmerRecord> = Store::open(temp.path()).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        watcher.subscribe(move |records: &[FarmerRecord]| {
            sink.borrow_mut().push(records.iter().map(|r| r.id.clone()).collect::<Vec<_>>());
        });

        writer.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();

        assert!(watcher.poll_changes().unwrap());
        assert!(!watcher.poll_changes().unwrap());
        assert_eq!(*seen.borrow(), vec![vec!["UFI-A".to_string()]]);
        assert_eq!(watcher.find_by_id("UFI-A").unwrap().unwrap().name, "Ramesh");
    }

    #[test]
    fn test_append_delivers_pending_external_change() {
        let temp = TempDir::new().unwrap();
        let mut first: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        let mut second: Store<FarmerRecord> = Store::open(temp.path()).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        first.subscribe(move |records: &[FarmerRecord]| sink.borrow_mut().push(records.len()));

        second.append(farmer("UFI-B", "Suresh", "Y", "Rice")).unwrap();
        first.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();

        // The other context's record arrived before the local write, and survived it
        assert_eq!(*seen.borrow(), vec![1]);
        let ids: Vec<_> = first.records().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["UFI-B", "UFI-A"]);
        assert!(!first.poll_changes().unwrap());
    }

    #[test]
    fn test_unsubscribe() {
        let temp = TempDir::new().unwrap();
        let mut watcher: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        let mut writer: Store<FarmerRecord> = Store::open(temp.path()).unwrap();

        let calls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&calls);
        let id = watcher.subscribe(move |_| *counter.borrow_mut() += 1);

        assert!(watcher.unsubscribe(id));
        assert!(!watcher.unsubscribe(id));

        writer.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();
        assert!(watcher.poll_changes().unwrap());
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn test_concurrent_appends_lose_nothing() {
        let temp = TempDir::new().unwrap();
        let base_path = temp.path().to_path_buf();
        let _: Store<FarmerRecord> = Store::open(&base_path).unwrap();

        let num_threads = 8;
        let per_thread = 5;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let barrier = Arc::clone(&barrier);
                let base_path = base_path.clone();
                thread::spawn(move || {
                    let mut store: Store<FarmerRecord> = Store::open(&base_path).unwrap();
                    barrier.wait();
                    for i in 0..per_thread {
                        let id = format!("UFI-T{}-{}", t, i);
                        store.append(farmer(&id, "Worker", "X", "Wheat")).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut store: Store<FarmerRecord> = Store::open(&base_path).unwrap();
        assert_eq!(store.len().unwrap(), num_threads * per_thread);
        assert!(store.find_by_id("UFI-T3-4").unwrap().is_some());
    }

    #[test]
    fn test_append_survives_locked_index() {
        let temp = TempDir::new().unwrap();
        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();

        let calls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&calls);
        store.subscribe(move |_| *counter.borrow_mut() += 1);

        // Another connection holds the index database for the whole append
        let blocker = Connection::open(temp.path().join(".ufi/ufi.db")).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();
        let result = store.append(farmer("UFI-A", "Ramesh", "X", "Wheat"));
        blocker.execute_batch("COMMIT").unwrap();

        assert!(result.is_ok());
        assert!(!store.poll_changes().unwrap());
        assert_eq!(*calls.borrow(), 0);
        assert_eq!(store.find_by_id("UFI-A").unwrap().unwrap().name, "Ramesh");
    }

    #[test]
    fn test_failed_build_leaves_malformed_slot_alone() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join(".ufi");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("farmers.json"), "not json at all").unwrap();

        let mut store: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        for _ in 0..2 {
            let result = store.append_with(|_| Err(eyre!("no unused id")));
            assert!(result.is_err());
        }

        let backups = fs::read_dir(&base)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("farmers.json.corrupt-"))
            .count();
        assert_eq!(backups, 0);
        assert_eq!(fs::read_to_string(base.join("farmers.json")).unwrap(), "not json at all");
    }

    // Generic record type living in its own slot
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestRecord {
        id: String,
        status: String,
    }

    impl Record for TestRecord {
        fn id(&self) -> &str {
            &self.id
        }

        fn slot_name() -> &'static str {
            "test_records"
        }

        fn indexed_fields(&self) -> HashMap<String, String> {
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), self.status.clone());
            fields
        }
    }

    #[test]
    fn test_slots_are_independent() {
        let temp = TempDir::new().unwrap();
        let mut farmers: Store<FarmerRecord> = Store::open(temp.path()).unwrap();
        let mut tests: Store<TestRecord> = Store::open(temp.path()).unwrap();

        farmers.append(farmer("UFI-A", "Ramesh", "X", "Wheat")).unwrap();
        tests
            .append(TestRecord {
                id: "UFI-A".to_string(),
                status: "active".to_string(),
            })
            .unwrap();

        assert_eq!(farmers.len().unwrap(), 1);
        assert_eq!(tests.len().unwrap(), 1);
        assert_eq!(tests.list(&[Filter::eq("status", "active")]).unwrap().len(), 1);
        assert!(temp.path().join(".ufi/test_records.json").exists());
    }

    #[test]
    fn test_validation_slot_name() {
        assert!(Store::<TestRecord>::validate_slot_name("valid_name").is_ok());
        assert!(Store::<TestRecord>::validate_slot_name("valid-name").is_ok());

        assert!(Store::<TestRecord>::validate_slot_name("invalid/name").is_err());
        assert!(Store::<TestRecord>::validate_slot_name("").is_err());
        assert!(Store::<TestRecord>::validate_slot_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_validation_field_name() {
        assert!(Store::<TestRecord>::validate_field_name("valid_field").is_ok());

        assert!(Store::<TestRecord>::validate_field_name("invalid-field").is_err());
        assert!(Store::<TestRecord>::validate_field_name("").is_err());
        assert!(Store::<TestRecord>::validate_field_name(&"a".repeat(65)).is_err());
    }
}
