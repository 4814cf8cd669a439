//! Persistent store - collections, requests, history and settings in SQLite
//!
//! Each record is kept as a JSON document in a `data` column, with the
//! fields we query on (owning collection, execution time) lifted into
//! indexed columns. Every public write is a single transaction.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::models::{
    Collection, CollectionItem, HistoryEntry, Request, SearchKind, SearchResult, Settings,
};

pub type Result<T> = std::result::Result<T, StoreError>;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Current on-disk schema, tracked in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
    CREATE TABLE IF NOT EXISTS collections (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        data TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS requests (
        id TEXT PRIMARY KEY,
        collection_id TEXT,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        data TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_requests_collection ON requests(collection_id);
    CREATE TABLE IF NOT EXISTS history (
        id TEXT PRIMARY KEY,
        executed_at INTEGER NOT NULL,
        data TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_history_executed_at ON history(executed_at);
    CREATE TABLE IF NOT EXISTS settings (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );
";

/// Local record store
pub struct Store {
    conn: Connection,
}

fn decode<T: DeserializeOwned>(data: String) -> Result<T> {
    Ok(serde_json::from_str(&data)?)
}

impl Store {
    /// Open (or create) the database file, migrating it to the current schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        tracing::info!(path = %path.display(), "Opened store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut store = Store { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&mut self) -> Result<()> {
        let found = self.schema_version()?;
        if found > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                found,
                supported: SCHEMA_VERSION,
            });
        }
        if found == SCHEMA_VERSION {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        if found < 1 {
            tx.execute_batch(SCHEMA_V1)?;
        }
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tx.commit()?;
        tracing::info!(from = found, to = SCHEMA_VERSION, "Migrated store schema");
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, table: &'static str, id: &str) -> Result<Option<T>> {
        let sql = format!("SELECT data FROM {} WHERE id = ?1", table);
        self.conn
            .query_row(&sql, params![id], |row| row.get::<_, String>(0))
            .optional()?
            .map(decode)
            .transpose()
    }

    fn get_records<T: DeserializeOwned>(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for data in rows {
            out.push(decode(data?)?);
        }
        Ok(out)
    }

    // ---- collections ----

    pub fn put_collection(&self, collection: &Collection) -> Result<()> {
        put_collection_in(&self.conn, collection)?;
        tracing::debug!(id = %collection.id, "Saved collection");
        Ok(())
    }

    /// Save a collection together with its requests. Either all of them
    /// land or none do.
    pub fn import_collection(&mut self, collection: &Collection, requests: &[Request]) -> Result<()> {
        let tx = self.conn.transaction()?;
        put_collection_in(&tx, collection)?;
        for request in requests {
            put_request_in(&tx, request)?;
        }
        tx.commit()?;
        tracing::info!(id = %collection.id, requests = requests.len(), "Imported collection");
        Ok(())
    }

    pub fn get_collection(&self, id: &str) -> Result<Option<Collection>> {
        self.get_record("collections", id)
    }

    pub fn get_all_collections(&self) -> Result<Vec<Collection>> {
        self.get_records("SELECT data FROM collections ORDER BY rowid", [])
    }

    /// Delete a collection and every request it owns. Returns the number of
    /// requests removed.
    pub fn delete_collection(&mut self, id: &str) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let requests = tx.execute("DELETE FROM requests WHERE collection_id = ?1", params![id])?;
        tx.execute("DELETE FROM collections WHERE id = ?1", params![id])?;
        tx.commit()?;
        tracing::info!(id, requests, "Deleted collection");
        Ok(requests)
    }

    // ---- requests ----

    pub fn put_request(&self, request: &Request) -> Result<()> {
        put_request_in(&self.conn, request)?;
        tracing::debug!(id = %request.id, "Saved request");
        Ok(())
    }

    pub fn get_request(&self, id: &str) -> Result<Option<Request>> {
        self.get_record("requests", id)
    }

    pub fn get_all_requests(&self) -> Result<Vec<Request>> {
        self.get_records("SELECT data FROM requests ORDER BY rowid", [])
    }

    pub fn get_requests_by_collection(&self, collection_id: &str) -> Result<Vec<Request>> {
        self.get_records(
            "SELECT data FROM requests WHERE collection_id = ?1 ORDER BY rowid",
            params![collection_id],
        )
    }

    pub fn delete_request(&self, id: &str) -> Result<bool> {
        Ok(self.conn.execute("DELETE FROM requests WHERE id = ?1", params![id])? > 0)
    }

    // ---- history ----

    /// Record a dispatch attempt. Entries are never updated afterwards.
    pub fn add_history_entry(&self, entry: &HistoryEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO history (id, executed_at, data) VALUES (?1, ?2, ?3)",
            params![
                entry.id,
                entry.executed_at.timestamp_millis(),
                serde_json::to_string(entry)?
            ],
        )?;
        Ok(())
    }

    pub fn get_history_entry(&self, id: &str) -> Result<Option<HistoryEntry>> {
        self.get_record("history", id)
    }

    /// Newest first
    pub fn get_history(&self, limit: usize, offset: usize) -> Result<Vec<HistoryEntry>> {
        self.get_records(
            "SELECT data FROM history ORDER BY executed_at DESC, rowid DESC LIMIT ?1 OFFSET ?2",
            params![limit as i64, offset as i64],
        )
    }

    pub fn history_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn delete_history_entry(&self, id: &str) -> Result<bool> {
        Ok(self.conn.execute("DELETE FROM history WHERE id = ?1", params![id])? > 0)
    }

    /// Delete the `count` oldest entries by execution time.
    pub fn delete_oldest(&self, count: usize) -> Result<usize> {
        Ok(delete_oldest_in(&self.conn, count)?)
    }

    pub fn clear_history(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM history", [])?)
    }

    /// Drop entries older than `expiry_days` (zero keeps everything), then
    /// the oldest surplus beyond `max_count`. Returns how many were removed.
    pub fn enforce_retention(
        &mut self,
        expiry_days: u32,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;

        let mut removed = 0;
        if expiry_days > 0 {
            // in millis so any day count fits
            let cutoff = now
                .timestamp_millis()
                .saturating_sub(i64::from(expiry_days) * MILLIS_PER_DAY);
            removed += tx.execute("DELETE FROM history WHERE executed_at < ?1", params![cutoff])?;
        }

        let count: i64 = tx.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        let surplus = (count as usize).saturating_sub(max_count);
        if surplus > 0 {
            removed += delete_oldest_in(&tx, surplus)?;
        }

        tx.commit()?;
        if removed > 0 {
            tracing::info!(removed, expiry_days, max_count, "Enforced history retention");
        }
        Ok(removed)
    }

    // ---- settings ----

    /// The settings record, created with defaults on first access.
    pub fn get_settings(&self) -> Result<Settings> {
        match self.get_record::<Settings>("settings", crate::constants::SETTINGS_ID)? {
            Some(settings) => Ok(settings),
            None => {
                let settings = Settings::default();
                self.save_settings(&settings)?;
                tracing::info!("Created default settings");
                Ok(settings)
            }
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (id, data) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            params![settings.id, serde_json::to_string(settings)?],
        )?;
        Ok(())
    }

    // ---- maintenance ----

    /// Remove every record from every table.
    pub fn clear_all(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM requests;
             DELETE FROM collections;
             DELETE FROM history;
             DELETE FROM settings;",
        )?;
        tx.commit()?;
        tracing::warn!("Cleared all stored data");
        Ok(())
    }

    /// Case-insensitive search over collection, folder and request names and
    /// request URLs.
    pub fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let matches = |text: &str| text.to_lowercase().contains(&needle);

        let requests: HashMap<String, Request> = self
            .get_all_requests()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let request_matches = |r: &Request| matches(&r.name) || matches(&r.url);

        let mut results = Vec::new();
        let mut placed: Vec<&str> = Vec::new();

        for collection in self.get_all_collections()? {
            if matches(&collection.name) {
                results.push(SearchResult {
                    kind: SearchKind::Collection,
                    id: collection.id.clone(),
                    name: collection.name.clone(),
                    path: collection.name.clone(),
                    parent_id: None,
                });
            }

            let mut stack: Vec<(&[CollectionItem], String, &str)> =
                vec![(&collection.items, collection.name.clone(), &collection.id)];
            while let Some((items, path, parent_id)) = stack.pop() {
                for item in items {
                    match item {
                        CollectionItem::Folder(folder) => {
                            let folder_path = format!("{}/{}", path, folder.name);
                            if matches(&folder.name) {
                                results.push(SearchResult {
                                    kind: SearchKind::Folder,
                                    id: folder.id.clone(),
                                    name: folder.name.clone(),
                                    path: folder_path.clone(),
                                    parent_id: Some(parent_id.to_string()),
                                });
                            }
                            stack.push((&folder.items, folder_path, &folder.id));
                        }
                        CollectionItem::Request(reference) => {
                            let Some(request) = requests.get(&reference.id) else {
                                continue;
                            };
                            placed.push(&request.id);
                            if request_matches(request) {
                                results.push(SearchResult {
                                    kind: SearchKind::Request,
                                    id: request.id.clone(),
                                    name: request.name.clone(),
                                    path: format!("{}/{}", path, request.name),
                                    parent_id: Some(parent_id.to_string()),
                                });
                            }
                        }
                    }
                }
            }
        }

        // Requests not placed in any tree
        for request in requests.values() {
            if !placed.contains(&request.id.as_str()) && request_matches(request) {
                results.push(SearchResult {
                    kind: SearchKind::Request,
                    id: request.id.clone(),
                    name: request.name.clone(),
                    path: request.name.clone(),
                    parent_id: request.collection_id.clone(),
                });
            }
        }

        Ok(results)
    }
}

fn put_collection_in(conn: &Connection, collection: &Collection) -> Result<()> {
    conn.execute(
        "INSERT INTO collections (id, name, data, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           data = excluded.data,
           updated_at = excluded.updated_at",
        params![
            collection.id,
            collection.name,
            serde_json::to_string(collection)?,
            collection.updated_at.timestamp_millis()
        ],
    )?;
    Ok(())
}

fn put_request_in(conn: &Connection, request: &Request) -> Result<()> {
    conn.execute(
        "INSERT INTO requests (id, collection_id, name, url, data, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
           collection_id = excluded.collection_id,
           name = excluded.name,
           url = excluded.url,
           data = excluded.data,
           updated_at = excluded.updated_at",
        params![
            request.id,
            request.collection_id,
            request.name,
            request.url,
            serde_json::to_string(request)?,
            request.updated_at.timestamp_millis()
        ],
    )?;
    Ok(())
}

fn delete_oldest_in(conn: &Connection, count: usize) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM history WHERE id IN (
             SELECT id FROM history ORDER BY executed_at ASC, rowid ASC LIMIT ?1
         )",
        params![count as i64],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Folder, HttpMethod, RequestRef};
    use chrono::Duration;

    fn entry(url: &str, executed_at: DateTime<Utc>) -> HistoryEntry {
        HistoryEntry {
            id: crate::models::new_id(),
            request_id: None,
            collection_id: None,
            method: HttpMethod::GET,
            url: url.to_string(),
            name: url.to_string(),
            status: Some(200),
            response_time_ms: 5,
            response_size: 2,
            executed_at,
            curl: format!("curl -X GET '{}'", url),
            response_body: Some("{}".into()),
            response_headers: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn test_open_file_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("apiscope.db");
        {
            let store = Store::open(&path).unwrap();
            store.put_collection(&Collection::new("Shop")).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        assert_eq!(store.get_all_collections().unwrap()[0].name, "Shop");
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        match Store::open(&path) {
            Err(StoreError::UnsupportedSchema { found, .. }) => assert_eq!(found, 99),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_request_crud_and_upsert_keeps_order() {
        let store = Store::open_in_memory().unwrap();
        let mut a = Request::new(HttpMethod::GET, "https://a.test");
        let b = Request::new(HttpMethod::POST, "https://b.test");
        store.put_request(&a).unwrap();
        store.put_request(&b).unwrap();

        a.name = "Renamed".into();
        store.put_request(&a).unwrap();

        let all = store.get_all_requests().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "Renamed");
        assert_eq!(store.get_request(&b.id).unwrap().unwrap().method, HttpMethod::POST);

        assert!(store.delete_request(&a.id).unwrap());
        assert!(!store.delete_request(&a.id).unwrap());
        assert!(store.get_request(&a.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_collection_cascades() {
        let mut store = Store::open_in_memory().unwrap();
        let mut col = Collection::new("Shop");
        let other = Collection::new("Other");
        for i in 0..3 {
            let mut req = Request::new(HttpMethod::GET, format!("https://shop.test/{}", i));
            col.add_request(&mut req);
            store.put_request(&req).unwrap();
        }
        let mut keep = Request::new(HttpMethod::GET, "https://other.test");
        keep.collection_id = Some(other.id.clone());
        store.put_request(&keep).unwrap();
        store.put_collection(&col).unwrap();
        store.put_collection(&other).unwrap();

        assert_eq!(store.get_requests_by_collection(&col.id).unwrap().len(), 3);
        assert_eq!(store.delete_collection(&col.id).unwrap(), 3);
        assert!(store.get_requests_by_collection(&col.id).unwrap().is_empty());
        assert!(store.get_collection(&col.id).unwrap().is_none());
        assert_eq!(store.get_all_requests().unwrap().len(), 1);
    }

    #[test]
    fn test_history_is_newest_first_with_paging() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        for i in 0..5 {
            store
                .add_history_entry(&entry(&format!("https://h/{}", i), now + Duration::seconds(i)))
                .unwrap();
        }
        let page: Vec<String> = store
            .get_history(2, 1)
            .unwrap()
            .into_iter()
            .map(|e| e.url)
            .collect();
        assert_eq!(page, vec!["https://h/3", "https://h/2"]);
        assert_eq!(store.history_count().unwrap(), 5);

        assert_eq!(store.delete_oldest(2).unwrap(), 2);
        let urls: Vec<String> = store.get_history(10, 0).unwrap().into_iter().map(|e| e.url).collect();
        assert_eq!(urls, vec!["https://h/4", "https://h/3", "https://h/2"]);
    }

    #[test]
    fn test_enforce_retention() {
        let mut store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        // 3 expired, 6 fresh
        for i in 0..3 {
            store
                .add_history_entry(&entry(&format!("old{}", i), now - Duration::days(40 + i)))
                .unwrap();
        }
        for i in 0..6 {
            store
                .add_history_entry(&entry(&format!("new{}", i), now - Duration::minutes(60 - i)))
                .unwrap();
        }

        let removed = store.enforce_retention(30, 4, now).unwrap();
        assert_eq!(removed, 5);

        let urls: Vec<String> = store.get_history(100, 0).unwrap().into_iter().map(|e| e.url).collect();
        assert_eq!(urls, vec!["new5", "new4", "new3", "new2"]);

        // under the cap only expiry applies
        assert_eq!(store.enforce_retention(30, 100, now).unwrap(), 0);
    }

    #[test]
    fn test_enforce_retention_with_huge_expiry() {
        let mut store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        for i in 0..3 {
            store
                .add_history_entry(&entry(&format!("e{}", i), now - Duration::days(365 * 50 + i)))
                .unwrap();
        }

        assert_eq!(store.enforce_retention(100_000_000, 10, now).unwrap(), 0);
        assert_eq!(store.enforce_retention(u32::MAX, 10, now).unwrap(), 0);
        assert_eq!(store.get_history(10, 0).unwrap().len(), 3);

        // the count cap still applies
        assert_eq!(store.enforce_retention(u32::MAX, 1, now).unwrap(), 2);
        assert_eq!(store.get_history(10, 0).unwrap()[0].url, "e0");
    }

    #[test]
    fn test_import_collection_is_all_or_nothing() {
        let mut store = Store::open_in_memory().unwrap();
        let collection = Collection::new("Imported");
        let mut ok = Request::new(HttpMethod::GET, "https://h/ok");
        ok.collection_id = Some(collection.id.clone());
        let mut boom = Request::new(HttpMethod::GET, "https://h/boom");
        boom.name = "boom".to_string();
        boom.collection_id = Some(collection.id.clone());

        store
            .conn
            .execute_batch(
                "CREATE TRIGGER fail_insert BEFORE INSERT ON requests
                 WHEN NEW.name = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'boom'); END;",
            )
            .unwrap();

        assert!(store
            .import_collection(&collection, &[ok.clone(), boom])
            .is_err());
        assert!(store.get_collection(&collection.id).unwrap().is_none());
        assert!(store.get_request(&ok.id).unwrap().is_none());

        store.import_collection(&collection, &[ok.clone()]).unwrap();
        assert!(store.get_collection(&collection.id).unwrap().is_some());
        assert_eq!(
            store.get_requests_by_collection(&collection.id).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_settings_created_once() {
        let store = Store::open_in_memory().unwrap();
        let mut settings = store.get_settings().unwrap();
        assert_eq!(settings.max_history_size, crate::constants::DEFAULT_MAX_HISTORY);

        settings.default_timeout_ms = 1234;
        store.save_settings(&settings).unwrap();
        assert_eq!(store.get_settings().unwrap().default_timeout_ms, 1234);
    }

    #[test]
    fn test_search_reports_paths() {
        let store = Store::open_in_memory().unwrap();
        let mut col = Collection::new("Payments API");
        let mut list = Request::new(HttpMethod::GET, "https://pay.test/invoices");
        list.name = "List invoices".into();
        list.collection_id = Some(col.id.clone());
        let mut folder = Folder::new("Invoices");
        folder.items.push(CollectionItem::Request(RequestRef::from(&list)));
        let folder_id = folder.id.clone();
        col.items.push(CollectionItem::Folder(folder));
        let loose = Request::new(HttpMethod::GET, "https://elsewhere.test/invoice");

        store.put_collection(&col).unwrap();
        store.put_request(&list).unwrap();
        store.put_request(&loose).unwrap();

        let results = store.search("INVOICE").unwrap();
        let paths: Vec<(SearchKind, &str)> = results.iter().map(|r| (r.kind, r.path.as_str())).collect();
        assert_eq!(
            paths,
            vec![
                (SearchKind::Folder, "Payments API/Invoices"),
                (SearchKind::Request, "Payments API/Invoices/List invoices"),
                (SearchKind::Request, "New Request"),
            ]
        );
        assert_eq!(results[1].parent_id.as_deref(), Some(folder_id.as_str()));
        assert!(store.search("  ").unwrap().is_empty());
    }

    #[test]
    fn test_clear_all() {
        let mut store = Store::open_in_memory().unwrap();
        store.put_collection(&Collection::new("x")).unwrap();
        store.add_history_entry(&entry("https://h", Utc::now())).unwrap();
        store.get_settings().unwrap();
        store.clear_all().unwrap();
        assert!(store.get_all_collections().unwrap().is_empty());
        assert_eq!(store.history_count().unwrap(), 0);
    }
}
