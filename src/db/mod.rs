pub mod error;
pub mod guild;
mod migrations;
pub mod schema;

pub use error::{Result, StoreError};
pub use guild::GuildDatabases;
pub use schema::{SchemaStatus, SchemaStore, SchemaVersion, SeedDefaults, CURRENT_SCHEMA_VERSION};

use error::classify_constraint;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// An empty singleton table means the schema was damaged after creation.
fn singleton_error(err: rusqlite::Error, table: &str) -> StoreError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => {
            StoreError::CorruptSchema(format!("singleton table `{}` is empty", table))
        }
        other => StoreError::Sqlite(other),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberRecord {
    pub id: u64,
    pub name: String,
}

/// First sighting of a URL in a guild.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlRecord {
    pub url: String,
    pub message_id: u64,
    pub channel_id: Option<u64>,
    pub member_id: Option<u64>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepostRecord {
    pub message_id: u64,
    pub channel_id: u64,
    pub member_id: u64,
    pub url: String,
}

/// Handle to one guild database. Clones share the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Runs `f` with exclusive access to the underlying connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Runs blocking database work on the tokio blocking pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Creates, migrates, or checks the schema so it ends at `required`.
    pub fn prepare_schema(
        &self,
        required: SchemaVersion,
        defaults: &SeedDefaults,
    ) -> Result<SchemaVersion> {
        self.with_conn(|conn| {
            SchemaStore::new(conn)
                .with_defaults(defaults.clone())
                .prepare(required)
        })
    }

    pub fn schema_version(&self) -> Result<SchemaVersion> {
        self.with_conn(|conn| SchemaStore::new(conn).detect_version())
    }

    // --- Singletons ---

    pub fn get_active(&self) -> Result<bool> {
        let conn = self.lock()?;
        let active: i64 = conn
            .query_row("SELECT active FROM active", [], |row| row.get(0))
            .map_err(|e| singleton_error(e, "active"))?;
        Ok(active != 0)
    }

    pub fn set_active(&self, active: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("UPDATE active SET active = ?1", [i64::from(active)])?;
        info!("Database: Repost tracking {}", if active { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn get_prefix(&self) -> Result<String> {
        let conn = self.lock()?;
        conn.query_row("SELECT prefix FROM prefix", [], |row| row.get(0))
            .map_err(|e| singleton_error(e, "prefix"))
    }

    pub fn set_prefix(&self, prefix: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("UPDATE prefix SET prefix = ?1", [prefix])?;
        Ok(())
    }

    /// Returns `(oldestUpdate, lastUpdate)` as epoch seconds.
    pub fn get_updates(&self) -> Result<(f64, f64)> {
        let conn = self.lock()?;
        conn.query_row("SELECT oldestUpdate, lastUpdate FROM updates", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .map_err(|e| singleton_error(e, "updates"))
    }

    pub fn get_last_updated(&self) -> Result<f64> {
        Ok(self.get_updates()?.1)
    }

    pub fn set_updates(&self, oldest: f64, last: f64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE updates SET oldestUpdate = ?1, lastUpdate = ?2",
            [oldest, last],
        )?;
        debug!("Database: Watermarks set to {} .. {}", oldest, last);
        Ok(())
    }

    // --- Blacklisted channels ---

    pub fn get_blacklisted_channels(&self) -> Result<Vec<u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT channelID FROM blacklistedChannels ORDER BY channelID")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Returns false when the channel was already blacklisted.
    pub fn blacklist_channel(&self, channel_id: u64) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO blacklistedChannels (channelID) VALUES (?1)",
            [channel_id],
        )?;
        Ok(inserted > 0)
    }

    pub fn unblacklist_channel(&self, channel_id: u64) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM blacklistedChannels WHERE channelID = ?1",
            [channel_id],
        )?;
        Ok(deleted > 0)
    }

    // --- Reaction emoji ---

    pub fn get_emoji(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT emoji FROM emoji ORDER BY emoji")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn add_emoji(&self, emoji: &str) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute("INSERT OR IGNORE INTO emoji (emoji) VALUES (?1)", [emoji])?;
        Ok(inserted > 0)
    }

    pub fn remove_emoji(&self, emoji: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM emoji WHERE emoji = ?1", [emoji])?;
        Ok(deleted > 0)
    }

    // --- Members ---

    pub fn upsert_member(&self, id: u64, name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO members (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = ?2",
            (id, name),
        )?;
        Ok(())
    }

    pub fn list_members(&self) -> Result<Vec<MemberRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name FROM members ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(MemberRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // --- URLs ---

    /// Records the first posting of a URL.
    ///
    /// Fails with [`StoreError::DuplicateUrl`] when the URL is already known
    /// and with [`StoreError::ForeignKeyViolation`] when the member is not.
    pub fn record_url(&self, record: &UrlRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO urls (url, messageID, timestamp, channelID, memberID)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                &record.url,
                record.message_id,
                record.timestamp,
                record.channel_id,
                record.member_id,
            ),
        )
        .map_err(|e| classify_constraint(e, record.url.clone()))?;
        debug!("Database: Recorded URL {} from message {}", record.url, record.message_id);
        Ok(())
    }

    pub fn find_url(&self, url: &str) -> Result<Option<UrlRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT url, messageID, channelID, memberID, timestamp FROM urls WHERE url = ?1",
                [url],
                |row| {
                    Ok(UrlRecord {
                        url: row.get(0)?,
                        message_id: row.get(1)?,
                        channel_id: row.get(2)?,
                        member_id: row.get(3)?,
                        timestamp: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // --- Reposts ---

    pub fn record_repost(&self, record: &RepostRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO reposts (messageID, channelID, memberID, url) VALUES (?1, ?2, ?3, ?4)",
            (record.message_id, record.channel_id, record.member_id, &record.url),
        )
        .map_err(|e| {
            classify_constraint(
                e,
                format!("repost of {} by member {}", record.url, record.member_id),
            )
        })?;
        debug!("Database: Recorded repost of {} in message {}", record.url, record.message_id);
        Ok(())
    }

    pub fn reposts_for_member(&self, member_id: u64) -> Result<Vec<RepostRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT messageID, channelID, memberID, url FROM reposts WHERE memberID = ?1 ORDER BY messageID",
        )?;
        let rows = stmt.query_map([member_id], |row| {
            Ok(RepostRecord {
                message_id: row.get(0)?,
                channel_id: row.get(1)?,
                member_id: row.get(2)?,
                url: row.get(3)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn repost_count(&self, url: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM reposts WHERE url = ?1", [url], |row| {
            row.get(0)
        })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.prepare_schema(CURRENT_SCHEMA_VERSION, &SeedDefaults::default())
            .unwrap();
        db
    }

    fn url(url: &str, member_id: Option<u64>) -> UrlRecord {
        UrlRecord {
            url: url.to_string(),
            message_id: 1000,
            channel_id: Some(55),
            member_id,
            timestamp: 1_700_000_000.25,
        }
    }

    #[test]
    fn test_singletons() {
        let db = test_db();

        assert!(db.get_active().unwrap());
        db.set_active(false).unwrap();
        assert!(!db.get_active().unwrap());

        assert_eq!(db.get_prefix().unwrap(), "$");
        db.set_prefix("!rb").unwrap();
        assert_eq!(db.get_prefix().unwrap(), "!rb");

        db.set_updates(1_600_000_000.0, 1_700_000_000.0).unwrap();
        assert_eq!(db.get_updates().unwrap(), (1_600_000_000.0, 1_700_000_000.0));
        assert_eq!(db.get_last_updated().unwrap(), 1_700_000_000.0);

        assert_eq!(db.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_empty_singletons_report_corruption() {
        let db = test_db();
        db.with_conn(|conn| {
            conn.execute_batch("DELETE FROM active; DELETE FROM prefix; DELETE FROM updates;")?;
            Ok(())
        })
        .unwrap();

        assert!(matches!(db.get_active(), Err(StoreError::CorruptSchema(_))));
        assert!(matches!(db.get_prefix(), Err(StoreError::CorruptSchema(_))));
        assert!(matches!(db.get_updates(), Err(StoreError::CorruptSchema(_))));
        assert!(matches!(db.get_last_updated(), Err(StoreError::CorruptSchema(_))));
    }

    #[test]
    fn test_blacklist_and_emoji() {
        let db = test_db();

        assert!(db.get_blacklisted_channels().unwrap().is_empty());
        assert!(db.blacklist_channel(42).unwrap());
        assert!(!db.blacklist_channel(42).unwrap());
        assert!(db.blacklist_channel(7).unwrap());
        assert_eq!(db.get_blacklisted_channels().unwrap(), vec![7, 42]);
        assert!(db.unblacklist_channel(42).unwrap());
        assert!(!db.unblacklist_channel(42).unwrap());

        assert_eq!(db.get_emoji().unwrap(), vec!["recycle".to_string()]);
        assert!(db.add_emoji("eyes").unwrap());
        assert!(!db.add_emoji("eyes").unwrap());
        assert!(db.remove_emoji("recycle").unwrap());
        assert_eq!(db.get_emoji().unwrap(), vec!["eyes".to_string()]);
    }

    #[test]
    fn test_members_upsert() {
        let db = test_db();
        db.upsert_member(1, "alice").unwrap();
        db.upsert_member(1, "alice2").unwrap();
        db.upsert_member(2, "").unwrap();

        let members = db.list_members().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], MemberRecord { id: 1, name: "alice2".to_string() });
    }

    #[test]
    fn test_duplicate_url_rejected() {
        let db = test_db();
        db.upsert_member(9, "bob").unwrap();
        db.record_url(&url("https://example.com/a", Some(9))).unwrap();

        let result = db.record_url(&url("https://example.com/a", Some(9)));
        assert!(matches!(result, Err(StoreError::DuplicateUrl(_))));

        let found = db.find_url("https://example.com/a").unwrap().unwrap();
        assert_eq!(found.member_id, Some(9));
        assert_eq!(found.channel_id, Some(55));
        assert_eq!(found.timestamp, 1_700_000_000.25);
        assert!(db.find_url("https://example.com/missing").unwrap().is_none());
    }

    #[test]
    fn test_url_with_unknown_member_rejected() {
        let db = test_db();
        let result = db.record_url(&url("https://example.com/b", Some(404)));
        assert!(matches!(result, Err(StoreError::ForeignKeyViolation(_))));

        // Unattributed URLs are allowed.
        db.record_url(&url("https://example.com/b", None)).unwrap();
    }

    #[test]
    fn test_repost_foreign_keys() {
        let db = test_db();
        db.upsert_member(3, "carol").unwrap();
        db.record_url(&url("https://example.com/c", Some(3))).unwrap();

        let repost = RepostRecord {
            message_id: 2000,
            channel_id: 55,
            member_id: 3,
            url: "https://example.com/c".to_string(),
        };
        db.record_repost(&repost).unwrap();
        assert_eq!(db.reposts_for_member(3).unwrap(), vec![repost.clone()]);
        assert_eq!(db.repost_count("https://example.com/c").unwrap(), 1);

        let unknown_member = RepostRecord { member_id: 99, ..repost.clone() };
        assert!(matches!(
            db.record_repost(&unknown_member),
            Err(StoreError::ForeignKeyViolation(_))
        ));

        let unknown_url = RepostRecord {
            url: "https://example.com/never-seen".to_string(),
            ..repost
        };
        assert!(matches!(
            db.record_repost(&unknown_url),
            Err(StoreError::ForeignKeyViolation(_))
        ));
        assert_eq!(db.repost_count("https://example.com/c").unwrap(), 1);
    }

    #[test]
    fn test_url_lookup_is_parameterized() {
        let db = test_db();
        let hostile = "https://example.com/\"; DROP TABLE urls; --";
        assert!(db.find_url(hostile).unwrap().is_none());
        db.record_url(&url(hostile, None)).unwrap();
        assert!(db.find_url(hostile).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let db = test_db();
        db.run_blocking(|db| db.blacklist_channel(12)).await.unwrap();
        let channels = db
            .run_blocking(|db| db.get_blacklisted_channels())
            .await
            .unwrap();
        assert_eq!(channels, vec![12]);
    }
}
