use crate::db::{Database, Result, SchemaVersion, SeedDefaults};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One database file per guild, opened and brought to the required schema
/// revision before the bot handles any event for that guild.
pub struct GuildDatabases {
    dir: PathBuf,
    required: SchemaVersion,
    defaults: SeedDefaults,
    databases: HashMap<u64, Database>,
}

impl GuildDatabases {
    pub fn new(dir: impl Into<PathBuf>, required: SchemaVersion, defaults: SeedDefaults) -> Self {
        Self {
            dir: dir.into(),
            required,
            defaults,
            databases: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn database_path(&self, guild_id: u64) -> PathBuf {
        self.dir.join(format!("{}.sqlite3", guild_id))
    }

    /// Opens (creating if needed) and prepares the database of `guild_id`.
    ///
    /// Already opened guilds return the existing handle.
    pub fn open(&mut self, guild_id: u64) -> Result<Database> {
        if let Some(db) = self.databases.get(&guild_id) {
            return Ok(db.clone());
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.database_path(guild_id);
        if !path.exists() {
            info!("Creating new database for guild {}.", guild_id);
        }

        let db = Database::open(&path)?;
        match db.prepare_schema(self.required, &self.defaults) {
            Ok(version) => info!("Guild {} database ready at schema version {}", guild_id, version),
            Err(e) => {
                warn!("Guild {} database at {:?} is unusable: {}", guild_id, path, e);
                return Err(e);
            }
        }

        self.databases.insert(guild_id, db.clone());
        Ok(db)
    }

    pub fn get(&self, guild_id: u64) -> Option<&Database> {
        self.databases.get(&guild_id)
    }

    pub fn guild_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.databases.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SchemaStore, StoreError, CURRENT_SCHEMA_VERSION};

    #[test]
    fn test_open_creates_one_file_per_guild() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("databases");
        let mut guilds = GuildDatabases::new(&root, CURRENT_SCHEMA_VERSION, SeedDefaults::default());

        let first = guilds.open(111).unwrap();
        guilds.open(222).unwrap();
        // Reopening returns the cached handle.
        guilds.open(111).unwrap();

        assert_eq!(guilds.len(), 2);
        assert!(root.join("111.sqlite3").exists());
        assert!(root.join("222.sqlite3").exists());
        assert_eq!(first.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        assert!(guilds.get(333).is_none());

        let mut ids: Vec<u64> = guilds.guild_ids().collect();
        ids.sort();
        assert_eq!(ids, vec![111, 222]);
    }

    #[test]
    fn test_open_migrates_existing_file_and_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let guilds_dir = dir.path().to_path_buf();
        let path = guilds_dir.join("42.sqlite3");

        {
            let old = Database::open(&path).unwrap();
            old.with_conn(|conn| {
                SchemaStore::new(conn).initialize(SchemaVersion::V1)?;
                conn.execute("INSERT INTO members (id) VALUES (5)", [])?;
                conn.execute("INSERT INTO blacklistedChannels (id) VALUES (77)", [])?;
                Ok(())
            })
            .unwrap();
        }

        let mut guilds = GuildDatabases::new(&guilds_dir, CURRENT_SCHEMA_VERSION, SeedDefaults::default());
        let db = guilds.open(42).unwrap();

        assert_eq!(db.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        assert_eq!(db.get_blacklisted_channels().unwrap(), vec![77]);
        assert_eq!(db.list_members().unwrap()[0].name, "");
        assert_eq!(db.get_prefix().unwrap(), "$");
    }

    #[test]
    fn test_open_refuses_corrupt_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("9.sqlite3");
        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute("CREATE TABLE version (version INT NOT NULL)", [])?;
                Ok(())
            })
            .unwrap();
        }

        let mut guilds = GuildDatabases::new(dir.path(), CURRENT_SCHEMA_VERSION, SeedDefaults::default());
        let result = guilds.open(9);
        assert!(matches!(result, Err(StoreError::CorruptSchema(_))));
        assert!(guilds.is_empty());
    }
}
