//! Schema revisions for a guild database and the store that creates,
//! detects, migrates, and verifies them.
//!
//! A guild database carries its revision in the single-row `version` table.
//! Revisions are strictly ordered and only ever move forward.

use crate::db::error::{Result, StoreError};
use crate::db::migrations::{Migration, MIGRATIONS};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::Connection;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, info};

/// A schema revision as stored in the `version` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(u32);

impl SchemaVersion {
    pub const V1: Self = Self(1);
    pub const V2: Self = Self(2);
    pub const V3: Self = Self(3);

    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this binary knows how to create this revision.
    pub fn is_supported(self) -> bool {
        self >= Self::V1 && self <= CURRENT_SCHEMA_VERSION
    }
}

/// The revision the running code expects every guild database to be at.
pub const CURRENT_SCHEMA_VERSION: SchemaVersion = SchemaVersion::V3;

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SchemaVersion {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|_| StoreError::Schema(format!("invalid schema version {:?}", s)))
    }
}

/// Table definitions for every revision
pub struct SchemaDefinitions;

impl SchemaDefinitions {
    pub const VERSION_INT: &'static str = "CREATE TABLE version (version INT NOT NULL)";

    pub const VERSION_TEXT: &'static str = "CREATE TABLE version (version VARCHAR NOT NULL)";

    /// Watermarks bounding the already-scanned message range, as epoch seconds.
    pub const UPDATES: &'static str =
        "CREATE TABLE updates (oldestUpdate FLOAT NOT NULL, lastUpdate FLOAT NOT NULL)";

    pub const ACTIVE: &'static str = "CREATE TABLE active (active INT NOT NULL)";

    pub const PREFIX: &'static str = "CREATE TABLE prefix (prefix VARCHAR NOT NULL)";

    pub const BLACKLISTED_CHANNELS_V1: &'static str =
        "CREATE TABLE blacklistedChannels (id INT PRIMARY KEY)";

    pub const BLACKLISTED_CHANNELS: &'static str =
        "CREATE TABLE blacklistedChannels (channelID INT PRIMARY KEY)";

    pub const EMOJI: &'static str = "CREATE TABLE emoji (emoji VARCHAR PRIMARY KEY)";

    pub const MEMBERS_V1: &'static str = "CREATE TABLE members (id INT PRIMARY KEY)";

    pub const MEMBERS: &'static str =
        "CREATE TABLE members (id INT PRIMARY KEY, name VARCHAR NOT NULL DEFAULT '')";

    pub const URLS_V1: &'static str = r#"
        CREATE TABLE urls (
            url VARCHAR PRIMARY KEY,
            messageID INT NOT NULL,
            timestamp FLOAT NOT NULL
        )
    "#;

    /// Columns added after the first revision sit at the end, where
    /// `ALTER TABLE ... ADD COLUMN` puts them on migrated databases.
    pub const URLS: &'static str = r#"
        CREATE TABLE urls (
            url VARCHAR PRIMARY KEY,
            messageID INT NOT NULL,
            timestamp FLOAT NOT NULL,
            channelID INT,
            memberID INT REFERENCES members(id)
        )
    "#;

    pub const REPOSTS: &'static str = r#"
        CREATE TABLE reposts (
            messageID INT NOT NULL,
            channelID INT NOT NULL,
            memberID INT NOT NULL REFERENCES members(id),
            url VARCHAR NOT NULL REFERENCES urls(url)
        )
    "#;

    const REVISION_1: &'static [&'static str] = &[
        Self::VERSION_INT,
        Self::UPDATES,
        Self::ACTIVE,
        Self::BLACKLISTED_CHANNELS_V1,
        Self::EMOJI,
        Self::MEMBERS_V1,
        Self::URLS_V1,
        Self::REPOSTS,
    ];

    const REVISION_2: &'static [&'static str] = &[
        Self::VERSION_INT,
        Self::UPDATES,
        Self::ACTIVE,
        Self::PREFIX,
        Self::BLACKLISTED_CHANNELS,
        Self::EMOJI,
        Self::MEMBERS_V1,
        Self::URLS,
        Self::REPOSTS,
    ];

    const REVISION_3: &'static [&'static str] = &[
        Self::VERSION_TEXT,
        Self::UPDATES,
        Self::ACTIVE,
        Self::PREFIX,
        Self::BLACKLISTED_CHANNELS,
        Self::EMOJI,
        Self::MEMBERS,
        Self::URLS,
        Self::REPOSTS,
    ];

    /// `CREATE TABLE` statements of a revision, in dependency order.
    pub fn tables(version: SchemaVersion) -> Result<&'static [&'static str]> {
        match version.get() {
            1 => Ok(Self::REVISION_1),
            2 => Ok(Self::REVISION_2),
            3 => Ok(Self::REVISION_3),
            _ => Err(StoreError::Schema(format!(
                "unknown schema version {}",
                version
            ))),
        }
    }
}

/// Values written into freshly created rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedDefaults {
    pub prefix: String,
    pub emoji: String,
}

impl Default for SeedDefaults {
    fn default() -> Self {
        Self {
            prefix: "$".to_string(),
            emoji: "recycle".to_string(),
        }
    }
}

/// Tables that model process-wide settings and hold exactly one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Singleton {
    Active,
    Updates,
    Prefix,
}

impl Singleton {
    pub(crate) const ALL: [Singleton; 3] = [Singleton::Active, Singleton::Updates, Singleton::Prefix];

    pub(crate) fn table(self) -> &'static str {
        match self {
            Singleton::Active => "active",
            Singleton::Updates => "updates",
            Singleton::Prefix => "prefix",
        }
    }

    fn seed(self, conn: &Connection, defaults: &SeedDefaults, now: f64) -> rusqlite::Result<usize> {
        match self {
            Singleton::Active => conn.execute("INSERT INTO active (active) VALUES (1)", []),
            Singleton::Updates => conn.execute(
                "INSERT INTO updates (oldestUpdate, lastUpdate) VALUES (?1, ?1)",
                [now],
            ),
            Singleton::Prefix => {
                conn.execute("INSERT INTO prefix (prefix) VALUES (?1)", [&defaults.prefix])
            }
        }
    }

    fn row_count(self, conn: &Connection) -> rusqlite::Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table()), [], |row| {
            row.get(0)
        })
    }
}

/// Status of a guild database relative to the revision the code requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaStatus {
    /// No tables at all
    NotInitialized,

    Current,

    NeedsMigration {
        from: SchemaVersion,
        to: SchemaVersion,
    },

    /// Written by a newer build; there is no downgrade path
    Incompatible {
        database_version: SchemaVersion,
        required_version: SchemaVersion,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnShape {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyShape {
    pub column: String,
    pub table: String,
    pub target: Option<String>,
}

/// Normalized layout of one table, independent of the DDL text that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableShape {
    pub name: String,
    pub columns: Vec<ColumnShape>,
    pub foreign_keys: Vec<ForeignKeyShape>,
}

/// Describes every user table of the database, ordered by table name.
pub fn describe(conn: &Connection) -> Result<Vec<TableShape>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    names
        .into_iter()
        .map(|name| describe_table(conn, name))
        .collect()
}

fn describe_table(conn: &Connection, name: String) -> Result<TableShape> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map([&name], |row| {
            Ok(ColumnShape {
                name: row.get(0)?,
                declared_type: row.get::<_, String>(1)?.to_uppercase(),
                not_null: row.get::<_, i64>(2)? != 0,
                default: row.get(3)?,
                primary_key: row.get::<_, i64>(4)? != 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt =
        conn.prepare("SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1)")?;
    let mut foreign_keys = stmt
        .query_map([&name], |row| {
            Ok(ForeignKeyShape {
                column: row.get(0)?,
                table: row.get(1)?,
                target: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    foreign_keys.sort_by(|a, b| a.column.cmp(&b.column));

    Ok(TableShape {
        name,
        columns,
        foreign_keys,
    })
}

/// Shape of a freshly created database at `version`.
pub fn expected_shape(version: SchemaVersion) -> Result<Vec<TableShape>> {
    let conn = Connection::open_in_memory()?;
    for ddl in SchemaDefinitions::tables(version)? {
        conn.execute(ddl, [])?;
    }
    describe(&conn)
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Declared type of `table.column`, or `None` when the column is absent.
pub(crate) fn column_type(
    conn: &Connection,
    table: &str,
    column: &str,
) -> rusqlite::Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
    let mut rows = stmt.query([table])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        if name == column {
            return Ok(Some(row.get(1)?));
        }
    }
    Ok(None)
}

pub(crate) fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn write_version(conn: &Connection, version: SchemaVersion) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM version", [])?;
    conn.execute(
        "INSERT INTO version (version) VALUES (?1)",
        [version.to_string()],
    )?;
    Ok(())
}

/// Inserts the default row into every present singleton table that is empty.
fn seed_singletons(conn: &Connection, defaults: &SeedDefaults) -> Result<usize> {
    let now = now_epoch();
    let mut inserted = 0;
    for singleton in Singleton::ALL {
        if !table_exists(conn, singleton.table())? {
            continue;
        }
        match singleton.row_count(conn)? {
            0 => {
                inserted += singleton.seed(conn, defaults, now)?;
                info!("Schema: Seeded default row into `{}`", singleton.table());
            }
            1 => {}
            rows => {
                return Err(StoreError::CorruptSchema(format!(
                    "singleton table `{}` holds {} rows",
                    singleton.table(),
                    rows
                )))
            }
        }
    }
    Ok(inserted)
}

fn parse_version_value(value: &Value) -> Result<SchemaVersion> {
    let parsed = match value {
        Value::Integer(v) => u32::try_from(*v).ok(),
        Value::Text(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| *v > 0)
        .map(SchemaVersion)
        .ok_or_else(|| StoreError::CorruptSchema(format!("unreadable version value {:?}", value)))
}

/// Creates, detects, migrates, and verifies the schema of one guild database.
///
/// The store only borrows the connection; callers decide how access to it is
/// serialized.
pub struct SchemaStore<'a> {
    conn: &'a Connection,
    defaults: SeedDefaults,
}

impl<'a> SchemaStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            defaults: SeedDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: SeedDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// True when the database holds no tables, indexes, or views.
    pub fn is_empty(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )?;
        Ok(count == 0)
    }

    /// Creates every table of `target` and seeds the default rows.
    pub fn initialize(&self, target: SchemaVersion) -> Result<()> {
        let tables = SchemaDefinitions::tables(target)?;
        if !self.is_empty()? {
            return Err(StoreError::Schema(format!(
                "cannot initialize version {}: database already contains tables",
                target
            )));
        }

        info!("Schema: Initializing database at version {}", target);
        let tx = self.conn.unchecked_transaction()?;
        for ddl in tables {
            tx.execute(ddl, [])?;
        }
        write_version(&tx, target)?;
        seed_singletons(&tx, &self.defaults)?;
        tx.execute("INSERT INTO emoji (emoji) VALUES (?1)", [&self.defaults.emoji])?;
        tx.commit()?;
        debug!("Schema: Database initialized at version {}", target);
        Ok(())
    }

    /// Reads the installed revision from the single `version` row.
    pub fn detect_version(&self) -> Result<SchemaVersion> {
        if !table_exists(self.conn, "version")? {
            return Err(StoreError::Schema(
                "required table `version` is missing".to_string(),
            ));
        }

        let mut stmt = self.conn.prepare("SELECT version FROM version")?;
        let values = stmt
            .query_map([], |row| row.get::<_, Value>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        match values.as_slice() {
            [value] => parse_version_value(value),
            [] => Err(StoreError::CorruptSchema(
                "`version` table is empty".to_string(),
            )),
            rows => Err(StoreError::CorruptSchema(format!(
                "`version` table holds {} rows",
                rows.len()
            ))),
        }
    }

    pub fn status(&self, required: SchemaVersion) -> Result<SchemaStatus> {
        if self.is_empty()? {
            return Ok(SchemaStatus::NotInitialized);
        }

        let installed = self.detect_version()?;
        Ok(match installed.cmp(&required) {
            Ordering::Equal => SchemaStatus::Current,
            Ordering::Less => SchemaStatus::NeedsMigration {
                from: installed,
                to: required,
            },
            Ordering::Greater => SchemaStatus::Incompatible {
                database_version: installed,
                required_version: required,
            },
        })
    }

    /// Brings the database from `from` to `to`, one revision per transaction.
    ///
    /// Steps the installed revision already covers are skipped, so an
    /// interrupted run resumes where the last committed step left off.
    pub fn migrate(&self, from: SchemaVersion, to: SchemaVersion) -> Result<()> {
        if from == to {
            debug!("Schema: Already at version {}, nothing to migrate", to);
            return Ok(());
        }

        let refuse = |reason: String| StoreError::Migration { from, to, reason };
        if from > to {
            return Err(refuse("migrations are forward-only".to_string()));
        }
        if !from.is_supported() || !to.is_supported() {
            return Err(refuse(format!(
                "supported versions are {} to {}",
                SchemaVersion::V1,
                CURRENT_SCHEMA_VERSION
            )));
        }

        let installed = self.detect_version()?;
        if installed > CURRENT_SCHEMA_VERSION {
            return Err(refuse(format!(
                "database is at version {}, newer than supported version {}",
                installed, CURRENT_SCHEMA_VERSION
            )));
        }
        if installed >= to {
            debug!("Schema: Installed version {} already satisfies {}", installed, to);
            return Ok(());
        }
        if installed < from {
            return Err(refuse(format!(
                "database is at version {}, below the requested starting version",
                installed
            )));
        }

        info!("Schema: Migrating from version {} to {}", installed, to);
        for step in MIGRATIONS
            .iter()
            .filter(|step| step.from >= installed && step.from < to)
        {
            self.apply(step)?;
        }
        info!("Schema: Migration to version {} complete", to);
        Ok(())
    }

    fn apply(&self, step: &Migration) -> Result<()> {
        let target = step.from.next();
        debug!(
            "Schema: Applying migration {} -> {}: {}",
            step.from, target, step.description
        );

        let run = || -> Result<()> {
            let tx = self.conn.unchecked_transaction()?;
            (step.apply)(&*tx)?;
            seed_singletons(&tx, &self.defaults)?;
            write_version(&tx, target)?;
            tx.commit()?;
            Ok(())
        };

        run().map_err(|e| {
            error!(
                "Schema: Migration {} -> {} failed and was rolled back: {}",
                step.from, target, e
            );
            StoreError::Migration {
                from: step.from,
                to: target,
                reason: e.to_string(),
            }
        })
    }

    /// Fills singleton tables left empty, returning how many rows were added.
    pub fn seed_defaults(&self) -> Result<usize> {
        seed_singletons(self.conn, &self.defaults)
    }

    /// Checks the live schema against a fresh database of `version`.
    pub fn verify(&self, version: SchemaVersion) -> Result<()> {
        let expected = expected_shape(version)?;
        let actual = describe(self.conn)?;

        for table in &expected {
            match actual.iter().find(|t| t.name == table.name) {
                None => {
                    return Err(StoreError::Schema(format!(
                        "required table `{}` is missing",
                        table.name
                    )))
                }
                Some(found) if found != table => {
                    return Err(StoreError::CorruptSchema(format!(
                        "table `{}` does not match schema version {}",
                        table.name, version
                    )))
                }
                Some(_) => {}
            }
        }

        for singleton in Singleton::ALL {
            if !table_exists(self.conn, singleton.table())? {
                continue;
            }
            let rows = singleton.row_count(self.conn)?;
            if rows != 1 {
                return Err(StoreError::CorruptSchema(format!(
                    "singleton table `{}` holds {} rows",
                    singleton.table(),
                    rows
                )));
            }
        }

        let installed = self.detect_version()?;
        if installed != version {
            return Err(StoreError::CorruptSchema(format!(
                "`version` row says {} but the tables match {}",
                installed, version
            )));
        }
        Ok(())
    }

    /// Startup entry point: creates, migrates, or checks the database so it
    /// ends up at `required`, then verifies it.
    pub fn prepare(&self, required: SchemaVersion) -> Result<SchemaVersion> {
        match self.status(required)? {
            SchemaStatus::NotInitialized => self.initialize(required)?,
            SchemaStatus::Current => debug!("Schema: Database is current at version {}", required),
            SchemaStatus::NeedsMigration { from, to } => self.migrate(from, to)?,
            SchemaStatus::Incompatible {
                database_version,
                required_version,
            } => {
                return Err(StoreError::Schema(format!(
                    "database version {} is newer than supported version {}",
                    database_version, required_version
                )))
            }
        }

        self.verify(required)?;
        Ok(required)
    }
}
