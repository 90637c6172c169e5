//! Forward-only deltas between schema revisions.
//!
//! Every step inspects the live schema before touching it, so applying a step
//! to a database that already has it changes nothing. Renames keep row data:
//! columns are renamed in place and rebuilt tables are filled from the old
//! one before it is dropped.

use crate::db::schema::{column_type, table_exists, SchemaDefinitions, SchemaVersion};
use rusqlite::Connection;

pub(crate) struct Migration {
    pub from: SchemaVersion,
    pub description: &'static str,
    pub apply: fn(&Connection) -> rusqlite::Result<()>,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        from: SchemaVersion::V1,
        description: "add prefix table, rename blacklistedChannels.id, track url channel and member",
        apply: v1_to_v2,
    },
    Migration {
        from: SchemaVersion::V2,
        description: "add members.name, store version as text",
        apply: v2_to_v3,
    },
];

fn v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    if !table_exists(conn, "prefix")? {
        conn.execute(SchemaDefinitions::PREFIX, [])?;
    }

    let has_new = column_type(conn, "blacklistedChannels", "channelID")?.is_some();
    let has_old = column_type(conn, "blacklistedChannels", "id")?.is_some();
    if has_old && !has_new {
        conn.execute(
            "ALTER TABLE blacklistedChannels RENAME COLUMN id TO channelID",
            [],
        )?;
    }

    add_column(conn, "urls", "channelID", "INT")?;
    add_column(conn, "urls", "memberID", "INT REFERENCES members(id)")?;
    Ok(())
}

fn v2_to_v3(conn: &Connection) -> rusqlite::Result<()> {
    add_column(conn, "members", "name", "VARCHAR NOT NULL DEFAULT ''")?;

    let stored_as_text = column_type(conn, "version", "version")?
        .is_some_and(|declared| declared.eq_ignore_ascii_case("VARCHAR"));
    if !stored_as_text {
        // SQLite cannot change a column type in place.
        conn.execute_batch(
            "DROP TABLE IF EXISTS version_staging;
             CREATE TABLE version_staging (version VARCHAR NOT NULL);
             INSERT INTO version_staging (version) SELECT CAST(version AS TEXT) FROM version;
             DROP TABLE version;
             ALTER TABLE version_staging RENAME TO version;",
        )?;
    }
    Ok(())
}

/// Adds `table.column` unless it already exists. Returns whether it was added.
fn add_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<bool> {
    if column_type(conn, table, column)?.is_some() {
        return Ok(false);
    }
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition),
        [],
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{describe, SchemaStore};

    fn v1_database() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys=ON", []).unwrap();
        SchemaStore::new(&conn).initialize(SchemaVersion::V1).unwrap();
        conn
    }

    #[test]
    fn test_migrations_are_contiguous() {
        let mut expected = SchemaVersion::V1;
        for step in MIGRATIONS {
            assert_eq!(step.from, expected);
            expected = expected.next();
        }
        assert_eq!(expected, crate::db::schema::CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_steps_are_idempotent() {
        let conn = v1_database();
        for step in MIGRATIONS {
            (step.apply)(&conn).unwrap();
            let once = describe(&conn).unwrap();
            (step.apply)(&conn).unwrap();
            assert_eq!(describe(&conn).unwrap(), once, "{}", step.description);
        }
    }

    #[test]
    fn test_blacklist_rename_keeps_rows() {
        let conn = v1_database();
        conn.execute("INSERT INTO blacklistedChannels (id) VALUES (100), (200)", [])
            .unwrap();

        v1_to_v2(&conn).unwrap();

        let channels: Vec<i64> = conn
            .prepare("SELECT channelID FROM blacklistedChannels ORDER BY channelID")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(channels, vec![100, 200]);
        assert!(column_type(&conn, "blacklistedChannels", "id").unwrap().is_none());
    }

    #[test]
    fn test_urls_gain_nullable_columns() {
        let conn = v1_database();
        conn.execute(
            "INSERT INTO urls (url, messageID, timestamp) VALUES ('https://example.com', 1, 1600000000.5)",
            [],
        )
        .unwrap();

        v1_to_v2(&conn).unwrap();

        let (channel, member): (Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT channelID, memberID FROM urls WHERE url = 'https://example.com'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(channel, None);
        assert_eq!(member, None);
    }

    #[test]
    fn test_version_rebuild_keeps_value() {
        let conn = v1_database();
        v1_to_v2(&conn).unwrap();
        conn.execute("UPDATE version SET version = 2", []).unwrap();

        v2_to_v3(&conn).unwrap();

        let declared = column_type(&conn, "version", "version").unwrap();
        assert_eq!(declared.as_deref(), Some("VARCHAR"));
        let stored: String = conn
            .query_row("SELECT version FROM version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, "2");
        assert!(!table_exists(&conn, "version_staging").unwrap());
    }
}
