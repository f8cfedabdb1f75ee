use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::manifest::PackageManifest;
use crate::writer::EntryRecord;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PackageRecord {
    pub id: Option<i64>, // None when inserting new records
    pub run_id: String,
    pub package_index: u32,
    pub name: String,
    pub path: String,
    pub item_count: u32,
    pub total_uncompressed_size: u64,
    pub compressed_size: u64,
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PackageEntryRecord {
    pub package_id: i64,
    pub entry_path: String,
    pub virtual_path: String,
    pub size: u64,
}

/// SQLite record of produced packages and the entries inside them.
pub struct PackageLedger {
    conn: Connection,
}

impl PackageLedger {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open ledger DB at {}", db_path.display()))?;

        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("Failed to configure ledger connection")?;

        let ledger = Self { conn };
        ledger.init_schema().context("Failed to initialize schema")?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS packages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                package_index INTEGER NOT NULL,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                item_count INTEGER NOT NULL,
                total_uncompressed_size INTEGER NOT NULL,
                compressed_size INTEGER NOT NULL,
                sha256 TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_packages_run ON packages (run_id);

            CREATE TABLE IF NOT EXISTS package_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                package_id INTEGER NOT NULL,
                entry_path TEXT NOT NULL,
                virtual_path TEXT NOT NULL,
                size INTEGER NOT NULL,
                FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_package_entries_package ON package_entries (package_id);
            CREATE INDEX IF NOT EXISTS idx_package_entries_virtual ON package_entries (virtual_path);
        "#,
            )
            .context("Failed to create schema")?;
        Ok(())
    }

    /// Record every package of one run in a single transaction.
    pub fn record_run(&mut self, run_id: &str, packages: &[(PackageManifest, Vec<EntryRecord>)]) -> Result<Vec<i64>> {
        let tx = self.conn.transaction().context("Failed to start transaction")?;
        let mut ids = Vec::with_capacity(packages.len());

        for (manifest, entries) in packages {
            let package_id: i64 = tx
                .query_row(
                    "INSERT INTO packages
                     (run_id, package_index, name, path, item_count, total_uncompressed_size, compressed_size, sha256, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     RETURNING id",
                    params![
                        run_id,
                        manifest.index,
                        &manifest.name,
                        manifest.path.to_string_lossy().into_owned(),
                        manifest.item_count,
                        manifest.total_uncompressed_size as i64,
                        manifest.compressed_size as i64,
                        &manifest.sha256,
                        manifest.created_at.to_rfc3339(),
                    ],
                    |row| row.get(0),
                )
                .context("Failed to insert package record")?;

            for entry in entries {
                tx.execute(
                    "INSERT INTO package_entries (package_id, entry_path, virtual_path, size)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![package_id, &entry.entry_path, &entry.virtual_path, entry.size as i64],
                )
                .context("Failed to insert package entry")?;
            }
            ids.push(package_id);
        }

        tx.commit().context("Failed to commit transaction")?;
        Ok(ids)
    }

    pub fn list_packages(&self) -> Result<Vec<PackageRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, package_index, name, path, item_count, total_uncompressed_size, compressed_size, sha256, created_at
                 FROM packages
                 ORDER BY id ASC",
            )
            .context("Failed to prepare query")?;

        let records = stmt
            .query_map([], |row| {
                let created: String = row.get(9)?;
                Ok(PackageRecord {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    package_index: row.get(2)?,
                    name: row.get(3)?,
                    path: row.get(4)?,
                    item_count: row.get(5)?,
                    total_uncompressed_size: row.get::<_, i64>(6)? as u64,
                    compressed_size: row.get::<_, i64>(7)? as u64,
                    sha256: row.get(8)?,
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_default(),
                })
            })
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect results")?;

        Ok(records)
    }

    pub fn package_entries(&self, package_id: i64) -> Result<Vec<PackageEntryRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT package_id, entry_path, virtual_path, size
                 FROM package_entries
                 WHERE package_id = ?1
                 ORDER BY id ASC",
            )
            .context("Failed to prepare query")?;

        let entries = stmt
            .query_map(params![package_id], |row| {
                Ok(PackageEntryRecord {
                    package_id: row.get(0)?,
                    entry_path: row.get(1)?,
                    virtual_path: row.get(2)?,
                    size: row.get::<_, i64>(3)? as u64,
                })
            })
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect results")?;

        Ok(entries)
    }

    /// Name of the package that last stored `virtual_path`, if any.
    pub fn find_package_for(&self, virtual_path: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT p.name FROM package_entries e
                 JOIN packages p ON p.id = e.package_id
                 WHERE e.virtual_path = ?1
                 ORDER BY e.id DESC
                 LIMIT 1",
                params![virtual_path],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query package for path")
    }

    pub fn export_json(&self, output_path: impl AsRef<Path>) -> Result<()> {
        let packages = self.list_packages()?;
        let json = serde_json::to_string_pretty(&packages).context("Failed to serialize to JSON")?;
        std::fs::write(output_path.as_ref(), json)
            .with_context(|| format!("Failed to write JSON to {}", output_path.as_ref().display()))?;
        Ok(())
    }
}
