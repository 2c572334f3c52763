use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::engine::error::StoreError;
use crate::engine::store::{ExpiredCounts, Store};
use crate::engine::types::{PackageMetadata, ResolvedTree};
use crate::engine::vulnerability::{SemverSpec, Severity, Vulnerability};

/// Schema migrations
/// Each version contains a list of SQL statements to execute
const MIGRATIONS: &[&[&str]] = &[
    // v1: latest_version column for cheap "latest" lookups
    &["ALTER TABLE packages ADD COLUMN latest_version TEXT"],
    // v2: package_manager column on vulnerabilities
    &["ALTER TABLE vulnerabilities ADD COLUMN package_manager TEXT NOT NULL DEFAULT 'npm'"],
];

/// SQLite-backed implementation of [`Store`]
pub struct Cache {
    conn: Mutex<Connection>,
}

impl Cache {
    pub fn new(db_path: &Path) -> Result<Self, StoreError> {
        info!("Initializing cache database at {:?}", db_path);

        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        debug!("Database connection established");

        let cache = Self {
            conn: Mutex::new(conn),
        };

        cache.create_schema()?;
        info!("Cache initialized successfully");

        Ok(cache)
    }

    /// Acquire database connection lock with proper error handling
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        debug!("Creating database schema");

        let conn = self.lock_conn()?;

        // Create base tables (without migration columns)
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS packages (
                name TEXT PRIMARY KEY,
                info TEXT NOT NULL,
                create_time INTEGER NOT NULL,
                expire_time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_packages_expire_time ON packages(expire_time);

            CREATE TABLE IF NOT EXISTS resolved_versions (
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                content TEXT NOT NULL,
                create_time INTEGER NOT NULL,
                expire_time INTEGER NOT NULL,
                PRIMARY KEY (name, version)
            );
            CREATE INDEX IF NOT EXISTS idx_resolved_versions_expire_time
                ON resolved_versions(expire_time);

            CREATE TABLE IF NOT EXISTS uploaded_files (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                create_time INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vulnerabilities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                title TEXT NOT NULL,
                publication_time INTEGER NOT NULL,
                semver TEXT NOT NULL,
                severity TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_vulnerabilities_name ON vulnerabilities(name);
            "#,
        )?;

        // Apply migrations
        Self::apply_migrations(&conn)?;

        debug!("Database schema created successfully");
        Ok(())
    }

    /// Apply pending migrations based on user_version pragma
    fn apply_migrations(conn: &Connection) -> Result<(), StoreError> {
        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        for (i, statements) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i32;
            if version > current_version {
                for sql in *statements {
                    match conn.execute(sql, []) {
                        Ok(_) => {}
                        Err(rusqlite::Error::SqliteFailure(_, Some(ref msg)))
                            if msg.contains("duplicate column name") =>
                        {
                            debug!("Column already exists, skipping: {}", sql);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                debug!("Applied migration v{}", version);
            }
        }

        let target_version = MIGRATIONS.len() as i32;
        if target_version > current_version {
            conn.pragma_update(None, "user_version", target_version)?;
            debug!("Updated schema version to v{}", target_version);
        }

        Ok(())
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Rows with unreadable fields are skipped with a warning
    fn row_to_vulnerability(row: VulnerabilityRow) -> Option<Vulnerability> {
        let (id, name, title, publication_ms, semver, severity, package_manager) = row;
        let Some(publication_time) = DateTime::from_timestamp_millis(publication_ms) else {
            warn!("Invalid publication time {} for {}", publication_ms, id);
            return None;
        };
        let semver: SemverSpec = serde_json::from_str(&semver)
            .inspect_err(|e| warn!("Could not parse semver of {}: {}", id, e))
            .ok()?;
        let Ok(severity) = severity.parse::<Severity>() else {
            warn!("Unknown severity {:?} for {}", severity, id);
            return None;
        };

        Some(Vulnerability {
            id,
            package_manager,
            package_name: name,
            title,
            publication_time,
            semver,
            severity,
        })
    }
}

type VulnerabilityRow = (String, String, String, i64, String, String, String);

fn read_vulnerability_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VulnerabilityRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

impl Store for Cache {
    fn get_package(&self, name: &str) -> Result<Option<PackageMetadata>, StoreError> {
        let conn = self.lock_conn()?;
        let info: Option<String> = conn
            .query_row(
                "SELECT info FROM packages WHERE name = ?1 AND expire_time > ?2",
                (name, Self::now_ms()),
                |row| row.get(0),
            )
            .optional()?;

        Ok(info.map(|info| serde_json::from_str(&info)).transpose()?)
    }

    fn get_package_latest_version(&self, name: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock_conn()?;
        let latest: Option<Option<String>> = conn
            .query_row(
                "SELECT latest_version FROM packages WHERE name = ?1 AND expire_time > ?2",
                (name, Self::now_ms()),
                |row| row.get(0),
            )
            .optional()?;

        Ok(latest.flatten())
    }

    fn put_package(
        &self,
        name: &str,
        package: &PackageMetadata,
        expire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let info = serde_json::to_string(package)?;
        debug!("Saving package {} ({} bytes)", name, info.len());

        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO packages (name, info, latest_version, create_time, expire_time)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name) DO UPDATE SET
                info = excluded.info,
                latest_version = excluded.latest_version,
                create_time = excluded.create_time,
                expire_time = excluded.expire_time
            "#,
            (
                name,
                info,
                package.latest_tag(),
                Self::now_ms(),
                expire_at.timestamp_millis(),
            ),
        )?;
        Ok(())
    }

    fn get_resolved_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<ResolvedTree>, StoreError> {
        let conn = self.lock_conn()?;
        let content: Option<String> = conn
            .query_row(
                r#"
                SELECT content FROM resolved_versions
                WHERE name = ?1 AND version = ?2 AND expire_time > ?3
                "#,
                (name, version, Self::now_ms()),
                |row| row.get(0),
            )
            .optional()?;

        Ok(content.map(|c| serde_json::from_str(&c)).transpose()?)
    }

    fn put_resolved_version(
        &self,
        name: &str,
        version: &str,
        tree: &ResolvedTree,
        expire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let content = serde_json::to_string(tree)?;
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO resolved_versions (name, version, content, create_time, expire_time)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name, version) DO UPDATE SET
                content = excluded.content,
                create_time = excluded.create_time,
                expire_time = excluded.expire_time
            "#,
            (
                name,
                version,
                content,
                Self::now_ms(),
                expire_at.timestamp_millis(),
            ),
        )?;
        Ok(())
    }

    fn get_uploaded_file(&self, id: &str) -> Result<Option<ResolvedTree>, StoreError> {
        let conn = self.lock_conn()?;
        let content: Option<String> = conn
            .query_row(
                "SELECT content FROM uploaded_files WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(content.map(|c| serde_json::from_str(&c)).transpose()?)
    }

    fn put_uploaded_file(&self, id: &str, tree: &ResolvedTree) -> Result<(), StoreError> {
        let content = serde_json::to_string(tree)?;
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO uploaded_files (id, content, create_time)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET content = excluded.content
            "#,
            (id, content, Self::now_ms()),
        )?;
        Ok(())
    }

    fn get_vulnerabilities_for_packages(
        &self,
        names: &[String],
    ) -> Result<Vec<Vulnerability>, StoreError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        // Build WHERE IN clause with placeholders
        let placeholders: Vec<_> = (0..names.len()).map(|i| format!("?{}", i + 1)).collect();
        let query = format!(
            r#"
            SELECT id, name, title, publication_time, semver, severity, package_manager
            FROM vulnerabilities
            WHERE name IN ({})
            ORDER BY name, publication_time DESC
            "#,
            placeholders.join(", ")
        );

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(names), read_vulnerability_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(Self::row_to_vulnerability)
            .collect())
    }

    fn get_latest_vulnerability(&self) -> Result<Option<Vulnerability>, StoreError> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, name, title, publication_time, semver, severity, package_manager
                FROM vulnerabilities
                ORDER BY publication_time DESC
                LIMIT 1
                "#,
                [],
                read_vulnerability_row,
            )
            .optional()?;

        Ok(row.and_then(Self::row_to_vulnerability))
    }

    fn put_vulnerability(&self, vulnerability: &Vulnerability) -> Result<(), StoreError> {
        let semver = serde_json::to_string(&vulnerability.semver)?;
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO vulnerabilities
                (id, name, title, publication_time, semver, severity, package_manager)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                title = excluded.title,
                publication_time = excluded.publication_time,
                semver = excluded.semver,
                severity = excluded.severity,
                package_manager = excluded.package_manager
            "#,
            (
                &vulnerability.id,
                &vulnerability.package_name,
                &vulnerability.title,
                vulnerability.publication_time.timestamp_millis(),
                semver,
                vulnerability.severity.as_str(),
                &vulnerability.package_manager,
            ),
        )?;
        Ok(())
    }

    fn expire_older_than(&self, now: DateTime<Utc>) -> Result<ExpiredCounts, StoreError> {
        let now = now.timestamp_millis();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let packages = tx.execute("DELETE FROM packages WHERE expire_time < ?1", [now])?;
        let resolved_versions =
            tx.execute("DELETE FROM resolved_versions WHERE expire_time < ?1", [now])?;

        tx.commit()?;

        if packages > 0 || resolved_versions > 0 {
            info!(
                "Expired {} packages and {} resolved versions",
                packages, resolved_versions
            );
        }

        Ok(ExpiredCounts {
            packages,
            resolved_versions,
        })
    }
}
