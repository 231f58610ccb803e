use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use widget_search_core::{distinct_by_id, fixture_catalogue, NewWidget, Widget, WidgetId};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS widgets (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  price REAL NOT NULL CHECK (price >= 0),
  enabled INTEGER NOT NULL CHECK (enabled IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_widgets_enabled ON widgets(enabled);
";

const WIDGET_COLUMNS: &str = "id, name, price, enabled";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedSummary {
    pub inserted: usize,
    pub skipped_existing_catalogue: bool,
}

impl SqliteStore {
    /// Open a SQLite-backed widget store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Validate and persist one widget, returning it with its assigned identity.
    ///
    /// # Errors
    /// Returns an error when validation or the insert fails.
    pub fn insert_widget(&mut self, widget: NewWidget) -> Result<Widget> {
        widget.validate()?;
        self.conn
            .execute(
                "INSERT INTO widgets(name, price, enabled) VALUES (?1, ?2, ?3)",
                params![widget.name, widget.price, widget.enabled],
            )
            .with_context(|| format!("failed to insert widget {}", widget.name))?;
        let id = WidgetId(self.conn.last_insert_rowid());
        Ok(widget.with_id(id))
    }

    /// All widgets in identity order.
    ///
    /// # Errors
    /// Returns an error when the widgets table cannot be read.
    pub fn list_widgets(&self) -> Result<Vec<Widget>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {WIDGET_COLUMNS} FROM widgets ORDER BY id ASC"))
            .context("failed to prepare widget listing")?;
        let rows = stmt.query_map([], widget_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read widgets")
    }

    /// Widgets whose name contains `term` (case-sensitive), in identity order, without duplicates.
    ///
    /// # Errors
    /// Returns an error when the widgets table cannot be queried.
    pub fn find_by_name_containing(&self, term: &str) -> Result<Vec<Widget>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {WIDGET_COLUMNS} FROM widgets WHERE instr(name, ?1) > 0 ORDER BY id ASC"
            ))
            .context("failed to prepare widget lookup")?;
        let rows = stmt.query_map(params![term], widget_from_row)?;
        let widgets = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to look up widgets containing {term:?}"))?;
        Ok(distinct_by_id(widgets))
    }

    /// Insert the demo catalogue unless the store already holds widgets.
    ///
    /// # Errors
    /// Returns an error when counting or inserting widgets fails.
    pub fn seed_fixtures(&mut self) -> Result<SeedSummary> {
        let existing = self
            .conn
            .query_row("SELECT COUNT(*) FROM widgets", [], |row| row.get::<_, i64>(0))
            .context("failed to count widgets")?;
        if existing > 0 {
            return Ok(SeedSummary { inserted: 0, skipped_existing_catalogue: true });
        }

        let tx = self.conn.transaction().context("failed to start seed transaction")?;
        let catalogue = fixture_catalogue();
        for widget in &catalogue {
            tx.execute(
                "INSERT INTO widgets(name, price, enabled) VALUES (?1, ?2, ?3)",
                params![widget.name, widget.price, widget.enabled],
            )
            .with_context(|| format!("failed to seed widget {}", widget.name))?;
        }
        tx.commit().context("failed to commit seed transaction")?;

        Ok(SeedSummary { inserted: catalogue.len(), skipped_existing_catalogue: false })
    }
}

fn widget_from_row(row: &Row<'_>) -> rusqlite::Result<Widget> {
    Ok(Widget {
        id: WidgetId(row.get(0)?),
        name: row.get(1)?,
        price: row.get(2)?,
        enabled: row.get(3)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
