use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::ConfigSnapshot;
use crate::error::CrawlerError;
use crate::resource::Resource;

pub struct Database {
    pub conn: Connection,
}

/// Shared access to one [`Database`]. Each logical operation acquires the
/// handle, runs its queries and releases it before the next await point.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<Database>>,
}

impl DbHandle {
    pub fn new(db: Database) -> Self {
        DbHandle {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn acquire(&self) -> Result<MutexGuard<'_, Database>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("Database lock poisoned"))
    }
}

pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigRow {
    pub id: i64,
    pub value: ConfigSnapshot,
    pub created: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceRow {
    pub id: i64,
    pub name: String,
    pub created: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub id: i64,
    pub event_type: String,
    pub description: String,
    pub event_count: i64,
    pub created: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlacklistedPhone {
    pub id: i64,
    pub phone: String,
    pub reason: String,
    pub created: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleLogRow {
    pub cycle_number: i64,
    pub working: bool,
    pub grabbers_run: i64,
    pub grabbers_failed: i64,
    pub bids_inserted: i64,
    pub bids_inactivated: i64,
    pub bids_notified: i64,
    pub created: NaiveDateTime,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn =
            Connection::open(path).with_context(|| format!("Failed to open database: {}", path))?;

        let db = Database { conn };
        db.run_migrations()?;
        db.enable_wal()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn enable_wal(&self) -> Result<()> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS resource (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                definition TEXT NOT NULL,
                created TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bid (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rate REAL NOT NULL,
                amount REAL NOT NULL,
                currency TEXT NOT NULL,
                phone TEXT NOT NULL,
                bid_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                in_use BOOLEAN NOT NULL DEFAULT 1,
                dry_run BOOLEAN NOT NULL,
                created TEXT NOT NULL,
                resource_id INTEGER,
                FOREIGN KEY (resource_id) REFERENCES resource(id)
            );

            CREATE INDEX IF NOT EXISTS idx_bid_signature
                ON bid (rate, amount, currency, phone, bid_type, in_use);
            CREATE INDEX IF NOT EXISTS idx_bid_created ON bid (created);

            CREATE TABLE IF NOT EXISTS config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                value TEXT NOT NULL,
                created TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bank TEXT NOT NULL,
                currency TEXT NOT NULL,
                amount REAL NOT NULL,
                rate_buy REAL NOT NULL,
                rate_sale REAL NOT NULL,
                rate_close REAL,
                date_opened TEXT NOT NULL,
                date_closed TEXT,
                status TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rate (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                bank TEXT NOT NULL,
                currency TEXT NOT NULL,
                rate_buy REAL NOT NULL,
                rate_sale REAL NOT NULL,
                UNIQUE (date, bank, currency)
            );

            CREATE TABLE IF NOT EXISTS event (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                description TEXT NOT NULL,
                event_count INTEGER NOT NULL DEFAULT 1,
                created TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS phone_blacklist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phone TEXT NOT NULL UNIQUE,
                reason TEXT NOT NULL,
                created TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fund_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_type TEXT NOT NULL,
                amount REAL NOT NULL,
                balance_after REAL NOT NULL,
                description TEXT,
                created TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cycle_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_number INTEGER NOT NULL,
                working BOOLEAN NOT NULL,
                grabbers_run INTEGER NOT NULL DEFAULT 0,
                grabbers_failed INTEGER NOT NULL DEFAULT 0,
                bids_inserted INTEGER NOT NULL DEFAULT 0,
                bids_inactivated INTEGER NOT NULL DEFAULT 0,
                bids_notified INTEGER NOT NULL DEFAULT 0,
                created TEXT NOT NULL
            );
            ",
            )
            .context("Failed to run database migrations")?;

        Ok(())
    }

    // ─── Config log ────────────────────────────────────────

    /// Append a new config row. Rows are never updated in place.
    pub fn insert_config(&self, value: &ConfigSnapshot, created: NaiveDateTime) -> Result<i64> {
        value.validate()?;
        let json = serde_json::to_string(value).context("Failed to serialize config")?;
        self.conn
            .execute(
                "INSERT INTO config (value, created) VALUES (?1, ?2)",
                params![json, created],
            )
            .context("Failed to insert config")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// The newest config row. Errors with [`CrawlerError::ConfigMissing`]
    /// when the table is empty.
    pub fn load_config(&self) -> Result<ConfigSnapshot> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM config ORDER BY created DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load config")?;

        let raw = raw.ok_or(CrawlerError::ConfigMissing)?;
        serde_json::from_str(&raw).context("Failed to parse stored config")
    }

    pub fn config_history(&self, limit: i64) -> Result<Vec<ConfigRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, value, created FROM config ORDER BY created DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, NaiveDateTime>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read config history")?;

        rows.into_iter()
            .map(|(id, raw, created)| {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config row {}", id))?;
                Ok(ConfigRow { id, value, created })
            })
            .collect()
    }

    // ─── Resources ─────────────────────────────────────────

    pub fn resource_by_name(&self, name: &str) -> Result<Option<ResourceRow>> {
        self.conn
            .query_row(
                "SELECT id, name, created FROM resource WHERE name = ?1",
                [name],
                |row| {
                    Ok(ResourceRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to look up resource")
    }

    /// Register the resource if it is not known yet. Returns `(id, inserted)`.
    pub fn get_or_insert_resource(&self, resource: &Resource) -> Result<(i64, bool)> {
        if let Some(row) = self.resource_by_name(&resource.name)? {
            return Ok((row.id, false));
        }
        let definition =
            serde_json::to_string(resource).context("Failed to serialize resource")?;
        self.conn
            .execute(
                "INSERT INTO resource (name, definition, created) VALUES (?1, ?2, ?3)",
                params![resource.name, definition, now_local()],
            )
            .context("Failed to insert resource")?;
        Ok((self.conn.last_insert_rowid(), true))
    }

    pub fn list_resources(&self) -> Result<Vec<ResourceRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created FROM resource ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ResourceRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list resources")?;
        Ok(rows)
    }

    // ─── Events ────────────────────────────────────────────

    pub fn add_event(&self, event_type: &str, description: &str, event_count: i64) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO event (event_type, description, event_count, created)
                 VALUES (?1, ?2, ?3, ?4)",
                params![event_type, description, event_count, now_local()],
            )
            .context("Failed to insert event")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn recent_events(&self, limit: i64) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_type, description, event_count, created
             FROM event ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    event_type: row.get(1)?,
                    description: row.get(2)?,
                    event_count: row.get(3)?,
                    created: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read events")?;
        Ok(rows)
    }

    // ─── Phone blacklist ───────────────────────────────────

    pub fn blacklist_phone(&self, phone: &str, reason: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO phone_blacklist (phone, reason, created)
                 VALUES (?1, ?2, ?3)",
                params![phone, reason, now_local()],
            )
            .context("Failed to blacklist phone")?;
        Ok(())
    }

    pub fn is_phone_blacklisted(&self, phone: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM phone_blacklist WHERE phone = ?1",
                [phone],
                |row| row.get(0),
            )
            .context("Failed to check phone blacklist")?;
        Ok(count > 0)
    }

    pub fn blacklisted_phones(&self) -> Result<Vec<BlacklistedPhone>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, phone, reason, created FROM phone_blacklist ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(BlacklistedPhone {
                    id: row.get(0)?,
                    phone: row.get(1)?,
                    reason: row.get(2)?,
                    created: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read phone blacklist")?;
        Ok(rows)
    }

    // ─── Fund ledger ───────────────────────────────────────

    /// Seed the trading fund on first run. No-op when any entry exists.
    pub fn ensure_fund_seeded(&self, amount: f64) -> Result<()> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM fund_log", [], |row| row.get(0))
            .context("Failed to count fund entries")?;
        if count == 0 {
            self.log_fund_entry("seed", amount, amount, "Initial trading fund")?;
        }
        Ok(())
    }

    pub fn current_fund(&self) -> Result<f64> {
        let balance: Option<f64> = self
            .conn
            .query_row(
                "SELECT balance_after FROM fund_log ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read current fund")?;
        Ok(balance.unwrap_or(0.0))
    }

    pub fn log_fund_entry(
        &self,
        entry_type: &str,
        amount: f64,
        balance_after: f64,
        description: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO fund_log (entry_type, amount, balance_after, description, created)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![entry_type, amount, balance_after, description, now_local()],
            )
            .context("Failed to log fund entry")?;
        Ok(())
    }

    // ─── Cycle log ─────────────────────────────────────────

    pub fn next_cycle_number(&self) -> Result<i64> {
        let max: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(cycle_number), 0) FROM cycle_log",
                [],
                |row| row.get(0),
            )
            .context("Failed to read cycle number")?;
        Ok(max + 1)
    }

    pub fn log_cycle(&self, row: &CycleLogRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cycle_log (cycle_number, working, grabbers_run, grabbers_failed,
                     bids_inserted, bids_inactivated, bids_notified, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.cycle_number,
                    row.working,
                    row.grabbers_run,
                    row.grabbers_failed,
                    row.bids_inserted,
                    row.bids_inactivated,
                    row.bids_notified,
                    row.created,
                ],
            )
            .context("Failed to log cycle")?;
        Ok(())
    }

    pub fn recent_cycles(&self, limit: i64) -> Result<Vec<CycleLogRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle_number, working, grabbers_run, grabbers_failed, bids_inserted,
                    bids_inactivated, bids_notified, created
             FROM cycle_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok(CycleLogRow {
                    cycle_number: row.get(0)?,
                    working: row.get(1)?,
                    grabbers_run: row.get(2)?,
                    grabbers_failed: row.get(3)?,
                    bids_inserted: row.get(4)?,
                    bids_inactivated: row.get(5)?,
                    bids_notified: row.get(6)?,
                    created: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read cycle log")?;
        Ok(rows)
    }
}
