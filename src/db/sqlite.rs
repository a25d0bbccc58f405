use crate::db::{schema, BackendKind, StoreBackend};
use crate::errors::{AppError, AppResult};
use crate::ledger::{MarkKey, MarkTable};
use crate::models::{Aptitude, LevelMap, NewUser, Profile};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const USER_COLUMNS: &str = "telegram_id, first_name, last_name, age, score, aptitude_top";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum ConnectionSlot {
    Idle,
    Open(Connection),
    Closed,
}

#[derive(Debug, Clone)]
pub struct SqliteBackend {
    db_path: PathBuf,
    slot: Arc<Mutex<ConnectionSlot>>,
}

impl SqliteBackend {
    pub fn new(path: &Path) -> Self {
        Self {
            db_path: path.to_path_buf(),
            slot: Arc::new(Mutex::new(ConnectionSlot::Idle)),
        }
    }

    async fn with_conn<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> AppResult<T> + Send + 'static,
    {
        let slot = self.slot.clone();
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut slot = slot
                .lock()
                .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            if matches!(*slot, ConnectionSlot::Idle) {
                *slot = ConnectionSlot::Open(open_connection(&path)?);
            }
            match &*slot {
                ConnectionSlot::Open(conn) => op(conn),
                _ => Err(AppError::StoreUnavailable("sqlite store is closed".to_string())),
            }
        })
        .await?
    }

    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &'static str) -> AppResult<()> {
        self.with_conn(move |conn| conn.execute_batch(sql).map_err(AppError::from))
            .await
    }
}

fn open_connection(path: &Path) -> AppResult<Connection> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
    }
    let conn = Connection::open(path).map_err(|err| AppError::StoreUnavailable(err.to_string()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    // synchronous = NORMAL
    conn.pragma_update(None, "synchronous", 1)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    tracing::debug!(path = %path.display(), journal_mode = %journal_mode, "sqlite connection opened");
    Ok(conn)
}

fn parse_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let aptitude: Option<String> = row.get(5)?;
    Ok(Profile {
        telegram_id: row.get(0)?,
        first_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        last_name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        age: row.get::<_, Option<i32>>(3)?.unwrap_or(0),
        score: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        aptitude_top: aptitude.as_deref().and_then(Aptitude::from_db),
    })
}

fn query_profiles(conn: &Connection, sql: &str, limit: u32) -> AppResult<Vec<Profile>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![limit], parse_profile_row)?;
    let mut profiles = Vec::new();
    for row in rows {
        profiles.push(row?);
    }
    Ok(profiles)
}

#[async_trait]
impl StoreBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn init_schema(&self) -> AppResult<()> {
        self.with_conn(|conn| schema::apply_sqlite(conn)).await
    }

    async fn insert_user_if_absent(&self, user: &NewUser) -> AppResult<bool> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (telegram_id, first_name, last_name, age) VALUES (?1, ?2, ?3, ?4)",
                params![user.telegram_id, user.first_name, user.last_name, user.age],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn raise_score(&self, telegram_id: i64, score: i64) -> AppResult<bool> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE users SET score = ?2 WHERE telegram_id = ?1 AND COALESCE(score, 0) < ?2",
                params![telegram_id, score],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn set_aptitude(&self, telegram_id: i64, aptitude: Option<Aptitude>) -> AppResult<bool> {
        let label = aptitude.map(Aptitude::as_str);
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE users SET aptitude_top = ?2 WHERE telegram_id = ?1",
                params![telegram_id, label],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn fetch_user(&self, telegram_id: i64) -> AppResult<Option<Profile>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM users WHERE telegram_id = ?1", USER_COLUMNS);
            conn.query_row(&sql, [telegram_id], parse_profile_row)
                .optional()
                .map_err(AppError::from)
        })
        .await
    }

    async fn fetch_top(&self, limit: u32) -> AppResult<Vec<Profile>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM users ORDER BY COALESCE(score, 0) DESC, telegram_id ASC LIMIT ?1",
                USER_COLUMNS
            );
            query_profiles(conn, &sql, limit)
        })
        .await
    }

    async fn fetch_users(&self, limit: u32) -> AppResult<Vec<Profile>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM users ORDER BY telegram_id ASC LIMIT ?1", USER_COLUMNS);
            query_profiles(conn, &sql, limit)
        })
        .await
    }

    async fn count_users(&self) -> AppResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(1) FROM users", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn count_users_above(&self, score: i64) -> AppResult<u64> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(1) FROM users WHERE COALESCE(score, 0) > ?1",
                [score],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn clear_scores(&self, scope: Option<i64>) -> AppResult<u64> {
        self.with_conn(move |conn| {
            let affected = match scope {
                Some(telegram_id) => conn.execute(
                    "UPDATE users SET score = 0, aptitude_top = NULL WHERE telegram_id = ?1",
                    [telegram_id],
                )?,
                None => conn.execute("UPDATE users SET score = 0, aptitude_top = NULL", [])?,
            };
            Ok(affected as u64)
        })
        .await
    }

    async fn delete_users(&self, scope: Option<i64>) -> AppResult<u64> {
        self.with_conn(move |conn| {
            let affected = match scope {
                Some(telegram_id) => conn.execute("DELETE FROM users WHERE telegram_id = ?1", [telegram_id])?,
                None => conn.execute("DELETE FROM users", [])?,
            };
            Ok(affected as u64)
        })
        .await
    }

    async fn fetch_levels(&self) -> AppResult<LevelMap> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT level_key, is_active FROM levels ORDER BY level_key ASC")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)))?;
            let mut levels = LevelMap::new();
            for row in rows {
                let (key, active) = row?;
                levels.insert(key, active);
            }
            Ok(levels)
        })
        .await
    }

    async fn upsert_level(&self, level_key: &str, is_active: bool) -> AppResult<()> {
        let level_key = level_key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO levels (level_key, is_active) VALUES (?1, ?2)
                 ON CONFLICT (level_key) DO UPDATE SET is_active = excluded.is_active",
                params![level_key, is_active],
            )?;
            Ok(())
        })
        .await
    }

    async fn ensure_mark_table(&self, table: MarkTable) -> AppResult<()> {
        self.with_conn(move |conn| {
            conn.execute_batch(schema::mark_table_sql(table))?;
            Ok(())
        })
        .await
    }

    async fn read_mark(&self, key: MarkKey) -> AppResult<Option<String>> {
        self.with_conn(move |conn| {
            let token = match key.telegram_id() {
                None => conn
                    .query_row("SELECT token FROM global_marks WHERE id = 1", [], |row| row.get(0))
                    .optional()?,
                Some(telegram_id) => {
                    let sql = format!(
                        "SELECT token FROM {} WHERE telegram_id = ?1",
                        key.table().table_name()
                    );
                    conn.query_row(&sql, [telegram_id], |row| row.get(0)).optional()?
                }
            };
            Ok(token)
        })
        .await
    }

    async fn write_mark(&self, key: MarkKey, token: &str) -> AppResult<()> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            match key.telegram_id() {
                None => conn.execute(
                    "INSERT INTO global_marks (id, token) VALUES (1, ?1)
                     ON CONFLICT (id) DO UPDATE SET token = excluded.token",
                    [&token],
                )?,
                Some(telegram_id) => {
                    let sql = format!(
                        "INSERT INTO {} (telegram_id, token) VALUES (?1, ?2)
                         ON CONFLICT (telegram_id) DO UPDATE SET token = excluded.token",
                        key.table().table_name()
                    );
                    conn.execute(&sql, params![telegram_id, token])?
                }
            };
            Ok(())
        })
        .await
    }

    async fn clear_mark(&self, key: MarkKey) -> AppResult<()> {
        self.with_conn(move |conn| {
            match key.telegram_id() {
                None => conn.execute("UPDATE global_marks SET token = '0' WHERE id = 1", [])?,
                Some(telegram_id) => {
                    let sql = format!("DELETE FROM {} WHERE telegram_id = ?1", key.table().table_name());
                    conn.execute(&sql, [telegram_id])?
                }
            };
            Ok(())
        })
        .await
    }

    async fn clear_user_marks(&self, table: MarkTable) -> AppResult<()> {
        if table == MarkTable::Global {
            return Ok(());
        }
        self.with_conn(move |conn| {
            conn.execute(&format!("DELETE FROM {}", table.table_name()), [])?;
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        let slot = self.slot.clone();
        let result = tokio::task::spawn_blocking(move || -> AppResult<()> {
            let mut slot = slot
                .lock()
                .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            if let ConnectionSlot::Open(conn) = std::mem::replace(&mut *slot, ConnectionSlot::Closed) {
                conn.close().map_err(|(_, error)| AppError::from(error))?;
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!(error = %error, "sqlite connection did not close cleanly"),
            Err(error) => tracing::warn!(error = %error, "sqlite close task failed"),
        }
    }
}
