use crate::errors::AppResult;
use crate::ledger::MarkTable;
use crate::models::DEFAULT_LEVELS;
use rusqlite::{params, Connection};

const SQLITE_BASE_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
  telegram_id INTEGER PRIMARY KEY,
  first_name TEXT,
  last_name TEXT,
  age INTEGER,
  score INTEGER DEFAULT 0
);
CREATE TABLE IF NOT EXISTS levels (
  level_key TEXT PRIMARY KEY,
  is_active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_users_score ON users(score DESC);
";

const POSTGRES_BASE_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
  telegram_id BIGINT PRIMARY KEY,
  first_name TEXT,
  last_name TEXT,
  age INTEGER,
  score BIGINT DEFAULT 0
);
CREATE TABLE IF NOT EXISTS levels (
  level_key TEXT PRIMARY KEY,
  is_active BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE INDEX IF NOT EXISTS idx_users_score ON users(score DESC);
";

const GLOBAL_MARKS_SQL: &str = "
CREATE TABLE IF NOT EXISTS global_marks (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  token TEXT NOT NULL
);
INSERT INTO global_marks (id, token) VALUES (1, '0') ON CONFLICT (id) DO NOTHING;
";

const USER_RESET_MARKS_SQL: &str = "
CREATE TABLE IF NOT EXISTS user_reset_marks (
  telegram_id BIGINT PRIMARY KEY,
  token TEXT NOT NULL
);
";

const USER_DELETION_MARKS_SQL: &str = "
CREATE TABLE IF NOT EXISTS user_deletion_marks (
  telegram_id BIGINT PRIMARY KEY,
  token TEXT NOT NULL
);
";

// (table, column, type)
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[("users", "aptitude_top", "TEXT")];

pub fn mark_table_sql(table: MarkTable) -> &'static str {
    match table {
        MarkTable::Global => GLOBAL_MARKS_SQL,
        MarkTable::Reset => USER_RESET_MARKS_SQL,
        MarkTable::Deletion => USER_DELETION_MARKS_SQL,
    }
}

pub fn apply_sqlite(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(SQLITE_BASE_SQL)?;

    for (table, column, column_type) in ADDITIVE_COLUMNS {
        if sqlite_column_exists(conn, table, column)? {
            continue;
        }
        let alter = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type);
        // A refused upgrade must not block boot.
        match conn.execute(&alter, []) {
            Ok(_) => tracing::info!(table, column, "added missing column"),
            Err(error) => {
                tracing::warn!(table, column, error = %error, "column upgrade skipped")
            }
        }
    }

    {
        let mut seed = conn.prepare("INSERT OR IGNORE INTO levels (level_key, is_active) VALUES (?1, 1)")?;
        for key in DEFAULT_LEVELS {
            seed.execute(params![key])?;
        }
    }

    conn.execute_batch(GLOBAL_MARKS_SQL)?;
    Ok(())
}

pub async fn apply_postgres(client: &tokio_postgres::Client) -> AppResult<()> {
    client.batch_execute(POSTGRES_BASE_SQL).await?;

    for (table, column, column_type) in ADDITIVE_COLUMNS {
        if postgres_column_exists(client, table, column).await? {
            continue;
        }
        let alter = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type);
        match client.execute(alter.as_str(), &[]).await {
            Ok(_) => tracing::info!(table, column, "added missing column"),
            Err(error) => {
                tracing::warn!(table, column, error = %error, "column upgrade skipped")
            }
        }
    }

    let seed = client
        .prepare("INSERT INTO levels (level_key, is_active) VALUES ($1, TRUE) ON CONFLICT (level_key) DO NOTHING")
        .await?;
    for key in DEFAULT_LEVELS {
        client.execute(&seed, &[key]).await?;
    }

    client.batch_execute(GLOBAL_MARKS_SQL).await?;
    Ok(())
}

pub(crate) fn sqlite_column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn postgres_column_exists(client: &tokio_postgres::Client, table: &str, column: &str) -> AppResult<bool> {
    let row = client
        .query_opt(
            "SELECT 1 FROM information_schema.columns
             WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2",
            &[&table, &column],
        )
        .await?;
    Ok(row.is_some())
}
