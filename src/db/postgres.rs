use crate::config::PoolOptions;
use crate::db::tls::{strip_tls_params, TlsMode};
use crate::db::{schema, BackendKind, StoreBackend};
use crate::errors::{AppError, AppResult};
use crate::ledger::{MarkKey, MarkTable};
use crate::models::{Aptitude, LevelMap, NewUser, Profile};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use tokio_postgres::config::SslMode;
use tokio_postgres::{NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;

const USER_COLUMNS: &str =
    "telegram_id::BIGINT, first_name, last_name, age::INTEGER, score::BIGINT, aptitude_top";

pub struct PostgresBackend {
    pool: Pool,
}

impl PostgresBackend {
    pub async fn connect(url: &str, options: &PoolOptions) -> AppResult<Self> {
        let tls_mode = TlsMode::from_connection_string(url);
        let mut pg_config: tokio_postgres::Config = strip_tls_params(url)
            .parse()
            .map_err(|error: tokio_postgres::Error| AppError::Config(format!("invalid DATABASE_URL: {}", error)))?;
        pg_config.connect_timeout(options.connect_timeout);
        pg_config.ssl_mode(match tls_mode {
            TlsMode::Disabled => SslMode::Disable,
            TlsMode::Unverified | TlsMode::Verified => SslMode::Require,
        });

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = match tls_mode.client_config()? {
            Some(client_config) => {
                Manager::from_config(pg_config, MakeRustlsConnect::new(client_config), manager_config)
            }
            None => Manager::from_config(pg_config, NoTls, manager_config),
        };

        let pool = Pool::builder(manager)
            .max_size(options.max_size)
            .runtime(Runtime::Tokio1)
            .create_timeout(Some(options.connect_timeout))
            .wait_timeout(Some(options.connect_timeout))
            .build()
            .map_err(|error| AppError::Config(format!("postgres pool setup failed: {}", error)))?;

        // Boot fails instead of hanging when the server never answers.
        let first_checkout = tokio::time::timeout(options.connect_timeout, pool.get()).await;
        match first_checkout {
            Ok(Ok(_client)) => {}
            Ok(Err(error)) => {
                pool.close();
                return Err(AppError::StoreUnavailable(format!("postgres unreachable: {}", error)));
            }
            Err(_) => {
                pool.close();
                return Err(AppError::StoreUnavailable(format!(
                    "postgres did not answer within {}s",
                    options.connect_timeout.as_secs()
                )));
            }
        }

        tracing::info!(tls = tls_mode.as_str(), max_size = options.max_size, "postgres pool ready");
        Ok(Self { pool })
    }

    async fn client(&self) -> AppResult<Object> {
        Ok(self.pool.get().await?)
    }
}

fn parse_profile_row(row: &Row) -> Result<Profile, tokio_postgres::Error> {
    let aptitude: Option<String> = row.try_get(5)?;
    Ok(Profile {
        telegram_id: row.try_get(0)?,
        first_name: row.try_get::<_, Option<String>>(1)?.unwrap_or_default(),
        last_name: row.try_get::<_, Option<String>>(2)?.unwrap_or_default(),
        age: row.try_get::<_, Option<i32>>(3)?.unwrap_or(0),
        score: row.try_get::<_, Option<i64>>(4)?.unwrap_or(0),
        aptitude_top: aptitude.as_deref().and_then(Aptitude::from_db),
    })
}

fn parse_profile_rows(rows: &[Row]) -> AppResult<Vec<Profile>> {
    Ok(rows.iter().map(parse_profile_row).collect::<Result<Vec<_>, _>>()?)
}

fn parse_count(row: &Row) -> AppResult<u64> {
    let count: i64 = row.try_get(0)?;
    Ok(count.max(0) as u64)
}

#[async_trait]
impl StoreBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn init_schema(&self) -> AppResult<()> {
        let client = self.client().await?;
        schema::apply_postgres(&client).await
    }

    async fn insert_user_if_absent(&self, user: &NewUser) -> AppResult<bool> {
        let client = self.client().await?;
        let inserted = client
            .execute(
                "INSERT INTO users (telegram_id, first_name, last_name, age) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (telegram_id) DO NOTHING",
                &[&user.telegram_id, &user.first_name, &user.last_name, &user.age],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn raise_score(&self, telegram_id: i64, score: i64) -> AppResult<bool> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE users SET score = $2 WHERE telegram_id = $1 AND COALESCE(score, 0) < $2",
                &[&telegram_id, &score],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn set_aptitude(&self, telegram_id: i64, aptitude: Option<Aptitude>) -> AppResult<bool> {
        let client = self.client().await?;
        let label = aptitude.map(Aptitude::as_str);
        let updated = client
            .execute(
                "UPDATE users SET aptitude_top = $2 WHERE telegram_id = $1",
                &[&telegram_id, &label],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn fetch_user(&self, telegram_id: i64) -> AppResult<Option<Profile>> {
        let client = self.client().await?;
        let sql = format!("SELECT {} FROM users WHERE telegram_id = $1", USER_COLUMNS);
        let row = client.query_opt(sql.as_str(), &[&telegram_id]).await?;
        Ok(row.as_ref().map(parse_profile_row).transpose()?)
    }

    async fn fetch_top(&self, limit: u32) -> AppResult<Vec<Profile>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT {} FROM users ORDER BY COALESCE(score, 0) DESC, telegram_id ASC LIMIT $1",
            USER_COLUMNS
        );
        let rows = client.query(sql.as_str(), &[&i64::from(limit)]).await?;
        parse_profile_rows(&rows)
    }

    async fn fetch_users(&self, limit: u32) -> AppResult<Vec<Profile>> {
        let client = self.client().await?;
        let sql = format!("SELECT {} FROM users ORDER BY telegram_id ASC LIMIT $1", USER_COLUMNS);
        let rows = client.query(sql.as_str(), &[&i64::from(limit)]).await?;
        parse_profile_rows(&rows)
    }

    async fn count_users(&self) -> AppResult<u64> {
        let client = self.client().await?;
        let row = client.query_one("SELECT COUNT(1) FROM users", &[]).await?;
        parse_count(&row)
    }

    async fn count_users_above(&self, score: i64) -> AppResult<u64> {
        let client = self.client().await?;
        let row = client
            .query_one("SELECT COUNT(1) FROM users WHERE COALESCE(score, 0) > $1", &[&score])
            .await?;
        parse_count(&row)
    }

    async fn clear_scores(&self, scope: Option<i64>) -> AppResult<u64> {
        let client = self.client().await?;
        let affected = match scope {
            Some(telegram_id) => {
                client
                    .execute(
                        "UPDATE users SET score = 0, aptitude_top = NULL WHERE telegram_id = $1",
                        &[&telegram_id],
                    )
                    .await?
            }
            None => client.execute("UPDATE users SET score = 0, aptitude_top = NULL", &[]).await?,
        };
        Ok(affected)
    }

    async fn delete_users(&self, scope: Option<i64>) -> AppResult<u64> {
        let client = self.client().await?;
        let affected = match scope {
            Some(telegram_id) => {
                client
                    .execute("DELETE FROM users WHERE telegram_id = $1", &[&telegram_id])
                    .await?
            }
            None => client.execute("DELETE FROM users", &[]).await?,
        };
        Ok(affected)
    }

    async fn fetch_levels(&self) -> AppResult<LevelMap> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT level_key, is_active::BOOLEAN FROM levels ORDER BY level_key ASC", &[])
            .await?;
        let mut levels = LevelMap::new();
        for row in &rows {
            levels.insert(row.try_get::<_, String>(0)?, row.try_get::<_, bool>(1)?);
        }
        Ok(levels)
    }

    async fn upsert_level(&self, level_key: &str, is_active: bool) -> AppResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO levels (level_key, is_active) VALUES ($1, $2)
                 ON CONFLICT (level_key) DO UPDATE SET is_active = EXCLUDED.is_active",
                &[&level_key, &is_active],
            )
            .await?;
        Ok(())
    }

    async fn ensure_mark_table(&self, table: MarkTable) -> AppResult<()> {
        let client = self.client().await?;
        client.batch_execute(schema::mark_table_sql(table)).await?;
        Ok(())
    }

    async fn read_mark(&self, key: MarkKey) -> AppResult<Option<String>> {
        let client = self.client().await?;
        let row = match key.telegram_id() {
            None => {
                client
                    .query_opt("SELECT token FROM global_marks WHERE id = 1", &[])
                    .await?
            }
            Some(telegram_id) => {
                let sql = format!("SELECT token FROM {} WHERE telegram_id = $1", key.table().table_name());
                client.query_opt(sql.as_str(), &[&telegram_id]).await?
            }
        };
        Ok(row.map(|row| row.try_get::<_, String>(0)).transpose()?)
    }

    async fn write_mark(&self, key: MarkKey, token: &str) -> AppResult<()> {
        let client = self.client().await?;
        match key.telegram_id() {
            None => {
                client
                    .execute(
                        "INSERT INTO global_marks (id, token) VALUES (1, $1)
                         ON CONFLICT (id) DO UPDATE SET token = EXCLUDED.token",
                        &[&token],
                    )
                    .await?
            }
            Some(telegram_id) => {
                let sql = format!(
                    "INSERT INTO {} (telegram_id, token) VALUES ($1, $2)
                     ON CONFLICT (telegram_id) DO UPDATE SET token = EXCLUDED.token",
                    key.table().table_name()
                );
                client.execute(sql.as_str(), &[&telegram_id, &token]).await?
            }
        };
        Ok(())
    }

    async fn clear_mark(&self, key: MarkKey) -> AppResult<()> {
        let client = self.client().await?;
        match key.telegram_id() {
            None => {
                client
                    .execute("UPDATE global_marks SET token = '0' WHERE id = 1", &[])
                    .await?
            }
            Some(telegram_id) => {
                let sql = format!("DELETE FROM {} WHERE telegram_id = $1", key.table().table_name());
                client.execute(sql.as_str(), &[&telegram_id]).await?
            }
        };
        Ok(())
    }

    async fn clear_user_marks(&self, table: MarkTable) -> AppResult<()> {
        if table == MarkTable::Global {
            return Ok(());
        }
        let client = self.client().await?;
        let sql = format!("DELETE FROM {}", table.table_name());
        client.execute(sql.as_str(), &[]).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}
