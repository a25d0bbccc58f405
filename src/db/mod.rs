pub mod postgres;
pub mod schema;
pub mod sqlite;
pub mod tls;

use crate::config::StoreConfig;
use crate::errors::{AppError, AppResult};
use crate::ledger::{InvalidationLedger, MarkKey, MarkTable};
use crate::models::{Aptitude, LevelMap, NewUser, Profile, Standing};
use crate::redaction::Redactor;
use async_trait::async_trait;
use std::sync::Arc;

pub const MAX_TOP_LIMIT: u32 = 100;
pub const DEFAULT_LIST_LIMIT: u32 = 200;
pub const MAX_LIST_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Postgres,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

// `scope = None` means every user.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn init_schema(&self) -> AppResult<()>;

    async fn insert_user_if_absent(&self, user: &NewUser) -> AppResult<bool>;

    async fn raise_score(&self, telegram_id: i64, score: i64) -> AppResult<bool>;

    async fn set_aptitude(&self, telegram_id: i64, aptitude: Option<Aptitude>) -> AppResult<bool>;

    async fn fetch_user(&self, telegram_id: i64) -> AppResult<Option<Profile>>;

    async fn fetch_top(&self, limit: u32) -> AppResult<Vec<Profile>>;

    async fn fetch_users(&self, limit: u32) -> AppResult<Vec<Profile>>;

    async fn count_users(&self) -> AppResult<u64>;

    async fn count_users_above(&self, score: i64) -> AppResult<u64>;

    async fn clear_scores(&self, scope: Option<i64>) -> AppResult<u64>;

    async fn delete_users(&self, scope: Option<i64>) -> AppResult<u64>;

    async fn fetch_levels(&self) -> AppResult<LevelMap>;

    async fn upsert_level(&self, level_key: &str, is_active: bool) -> AppResult<()>;

    async fn ensure_mark_table(&self, table: MarkTable) -> AppResult<()>;

    async fn read_mark(&self, key: MarkKey) -> AppResult<Option<String>>;

    async fn write_mark(&self, key: MarkKey, token: &str) -> AppResult<()>;

    async fn clear_mark(&self, key: MarkKey) -> AppResult<()>;

    async fn clear_user_marks(&self, table: MarkTable) -> AppResult<()>;

    async fn close(&self);
}

#[derive(Clone)]
pub struct ScoreStore {
    backend: Arc<dyn StoreBackend>,
    ledger: InvalidationLedger,
}

impl ScoreStore {
    pub async fn open(config: &StoreConfig) -> AppResult<Self> {
        let backend: Arc<dyn StoreBackend> = match config {
            StoreConfig::Sqlite { path } => {
                tracing::info!(path = %path.display(), "using embedded sqlite store");
                Arc::new(sqlite::SqliteBackend::new(path))
            }
            StoreConfig::Postgres { url, pool } => {
                let shown = Redactor.redact(url);
                tracing::info!(
                    url = %shown.text,
                    redacted = shown.hits,
                    max_size = pool.max_size,
                    "using postgres store"
                );
                Arc::new(postgres::PostgresBackend::connect(url, pool).await?)
            }
        };

        if let Err(error) = backend.init_schema().await {
            backend.close().await;
            return Err(error);
        }
        tracing::info!(backend = backend.kind().as_str(), "store schema ready");
        Ok(Self::from_backend(backend))
    }

    pub fn from_backend(backend: Arc<dyn StoreBackend>) -> Self {
        let ledger = InvalidationLedger::new(backend.clone());
        Self { backend, ledger }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn ledger(&self) -> &InvalidationLedger {
        &self.ledger
    }

    pub async fn register(&self, telegram_id: i64, first_name: &str, last_name: &str, age: i32) -> AppResult<bool> {
        let inserted = self
            .backend
            .insert_user_if_absent(&NewUser {
                telegram_id,
                first_name: first_name.trim().to_string(),
                last_name: last_name.trim().to_string(),
                age,
            })
            .await?;

        if let Err(error) = self.ledger.clear(MarkKey::Deletion(telegram_id)).await {
            tracing::warn!(telegram_id, error = %error, "deletion mark not cleared on register");
        }
        if inserted {
            tracing::info!(telegram_id, "user registered");
        }
        Ok(inserted)
    }

    pub async fn update_score(&self, telegram_id: i64, score: i64) -> AppResult<bool> {
        self.backend.raise_score(telegram_id, score).await
    }

    pub async fn update_aptitude(&self, telegram_id: i64, aptitude: Option<Aptitude>) -> AppResult<bool> {
        self.backend.set_aptitude(telegram_id, aptitude).await
    }

    pub async fn get_user(&self, telegram_id: i64) -> AppResult<Option<Profile>> {
        self.backend.fetch_user(telegram_id).await
    }

    pub async fn get_top_users(&self, limit: u32) -> AppResult<Vec<Profile>> {
        self.backend.fetch_top(limit.clamp(1, MAX_TOP_LIMIT)).await
    }

    pub async fn list_users(&self, limit: u32) -> AppResult<Vec<Profile>> {
        self.backend.fetch_users(limit.clamp(1, MAX_LIST_LIMIT)).await
    }

    pub async fn count_users(&self) -> AppResult<u64> {
        self.backend.count_users().await
    }

    pub async fn get_standing(&self, telegram_id: i64) -> AppResult<Option<Standing>> {
        let Some(profile) = self.backend.fetch_user(telegram_id).await? else {
            return Ok(None);
        };
        let higher = self.backend.count_users_above(profile.score).await?;
        let total = self.backend.count_users().await?;
        Ok(Some(Standing {
            rank: higher + 1,
            total,
        }))
    }

    pub async fn reset_all(&self) -> AppResult<String> {
        let affected = self.backend.clear_scores(None).await?;
        let token = self.ledger.bump(MarkKey::Global).await?;
        tracing::info!(affected, token = %token, "all scores reset");
        Ok(token)
    }

    pub async fn reset_one(&self, telegram_id: i64) -> AppResult<String> {
        let affected = self.backend.clear_scores(Some(telegram_id)).await?;
        let token = self.ledger.bump(MarkKey::Reset(telegram_id)).await?;
        tracing::info!(telegram_id, affected, token = %token, "user scores reset");
        Ok(token)
    }

    // The deletion mark is written before the row is removed.
    pub async fn delete_one(&self, telegram_id: i64) -> AppResult<String> {
        self.ledger.bump(MarkKey::Deletion(telegram_id)).await?;
        let affected = self.backend.delete_users(Some(telegram_id)).await?;
        let token = self.ledger.bump(MarkKey::Global).await?;
        tracing::info!(telegram_id, affected, token = %token, "user deleted");
        Ok(token)
    }

    pub async fn delete_all(&self) -> AppResult<String> {
        let affected = self.backend.delete_users(None).await?;
        self.ledger.clear_user_marks().await?;
        let token = self.ledger.bump(MarkKey::Global).await?;
        tracing::info!(affected, token = %token, "all users deleted");
        Ok(token)
    }

    pub async fn get_levels(&self) -> AppResult<LevelMap> {
        self.backend.fetch_levels().await
    }

    pub async fn set_level_active(&self, level_key: &str, is_active: bool) -> AppResult<()> {
        let level_key = level_key.trim();
        if level_key.is_empty() {
            return Err(AppError::InvalidInput("level_key cannot be empty".to_string()));
        }
        self.backend.upsert_level(level_key, is_active).await?;
        tracing::info!(level_key, is_active, "level toggled");
        Ok(())
    }

    pub async fn close(&self) {
        self.backend.close().await;
        tracing::info!(backend = self.backend.kind().as_str(), "store closed");
    }
}
