use crate::db::StoreBackend;
use crate::errors::AppResult;
use crate::models::EMPTY_TOKEN;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkTable {
    Global,
    Reset,
    Deletion,
}

impl MarkTable {
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Global => "global_marks",
            Self::Reset => "user_reset_marks",
            Self::Deletion => "user_deletion_marks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkKey {
    Global,
    Reset(i64),
    Deletion(i64),
}

impl MarkKey {
    pub fn table(self) -> MarkTable {
        match self {
            Self::Global => MarkTable::Global,
            Self::Reset(_) => MarkTable::Reset,
            Self::Deletion(_) => MarkTable::Deletion,
        }
    }

    pub fn telegram_id(self) -> Option<i64> {
        match self {
            Self::Global => None,
            Self::Reset(id) | Self::Deletion(id) => Some(id),
        }
    }
}

#[derive(Debug, Default)]
pub struct TokenClock {
    last: AtomicI64,
}

impl TokenClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_after(&self, floor: i64) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut issued = 0;
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                issued = now.max(last.saturating_add(1)).max(floor.saturating_add(1));
                Some(issued)
            });
        issued
    }
}

// Reads never fail. Storage errors, including a mark table an older deployment
// never created, read as EMPTY_TOKEN.
#[derive(Clone)]
pub struct InvalidationLedger {
    backend: Arc<dyn StoreBackend>,
    clock: Arc<TokenClock>,
}

impl InvalidationLedger {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            clock: Arc::new(TokenClock::new()),
        }
    }

    pub async fn ensure_table(&self, table: MarkTable) -> AppResult<()> {
        self.backend.ensure_mark_table(table).await
    }

    pub async fn global_token(&self) -> String {
        self.read(MarkKey::Global).await
    }

    pub async fn reset_token(&self, telegram_id: i64) -> String {
        self.read(MarkKey::Reset(telegram_id)).await
    }

    pub async fn deletion_token(&self, telegram_id: i64) -> String {
        self.read(MarkKey::Deletion(telegram_id)).await
    }

    pub async fn read(&self, key: MarkKey) -> String {
        match self.backend.read_mark(key).await {
            Ok(token) => token.unwrap_or_else(|| EMPTY_TOKEN.to_string()),
            Err(error) => {
                tracing::warn!(table = key.table().table_name(), error = %error, "mark read failed, healing table");
                if let Err(error) = self.ensure_table(key.table()).await {
                    tracing::warn!(table = key.table().table_name(), error = %error, "mark table could not be created");
                    return EMPTY_TOKEN.to_string();
                }
                match self.backend.read_mark(key).await {
                    Ok(Some(token)) => token,
                    _ => EMPTY_TOKEN.to_string(),
                }
            }
        }
    }

    pub async fn bump(&self, key: MarkKey) -> AppResult<String> {
        self.ensure_table(key.table()).await?;
        let previous = self
            .backend
            .read_mark(key)
            .await?
            .and_then(|token| token.parse::<i64>().ok())
            .unwrap_or(0);
        let token = self.clock.next_after(previous).to_string();
        self.backend.write_mark(key, &token).await?;
        tracing::debug!(table = key.table().table_name(), telegram_id = ?key.telegram_id(), token = %token, "mark bumped");
        Ok(token)
    }

    pub async fn clear(&self, key: MarkKey) -> AppResult<()> {
        self.ensure_table(key.table()).await?;
        self.backend.clear_mark(key).await
    }

    pub async fn clear_user_marks(&self) -> AppResult<()> {
        for table in [MarkTable::Reset, MarkTable::Deletion] {
            self.ensure_table(table).await?;
            self.backend.clear_user_marks(table).await?;
        }
        Ok(())
    }
}
