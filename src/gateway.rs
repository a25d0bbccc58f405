use crate::auth::{AdminAllowList, AuthError, AuthVerifier, VerifiedInitData};
use crate::db::{ScoreStore, DEFAULT_LIST_LIMIT};
use crate::errors::AppError;
use crate::models::{
    LevelReceipt, MutationReceipt, ProfileSnapshot, SetLevelPayload, StatsResponse, TargetUserPayload, WhoAmI,
};
use thiserror::Error;

pub const STORE_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("forbidden: user {0} is not an administrator")]
    Forbidden(i64),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(AppError),
}

impl From<AppError> for GatewayError {
    fn from(value: AppError) -> Self {
        match value {
            AppError::InvalidInput(message) => Self::BadRequest(message),
            other => Self::Store(other),
        }
    }
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::BadRequest(_) => 400,
            Self::Store(error) if error.is_retryable() => 503,
            Self::Store(_) => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_retryable())
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        self.is_retryable().then_some(STORE_RETRY_AFTER_SECS)
    }

    // Store details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Unauthorized(_) => "unauthorized".to_string(),
            Self::Forbidden(_) => "forbidden".to_string(),
            Self::BadRequest(message) => message.clone(),
            Self::Store(error) if error.is_retryable() => "store temporarily unavailable".to_string(),
            Self::Store(_) => "internal error".to_string(),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminSession {
    telegram_id: i64,
}

impl AdminSession {
    pub fn telegram_id(&self) -> i64 {
        self.telegram_id
    }
}

// Privileged calls need an AdminSession, so nothing reaches the store before
// the signature and the allow-list have passed.
#[derive(Clone)]
pub struct AdminGateway {
    store: ScoreStore,
    verifier: AuthVerifier,
    admins: AdminAllowList,
}

impl AdminGateway {
    pub fn new(store: ScoreStore, verifier: AuthVerifier, admins: AdminAllowList) -> Self {
        Self {
            store,
            verifier,
            admins,
        }
    }

    pub fn store(&self) -> &ScoreStore {
        &self.store
    }

    pub fn authenticate(&self, init_data: Option<&str>) -> GatewayResult<VerifiedInitData> {
        let init_data = init_data.ok_or(AuthError::MissingPayload)?;
        self.verifier.verify(init_data).map_err(|error| {
            tracing::warn!(error = %error, "init data rejected");
            GatewayError::Unauthorized(error)
        })
    }

    pub fn authorize(&self, init_data: Option<&str>) -> GatewayResult<AdminSession> {
        let caller = self.authenticate(init_data)?.user.id;
        if !self.admins.contains(caller) {
            tracing::warn!(telegram_id = caller, "admin call from non-admin");
            return Err(GatewayError::Forbidden(caller));
        }
        Ok(AdminSession { telegram_id: caller })
    }

    pub fn whoami(&self, init_data: Option<&str>) -> GatewayResult<WhoAmI> {
        let user_id = self.authenticate(init_data)?.user.id;
        Ok(WhoAmI {
            ok: true,
            user_id,
            is_admin: self.admins.contains(user_id),
        })
    }

    pub async fn profile(&self, init_data: Option<&str>) -> GatewayResult<ProfileSnapshot> {
        let telegram_id = self.authenticate(init_data)?.user.id;
        let user = self.store.get_user(telegram_id).await?;
        let ledger = self.store.ledger();
        Ok(ProfileSnapshot {
            exists: user.is_some(),
            user,
            reset_token: ledger.reset_token(telegram_id).await,
            user_deleted_token: ledger.deletion_token(telegram_id).await,
        })
    }

    pub async fn stats(&self, _session: &AdminSession) -> GatewayResult<StatsResponse> {
        let users = self.store.list_users(DEFAULT_LIST_LIMIT).await?;
        let levels = self.store.get_levels().await?;
        let total = self.store.count_users().await?;
        Ok(StatsResponse {
            ok: true,
            users,
            levels,
            total,
            global_token: self.store.ledger().global_token().await,
        })
    }

    pub async fn set_level(&self, session: &AdminSession, payload: SetLevelPayload) -> GatewayResult<LevelReceipt> {
        let level_key = payload
            .level_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| GatewayError::BadRequest("level_key is required".to_string()))?;
        let is_active = payload
            .is_active
            .ok_or_else(|| GatewayError::BadRequest("is_active is required".to_string()))?;

        self.store.set_level_active(&level_key, is_active).await?;
        tracing::info!(admin = session.telegram_id, level_key = %level_key, is_active, "admin set level");
        Ok(LevelReceipt {
            ok: true,
            level_key,
            is_active,
            global_token: self.store.ledger().global_token().await,
        })
    }

    pub async fn reset_scores(&self, session: &AdminSession) -> GatewayResult<MutationReceipt> {
        let global_token = self.store.reset_all().await?;
        tracing::info!(admin = session.telegram_id, "admin reset all scores");
        Ok(MutationReceipt {
            ok: true,
            telegram_id: None,
            reset_token: None,
            global_token,
        })
    }

    pub async fn reset_user_scores(
        &self,
        session: &AdminSession,
        payload: TargetUserPayload,
    ) -> GatewayResult<MutationReceipt> {
        let telegram_id = required_target(&payload)?;
        let reset_token = self.store.reset_one(telegram_id).await?;
        tracing::info!(admin = session.telegram_id, telegram_id, "admin reset user scores");
        Ok(MutationReceipt {
            ok: true,
            telegram_id: Some(telegram_id),
            reset_token: Some(reset_token),
            global_token: self.store.ledger().global_token().await,
        })
    }

    pub async fn delete_user(&self, session: &AdminSession, payload: TargetUserPayload) -> GatewayResult<MutationReceipt> {
        let telegram_id = required_target(&payload)?;
        let global_token = self.store.delete_one(telegram_id).await?;
        tracing::info!(admin = session.telegram_id, telegram_id, "admin deleted user");
        Ok(MutationReceipt {
            ok: true,
            telegram_id: Some(telegram_id),
            reset_token: None,
            global_token,
        })
    }

    pub async fn delete_all_users(&self, session: &AdminSession) -> GatewayResult<MutationReceipt> {
        let global_token = self.store.delete_all().await?;
        tracing::info!(admin = session.telegram_id, "admin deleted all users");
        Ok(MutationReceipt {
            ok: true,
            telegram_id: None,
            reset_token: None,
            global_token,
        })
    }
}

fn required_target(payload: &TargetUserPayload) -> GatewayResult<i64> {
    payload
        .telegram_id
        .ok_or_else(|| GatewayError::BadRequest("telegram_id is required".to_string()))
}

#[cfg(test)]
mod tests {
    use super::{AdminGateway, GatewayError};
    use crate::auth::{sign_init_data, AdminAllowList, AuthVerifier};
    use crate::db::sqlite::SqliteBackend;
    use crate::db::{ScoreStore, StoreBackend};
    use crate::errors::AppError;
    use crate::models::{SetLevelPayload, TargetUserPayload};
    use std::sync::Arc;

    const BOT_TOKEN: &str = "777:GATEWAY";
    const ADMIN_ID: i64 = 1000;

    fn init_data_for(telegram_id: i64, token: &str) -> String {
        let user = format!(r#"{{"id":{},"first_name":"Test"}}"#, telegram_id);
        sign_init_data(&[("auth_date", "1700000000"), ("user", &user)], token)
    }

    async fn gateway() -> (tempfile::TempDir, AdminGateway) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(SqliteBackend::new(&dir.path().join("gateway.db")));
        backend.init_schema().await.expect("schema");
        let store = ScoreStore::from_backend(backend);
        store.register(1, "A", "A", 10).await.expect("register");
        store.register(2, "B", "B", 12).await.expect("register");
        store.update_score(1, 7).await.expect("score");
        store.update_score(2, 3).await.expect("score");
        let gateway = AdminGateway::new(store, AuthVerifier::new(BOT_TOKEN), AdminAllowList::new([ADMIN_ID]));
        (dir, gateway)
    }

    #[tokio::test]
    async fn non_admins_and_bad_signatures_get_no_session() {
        let (_dir, gateway) = gateway().await;

        let error = gateway
            .authorize(Some(&init_data_for(55, BOT_TOKEN)))
            .expect_err("forbidden");
        assert!(matches!(error, GatewayError::Forbidden(55)));
        assert_eq!(error.status_code(), 403);

        let error = gateway
            .authorize(Some(&init_data_for(ADMIN_ID, "not-the-token")))
            .expect_err("unauthorized");
        assert!(matches!(error, GatewayError::Unauthorized(_)));
        assert_eq!(error.status_code(), 401);

        let error = gateway.authorize(None).expect_err("missing");
        assert_eq!(error.status_code(), 401);

        let session = gateway
            .authorize(Some(&init_data_for(ADMIN_ID, BOT_TOKEN)))
            .expect("admin");
        assert_eq!(session.telegram_id(), ADMIN_ID);
    }

    #[tokio::test]
    async fn closed_store_is_a_retryable_failure() {
        let (_dir, gateway) = gateway().await;
        let session = gateway
            .authorize(Some(&init_data_for(ADMIN_ID, BOT_TOKEN)))
            .expect("admin");
        gateway.store().close().await;

        let error = gateway.stats(&session).await.expect_err("store closed");
        assert!(error.is_retryable());
        assert_eq!(error.status_code(), 503);
        assert_eq!(error.retry_after_secs(), Some(5));
        assert_eq!(error.client_message(), "store temporarily unavailable");
    }

    #[test]
    fn internal_store_errors_stay_opaque() {
        let error = GatewayError::from(AppError::Internal("no such column: secret_col".to_string()));
        assert!(!error.is_retryable());
        assert_eq!(error.status_code(), 500);
        assert_eq!(error.retry_after_secs(), None);
        assert_eq!(error.client_message(), "internal error");

        let error = GatewayError::from(AppError::InvalidInput("level_key cannot be empty".to_string()));
        assert_eq!(error.status_code(), 400);
    }

    #[tokio::test]
    async fn missing_target_is_a_client_error() {
        let (_dir, gateway) = gateway().await;
        let session = gateway
            .authorize(Some(&init_data_for(ADMIN_ID, BOT_TOKEN)))
            .expect("admin");

        let error = gateway
            .reset_user_scores(&session, TargetUserPayload::default())
            .await
            .expect_err("no target");
        assert!(matches!(error, GatewayError::BadRequest(_)));
        assert_eq!(error.status_code(), 400);

        let error = gateway
            .set_level(
                &session,
                SetLevelPayload {
                    level_key: Some("  ".to_string()),
                    is_active: Some(true),
                },
            )
            .await
            .expect_err("blank key");
        assert_eq!(error.status_code(), 400);
    }

    #[tokio::test]
    async fn admin_mutations_return_after_state() {
        let (_dir, gateway) = gateway().await;
        let session = gateway
            .authorize(Some(&init_data_for(ADMIN_ID, BOT_TOKEN)))
            .expect("admin");

        let receipt = gateway
            .reset_user_scores(&session, TargetUserPayload { telegram_id: Some(1) })
            .await
            .expect("reset one");
        assert_eq!(receipt.telegram_id, Some(1));
        assert_eq!(receipt.global_token, "0");
        let reset_token = receipt.reset_token.expect("reset token");
        assert_ne!(reset_token, "0");
        assert_eq!(gateway.store().ledger().reset_token(1).await, reset_token);

        let receipt = gateway
            .set_level(
                &session,
                SetLevelPayload {
                    level_key: Some(" quiz ".to_string()),
                    is_active: Some(false),
                },
            )
            .await
            .expect("set level");
        assert_eq!(receipt.level_key, "quiz");
        assert!(!receipt.is_active);

        let receipt = gateway
            .delete_user(&session, TargetUserPayload { telegram_id: Some(2) })
            .await
            .expect("delete");
        assert_ne!(receipt.global_token, "0");

        let stats = gateway.stats(&session).await.expect("stats");
        assert_eq!(stats.total, 1);
        assert_eq!(stats.users.len(), 1);
        assert_eq!(stats.levels.get("quiz"), Some(&false));
        assert_eq!(stats.global_token, receipt.global_token);
    }

    #[tokio::test]
    async fn whoami_and_profile_need_only_a_valid_signature() {
        let (_dir, gateway) = gateway().await;
        let player = init_data_for(2, BOT_TOKEN);

        let whoami = gateway.whoami(Some(&player)).expect("whoami");
        assert_eq!(whoami.user_id, 2);
        assert!(!whoami.is_admin);

        let profile = gateway.profile(Some(&player)).await.expect("profile");
        assert!(profile.exists);
        assert_eq!(profile.user.expect("user").score, 3);
        assert_eq!(profile.reset_token, "0");
        assert_eq!(profile.user_deleted_token, "0");

        let stranger = init_data_for(404, BOT_TOKEN);
        let profile = gateway.profile(Some(&stranger)).await.expect("profile");
        assert!(!profile.exists);
        assert!(profile.user.is_none());
    }
}
