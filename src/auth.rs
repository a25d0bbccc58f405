use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SECRET_KEY_LABEL: &[u8] = b"WebAppData";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("signing secret is not configured")]
    MissingSecret,
    #[error("init data is missing")]
    MissingPayload,
    #[error("init data is malformed: {0}")]
    Malformed(String),
    #[error("init data carries no hash")]
    MissingHash,
    #[error("init data signature mismatch")]
    SignatureMismatch,
    #[error("init data carries no user")]
    MissingUser,
    #[error("init data user is invalid: {0}")]
    InvalidUser(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedInitData {
    pub user: TelegramUser,
    pub auth_date: Option<i64>,
}

fn mac_for(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("hmac accepts keys of any length")
}

fn derive_secret_key(bot_token: &str) -> [u8; 32] {
    let mut mac = mac_for(SECRET_KEY_LABEL);
    mac.update(bot_token.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&mac.finalize().into_bytes());
    key
}

fn check_string(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Clone)]
pub struct AuthVerifier {
    secret_key: Option<[u8; 32]>,
}

impl std::fmt::Debug for AuthVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthVerifier")
            .field("configured", &self.secret_key.is_some())
            .finish()
    }
}

impl AuthVerifier {
    pub fn new(bot_token: &str) -> Self {
        let bot_token = bot_token.trim();
        Self {
            secret_key: (!bot_token.is_empty()).then(|| derive_secret_key(bot_token)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret_key.is_some()
    }

    pub fn verify(&self, init_data: &str) -> Result<VerifiedInitData, AuthError> {
        let secret_key = self.secret_key.ok_or(AuthError::MissingSecret)?;
        let init_data = init_data.trim();
        if init_data.is_empty() {
            return Err(AuthError::MissingPayload);
        }

        let mut fields = BTreeMap::new();
        for (key, value) in url::form_urlencoded::parse(init_data.as_bytes()) {
            if key.is_empty() {
                return Err(AuthError::Malformed("empty field name".to_string()));
            }
            if fields.insert(key.to_string(), value.to_string()).is_some() {
                return Err(AuthError::Malformed(format!("duplicate field '{}'", key)));
            }
        }

        let supplied = fields.remove("hash").ok_or(AuthError::MissingHash)?;
        let supplied = hex::decode(supplied.trim())
            .map_err(|_| AuthError::Malformed("hash is not hex".to_string()))?;

        let mut mac = mac_for(&secret_key);
        mac.update(check_string(&fields).as_bytes());
        mac.verify_slice(&supplied)
            .map_err(|_| AuthError::SignatureMismatch)?;

        let raw_user = fields.get("user").ok_or(AuthError::MissingUser)?;
        let user: TelegramUser =
            serde_json::from_str(raw_user).map_err(|error| AuthError::InvalidUser(error.to_string()))?;
        let auth_date = fields.get("auth_date").and_then(|value| value.parse().ok());

        Ok(VerifiedInitData { user, auth_date })
    }
}

pub fn sign_init_data(fields: &[(&str, &str)], bot_token: &str) -> String {
    let sorted = fields
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect::<BTreeMap<_, _>>();
    let mut mac = mac_for(&derive_secret_key(bot_token));
    mac.update(check_string(&sorted).as_bytes());
    let hash = hex::encode(mac.finalize().into_bytes());

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in fields {
        serializer.append_pair(key, value);
    }
    serializer.append_pair("hash", &hash);
    serializer.finish()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminAllowList {
    ids: BTreeSet<i64>,
}

impl AdminAllowList {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        Self::new(
            raw.split(',')
                .filter_map(|part| part.trim().parse::<i64>().ok())
                .filter(|id| *id > 0),
        )
    }

    pub fn contains(&self, telegram_id: i64) -> bool {
        self.ids.contains(&telegram_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
