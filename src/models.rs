use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_LEVELS: &[&str] = &[
    "puzzle-2x2",
    "puzzle-3x3",
    "puzzle-4x4",
    "jumper",
    "factory-2048",
    "quiz",
];

pub const EMPTY_TOKEN: &str = "0";

pub type LevelMap = BTreeMap<String, bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aptitude {
    Tech,
    Logic,
    Creative,
    Human,
    Social,
}

impl Aptitude {
    pub const ALL: [Aptitude; 5] = [
        Self::Tech,
        Self::Logic,
        Self::Creative,
        Self::Human,
        Self::Social,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tech => "TECH",
            Self::Logic => "LOGIC",
            Self::Creative => "CREATIVE",
            Self::Human => "HUMAN",
            Self::Social => "SOCIAL",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|value| value.as_str() == raw)
    }

    pub fn parse_label(raw: Option<&str>) -> AppResult<Option<Self>> {
        let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(None);
        };
        let upper = raw.to_ascii_uppercase();
        Self::from_db(&upper)
            .map(Some)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown aptitude label '{}'", raw)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Profile {
    pub telegram_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub age: i32,
    pub score: i64,
    pub aptitude_top: Option<Aptitude>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub telegram_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub age: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Standing {
    pub rank: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LevelsSnapshot {
    pub levels: LevelMap,
    pub reset_token: String,
    pub user_exists: Option<bool>,
    pub user_deleted_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProfileSnapshot {
    pub exists: bool,
    pub user: Option<Profile>,
    pub reset_token: String,
    pub user_deleted_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WhoAmI {
    pub ok: bool,
    pub user_id: i64,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StatsResponse {
    pub ok: bool,
    pub users: Vec<Profile>,
    pub levels: LevelMap,
    pub total: u64,
    pub global_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MutationReceipt {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_token: Option<String>,
    pub global_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LevelReceipt {
    pub ok: bool,
    pub level_key: String,
    pub is_active: bool,
    pub global_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TargetUserPayload {
    pub telegram_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SetLevelPayload {
    pub level_key: Option<String>,
    pub is_active: Option<bool>,
}
