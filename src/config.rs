use crate::auth::AdminAllowList;
use crate::errors::{AppError, AppResult};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "factory.db";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_size: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Sqlite { path: PathBuf },
    Postgres { url: String, pool: PoolOptions },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bot_token: String,
    pub admin_ids: AdminAllowList,
    pub store: StoreConfig,
    pub bind_addr: SocketAddr,
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).map(|raw| raw.trim().to_string()).filter(|raw| !raw.is_empty());

        let pool = PoolOptions {
            max_size: parse_number(value("PG_POOL_SIZE"), "PG_POOL_SIZE", DEFAULT_POOL_SIZE)?.max(1),
            connect_timeout: Duration::from_secs(
                parse_number(value("PG_CONNECT_TIMEOUT_SECS"), "PG_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?
                    .max(1),
            ),
        };
        let store = match value("DATABASE_URL") {
            Some(url) => StoreConfig::Postgres { url, pool },
            None => StoreConfig::Sqlite {
                path: PathBuf::from(value("DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string())),
            },
        };

        let port = match value("WEB_PORT").or_else(|| value("PORT")) {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| AppError::Config(format!("WEB_PORT '{}' is not a port", raw)))?,
            None => DEFAULT_PORT,
        };
        let host = match value("WEB_HOST") {
            Some(raw) => raw
                .parse::<IpAddr>()
                .map_err(|_| AppError::Config(format!("WEB_HOST '{}' is not an address", raw)))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        Ok(Self {
            bot_token: value("BOT_TOKEN").unwrap_or_default(),
            admin_ids: AdminAllowList::parse(&value("ADMIN_IDS").unwrap_or_default()),
            store,
            bind_addr: SocketAddr::new(host, port),
            log_dir: value("LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_number<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> AppResult<T> {
    match raw {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{} '{}' is not a number", key, raw))),
        None => Ok(default),
    }
}
