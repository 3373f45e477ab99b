//! Service configuration, loaded from the environment at startup.
//!
//! Every knob has a default except `DATABASE_URL`; a missing requirement or
//! an unparsable value aborts startup before any socket is bound.

use std::fmt;
use std::str::FromStr;

/// Which accounting backend owns capacity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcctBackend {
    /// External atomic-ledger service ("tb").
    Ledger,
    /// Relational implementation of the same contract ("pg").
    Postgres,
}

impl AcctBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcctBackend::Ledger => "tb",
            AcctBackend::Postgres => "pg",
        }
    }
}

impl FromStr for AcctBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tb" => Ok(AcctBackend::Ledger),
            "pg" => Ok(AcctBackend::Postgres),
            other => Err(format!("ACCT_BACKEND must be 'tb' or 'pg', got '{other}'")),
        }
    }
}

impl fmt::Display for AcctBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which store holds the checkout -> webhook handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    Redis,
    Postgres,
}

impl SessionBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionBackend::Redis => "redis",
            SessionBackend::Postgres => "pg",
        }
    }
}

impl FromStr for SessionBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(SessionBackend::Redis),
            "pg" => Ok(SessionBackend::Postgres),
            other => Err(format!(
                "PAYSESSION_BACKEND must be 'redis' or 'pg', got '{other}'"
            )),
        }
    }
}

impl fmt::Display for SessionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-resource capacities, seeded into whichever backend is active.
#[derive(Debug, Clone, Copy)]
pub struct Capacities {
    pub class_a: i64,
    pub class_b: i64,
    pub goodie: i64,
}

impl Default for Capacities {
    fn default() -> Self {
        Self {
            class_a: 5_000_000,
            class_b: 5_000_000,
            goodie: 100_000,
        }
    }
}

/// Logging knobs (file layer + stdout layer).
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_file: String,
    pub log_level: String,
    pub rotation: String,
    pub use_json: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub acct_backend: AcctBackend,
    pub paysession_backend: SessionBackend,

    // External atomic ledger
    pub tb_address: String,
    pub tb_cluster_id: u32,

    // Hot KV
    pub redis_url: String,
    pub redis_max_conn: usize,

    // SQL pool + gate sizing
    pub db_pool_size: u32,
    pub db_max_overflow: u32,
    pub db_pool_timeout_secs: u64,
    pub db_gate_limit: usize,

    // Payment provider
    pub mock_secret: String,
    pub mock_webhook_url: String,

    pub reservation_ttl_seconds: u64,
    pub capacities: Capacities,

    // Admin feed Basic auth
    pub admin_username: String,
    pub admin_password: String,

    pub port: u16,
    pub log: LogConfig,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, String>
where
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| format!("invalid {name}='{raw}': {e}")),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Read the full configuration from the environment.
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL is required".to_string())?;

        let acct_backend: AcctBackend = env_or("ACCT_BACKEND", "tb").parse()?;
        let paysession_backend: SessionBackend = env_or("PAYSESSION_BACKEND", "redis").parse()?;

        let db_pool_size: u32 = env_parse("DB_POOL_SIZE", 10)?;
        // Gate defaults to the pool size so queued queries never exceed
        // what the pool can actually serve.
        let db_gate_limit: usize = env_parse("DB_GATE_LIMIT", db_pool_size as usize)?;

        Ok(Self {
            database_url,
            acct_backend,
            paysession_backend,
            tb_address: env_or("TB_ADDRESS", "http://127.0.0.1:3000"),
            tb_cluster_id: env_parse("TB_CLUSTER_ID", 0)?,
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            redis_max_conn: env_parse("REDIS_MAX_CONN", 512)?,
            db_pool_size,
            db_max_overflow: env_parse("DB_MAX_OVERFLOW", 10)?,
            db_pool_timeout_secs: env_parse("DB_POOL_TIMEOUT", 30)?,
            db_gate_limit: db_gate_limit.max(1),
            mock_secret: env_or("MOCK_SECRET", "supersecret"),
            mock_webhook_url: env_or(
                "MOCK_WEBHOOK_URL",
                "http://localhost:8000/payments/webhook",
            ),
            reservation_ttl_seconds: env_parse("RESERVATION_TTL_SECONDS", 300)?,
            capacities: Capacities {
                class_a: env_parse("TICKET_CAPACITY_A", Capacities::default().class_a)?,
                class_b: env_parse("TICKET_CAPACITY_B", Capacities::default().class_b)?,
                goodie: env_parse("GOODIE_LIMIT", Capacities::default().goodie)?,
            },
            admin_username: env_or("ADMIN_USERNAME", "admin"),
            admin_password: env_or("ADMIN_PASSWORD", "supasecret"),
            port: env_parse("PORT", 8000)?,
            log: LogConfig {
                log_dir: env_or("LOG_DIR", "logs"),
                log_file: env_or("LOG_FILE", "hotseat.log"),
                log_level: env_or("LOG_LEVEL", "info"),
                rotation: env_or("LOG_ROTATION", "daily"),
                use_json: env_or("LOG_JSON", "0") == "1",
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("tb".parse::<AcctBackend>().unwrap(), AcctBackend::Ledger);
        assert_eq!("PG".parse::<AcctBackend>().unwrap(), AcctBackend::Postgres);
        assert!("mysql".parse::<AcctBackend>().is_err());

        assert_eq!(
            "redis".parse::<SessionBackend>().unwrap(),
            SessionBackend::Redis
        );
        assert_eq!(
            "pg".parse::<SessionBackend>().unwrap(),
            SessionBackend::Postgres
        );
        assert!("memcached".parse::<SessionBackend>().is_err());
    }

    #[test]
    fn test_default_capacities() {
        let caps = Capacities::default();
        assert_eq!(caps.class_a, 5_000_000);
        assert_eq!(caps.class_b, 5_000_000);
        assert_eq!(caps.goodie, 100_000);
    }
}
