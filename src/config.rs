use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Exchange {
    pub default_timeout_ms: u64,
    pub oauth_timeout_ms: u64,
    // delay before an in-flight send offers a cancel affordance
    pub grace_period_ms: u64,
    pub cookie_jar: bool,
}

impl Default for Exchange {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            oauth_timeout_ms: 30_000,
            grace_period_ms: 1_000,
            cookie_jar: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct History {
    pub limit: usize,
}

impl Default for History {
    fn default() -> Self {
        Self { limit: 50 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub listen: String,
    pub exchange: Exchange,
    pub history: History,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            listen: "127.0.0.1:3030".to_string(),
            exchange: Exchange::default(),
            history: History::default(),
        }
    }
}
