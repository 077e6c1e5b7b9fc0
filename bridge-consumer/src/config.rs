use bridge_core::config::BridgeConfig;
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub bridge: BridgeConfig,

    /// Stop after this many messages; 0 runs until shutdown. Used by
    /// one-shot catch-up runs.
    #[envconfig(from = "MAX_MESSAGES", default = "0")]
    pub max_messages: usize,

    #[envconfig(from = "MAX_PG_CONNECTIONS", default = "4")]
    pub max_pg_connections: u32,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
