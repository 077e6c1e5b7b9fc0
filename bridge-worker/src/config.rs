use bridge_core::config::BridgeConfig;
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub bridge: BridgeConfig,

    #[envconfig(from = "DEQUEUE_BATCH_SIZE", default = "10")]
    pub dequeue_batch_size: i64,

    /// How long to sleep when the job table has nothing available.
    #[envconfig(from = "DEQUEUE_INTERVAL_MS", default = "500")]
    pub dequeue_interval_ms: u64,

    #[envconfig(from = "SWEEP_INTERVAL_SECS", default = "60")]
    pub sweep_interval_secs: u64,

    #[envconfig(from = "SCHEMA_REFRESH_INTERVAL_SECS", default = "900")]
    pub schema_refresh_interval_secs: u64,

    #[envconfig(from = "MAX_PG_CONNECTIONS", default = "10")]
    pub max_pg_connections: u32,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
