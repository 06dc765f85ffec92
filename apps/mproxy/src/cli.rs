use clap::Parser;

/// Multi-provider LLM proxy.
#[derive(Debug, Parser)]
#[command(name = "mproxy", version, about)]
pub struct Cli {
    /// Bind address.
    #[arg(long, env = "MPROXY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port.
    #[arg(long, env = "MPROXY_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Database DSN (sqlite, mysql, or postgres).
    #[arg(long, env = "MPROXY_DSN", default_value = "sqlite://mproxy.db?mode=rwc")]
    pub dsn: String,

    /// Master secret used to encrypt stored API keys.
    #[arg(long, env = "MPROXY_MASTER_KEY", hide_env_values = true)]
    pub master_key: Option<String>,

    /// Optional JSON config file overriding the built-in defaults
    /// (transformer rules, strategies, pricing, timeouts).
    #[arg(long, env = "MPROXY_CONFIG")]
    pub config: Option<String>,
}
