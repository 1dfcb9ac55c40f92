use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use url::Url;

use crate::manager::TokenRange;

// ---------------------------------------------------------------------------
// Command line / environment configuration
// ---------------------------------------------------------------------------

/// Server configuration.  Every option has a CLI flag; the upstream
/// credentials also fall back to the conventional environment variables.
#[derive(Debug, Parser)]
#[command(name = "botgate", version, about = "Bot API HTTP front-end server")]
pub struct Config {
    /// Application identifier for the upstream Telegram client.
    #[arg(long, env = "TELEGRAM_API_ID")]
    pub api_id: Option<i32>,

    /// Application hash for the upstream Telegram client.
    #[arg(long, env = "TELEGRAM_API_HASH")]
    pub api_hash: Option<String>,

    /// Allow the server to serve local requests: plain-HTTP webhooks,
    /// reserved endpoint addresses and larger upload limits.
    #[arg(long)]
    pub local: bool,

    /// HTTP listening port.
    #[arg(long, short = 'p', default_value_t = 8081)]
    pub http_port: u16,

    /// Port for the statistics page; disabled when omitted.
    #[arg(long, short = 's')]
    pub http_stat_port: Option<u16>,

    /// Address to bind the HTTP listeners to.
    #[arg(long, default_value = "0.0.0.0")]
    pub http_ip_address: String,

    /// Server working directory (persistent state lives here).
    #[arg(long, short = 'd', default_value = ".")]
    pub dir: PathBuf,

    /// Directory for temporary files; defaults to `<dir>/temp`.
    #[arg(long, short = 't')]
    pub temp_dir: Option<PathBuf>,

    /// "<remainder>/<modulo>" shard of bot tokens served by this instance.
    #[arg(long, value_parser = parse_token_range)]
    pub filter: Option<TokenRange>,

    /// Default maximum webhook connections per bot.
    #[arg(long)]
    pub max_webhook_connections: Option<i32>,

    /// HTTP proxy for outgoing webhook requests.
    #[arg(long)]
    pub proxy: Option<Url>,

    /// Path to the log file; logs go to stderr when omitted.
    #[arg(long, short = 'l')]
    pub log: Option<PathBuf>,

    /// Log verbosity: 0 = errors only .. 4+ = trace.
    #[arg(long, short = 'v', default_value_t = 2)]
    pub verbosity: u8,
}

fn parse_token_range(raw: &str) -> Result<TokenRange, String> {
    let (remainder, modulo) = raw
        .split_once('/')
        .ok_or_else(|| "expected <remainder>/<modulo>".to_string())?;
    let remainder: u64 = remainder
        .trim()
        .parse()
        .map_err(|_| "invalid remainder".to_string())?;
    let modulo: u64 = modulo
        .trim()
        .parse()
        .map_err(|_| "invalid modulo".to_string())?;
    if modulo == 0 || remainder >= modulo {
        return Err("remainder must be smaller than a positive modulo".to_string());
    }
    Ok(TokenRange { remainder, modulo })
}

impl Config {
    pub fn default_max_webhook_connections(&self) -> i32 {
        match self.max_webhook_connections {
            Some(value) if value > 0 => value,
            _ => {
                if self.local {
                    100
                } else {
                    40
                }
            }
        }
    }

    pub fn max_webhook_connections_limit(&self) -> i32 {
        if self.local {
            100_000
        } else {
            100
        }
    }

    pub fn max_update_body_size(&self) -> usize {
        16 << 20
    }

    pub fn temp_directory(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.dir.join("temp"))
    }

    pub fn token_range(&self) -> TokenRange {
        self.filter.unwrap_or_default()
    }

    /// Directive for the tracing `EnvFilter`; `RUST_LOG` still overrides.
    pub fn log_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    }

    pub fn log_summary(&self) {
        info!("──── botgate configuration ────");
        info!("  http            : {}:{}", self.http_ip_address, self.http_port);
        match self.http_stat_port {
            Some(port) => info!("  stats           : {}:{}", self.http_ip_address, port),
            None => info!("  stats           : disabled"),
        }
        info!("  dir             : {}", self.dir.display());
        info!("  temp_dir        : {}", self.temp_directory().display());
        info!("  local_mode      : {}", self.local);
        let range = self.token_range();
        info!("  token_filter    : {}/{}", range.remainder, range.modulo);
        info!(
            "  max_webhook_conn: {} (cap {})",
            self.default_max_webhook_connections(),
            self.max_webhook_connections_limit()
        );
        match &self.proxy {
            Some(proxy) => info!("  webhook_proxy   : {proxy}"),
            None => info!("  webhook_proxy   : none"),
        }
        info!("  verbosity       : {}", self.verbosity);
        info!("───────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::parse_from(["botgate"]);
        assert_eq!(config.http_port, 8081);
        assert!(!config.local);
        assert_eq!(config.default_max_webhook_connections(), 40);
        assert_eq!(config.max_webhook_connections_limit(), 100);
        let range = config.token_range();
        assert_eq!((range.remainder, range.modulo), (0, 1));
    }

    #[test]
    fn local_mode_raises_limits() {
        let config = Config::parse_from(["botgate", "--local"]);
        assert_eq!(config.default_max_webhook_connections(), 100);
        assert_eq!(config.max_webhook_connections_limit(), 100_000);
    }

    #[test]
    fn filter_parsing() {
        let config = Config::parse_from(["botgate", "--filter", "1/3"]);
        let range = config.token_range();
        assert_eq!((range.remainder, range.modulo), (1, 3));
        assert!(range.admits(4));
        assert!(!range.admits(2));

        assert!(parse_token_range("3/3").is_err());
        assert!(parse_token_range("1-3").is_err());
        assert!(parse_token_range("a/b").is_err());
        assert!(parse_token_range("0/0").is_err());
    }

    #[test]
    fn temp_dir_defaults_under_working_dir() {
        let config = Config::parse_from(["botgate", "--dir", "/srv/botgate"]);
        assert_eq!(
            config.temp_directory(),
            PathBuf::from("/srv/botgate/temp")
        );
    }
}
