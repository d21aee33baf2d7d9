//! Shared command line options.
//!
//! Every option has a matching `C8Y_*` / `C8YLP_*` environment variable;
//! explicit command line flags win over the environment. A dotenv file
//! given with `--env-file` is loaded before parsing and never overrides
//! variables already present in the process environment.

use std::path::PathBuf;

use clap::Args;
use c8ylp_core::LocalEndpoint;
use c8ylp_proxy::{BridgeConfig, Credentials, ResolveRequest};

/// Options common to every subcommand that talks to Cumulocity.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Cumulocity host URL, e.g. https://example.cumulocity.com
    #[arg(long, env = "C8Y_HOST")]
    pub host: String,

    /// Cumulocity tenant id; discovered from the host when omitted
    #[arg(long, env = "C8Y_TENANT")]
    pub tenant: Option<String>,

    /// Cumulocity username for the login flow
    #[arg(long, env = "C8Y_USER")]
    pub user: Option<String>,

    /// Cumulocity password for the login flow
    #[arg(long, env = "C8Y_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Two-factor code for the login flow
    #[arg(long = "tfa-code", env = "C8Y_TFA_CODE", hide_env_values = true)]
    pub tfa_code: Option<String>,

    /// Bearer token; bypasses the login flow
    #[arg(long, env = "C8Y_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// External identity namespace used for the device lookup
    #[arg(
        long = "external-type",
        env = "C8Y_EXTERNAL_TYPE",
        default_value = "c8y_Serial"
    )]
    pub external_type: String,

    /// Name of the remote access configuration
    #[arg(long = "config", env = "C8Y_CONFIG", default_value = "Passthrough")]
    pub config: String,

    /// Disable TLS certificate verification
    #[arg(long = "ignore-ssl-validate", env = "C8YLP_IGNORE_SSL_VALIDATE")]
    pub ignore_ssl_validate: bool,

    /// Dotenv file providing defaults for the environment variables
    #[arg(long = "env-file", env = "C8YLP_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// Write the session token back to the env file after login
    #[arg(long = "store-token", env = "C8YLP_STORE_TOKEN")]
    pub store_token: bool,

    /// Never prompt for missing credentials
    #[arg(long = "disable-prompts", env = "C8YLP_DISABLE_PROMPTS")]
    pub disable_prompts: bool,

    /// Debug logging
    #[arg(short, long, env = "C8YLP_VERBOSE")]
    pub verbose: bool,
}

impl CommonArgs {
    /// Build the resolver input for a device.
    pub fn resolve_request(&self, device: &str) -> ResolveRequest {
        ResolveRequest {
            host: self.host.clone(),
            tenant: self.tenant.clone(),
            credentials: Credentials {
                token: self.token.clone(),
                user: self.user.clone(),
                password: self.password.clone(),
                tfa_code: self.tfa_code.clone(),
            },
            device: device.to_string(),
            external_type: self.external_type.clone(),
            config_name: self.config.clone(),
            verify_tls: !self.ignore_ssl_validate,
        }
    }
}

/// Options shaping the local listener and the bridges it spawns.
#[derive(Args, Debug, Clone)]
pub struct TunnelArgs {
    /// Device external identity
    pub device: String,

    /// Local bind port; 0 picks an ephemeral port
    #[arg(long, env = "C8YLP_PORT", default_value_t = 0)]
    pub port: u16,

    /// WebSocket keepalive ping period in seconds; 0 disables
    #[arg(long = "ping-interval", env = "C8YLP_PING_INTERVAL", default_value_t = 0)]
    pub ping_interval: u64,

    /// Bytes per uplink TCP read
    #[arg(
        long = "tcp-size",
        env = "C8YLP_TCP_SIZE",
        default_value_t = 4096,
        value_parser = clap::value_parser!(u32).range(1024..=8_290_304)
    )]
    pub tcp_size: u32,

    /// Idle timeout in seconds; 0 disables
    #[arg(long = "tcp-timeout", env = "C8YLP_TCP_TIMEOUT", default_value_t = 0)]
    pub tcp_timeout: u64,
}

impl TunnelArgs {
    pub fn endpoint(&self) -> LocalEndpoint {
        LocalEndpoint::loopback(self.port)
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            tcp_size: self.tcp_size as usize,
            tcp_timeout: std::time::Duration::from_secs(self.tcp_timeout),
            ping_interval: std::time::Duration::from_secs(self.ping_interval),
        }
    }
}
