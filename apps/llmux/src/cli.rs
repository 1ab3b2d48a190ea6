use clap::Parser;

use llmux_common::GlobalConfig;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "llmux",
    version,
    about = "Reverse-proxy gateway multiplexing clients onto pooled LLM provider credentials"
)]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Enable periodic credential health checks.
    #[arg(long, env = "CHECK_KEYS")]
    pub check_keys: Option<bool>,

    /// Dispatch to AWS keys whose logging posture is unconfirmed.
    #[arg(long, env = "ALLOW_AWS_LOGGING")]
    pub allow_aws_logging: Option<bool>,
}

/// Merge precedence: CLI > ENV (clap applies both per field) > the
/// enumerated env contract parsed by `GlobalConfig::from_env`.
pub fn load_config() -> anyhow::Result<GlobalConfig> {
    let args = CliArgs::parse();
    let mut config = GlobalConfig::from_env()?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(check_keys) = args.check_keys {
        config.check_keys = check_keys;
    }
    if let Some(allow) = args.allow_aws_logging {
        config.allow_aws_logging = allow;
    }
    Ok(config)
}
