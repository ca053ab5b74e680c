//! Launch arguments passed to the skill by the skill server.

use hss_rpc::{ClientConfig, ServerConfig};

pub const USAGE: &str = "Usage: <skill> --skill-name <name> --parent-port <port> --port <port> [--host <addr>] [--debug]";

const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillArgs {
    pub skill_name: String,
    /// Port of the skill server; the skill connects here as a client.
    pub parent_port: u16,
    /// Port the skill listens on for requests from the skill server.
    pub port: u16,
    pub host: String,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing mandatory argument \"{0}\"")]
    MissingArgument(&'static str),

    #[error("invalid value '{value}' for --{flag}: expected a port number between 1 and 65535")]
    InvalidPort { flag: &'static str, value: String },

    #[error("--{0} requires a value")]
    MissingValue(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),

    #[error("help requested")]
    HelpRequested,
}

impl SkillArgs {
    /// Parse the current process arguments.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse arguments, not including the program name.
    ///
    /// Accepts both `--flag value` and `--flag=value`.
    pub fn parse<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut skill_name: Option<String> = None;
        let mut parent_port: Option<String> = None;
        let mut port: Option<String> = None;
        let mut host = DEFAULT_HOST.to_string();
        let mut debug = false;

        let mut args = args.into_iter().map(Into::into);
        while let Some(arg) = args.next() {
            let Some(flag) = arg.strip_prefix("--") else {
                if arg == "-h" {
                    return Err(ConfigError::HelpRequested);
                }
                return Err(ConfigError::UnexpectedArgument(arg));
            };

            let (name, inline) = match flag.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (flag.to_string(), None),
            };

            let mut value = |name: &str| match inline.clone() {
                Some(v) => Ok(v),
                None => args
                    .next()
                    .ok_or_else(|| ConfigError::MissingValue(name.to_string())),
            };

            match name.as_str() {
                "skill-name" => skill_name = Some(value("skill-name")?),
                "parent-port" => parent_port = Some(value("parent-port")?),
                "port" => port = Some(value("port")?),
                "host" => host = value("host")?,
                "debug" => debug = inline.as_deref().is_none_or(|v| v != "false"),
                "help" => return Err(ConfigError::HelpRequested),
                _ => return Err(ConfigError::UnknownFlag(arg)),
            }
        }

        let skill_name = skill_name
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::MissingArgument("skill-name"))?;
        let parent_port = parse_port(
            "parent-port",
            parent_port.ok_or(ConfigError::MissingArgument("parent-port"))?,
        )?;
        let port = parse_port("port", port.ok_or(ConfigError::MissingArgument("port"))?)?;

        Ok(Self {
            skill_name,
            parent_port,
            port,
            host,
            debug,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.parent_port).with_host(self.host.clone())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.port).with_host(self.host.clone())
    }
}

fn parse_port(flag: &'static str, value: String) -> Result<u16, ConfigError> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort { flag, value }),
    }
}
