use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

pub const DEFAULT_CLIENT_PORT: u16 = 8081;
pub const DEFAULT_STORAGE_PORT: u16 = 8080;
pub const DEFAULT_DATA_PORT: u16 = 8082;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;

/// Config file (TOML). All fields optional; CLI args take precedence.
/// Default location: `{config_dir}/shardfs/config.toml`
/// (Linux: `~/.config/shardfs/config.toml`)
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub naming: NamingSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub client: ClientSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct NamingSection {
    pub bind: Option<IpAddr>,
    pub client_port: Option<u16>,
    pub storage_port: Option<u16>,
    pub heartbeat_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageSection {
    pub naming: Option<String>,
    pub advertise_ip: Option<IpAddr>,
    pub bind: Option<IpAddr>,
    pub control_port: Option<u16>,
    pub data_port: Option<u16>,
    pub root: Option<PathBuf>,
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClientSection {
    pub naming: Option<String>,
}

impl ConfigFile {
    fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: failed to parse config file {path:?}: {e}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// shardfs: one namespace spread over independently owned storage nodes.
#[derive(Parser, Debug)]
#[command(name = "shardfs", about = "Naming server, storage node and client for a partitioned namespace")]
pub struct CliArgs {
    /// Path to config file (default: {config_dir}/shardfs/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub role: RoleArgs,
}

#[derive(Subcommand, Debug)]
pub enum RoleArgs {
    /// Run the naming server.
    Naming(NamingArgs),
    /// Run a storage node.
    Storage(StorageArgs),
    /// Talk to a naming server. Runs the given command, or reads commands
    /// from stdin when none is given.
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct NamingArgs {
    /// Address to bind both listeners to.
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Port clients connect to.
    #[arg(long)]
    pub client_port: Option<u16>,

    /// Port storage nodes register on.
    #[arg(long)]
    pub storage_port: Option<u16>,

    /// Seconds between heartbeat pings; 0 disables them.
    #[arg(long)]
    pub heartbeat_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct StorageArgs {
    /// Naming server registration address (host:port).
    #[arg(long)]
    pub naming: Option<String>,

    /// IP other parties use to reach this node.
    #[arg(long)]
    pub advertise_ip: Option<IpAddr>,

    /// Address to bind the data listener to.
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Control port; together with the IP this identifies the node.
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Port for client and peer data connections.
    #[arg(long)]
    pub data_port: Option<u16>,

    /// Directory whose contents this node serves.
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Node name (default: hostname).
    #[arg(short, long)]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Naming server client address (host:port).
    #[arg(long)]
    pub naming: Option<String>,

    /// One command, e.g. `LIST /home`.
    pub command: Vec<String>,
}

/// Resolved naming-server configuration.
#[derive(Debug, Clone)]
pub struct NamingConfig {
    pub bind: IpAddr,
    pub client_port: u16,
    pub storage_port: u16,
    pub heartbeat: Option<Duration>,
}

/// Resolved storage-node configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub naming: String,
    pub advertise_ip: IpAddr,
    pub bind: IpAddr,
    pub control_port: u16,
    pub data_port: u16,
    pub root: PathBuf,
    pub name: String,
}

/// Resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub naming: String,
    pub command: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppConfig {
    Naming(NamingConfig),
    Storage(StorageConfig),
    Client(ClientConfig),
}

const UNSPECIFIED: IpAddr = IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);
const LOOPBACK: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

impl AppConfig {
    pub fn from_args(args: &CliArgs) -> anyhow::Result<Self> {
        // Determine config file path and load it
        let config_path = args.config.clone().or_else(|| {
            directories::ProjectDirs::from("", "", "shardfs")
                .map(|p| p.config_dir().join("config.toml"))
        });
        let cfg = config_path
            .as_deref()
            .map(ConfigFile::load)
            .unwrap_or_default();
        Self::resolve(&args.role, cfg)
    }

    /// Merge CLI arguments over a loaded config file.
    pub fn resolve(role: &RoleArgs, cfg: ConfigFile) -> anyhow::Result<Self> {
        Ok(match role {
            RoleArgs::Naming(args) => {
                let file = cfg.naming;
                let heartbeat_secs = args
                    .heartbeat_secs
                    .or(file.heartbeat_secs)
                    .unwrap_or(DEFAULT_HEARTBEAT_SECS);
                Self::Naming(NamingConfig {
                    bind: args.bind.or(file.bind).unwrap_or(UNSPECIFIED),
                    client_port: args
                        .client_port
                        .or(file.client_port)
                        .unwrap_or(DEFAULT_CLIENT_PORT),
                    storage_port: args
                        .storage_port
                        .or(file.storage_port)
                        .unwrap_or(DEFAULT_STORAGE_PORT),
                    heartbeat: (heartbeat_secs > 0).then(|| Duration::from_secs(heartbeat_secs)),
                })
            }
            RoleArgs::Storage(args) => {
                let file = cfg.storage;
                // Root directory (CLI > config file, required from one of them)
                let root = args.root.clone().or(file.root).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Root directory is required. Pass --root <path> or set `storage.root` in config file."
                    )
                })?;
                let name = args.name.clone().or(file.name).unwrap_or_else(|| {
                    hostname::get().map_or_else(
                        |_| "unknown".to_string(),
                        |h| h.to_string_lossy().to_string(),
                    )
                });
                Self::Storage(StorageConfig {
                    naming: args
                        .naming
                        .clone()
                        .or(file.naming)
                        .unwrap_or_else(|| format!("127.0.0.1:{DEFAULT_STORAGE_PORT}")),
                    advertise_ip: args.advertise_ip.or(file.advertise_ip).unwrap_or(LOOPBACK),
                    bind: args.bind.or(file.bind).unwrap_or(UNSPECIFIED),
                    control_port: args
                        .control_port
                        .or(file.control_port)
                        .unwrap_or(DEFAULT_STORAGE_PORT),
                    data_port: args.data_port.or(file.data_port).unwrap_or(DEFAULT_DATA_PORT),
                    root,
                    name,
                })
            }
            RoleArgs::Client(args) => Self::Client(ClientConfig {
                naming: args
                    .naming
                    .clone()
                    .or(cfg.client.naming)
                    .unwrap_or_else(|| format!("127.0.0.1:{DEFAULT_CLIENT_PORT}")),
                command: (!args.command.is_empty()).then(|| args.command.join(" ")),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_naming_defaults() {
        let args = parse(&["shardfs", "naming"]);
        let AppConfig::Naming(cfg) = AppConfig::resolve(&args.role, ConfigFile::default()).unwrap()
        else {
            panic!("expected naming config");
        };
        assert_eq!(cfg.client_port, 8081);
        assert_eq!(cfg.storage_port, 8080);
        assert_eq!(cfg.heartbeat, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_cli_beats_file() {
        let file = ConfigFile::parse(
            r#"
            [naming]
            client_port = 9000
            heartbeat_secs = 0

            [storage]
            root = "/from/file"
            data_port = 9100
            "#,
        )
        .unwrap();
        let args = parse(&["shardfs", "naming", "--client-port", "9001"]);
        let AppConfig::Naming(cfg) = AppConfig::resolve(&args.role, file).unwrap() else {
            panic!("expected naming config");
        };
        assert_eq!(cfg.client_port, 9001);
        assert_eq!(cfg.heartbeat, None);

        let file = ConfigFile::parse("[storage]\nroot = \"/from/file\"\ndata_port = 9100\n").unwrap();
        let args = parse(&["shardfs", "storage", "--name", "alpha"]);
        let AppConfig::Storage(cfg) = AppConfig::resolve(&args.role, file).unwrap() else {
            panic!("expected storage config");
        };
        assert_eq!(cfg.root, PathBuf::from("/from/file"));
        assert_eq!(cfg.data_port, 9100);
        assert_eq!(cfg.control_port, 8080);
        assert_eq!(cfg.name, "alpha");
    }

    #[test]
    fn test_storage_requires_root() {
        let args = parse(&["shardfs", "storage"]);
        assert!(AppConfig::resolve(&args.role, ConfigFile::default()).is_err());
    }

    #[test]
    fn test_client_command_joined() {
        let args = parse(&["shardfs", "client", "LIST", "/home"]);
        let AppConfig::Client(cfg) = AppConfig::resolve(&args.role, ConfigFile::default()).unwrap()
        else {
            panic!("expected client config");
        };
        assert_eq!(cfg.command.as_deref(), Some("LIST /home"));
        assert_eq!(cfg.naming, "127.0.0.1:8081");
    }
}
