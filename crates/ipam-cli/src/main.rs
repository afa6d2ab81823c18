mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use config::{Config, Overrides, LOG_ENV};
use ipam_core::{AddressId, OrgId, SubnetId};
use ipam_engine::{Ipam, SubnetUpdate};
use ipam_rpc::{IpamServer, StdioTransport};
use ipam_store::{MemoryStore, Store};
use output::{emit, OutputFormat, View};
use std::io::{Read, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// IP address management: subnets, reservations, import/export
#[derive(Parser)]
#[command(name = "ipam")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value = "human", global = true)]
    output: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Database path (overrides IPAM_DB)
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,

    /// Storage backend
    #[arg(long, value_enum, default_value = "snapshot", global = true)]
    backend: Backend,

    /// Organizations the caller belongs to (overrides IPAM_ORGANIZATIONS)
    #[arg(long = "org", value_name = "ORG", value_delimiter = ',', global = true)]
    orgs: Vec<String>,

    /// Act as superuser
    #[arg(long, global = true)]
    superuser: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Backend {
    /// JSON snapshot file
    Snapshot,
    /// RocksDB directory
    #[cfg(feature = "rocksdb")]
    Rocksdb,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage subnets
    #[command(subcommand)]
    Subnet(SubnetCommand),
    /// Manage IP address reservations
    #[command(subcommand)]
    Ip(IpCommand),
    /// Import a subnet document (use '-' for stdin)
    Import(ImportArgs),
    /// Export a subnet document
    Export(ExportArgs),
    /// Serve JSON-RPC 2.0 on stdio
    Serve,
}

#[derive(Subcommand)]
enum SubnetCommand {
    /// Create a subnet
    Create {
        /// Network in CIDR notation
        cidr: String,
        /// Display name
        #[arg(short, long, default_value = "")]
        name: String,
        /// Owning organization (defaults to the caller's only one)
        #[arg(long)]
        owner: Option<String>,
        /// Create a globally shared subnet
        #[arg(long, conflicts_with = "owner")]
        shared: bool,
    },
    /// List visible subnets
    List,
    /// Show one subnet
    Show { id: SubnetId },
    /// List subnets nested inside a subnet
    Children { id: SubnetId },
    /// Show the subnet directly containing a subnet
    Parent { id: SubnetId },
    /// Rename a subnet or move it to another organization
    Update {
        id: SubnetId,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Delete a subnet
    Delete {
        id: SubnetId,
        /// Also delete its addresses
        #[arg(long)]
        cascade: bool,
    },
    /// Page through usable hosts
    Hosts {
        id: SubnetId,
        #[arg(long, default_value = "0")]
        offset: u128,
        #[arg(long, default_value = "256")]
        limit: usize,
    },
    /// Show address usage
    Usage { id: SubnetId },
}

#[derive(Subcommand)]
enum IpCommand {
    /// Show the next free address without reserving it
    Next { subnet: SubnetId },
    /// Reserve the next free address
    Request {
        subnet: SubnetId,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Reserve a specific address in a subnet
    Reserve {
        subnet: SubnetId,
        ip: IpAddr,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Reserve an address in whichever subnet contains it
    Add {
        ip: IpAddr,
        #[arg(long)]
        owner: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List addresses of a subnet
    List { subnet: SubnetId },
    /// Show one address
    Show { id: AddressId },
    /// Replace an address description
    Describe { id: AddressId, description: String },
    /// Release an address
    Release { id: AddressId },
}

#[derive(Parser)]
struct ImportArgs {
    /// Input file (use '-' for stdin)
    #[arg(value_name = "FILE")]
    file: String,

    /// Owning organization (defaults to the one the document names, then
    /// the caller's only one)
    #[arg(long)]
    owner: Option<String>,
}

#[derive(Parser)]
struct ExportArgs {
    subnet: SubnetId,

    /// Output file (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::resolve(&Overrides {
        db: cli.db.clone(),
        organizations: cli.orgs.clone(),
        superuser: cli.superuser,
    })?;
    debug!(
        db = %config.db.display(),
        superuser = config.caller.is_superuser(),
        "Resolved configuration"
    );
    let ipam = Arc::new(Ipam::new(open_store(cli.backend, &config)?));

    match cli.command {
        Commands::Subnet(cmd) => handle_subnet(&ipam, &config, cmd, cli.output).await?,
        Commands::Ip(cmd) => handle_ip(&ipam, &config, cmd, cli.output).await?,
        Commands::Import(args) => handle_import(&ipam, &config, args, cli.output).await?,
        Commands::Export(args) => handle_export(&ipam, &config, args, cli.verbose).await?,
        Commands::Serve => handle_serve(ipam, &config, cli.verbose).await?,
    }

    Ok(())
}

/// Logs go to stderr; `IPAM_LOG` then `RUST_LOG` pick the filter
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(backend: Backend, config: &Config) -> Result<Box<dyn Store>> {
    match backend {
        Backend::Snapshot => {
            let store = MemoryStore::open(&config.db)
                .with_context(|| format!("Failed to open {}", config.db.display()))?;
            Ok(Box::new(store))
        }
        #[cfg(feature = "rocksdb")]
        Backend::Rocksdb => {
            let store = ipam_store::RocksStore::open(&config.db)
                .with_context(|| format!("Failed to open {}", config.db.display()))?;
            Ok(Box::new(store))
        }
    }
}

/// Explicit owner, else the caller's only organization
fn owner(config: &Config, requested: Option<String>) -> Option<OrgId> {
    requested
        .map(OrgId::from)
        .or_else(|| config.caller.default_organization())
}

async fn handle_subnet(
    ipam: &Ipam<Box<dyn Store>>,
    config: &Config,
    cmd: SubnetCommand,
    format: OutputFormat,
) -> Result<()> {
    let caller = &config.caller;
    match cmd {
        SubnetCommand::Create {
            cidr,
            name,
            owner: requested,
            shared,
        } => {
            let organization = if shared {
                None
            } else {
                owner(config, requested)
            };
            let subnet = ipam.create_subnet(caller, organization, &cidr, &name).await?;
            emit(&subnet, View::subnet(&subnet), format)
        }
        SubnetCommand::List => {
            let subnets = ipam.visible_subnets(caller).await?;
            emit(&subnets, View::subnets("Subnets", &subnets), format)
        }
        SubnetCommand::Show { id } => {
            let subnet = ipam.subnet(caller, id).await?;
            emit(&subnet, View::subnet(&subnet), format)
        }
        SubnetCommand::Children { id } => {
            let children = ipam.children(caller, id).await?;
            emit(&children, View::subnets("Children", &children), format)
        }
        SubnetCommand::Parent { id } => {
            let parent = ipam.parent(caller, id).await?;
            let found: Vec<_> = parent.iter().cloned().collect();
            emit(&parent, View::subnets("Parent", &found), format)
        }
        SubnetCommand::Update {
            id,
            name,
            owner: requested,
        } => {
            let update = SubnetUpdate {
                name,
                organization: requested.map(|o| Some(OrgId::from(o))),
            };
            let subnet = ipam.update_subnet(caller, id, update).await?;
            emit(&subnet, View::subnet(&subnet), format)
        }
        SubnetCommand::Delete { id, cascade } => {
            let removed = ipam.delete_subnet(caller, id, cascade).await?;
            let result = serde_json::json!({ "deleted": id, "addresses_removed": removed });
            let view = View::message(
                "Deleted",
                vec![("Subnet", id.to_string()), ("Addresses removed", removed.to_string())],
            );
            emit(&result, view, format)
        }
        SubnetCommand::Hosts { id, offset, limit } => {
            let hosts = ipam.hosts(caller, id, offset, limit).await?;
            emit(&hosts, View::hosts(&hosts), format)
        }
        SubnetCommand::Usage { id } => {
            let usage = ipam.usage(caller, id).await?;
            emit(&usage, View::usage(&usage), format)
        }
    }
}

async fn handle_ip(
    ipam: &Ipam<Box<dyn Store>>,
    config: &Config,
    cmd: IpCommand,
    format: OutputFormat,
) -> Result<()> {
    let caller = &config.caller;
    let record = match cmd {
        IpCommand::Next { subnet } => {
            let ip = ipam.next_available(caller, subnet).await?;
            let result = serde_json::json!({ "subnet": subnet, "ip_address": ip });
            let view = View::message("Next available", vec![("Address", ip.to_string())]);
            return emit(&result, view, format);
        }
        IpCommand::List { subnet } => {
            let addresses = ipam.addresses(caller, subnet).await?;
            return emit(&addresses, View::addresses("Addresses", &addresses), format);
        }
        IpCommand::Request {
            subnet,
            description,
        } => ipam.request_address(caller, subnet, description).await?,
        IpCommand::Reserve {
            subnet,
            ip,
            description,
        } => ipam.reserve(caller, subnet, ip, description).await?,
        IpCommand::Add {
            ip,
            owner: requested,
            description,
        } => {
            ipam.create_address(caller, owner(config, requested), ip, description)
                .await?
        }
        IpCommand::Show { id } => ipam.address(caller, id).await?,
        IpCommand::Describe { id, description } => {
            ipam.update_description(caller, id, Some(description))
                .await?
        }
        IpCommand::Release { id } => ipam.release_address(caller, id).await?,
    };
    emit(&record, View::address(&record), format)
}

async fn handle_import(
    ipam: &Ipam<Box<dyn Store>>,
    config: &Config,
    args: ImportArgs,
    format: OutputFormat,
) -> Result<()> {
    let raw = if args.file == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        buf
    } else {
        std::fs::read(&args.file).with_context(|| format!("Failed to read {}", args.file))?
    };

    let report = ipam
        .import_document(&config.caller, args.owner.map(OrgId::from), &raw)
        .await?;
    emit(&report, View::import(&report), format)
}

async fn handle_export(
    ipam: &Ipam<Box<dyn Store>>,
    config: &Config,
    args: ExportArgs,
    verbose: bool,
) -> Result<()> {
    let bytes = ipam.export_subnet(&config.caller, args.subnet).await?;
    match args.file {
        Some(path) => {
            std::fs::write(&path, &bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if verbose {
                eprintln!("{} Exported to {}", "›".blue(), path.display());
            }
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

async fn handle_serve(ipam: Arc<Ipam<Box<dyn Store>>>, config: &Config, verbose: bool) -> Result<()> {
    if verbose {
        eprintln!("{} Serving JSON-RPC on stdio", "›".blue());
    }
    let server = Arc::new(IpamServer::new(ipam, config.caller.clone()));
    StdioTransport::new(server).run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["ipam", "subnet", "list"]);
        assert!(matches!(cli.command, Commands::Subnet(SubnetCommand::List)));
        assert!(matches!(cli.output, OutputFormat::Human));
        assert_eq!(cli.backend, Backend::Snapshot);
    }

    #[test]
    fn test_output_format_json() {
        let cli = Cli::parse_from(["ipam", "--output", "json-compact", "subnet", "list"]);
        assert!(matches!(cli.output, OutputFormat::JsonCompact));
    }

    #[test]
    fn test_global_identity_flags() {
        let cli = Cli::parse_from([
            "ipam", "subnet", "create", "10.0.0.0/24", "--name", "Office", "--org", "org_a,org_b",
            "--superuser",
        ]);
        assert_eq!(cli.orgs, vec!["org_a", "org_b"]);
        assert!(cli.superuser);
        if let Commands::Subnet(SubnetCommand::Create { cidr, name, .. }) = cli.command {
            assert_eq!(cidr, "10.0.0.0/24");
            assert_eq!(name, "Office");
        } else {
            panic!("Expected subnet create command");
        }
    }

    #[test]
    fn test_ip_reserve_command() {
        let id = SubnetId::new();
        let id_arg = id.to_string();
        let cli = Cli::parse_from([
            "ipam",
            "ip",
            "reserve",
            id_arg.as_str(),
            "10.0.0.7",
            "-d",
            "printer",
        ]);
        if let Commands::Ip(IpCommand::Reserve {
            subnet,
            ip,
            description,
        }) = cli.command
        {
            assert_eq!(subnet, id);
            assert_eq!(ip.to_string(), "10.0.0.7");
            assert_eq!(description.as_deref(), Some("printer"));
        } else {
            panic!("Expected ip reserve command");
        }
    }

    #[test]
    fn test_invalid_subnet_id_is_rejected() {
        assert!(Cli::try_parse_from(["ipam", "subnet", "show", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_shared_conflicts_with_owner() {
        assert!(Cli::try_parse_from([
            "ipam", "subnet", "create", "10.0.0.0/8", "--shared", "--owner", "org_a"
        ])
        .is_err());
    }

    #[test]
    fn test_verbose_flag() {
        let cli = Cli::parse_from(["ipam", "-v", "serve"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Serve));
    }
}
