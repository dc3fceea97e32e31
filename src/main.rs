//! Storage Gateway
//!
//! Command line front end for highly available iSCSI targets, NFS exports
//! and NVMe-oF subsystems. Every command prints the resulting resource config
//! as JSON on stdout; logs go to stderr.

use anyhow::{anyhow, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_gateway::protocols::{iscsi, nfs, nvmeof};
use storage_gateway::{
    BackendConfig, BackendFactory, GatewayConfig, Iqn, Iscsi, LinstorConfig, Nfs, Nqn, Nvmeof,
    ResourceName, ServiceIp, StorageBackend, VolumeConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Gateway - Highly available iSCSI, NFS and NVMe-oF on replicated storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Comma separated LINSTOR controller URLs; the first one is used
    #[arg(long, env = "LINSTOR_CONTROLLERS", default_value = "http://localhost:3370")]
    controllers: String,

    /// LINSTOR request timeout in seconds
    #[arg(long, env = "LINSTOR_REQUEST_TIMEOUT", default_value = "30")]
    request_timeout_secs: u64,

    /// Directory drbd-reactor reads promoter configs from
    #[arg(long, env = "GATEWAY_PROMOTER_DIR", default_value = storage_gateway::promoter::DEFAULT_PROMOTER_DIR)]
    promoter_dir: String,

    /// Seconds to wait for a resource to start or stop
    #[arg(long, env = "GATEWAY_RESOURCE_TIMEOUT", default_value = "60")]
    resource_timeout_secs: u64,

    /// Seconds between two resource state queries
    #[arg(long, env = "GATEWAY_POLL_INTERVAL", default_value = "3")]
    poll_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against a process local in-memory backend instead of LINSTOR
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage iSCSI targets
    Iscsi {
        #[command(subcommand)]
        action: IscsiAction,
    },
    /// Manage NFS exports
    Nfs {
        #[command(subcommand)]
        action: NfsAction,
    },
    /// Manage NVMe-oF subsystems
    Nvmeof {
        #[command(subcommand)]
        action: NvmeofAction,
    },
}

/// Volume sizes in KiB, one volume per value
#[derive(ClapArgs, Debug)]
struct Sizes {
    #[arg(long = "size", required = true)]
    sizes: Vec<u64>,
}

impl Sizes {
    fn volumes(&self) -> Vec<VolumeConfig> {
        self.sizes
            .iter()
            .map(|size| VolumeConfig::new(0, *size))
            .collect()
    }
}

#[derive(Subcommand, Debug)]
enum IscsiAction {
    /// Create and start a target
    Create {
        iqn: Iqn,
        #[arg(long = "service-ip", required = true)]
        service_ips: Vec<ServiceIp>,
        #[command(flatten)]
        sizes: Sizes,
        #[arg(long, default_value = "")]
        username: String,
        #[arg(long, default_value = "")]
        password: String,
        #[arg(long = "allowed-initiator")]
        allowed_initiators: Vec<Iqn>,
        #[arg(long, default_value = "")]
        resource_group: String,
        #[arg(long)]
        gross_size: bool,
        /// Target implementation, e.g. lio-t or scst
        #[arg(long)]
        implementation: Option<String>,
    },
    Get { iqn: Iqn },
    List,
    Start { iqn: Iqn },
    Stop { iqn: Iqn },
    Delete { iqn: Iqn },
    /// Add a logical unit to a stopped target
    AddVolume {
        iqn: Iqn,
        /// LUN, assigned automatically if omitted
        #[arg(long, default_value = "0")]
        number: u32,
        #[arg(long)]
        size: u64,
    },
    DeleteVolume { iqn: Iqn, number: u32 },
}

#[derive(Subcommand, Debug)]
enum NfsAction {
    /// Create and start an NFS export
    Create {
        name: ResourceName,
        #[arg(long)]
        service_ip: ServiceIp,
        #[command(flatten)]
        sizes: Sizes,
        /// Export path of each volume, in the order of the sizes
        #[arg(long = "export-path")]
        export_paths: Vec<String>,
        #[arg(long = "allowed-ip")]
        allowed_ips: Vec<ServiceIp>,
        #[arg(long, default_value = "")]
        resource_group: String,
    },
    Get { name: ResourceName },
    List,
    Start { name: ResourceName },
    Stop { name: ResourceName },
    Delete { name: ResourceName },
    AddVolume {
        name: ResourceName,
        #[arg(long, default_value = "0")]
        number: u32,
        #[arg(long)]
        size: u64,
        #[arg(long, default_value = "/")]
        export_path: String,
    },
    DeleteVolume { name: ResourceName, number: u32 },
}

#[derive(Subcommand, Debug)]
enum NvmeofAction {
    /// Create and start a subsystem
    Create {
        nqn: Nqn,
        #[arg(long)]
        service_ip: ServiceIp,
        #[command(flatten)]
        sizes: Sizes,
        #[arg(long, default_value = "")]
        resource_group: String,
        #[arg(long)]
        gross_size: bool,
    },
    Get { nqn: Nqn },
    List,
    Start { nqn: Nqn },
    Stop { nqn: Nqn },
    Delete { nqn: Nqn },
    /// Add a namespace to a stopped subsystem
    AddVolume {
        nqn: Nqn,
        #[arg(long, default_value = "0")]
        number: u32,
        #[arg(long)]
        size: u64,
    },
    DeleteVolume { nqn: Nqn, number: u32 },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Storage Gateway {}", storage_gateway::VERSION);

    let backend = create_backend(&args)?;
    let config = GatewayConfig {
        promoter_dir: args.promoter_dir.clone(),
        resource_timeout: Duration::from_secs(args.resource_timeout_secs),
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pending waits");
            on_signal.cancel();
        }
    });

    match args.command {
        Command::Iscsi { action } => {
            run_iscsi(Iscsi::new(backend, &config).with_cancellation(cancel), action).await
        }
        Command::Nfs { action } => {
            run_nfs(Nfs::new(backend, &config).with_cancellation(cancel), action).await
        }
        Command::Nvmeof { action } => {
            run_nvmeof(Nvmeof::new(backend, &config).with_cancellation(cancel), action).await
        }
    }
}

fn create_backend(args: &Args) -> anyhow::Result<Arc<dyn StorageBackend>> {
    if args.standalone {
        info!("Standalone mode, state is not persisted");
        return Ok(BackendFactory::create("memory", BackendConfig::default())?);
    }

    let endpoint = args
        .controllers
        .split(',')
        .map(str::trim)
        .find(|c| !c.is_empty())
        .ok_or_else(|| anyhow!("no LINSTOR controller configured"))?;

    let config = BackendConfig {
        linstor: LinstorConfig {
            endpoint: endpoint.to_string(),
            timeout: Duration::from_secs(args.request_timeout_secs),
        },
        ..Default::default()
    };

    info!("Using LINSTOR controller at {}", endpoint);
    BackendFactory::create("linstor", config).context("failed to create LINSTOR client")
}

// =============================================================================
// Commands
// =============================================================================

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_found<T: Serialize>(value: Option<T>, what: &str) -> anyhow::Result<()> {
    match value {
        Some(value) => print_json(&value),
        None => Err(anyhow!("{} not found", what)),
    }
}

async fn run_iscsi(gateway: Iscsi, action: IscsiAction) -> anyhow::Result<()> {
    match action {
        IscsiAction::Create {
            iqn,
            service_ips,
            sizes,
            username,
            password,
            allowed_initiators,
            resource_group,
            gross_size,
            implementation,
        } => {
            let rsc = iscsi::ResourceConfig {
                username,
                password,
                allowed_initiators,
                resource_group,
                gross_size,
                implementation,
                ..iscsi::ResourceConfig::new(iqn, service_ips, sizes.volumes())
            };
            print_json(&gateway.create(rsc).await?)
        }
        IscsiAction::Get { iqn } => {
            let what = format!("iSCSI target {}", iqn);
            print_found(gateway.get(&iqn).await?, &what)
        }
        IscsiAction::List => print_json(&gateway.list().await?),
        IscsiAction::Start { iqn } => {
            let what = format!("iSCSI target {}", iqn);
            print_found(gateway.start(&iqn).await?, &what)
        }
        IscsiAction::Stop { iqn } => {
            let what = format!("iSCSI target {}", iqn);
            print_found(gateway.stop(&iqn).await?, &what)
        }
        IscsiAction::Delete { iqn } => {
            gateway.delete(&iqn).await?;
            info!("Deleted iSCSI target {}", iqn);
            Ok(())
        }
        IscsiAction::AddVolume { iqn, number, size } => {
            let what = format!("iSCSI target {}", iqn);
            let volume = VolumeConfig::new(number, size);
            print_found(gateway.add_volume(&iqn, volume).await?, &what)
        }
        IscsiAction::DeleteVolume { iqn, number } => {
            let what = format!("iSCSI target {}", iqn);
            print_found(gateway.delete_volume(&iqn, number).await?, &what)
        }
    }
}

async fn run_nfs(gateway: Nfs, action: NfsAction) -> anyhow::Result<()> {
    match action {
        NfsAction::Create {
            name,
            service_ip,
            sizes,
            export_paths,
            allowed_ips,
            resource_group,
        } => {
            if export_paths.len() > sizes.sizes.len() {
                return Err(anyhow!("more export paths than volumes given"));
            }

            let volumes = sizes
                .sizes
                .iter()
                .enumerate()
                .map(|(i, size)| {
                    let path = export_paths.get(i).map(String::as_str).unwrap_or("");
                    nfs::NfsVolumeConfig::new(0, *size, path)
                })
                .collect();

            let rsc = nfs::ResourceConfig {
                allowed_ips,
                resource_group,
                ..nfs::ResourceConfig::new(name, service_ip, volumes)
            };
            print_json(&gateway.create(rsc).await?)
        }
        NfsAction::Get { name } => {
            let what = format!("NFS export {}", name);
            print_found(gateway.get(&name).await?, &what)
        }
        NfsAction::List => print_json(&gateway.list().await?),
        NfsAction::Start { name } => {
            let what = format!("NFS export {}", name);
            print_found(gateway.start(&name).await?, &what)
        }
        NfsAction::Stop { name } => {
            let what = format!("NFS export {}", name);
            print_found(gateway.stop(&name).await?, &what)
        }
        NfsAction::Delete { name } => {
            gateway.delete(&name).await?;
            info!("Deleted NFS export {}", name);
            Ok(())
        }
        NfsAction::AddVolume {
            name,
            number,
            size,
            export_path,
        } => {
            let what = format!("NFS export {}", name);
            let volume = nfs::NfsVolumeConfig::new(number, size, export_path);
            print_found(gateway.add_volume(&name, volume).await?, &what)
        }
        NfsAction::DeleteVolume { name, number } => {
            let what = format!("NFS export {}", name);
            print_found(gateway.delete_volume(&name, number).await?, &what)
        }
    }
}

async fn run_nvmeof(gateway: Nvmeof, action: NvmeofAction) -> anyhow::Result<()> {
    match action {
        NvmeofAction::Create {
            nqn,
            service_ip,
            sizes,
            resource_group,
            gross_size,
        } => {
            let rsc = nvmeof::ResourceConfig {
                resource_group,
                gross_size,
                ..nvmeof::ResourceConfig::new(nqn, service_ip, sizes.volumes())
            };
            print_json(&gateway.create(rsc).await?)
        }
        NvmeofAction::Get { nqn } => {
            let what = format!("NVMe-oF subsystem {}", nqn);
            print_found(gateway.get(&nqn).await?, &what)
        }
        NvmeofAction::List => print_json(&gateway.list().await?),
        NvmeofAction::Start { nqn } => {
            let what = format!("NVMe-oF subsystem {}", nqn);
            print_found(gateway.start(&nqn).await?, &what)
        }
        NvmeofAction::Stop { nqn } => {
            let what = format!("NVMe-oF subsystem {}", nqn);
            print_found(gateway.stop(&nqn).await?, &what)
        }
        NvmeofAction::Delete { nqn } => {
            gateway.delete(&nqn).await?;
            info!("Deleted NVMe-oF subsystem {}", nqn);
            Ok(())
        }
        NvmeofAction::AddVolume { nqn, number, size } => {
            let what = format!("NVMe-oF subsystem {}", nqn);
            let volume = VolumeConfig::new(number, size);
            print_found(gateway.add_volume(&nqn, volume).await?, &what)
        }
        NvmeofAction::DeleteVolume { nqn, number } => {
            let what = format!("NVMe-oF subsystem {}", nqn);
            print_found(gateway.delete_volume(&nqn, number).await?, &what)
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = ["hyper=warn", "reqwest=info"]
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_iscsi_create() {
        let args = Args::try_parse_from([
            "storage-gateway",
            "--standalone",
            "iscsi",
            "create",
            "iqn.2021-08.com.linbit:target1",
            "--service-ip",
            "10.0.0.1/24",
            "--size",
            "1048576",
            "--size",
            "2048",
            "--allowed-initiator",
            "iqn.2021-08.com.linbit:client1",
        ])
        .unwrap();

        assert!(args.standalone);
        match args.command {
            Command::Iscsi {
                action:
                    IscsiAction::Create {
                        iqn,
                        service_ips,
                        sizes,
                        allowed_initiators,
                        ..
                    },
            } => {
                assert_eq!(iqn.wwn(), "target1");
                assert_eq!(service_ips.len(), 1);
                assert_eq!(sizes.volumes().len(), 2);
                assert_eq!(allowed_initiators.len(), 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_invalid_identity() {
        assert!(Args::try_parse_from(["storage-gateway", "nvmeof", "get", "garbage"]).is_err());
        assert!(Args::try_parse_from([
            "storage-gateway",
            "nfs",
            "delete-volume",
            "nfs1",
            "not-a-number"
        ])
        .is_err());
    }
}
