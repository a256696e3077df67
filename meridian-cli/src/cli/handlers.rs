//! CLI command handlers: configuration and the region node

use anyhow::{Context, Result};
use meridian_core::context::RegionContext;
use meridian_core::distributed::{DistributedState, LeaseArbiter, LocalTransport, PeerTransport};
use meridian_core::models::{Configuration, LogLevel};
use meridian_core::region::RegionDirectory;
use meridian_core::response::PatternSet;
use meridian_core::RegionNode;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;

use super::workflow_handlers::load_definitions_dir;

/// Expand `~/` and fall back to the XDG default
pub fn resolve_config_path(config_file: Option<&str>) -> Result<PathBuf> {
    match config_file {
        Some(path) if path.starts_with("~/") => {
            let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
            Ok(home.join(&path[2..]))
        }
        Some(path) => Ok(PathBuf::from(path)),
        None => Configuration::default_config_path(),
    }
}

/// Load and validate configuration; a missing file yields defaults
pub fn load_configuration(path: &Path) -> Result<Configuration> {
    let config = Configuration::load_from_file(&path.to_path_buf())
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Invalid configuration in {}:\n  {}",
            path.display(),
            errors.join("\n  ")
        ));
    }
    Ok(config)
}

pub fn init_logging(config: &Configuration) -> Result<()> {
    meridian_core::services::logging::init_logging(config.log_level)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Register every workflow in `workflows` and every pattern in `patterns` on a node
fn load_node_content(node: &RegionNode, workflows: Option<&str>, patterns: Option<&str>) -> Result<()> {
    if let Some(dir) = workflows {
        for (path, definition) in load_definitions_dir(Path::new(dir))? {
            let name = definition.name.clone();
            node.engine()
                .register_definition(definition)
                .with_context(|| format!("Failed to register {} ({})", name, path.display()))?;
        }
    }
    if let Some(file) = patterns {
        let set = PatternSet::load(Path::new(file))?;
        let count = node
            .response()
            .load_patterns(set)
            .context("Failed to load response patterns")?;
        tracing::info!(patterns = count, region = %node.region(), "Response patterns loaded");
    }
    Ok(())
}

/// Handle the 'serve' command
pub async fn handle_serve(
    config: Configuration,
    host: Option<String>,
    port: Option<u16>,
    workflows: Option<String>,
    patterns: Option<String>,
) -> Result<()> {
    let mut config = config;
    if let Some(host) = host {
        config.api_host = host;
    }
    if let Some(port) = port {
        config.api_port = port;
    }
    let addr: SocketAddr = format!("{}:{}", config.api_host, config.api_port)
        .parse()
        .with_context(|| format!("Invalid status API address {}:{}", config.api_host, config.api_port))?;

    // Every region in this process shares one lease arbiter and one transport
    let arbiter = Arc::new(DistributedState::new(format!("{}-leases", config.region_id)));
    let transport = Arc::new(LocalTransport::new());
    let directory = Arc::new(RegionDirectory::new());

    let mut nodes = Vec::new();
    for region_config in cluster_configs(&config) {
        let ctx = RegionContext::builder(region_config)
            .arbiter(Arc::clone(&arbiter) as Arc<dyn LeaseArbiter>)
            .build()?;
        transport.register(Arc::clone(&ctx.replica));
        let peer_transport = (!ctx.config.peers.is_empty())
            .then(|| Arc::clone(&transport) as Arc<dyn PeerTransport>);
        let node = RegionNode::new(ctx, Arc::clone(&directory), peer_transport)?;
        load_node_content(&node, workflows.as_deref(), patterns.as_deref())?;
        node.start();
        nodes.push(node);
    }

    let local = nodes
        .first()
        .ok_or_else(|| anyhow::anyhow!("No region configured"))?;
    let bound = local.start_api(addr)?;

    println!("🌐 Meridian region '{}' running", local.region());
    println!("   Status API: http://{}/api/v1/health", bound);
    if nodes.len() > 1 {
        let simulated: Vec<&str> = nodes[1..].iter().map(|n| n.region()).collect();
        println!("   Simulated peers: {}", simulated.join(", "));
    }
    println!("   Workflows: {}", local.engine().list_definitions().join(", "));
    println!("Press Ctrl+C to stop");

    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    println!("\n🛑 Shutting down");
    for node in &nodes {
        node.shutdown();
    }
    Ok(())
}

/// The local region first, then one configuration per peer
fn cluster_configs(config: &Configuration) -> Vec<Configuration> {
    let mut all = vec![config.local_region()];
    all.extend(config.peers.iter().cloned());

    all.iter()
        .map(|region| Configuration {
            region_id: region.id.clone(),
            endpoint: region.endpoint.clone(),
            capacity: region.capacity,
            peers: all.iter().filter(|r| r.id != region.id).cloned().collect(),
            // Peers keep their replicas and audit trails in memory
            audit_store_path: if region.id == config.region_id {
                config.audit_store_path.clone()
            } else {
                None
            },
            ..config.clone()
        })
        .collect()
}

/// Handle 'config' without --init: print the effective configuration
pub fn handle_config_show(config_path: &Path) -> Result<()> {
    let config = Configuration::load_from_file(&config_path.to_path_buf())
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    println!("# {}", config_path.display());
    if !config_path.exists() {
        println!("# (file not found, showing defaults)");
    }
    println!("{}", toml::to_string_pretty(&config)?);

    if let Err(errors) = config.validate() {
        println!("⚠️  Configuration has errors:");
        for error in errors {
            println!("   - {}", error);
        }
    }
    Ok(())
}

fn read_user_input_sync() -> Result<String> {
    let mut buffer = String::new();
    io::stdin()
        .read_line(&mut buffer)
        .context("Failed to read from stdin")?;
    Ok(buffer)
}

fn prompt(label: &str, current: &str) -> Result<Option<String>> {
    print!("{} [{}]: ", label, current);
    io::stdout().flush()?;
    let input = read_user_input_sync()?;
    let input = input.trim();
    Ok((!input.is_empty()).then(|| input.to_string()))
}

fn log_level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

/// Handle the 'config --init' command
pub async fn handle_config_init(config_path: &Path) -> Result<()> {
    println!("⚙️  Initializing meridian configuration");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📄 Config file: {}", config_path.display());

    let mut config = if config_path.exists() {
        println!("⚠️  Configuration file already exists. Loading existing values...");
        Configuration::load_from_file(&config_path.to_path_buf())
            .map_err(|e| anyhow::anyhow!("Failed to load existing config: {}", e))?
    } else {
        println!("✨ Creating new configuration with defaults...");
        Configuration::default()
    };

    println!("\n📝 Please answer the following questions (press Enter to use default):\n");

    if let Some(region) = prompt("Region id", &config.region_id)? {
        config.region_id = region;
    }
    if let Some(endpoint) = prompt("Region endpoint", &config.endpoint)? {
        config.endpoint = endpoint;
    }
    if let Some(capacity) = prompt("Maximum active workflows", &config.capacity.to_string())? {
        match capacity.parse::<u32>() {
            Ok(capacity) => config.capacity = capacity,
            Err(_) => println!("⚠️  Invalid capacity, using default"),
        }
    }
    if let Some(level) = prompt("Log level (error/warn/info/debug/trace)", log_level_name(config.log_level))? {
        config.log_level = match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => {
                println!("⚠️  Invalid log level, using default");
                config.log_level
            }
        };
    }
    if let Some(host) = prompt("Status API bind address", &config.api_host)? {
        config.api_host = host;
    }
    if let Some(port) = prompt("Status API port", &config.api_port.to_string())? {
        match port.parse::<u16>() {
            Ok(port) => config.api_port = port,
            Err(_) => println!("⚠️  Invalid port number, using default"),
        }
    }
    let audit_default = config
        .audit_store_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "in-memory".to_string());
    if let Some(path) = prompt("Audit store file", &audit_default)? {
        config.audit_store_path = Some(PathBuf::from(path));
    }

    println!("\n🔍 Validating configuration...");
    match config.validate() {
        Ok(()) => println!("✅ Configuration is valid"),
        Err(errors) => {
            println!("❌ Configuration has errors:");
            for error in &errors {
                println!("   - {}", error);
            }
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    config
        .save_to_file(&config_path.to_path_buf())
        .with_context(|| format!("Failed to save configuration to {}", config_path.display()))?;
    println!("💾 Configuration saved to {}", config_path.display());
    println!("\nEdit the file to add peer regions under [[peers]].");
    Ok(())
}
