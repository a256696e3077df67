mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::{handlers, params, response_handlers, workflow_handlers};

#[derive(Parser)]
#[command(name = "meridian")]
#[command(version)]
#[command(about = "Distributed threat-response workflow orchestration")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    /// Path to configuration file (default: ~/.config/meridian/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition file
    ///
    /// Checks step ids, dependencies, cycles, retry policies and timeouts,
    /// and reports steps whose action has no registered handler.
    Validate {
        /// Path to workflow YAML file
        workflow_file: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run a workflow definition to completion in a local region
    ///
    /// Examples:
    ///   meridian run contain.yaml --param source=10.0.0.7
    ///   meridian run contain.yaml -p event.severity=high --json
    Run {
        /// Path to workflow YAML file
        workflow_file: String,

        /// Submission parameter as key=value (dotted keys nest, values parse as JSON when possible)
        #[arg(short, long = "param", value_parser = params::parse_param)]
        params: Vec<(String, String)>,

        /// Seconds to wait for the workflow to settle
        #[arg(short, long, default_value = "60")]
        timeout: u64,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Feed a threat event through response patterns
    Trigger {
        /// Pattern set YAML file
        #[arg(long)]
        patterns: String,

        /// Directory containing workflow YAML files
        #[arg(long)]
        workflows: String,

        /// Threat event JSON file
        #[arg(long)]
        event: String,

        /// Seconds to wait for a triggered workflow to settle
        #[arg(short, long, default_value = "60")]
        timeout: u64,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start a region node with its status API
    ///
    /// Peers listed in the configuration run as simulated regions in the
    /// same process and gossip with the local region.
    Serve {
        /// Status API bind address (overrides configuration)
        #[arg(long)]
        host: Option<String>,

        /// Status API port (overrides configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory of workflow definitions to register
        #[arg(long)]
        workflows: Option<String>,

        /// Pattern set to load into threat response
        #[arg(long)]
        patterns: Option<String>,
    },

    /// Show or initialize configuration
    Config {
        /// Start interactive configuration setup
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = handlers::resolve_config_path(cli.config.as_deref())?;

    if let Commands::Config { init } = cli.command {
        return if init {
            handlers::handle_config_init(&config_path).await
        } else {
            handlers::handle_config_show(&config_path)
        };
    }

    let config = handlers::load_configuration(&config_path)?;
    handlers::init_logging(&config)?;

    match cli.command {
        Commands::Validate { workflow_file, json } => {
            workflow_handlers::handle_validate(workflow_file, json)?;
        }
        Commands::Run {
            workflow_file,
            params,
            timeout,
            json,
        } => {
            workflow_handlers::handle_run(config, workflow_file, params, timeout, json).await?;
        }
        Commands::Trigger {
            patterns,
            workflows,
            event,
            timeout,
            json,
        } => {
            response_handlers::handle_trigger(config, patterns, workflows, event, timeout, json).await?;
        }
        Commands::Serve {
            host,
            port,
            workflows,
            patterns,
        } => {
            handlers::handle_serve(config, host, port, workflows, patterns).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
