use anyhow::Result;
use clap::{Parser, Subcommand};
use flowctl::cli::{self, ArchiveListArgs, Engine, SubmitArgs, commands};
use flowctl::config::EngineConfig;
use flowctl::logging::{self, LogOptions};
use flowctl::signals::{CancellationToken, setup_signal_handlers};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "flowctl")]
#[command(about = "DAG workflow engine - submit workflows, manage templates and cron schedules")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Namespace (defaults to the configured namespace)
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Output format: console, json or quiet
    #[arg(short, long, global = true, default_value = "console")]
    output: String,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a workflow and wait for it to finish
    Submit {
        /// Manifest file (Workflow, WorkflowTemplate or CronWorkflow)
        file: Option<PathBuf>,

        /// Submit from a stored object, e.g. workflowtemplate/my-template
        #[arg(long)]
        from: Option<String>,

        /// Root step to run
        #[arg(long)]
        entrypoint: Option<String>,

        /// Parameter override, name=value (repeatable)
        #[arg(short = 'p', long = "parameter")]
        parameters: Vec<String>,

        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List live workflows
    List {
        /// List across every namespace
        #[arg(short = 'A', long)]
        all_namespaces: bool,
    },

    /// Show a live workflow
    Get { name: String },

    /// Delete a live workflow
    Delete { name: String },

    /// Stop a running workflow
    Terminate { name: String },

    /// Manage workflow templates
    Template {
        #[command(subcommand)]
        command: TemplateCommand,
    },

    /// Manage cron workflows
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },

    /// Browse archived workflows
    Archive {
        #[command(subcommand)]
        command: ArchiveCommand,
    },

    /// Run the controller and cron scheduler until interrupted
    Controller {
        /// Also write logs to this file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Write logs to the default log file
        #[arg(long)]
        log: bool,
    },
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// Validate a manifest without storing it
    Lint { file: PathBuf },
    /// Store a workflow template
    Create { file: PathBuf },
    List,
    Get { name: String },
    Delete { name: String },
}

#[derive(Subcommand)]
enum CronCommand {
    /// Store a cron workflow
    Create { file: PathBuf },
    List,
    Get { name: String },
    Delete { name: String },
    /// Stop firing new workflows
    Suspend { name: String },
    /// Start firing again from now on
    Resume { name: String },
}

#[derive(Subcommand)]
enum ArchiveCommand {
    List {
        /// Only names starting with this prefix
        #[arg(long)]
        prefix: Option<String>,

        /// Label selector, key=value[,key=value]
        #[arg(short = 'l', long)]
        selector: Option<String>,
    },
    Get { uid: String },
    Delete { uid: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match cli.command {
        Commands::Controller { ref log_file, log } => match log_file {
            Some(path) => Some(path.clone()),
            None if log => Some(logging::default_log_path()?),
            None => None,
        },
        _ => None,
    };
    logging::init_logging(&LogOptions {
        debug: cli.debug,
        quiet: cli.quiet,
        json: cli.json_logs,
        file: log_file,
    })?;

    let project_dir = match cli.dir {
        Some(ref dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let config = EngineConfig::load(Some(&project_dir))?;
    let engine = Engine::open(&config, &project_dir)?;

    let mode = if cli.quiet {
        cli::OutputMode::Quiet
    } else {
        cli::OutputMode::from_str(&cli.output)
    };
    let handler = cli::create_handler(mode);
    let handler = &*handler;

    let ns = cli
        .namespace
        .clone()
        .unwrap_or_else(|| config.defaults.namespace.clone());
    let ns_override = cli.namespace.as_deref();

    let code = match cli.command {
        Commands::Submit {
            file,
            from,
            entrypoint,
            parameters,
            timeout,
        } => {
            let token = CancellationToken::new();
            tokio::spawn(setup_signal_handlers(token.clone()));
            let args = SubmitArgs {
                file,
                from,
                entrypoint,
                parameters,
                namespace: cli.namespace.clone(),
                timeout: timeout.map(Duration::from_secs),
            };
            commands::submit(&engine, args, token, handler).await?
        }
        Commands::List { all_namespaces } => {
            let filter = if all_namespaces { None } else { Some(ns.as_str()) };
            commands::list_workflows(&engine, filter, handler).await?
        }
        Commands::Get { name } => commands::get_workflow(&engine, &ns, &name, handler).await?,
        Commands::Delete { name } => {
            commands::delete_workflow(&engine, &ns, &name, handler).await?
        }
        Commands::Terminate { name } => {
            commands::terminate_workflow(&engine, &ns, &name, handler).await?
        }

        Commands::Template { command } => match command {
            TemplateCommand::Lint { file } => commands::lint_manifest(&file, handler)?,
            TemplateCommand::Create { file } => {
                commands::create_template(&engine, &file, ns_override, handler).await?
            }
            TemplateCommand::List => {
                commands::list_templates(&engine, Some(&ns), handler).await?
            }
            TemplateCommand::Get { name } => {
                commands::get_template(&engine, &ns, &name, handler).await?
            }
            TemplateCommand::Delete { name } => {
                commands::delete_template(&engine, &ns, &name, handler).await?
            }
        },

        Commands::Cron { command } => match command {
            CronCommand::Create { file } => {
                commands::create_cron(&engine, &file, ns_override, handler).await?
            }
            CronCommand::List => commands::list_crons(&engine, Some(&ns), handler).await?,
            CronCommand::Get { name } => commands::get_cron(&engine, &ns, &name, handler).await?,
            CronCommand::Delete { name } => {
                commands::delete_cron(&engine, &ns, &name, handler).await?
            }
            CronCommand::Suspend { name } => {
                commands::set_cron_suspended(&engine, &ns, &name, true, handler).await?
            }
            CronCommand::Resume { name } => {
                commands::set_cron_suspended(&engine, &ns, &name, false, handler).await?
            }
        },

        Commands::Archive { command } => match command {
            ArchiveCommand::List { prefix, selector } => {
                let args = ArchiveListArgs {
                    namespace: Some(ns.clone()),
                    name_prefix: prefix,
                    selector,
                };
                commands::list_archived(&engine, &args, handler).await?
            }
            ArchiveCommand::Get { uid } => commands::get_archived(&engine, &uid, handler).await?,
            ArchiveCommand::Delete { uid } => {
                commands::delete_archived(&engine, &uid, handler).await?
            }
        },

        Commands::Controller { .. } => {
            let token = CancellationToken::new();
            tokio::spawn(setup_signal_handlers(token.clone()));
            commands::run_controller(&engine, token, handler).await?
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
