mod config;
mod control;
mod serve_cmd;
mod signature;
mod start_cmd;
mod status_cmd;

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use planbot_core::driver::{AssistantDriver, CallOptions, ClaudeDriver};
use planbot_core::queue::load_queue_file;
use planbot_store::{State, StateStore};

use start_cmd::RunFlags;

#[derive(Parser)]
#[command(name = "planbot", about = "Autonomous ticket-processing engine for coding assistants")]
struct Cli {
    /// Path to the queue file (YAML or JSON)
    #[arg(long, global = true, default_value = "planbot.yaml")]
    queue: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the operator config file with a generated webhook secret
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Parse and validate the queue file without running anything
    Validate,
    /// Process the queue
    Start {
        #[command(flatten)]
        flags: StartFlags,
    },
    /// Resume an interrupted run from persisted state
    Resume {
        #[command(flatten)]
        flags: StartFlags,
    },
    /// Process the queue with the webhook server attached
    Serve {
        #[command(flatten)]
        flags: StartFlags,
        /// Serve without a signing secret (not recommended)
        #[arg(long)]
        insecure: bool,
    },
    /// Show run state and ticket progress
    Status,
    /// List tickets in the queue file
    List,
    /// Show the execution log for a ticket
    Logs {
        /// Ticket id
        ticket_id: String,
    },
    /// Generate and print a plan for one ticket without executing it
    Plan {
        /// Ticket id
        ticket_id: String,
        /// Model override
        #[arg(long)]
        model: Option<String>,
    },
    /// Approve a pending plan via the running webhook server
    Approve {
        /// Plan id (shown in events and chat prompts)
        plan_id: String,
    },
    /// Reject a pending plan via the running webhook server
    Reject {
        /// Plan id
        plan_id: String,
        /// Feedback; with feedback the plan is revised, without it the
        /// ticket is skipped
        #[arg(long)]
        reason: Option<String>,
    },
    /// Answer a pending question via the running webhook server
    Respond {
        /// Question id
        question_id: String,
        /// The answer text
        answer: String,
    },
    /// Mark a ticket complete in the queue file so it is never processed
    Skip {
        /// Ticket id
        ticket_id: String,
    },
    /// Ask a running queue to pause after the current ticket
    Pause,
    /// Ask a running queue to stop (alias of pause for out-of-process use)
    Stop,
    /// Reset run state to idle, keeping plans/sessions/logs
    Reset,
    /// Delete all run state and per-ticket artifacts
    Clear,
    /// Generate shell completions
    Completions {
        /// Shell to generate for
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args, Debug, Default)]
struct StartFlags {
    /// Model passed to the driver
    #[arg(long)]
    model: Option<String>,
    /// Fallback model for rate-limit retries
    #[arg(long)]
    fallback_model: Option<String>,
    /// Approve plans without asking
    #[arg(long)]
    auto_approve: bool,
    /// Keep processing after a ticket fails
    #[arg(long)]
    continue_on_error: bool,
    /// Pass the dangerous permissions-bypass flag to the driver
    #[arg(long)]
    skip_permissions: bool,
    /// Required to combine --skip-permissions with --auto-approve
    #[arg(long)]
    acknowledge_autonomous_risk: bool,
    /// Execute directly without a planning phase
    #[arg(long)]
    no_plan: bool,
    /// Attach the Telegram provider from the operator config
    #[arg(long)]
    telegram: bool,
}

impl StartFlags {
    fn into_run_flags(self, serve: bool, insecure: bool, resume: bool) -> RunFlags {
        RunFlags {
            model: self.model,
            fallback_model: self.fallback_model,
            auto_approve: self.auto_approve,
            continue_on_error: self.continue_on_error,
            skip_permissions: self.skip_permissions,
            acknowledge_autonomous_risk: self.acknowledge_autonomous_risk,
            no_plan: self.no_plan,
            telegram: self.telegram,
            serve,
            insecure,
            resume,
        }
    }
}

fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let secret = config::generate_webhook_secret();
    let mut file = config::ConfigFile::default();
    file.webhook.secret = Some(secret.clone());
    let written = config::save_config(&file)?;

    println!("Config written to {}", written.display());
    println!("  webhook.port   = {}", file.webhook.port);
    println!("  webhook.secret = {}...{}", &secret[..8], &secret[56..]);
    println!();
    println!("Edit the file to add telegram credentials or a driver binary path.");
    Ok(())
}

async fn cmd_plan(queue_path: &PathBuf, ticket_id: &str, model: Option<String>) -> anyhow::Result<()> {
    let queue = load_queue_file(queue_path)?;
    let ticket = queue
        .tickets
        .iter()
        .find(|t| t.id == ticket_id)
        .with_context(|| format!("unknown ticket id {ticket_id:?}"))?;

    let operator = config::load_config()?;
    let driver = match &operator.driver.binary {
        Some(binary) => ClaudeDriver::with_binary(binary.clone()),
        None => ClaudeDriver::new(),
    };

    let model = model.or_else(|| queue.config.as_ref().and_then(|c| c.model.clone()));
    let prompt = format!(
        "Create a detailed implementation plan for the following ticket. \
         Do not make any changes yet; produce the plan only.\n\n\
         Ticket {}: {}\n\n{}\n",
        ticket.id, ticket.title, ticket.description
    );

    let result = driver
        .generate_plan(&prompt, &CallOptions { model, timeout: None, cwd: None }, None)
        .await;
    if !result.success {
        anyhow::bail!(
            "plan generation failed: {}",
            result.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    println!("{}", result.output.unwrap_or_default());
    Ok(())
}

fn queue_root(queue: &PathBuf) -> PathBuf {
    queue
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init { force } => cmd_init(force)?,
        Commands::Validate => {
            let queue = load_queue_file(&cli.queue)?;
            println!(
                "{} is valid: {} ticket(s).",
                cli.queue.display(),
                queue.tickets.len()
            );
        }
        Commands::Start { flags } => {
            let operator = config::load_config()?;
            start_cmd::run_start(&cli.queue, flags.into_run_flags(false, false, false), &operator)
                .await?;
        }
        Commands::Resume { flags } => {
            let operator = config::load_config()?;
            start_cmd::run_start(&cli.queue, flags.into_run_flags(false, false, true), &operator)
                .await?;
        }
        Commands::Serve { flags, insecure } => {
            let operator = config::load_config()?;
            start_cmd::run_start(&cli.queue, flags.into_run_flags(true, insecure, false), &operator)
                .await?;
        }
        Commands::Status => status_cmd::run_status(&cli.queue).await?,
        Commands::List => status_cmd::run_list(&cli.queue)?,
        Commands::Logs { ticket_id } => status_cmd::run_logs(&cli.queue, &ticket_id).await?,
        Commands::Plan { ticket_id, model } => cmd_plan(&cli.queue, &ticket_id, model).await?,
        Commands::Approve { plan_id } => {
            let operator = config::load_config()?;
            control::approve(&operator, &plan_id).await?;
        }
        Commands::Reject { plan_id, reason } => {
            let operator = config::load_config()?;
            control::reject(&operator, &plan_id, reason.as_deref()).await?;
        }
        Commands::Respond { question_id, answer } => {
            let operator = config::load_config()?;
            control::respond(&operator, &question_id, &answer).await?;
        }
        Commands::Skip { ticket_id } => {
            let store = StateStore::new(queue_root(&cli.queue));
            store.mark_ticket_complete(&cli.queue, &ticket_id).await?;
            println!("Ticket {ticket_id} marked complete; it will not be processed.");
        }
        Commands::Pause | Commands::Stop => {
            let store = StateStore::new(queue_root(&cli.queue));
            store.update(|s| s.pause_requested = true).await.context(
                "no run state found; the queue has not been started from this directory",
            )?;
            println!("Pause requested; the queue stops after the current ticket.");
        }
        Commands::Reset => {
            let store = StateStore::new(queue_root(&cli.queue));
            store.init().await?;
            store.save(&State::new()).await?;
            println!("Run state reset to idle.");
        }
        Commands::Clear => {
            let store = StateStore::new(queue_root(&cli.queue));
            store.clear().await?;
            println!("Run state and artifacts cleared.");
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
