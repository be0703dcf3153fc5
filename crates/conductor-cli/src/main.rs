use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_core::{
    AgentService, AnthropicProvider, HostCommand, InMemoryTraceStore, ProactiveRunner, Progress,
    ProgressKind, Reply, SendOptions, Session, TraceNode, TracePersistence, TraceRecorder,
};
use conductor_store::SqliteTraceStore;

mod config;

use config::{ConductorConfig, TraceBackend, shellexpand};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version)]
#[command(about = "Conductor - route requests across a roster of agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// Send a message; the router picks the agent unless one is forced
    Ask {
        /// The message to send
        message: String,

        /// Skip routing and run this agent directly
        #[arg(short, long)]
        agent: Option<String>,

        /// Conversation id (a fresh one is generated when omitted)
        #[arg(long)]
        conversation: Option<String>,

        /// User the request is attributed to in traces
        #[arg(long)]
        user: Option<String>,
    },

    /// Interactive session; keeps scheduled and event-triggered tasks running
    Chat {
        /// Conversation id (a fresh one is generated when omitted)
        #[arg(long)]
        conversation: Option<String>,

        /// User the requests are attributed to in traces
        #[arg(long)]
        user: Option<String>,
    },

    /// List the agent roster
    Agents,

    /// Print every trace node recorded for a swarm
    Trace {
        /// Swarm id (the root trace id)
        swarm_id: String,
    },
}

/// `RUST_LOG` wins when set; otherwise `--debug` picks the level
fn log_filter(debug: bool, rust_log: Option<&str>) -> EnvFilter {
    let level = if debug { "debug" } else { "info" };
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so replies can be piped
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.debug, rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Ask {
            message,
            agent,
            conversation,
            user,
        } => cmd_ask(&cli.config, &message, agent, conversation, user).await,
        Commands::Chat { conversation, user } => cmd_chat(&cli.config, conversation, user).await,
        Commands::Agents => cmd_agents(&cli.config).await,
        Commands::Trace { swarm_id } => cmd_trace(&cli.config, &swarm_id).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Conductor initialized at {}", config_dir.display());
    println!("Edit {} to configure your API key and agents.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ConductorConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

async fn cmd_agents(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ConductorConfig::load(config_path)?;
    for profile in cfg.roster() {
        let mode = if profile.autonomous { "autonomous" } else { "tools" };
        println!(
            "{:<14} {:<11} {:<10} {}",
            profile.id, profile.category, mode, profile.description
        );
    }
    Ok(())
}

async fn open_traces(cfg: &ConductorConfig) -> Result<Arc<dyn TracePersistence>> {
    match cfg.trace.backend {
        TraceBackend::Memory => Ok(Arc::new(InMemoryTraceStore::new())),
        TraceBackend::Sqlite => {
            let db_path = shellexpand(&cfg.trace.db_path);
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let store = SqliteTraceStore::new(&db_path)
                .with_context(|| format!("Failed to open trace db at {}", db_path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

/// Service plus the host loop that serves its shared tools
struct Host {
    service: Arc<AgentService>,
    runner: ProactiveRunner,
}

async fn start_host(cfg: &ConductorConfig) -> Result<Host> {
    let provider = Arc::new(AnthropicProvider::new(
        cfg.provider.api_key.clone(),
        cfg.provider.model.clone(),
        cfg.provider.base_url.clone(),
        cfg.provider.max_tokens,
    ));
    let traces = open_traces(cfg).await?;

    let (host_tx, mut host_rx) = mpsc::channel::<HostCommand>(32);
    let service = Arc::new(
        AgentService::builder(provider)
            .with_profiles(cfg.roster())
            .with_traces(TraceRecorder::new(traces))
            .with_host(host_tx)
            .with_router_config(cfg.router.clone())
            .with_executor_config(cfg.executor.clone())
            .with_loop_config(cfg.agent_loop.clone())
            .build(),
    );

    let (runner, mut outcomes) = ProactiveRunner::new(service.clone());

    // Schedules and subscriptions go to the runner; the rest has no UI here
    {
        let runner = runner.clone();
        tokio::spawn(async move {
            while let Some(command) = host_rx.recv().await {
                let Some(other) = runner.handle(command).await else {
                    continue;
                };
                match serde_json::to_string(&other) {
                    Ok(json) => info!("Host command: {}", json),
                    Err(e) => warn!("Unserializable host command {:?}: {}", other, e),
                }
            }
        });
    }

    tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            match outcome.result {
                Ok(response) => println!(
                    "\n[task {} · {}] {}",
                    outcome.task_id, outcome.agent_id, response.text
                ),
                Err(e) => eprintln!(
                    "\n[task {} · {}] failed: {}",
                    outcome.task_id, outcome.agent_id, e
                ),
            }
        }
    });

    Ok(Host { service, runner })
}

fn progress_printer() -> (Progress, tokio::task::JoinHandle<()>) {
    let (progress, mut progress_rx) = Progress::channel();
    let printer = tokio::spawn(async move {
        let mut streaming = false;
        while let Some(event) = progress_rx.recv().await {
            match event.kind {
                ProgressKind::Token => {
                    eprint!("{}", event.content);
                    streaming = true;
                }
                ProgressKind::Thought => {
                    if std::mem::take(&mut streaming) {
                        eprintln!();
                    }
                    eprintln!("· {}", event.content);
                }
                ProgressKind::Tool => {
                    if std::mem::take(&mut streaming) {
                        eprintln!();
                    }
                    let name = event.tool_name.as_deref().unwrap_or("tool");
                    eprintln!("→ {}: {}", name, event.content);
                }
            }
        }
        if streaming {
            eprintln!();
        }
    });
    (progress, printer)
}

async fn register_conversation(
    service: &AgentService,
    conversation: Option<String>,
    user: Option<String>,
) -> String {
    let conversation_id = conversation.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut session = Session::new(&conversation_id);
    if let Some(user) = user {
        session = session.with_user(user);
    }
    service.register_session(session).await;
    conversation_id
}

/// Send one message with live progress; Ctrl-C cancels the request
async fn send_with_progress(
    service: &AgentService,
    conversation_id: &str,
    message: &str,
    agent: Option<String>,
) -> Result<Reply> {
    let (progress, printer) = progress_printer();
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling request");
                cancel.cancel();
            }
        })
    };

    let mut options = SendOptions::new().with_progress(progress).with_cancel(cancel);
    if let Some(agent) = agent {
        options = options.with_agent(agent);
    }

    let result = service.send_message(conversation_id, message, options).await;
    ctrl_c.abort();
    // The progress sender went out with the options, so the printer drains
    let _ = printer.await;
    result
}

fn print_reply(reply: &Reply, conversation_id: &str) {
    println!("{}", reply.text);
    eprintln!(
        "[agent: {} | conversation: {} | trace: {}]",
        reply.agent_id,
        conversation_id,
        reply.trace_id.as_deref().unwrap_or("none")
    );
}

async fn cmd_ask(
    config_path: &Option<PathBuf>,
    message: &str,
    agent: Option<String>,
    conversation: Option<String>,
    user: Option<String>,
) -> Result<()> {
    let cfg = ConductorConfig::load(config_path)?;
    let host = start_host(&cfg).await?;
    let conversation_id = register_conversation(&host.service, conversation, user).await;

    let reply = send_with_progress(&host.service, &conversation_id, message, agent).await?;
    print_reply(&reply, &conversation_id);

    let pending = host.runner.pending_count().await;
    if pending > 0 {
        warn!(
            "{} scheduled task(s) will not run after exit; use `conductor chat` to keep them alive",
            pending
        );
    }
    host.runner.shutdown().await;
    Ok(())
}

async fn cmd_chat(
    config_path: &Option<PathBuf>,
    conversation: Option<String>,
    user: Option<String>,
) -> Result<()> {
    let cfg = ConductorConfig::load(config_path)?;
    let host = start_host(&cfg).await?;
    let conversation_id = register_conversation(&host.service, conversation, user).await;

    eprintln!("Conversation {}.", conversation_id);
    eprintln!("Commands: /agent <id> <message>, /emit <event> [json], /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match ChatInput::parse(line) {
            ChatInput::Quit => break,
            ChatInput::Emit { event, data } => {
                let fired = host.runner.emit(&event, data).await;
                eprintln!("[event {} triggered {} subscription(s)]", event, fired);
            }
            ChatInput::Message { agent, text } => {
                match send_with_progress(&host.service, &conversation_id, &text, agent).await {
                    Ok(reply) => print_reply(&reply, &conversation_id),
                    Err(e) => eprintln!("Error: {:#}", e),
                }
            }
        }
    }

    host.runner.shutdown().await;
    Ok(())
}

/// One line of chat input
#[derive(Debug, PartialEq)]
enum ChatInput {
    Quit,
    Emit { event: String, data: serde_json::Value },
    Message { agent: Option<String>, text: String },
}

impl ChatInput {
    fn parse(line: &str) -> Self {
        if line == "/quit" || line == "/exit" {
            return Self::Quit;
        }
        if let Some(rest) = line.strip_prefix("/emit ") {
            let (event, raw) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            let data = if raw.trim().is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(raw.trim())
                    .unwrap_or_else(|_| serde_json::Value::String(raw.trim().to_string()))
            };
            return Self::Emit {
                event: event.to_string(),
                data,
            };
        }
        if let Some(rest) = line.strip_prefix("/agent ") {
            if let Some((agent, text)) = rest.trim().split_once(' ') {
                return Self::Message {
                    agent: Some(agent.to_string()),
                    text: text.trim().to_string(),
                };
            }
        }
        Self::Message {
            agent: None,
            text: line.to_string(),
        }
    }
}

async fn cmd_trace(config_path: &Option<PathBuf>, swarm_id: &str) -> Result<()> {
    let cfg = ConductorConfig::load(config_path)?;
    let traces = open_traces(&cfg).await?;
    let nodes = traces.list_swarm(swarm_id).await?;
    if nodes.is_empty() {
        println!("No traces recorded for swarm {}", swarm_id);
        return Ok(());
    }

    let mut children: HashMap<Option<&str>, Vec<&TraceNode>> = HashMap::new();
    for node in &nodes {
        children.entry(node.parent_id.as_deref()).or_default().push(node);
    }
    // Nodes whose parent is outside the listing are printed as roots
    let roots: Vec<&TraceNode> = nodes
        .iter()
        .filter(|n| {
            n.parent_id
                .as_deref()
                .is_none_or(|p| !nodes.iter().any(|other| other.id == p))
        })
        .collect();
    for root in roots {
        print_node(root, &children, 0);
    }
    Ok(())
}

fn print_node(node: &TraceNode, children: &HashMap<Option<&str>, Vec<&TraceNode>>, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{}{} [{}] {} ({} steps, {} in / {} out tokens, ${:.4})",
        indent,
        node.agent_id,
        node.status,
        node.id,
        node.steps.len(),
        node.usage.prompt_tokens,
        node.usage.completion_tokens,
        node.usage.cost
    );
    if let Some(error) = &node.error {
        println!("{}  error: {}", indent, error);
    }
    if let Some(kids) = children.get(&Some(node.id.as_str())) {
        for child in kids {
            print_node(child, children, depth + 1);
        }
    }
}
