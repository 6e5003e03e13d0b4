use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcprobe::agents::{self, AgentKind};
use mcprobe::config::{discover_config_file, CliOverrides, Component, FileConfig};
use mcprobe::conversation::ConversationOutcome;
use mcprobe::judgment::JudgmentResult;
use mcprobe::mcp::{McpConnection, McpServer};
use mcprobe::persistence::{ResultStorage, TestRunResult};
use mcprobe::providers::{create_provider, PROVIDER_NAMES};
use mcprobe::scenario::{LoadedScenario, ScenarioParser};
use mcprobe::{ConversationOrchestrator, LlmJudge, LlmSimulatedUser};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "mcprobe", version)]
#[command(about = "Conversational tests for tool-calling agents")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to mcprobe.yaml in the working directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scenarios against the configured agent
    Run(RunArgs),
    /// Parse and validate scenario files without running them
    Validate {
        /// Scenario file or directory
        path: PathBuf,
    },
    /// List the available LLM providers
    Providers,
    /// List the tools the configured MCP server exposes
    Tools,
}

#[derive(Args)]
struct RunArgs {
    /// Scenario file or directory
    path: PathBuf,

    /// Only run scenarios carrying one of these tags (repeatable)
    #[arg(long)]
    tag: Vec<String>,

    /// Wall-clock limit per scenario, in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Do not write results to disk
    #[arg(long)]
    no_save: bool,

    /// Where results are written
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Agent implementation to test (simple or tool)
    #[arg(long)]
    agent_type: Option<AgentKind>,

    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    base_url: Option<String>,

    #[arg(long)]
    api_key: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,
}

impl RunArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            provider: self.provider.clone(),
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            temperature: self.temperature,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Passed,
    Failed,
    Errored,
    Skipped,
}

#[derive(Default)]
struct Summary {
    passed: usize,
    failed: usize,
    errored: usize,
    skipped: usize,
}

impl Summary {
    fn record(&mut self, status: Status) {
        match status {
            Status::Passed => self.passed += 1,
            Status::Failed => self.failed += 1,
            Status::Errored => self.errored += 1,
            Status::Skipped => self.skipped += 1,
        }
    }

    fn all_passed(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info,mcprobe=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match &cli.command {
        Command::Run(args) => run(cli.config.as_deref(), args).await,
        Command::Validate { path } => validate(path),
        Command::Tools => list_tools(cli.config.as_deref()).await,
        Command::Providers => {
            for name in PROVIDER_NAMES {
                println!("{name}");
            }
            Ok(true)
        }
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("{} {error}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn validate(path: &Path) -> CliResult<bool> {
    let files = if path.is_dir() {
        ScenarioParser::discover_files(path)?
    } else {
        vec![path.to_path_buf()]
    };

    let mut all_valid = true;
    for file in &files {
        match ScenarioParser::parse_file(file) {
            Ok(scenario) => println!("{} {} ({})", "OK".green().bold(), scenario.name, file.display()),
            Err(error) => {
                all_valid = false;
                println!("{} {error}", "INVALID".red().bold());
            }
        }
    }
    println!("{} file(s) checked", files.len());
    Ok(all_valid)
}

/// The config file plus the directory its relative paths are resolved against.
fn load_config(config_path: Option<&Path>) -> CliResult<(FileConfig, PathBuf)> {
    let cwd = std::env::current_dir()?;
    match discover_config_file(config_path, &cwd)? {
        Some(path) => {
            debug!(path = %path.display(), "loaded config file");
            let base = path.parent().map_or_else(|| cwd.clone(), Path::to_path_buf);
            Ok((FileConfig::from_path(&path)?, base))
        }
        None => Ok((FileConfig::default(), cwd)),
    }
}

async fn list_tools(config_path: Option<&Path>) -> CliResult<bool> {
    let (config, _) = load_config(config_path)?;
    let section = config
        .mcp_server
        .as_ref()
        .ok_or("no `mcp_server` section in the config file")?;
    let server = McpServer::from_section(section)?;
    let connection = McpConnection::connect(&server).await?;

    let tools = connection.list_tools().await?;
    for tool in &tools {
        println!("{}", tool.name.bold());
        if let Some(description) = &tool.description {
            println!("    {}", description.dimmed());
        }
    }
    println!("{} tool(s) on {}", tools.len(), connection.target());
    Ok(true)
}

async fn run(config_path: Option<&Path>, args: &RunArgs) -> CliResult<bool> {
    let (config, base_dir) = load_config(config_path)?;

    let mut scenarios = ScenarioParser::load(&args.path)?;
    if !args.tag.is_empty() {
        scenarios.retain(|loaded| args.tag.iter().any(|tag| loaded.scenario.has_tag(tag)));
    }
    if scenarios.is_empty() {
        println!("No scenarios to run.");
        return Ok(true);
    }

    let storage = (!args.no_save && config.results.save).then(|| {
        let dir = args.results_dir.clone().unwrap_or_else(|| config.results.dir.clone());
        ResultStorage::new(if dir.is_relative() { base_dir.join(dir) } else { dir })
    });
    let timeout = match args.timeout.or(config.orchestrator.timeout_seconds) {
        Some(seconds) => Some(
            Duration::try_from_secs_f64(seconds)
                .map_err(|_| format!("invalid timeout: {seconds}"))?,
        ),
        None => None,
    };

    let mut summary = Summary::default();
    for loaded in &scenarios {
        let status = run_scenario(&config, &base_dir, args, loaded, timeout, storage.as_ref()).await;
        summary.record(status);
    }

    println!(
        "\n{} passed, {} failed, {} errors, {} skipped",
        summary.passed.to_string().green(),
        summary.failed.to_string().red(),
        summary.errored.to_string().yellow(),
        summary.skipped
    );
    Ok(summary.all_passed())
}

async fn run_scenario(
    config: &FileConfig,
    base_dir: &Path,
    args: &RunArgs,
    loaded: &LoadedScenario,
    timeout: Option<Duration>,
    storage: Option<&ResultStorage>,
) -> Status {
    let scenario = &loaded.scenario;
    if scenario.is_skipped() {
        let reason = scenario.skip_reason().unwrap_or("skipped");
        println!("{} {} ({reason})", "SKIP".dimmed(), scenario.name);
        return Status::Skipped;
    }

    let mut prepared = match build_orchestrator(config, base_dir, args, loaded).await {
        Ok(built) => built,
        Err(error) => {
            println!("{} {}: {error}", "ERROR".yellow().bold(), scenario.name);
            return Status::Errored;
        }
    };

    let run = prepared.orchestrator.run(scenario);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => {
                println!(
                    "{} {}: timed out after {:.1}s",
                    "ERROR".yellow().bold(),
                    scenario.name,
                    limit.as_secs_f64()
                );
                return Status::Errored;
            }
        },
        None => run.await,
    };

    let (outcome, judgment) = match result {
        Ok(pair) => pair,
        Err(error) => {
            println!("{} {}: {error}", "ERROR".yellow().bold(), scenario.name);
            return Status::Errored;
        }
    };

    report(&loaded.scenario.name, &outcome, &judgment);

    if let Some(storage) = storage {
        let record = prepared.record(loaded, outcome, judgment.clone());
        match storage.save(&record) {
            Ok(path) => debug!(path = %path.display(), "result saved"),
            Err(error) => warn!(error = %error, "failed to save result"),
        }
    }

    if judgment.passed {
        Status::Passed
    } else {
        Status::Failed
    }
}

/// An orchestrator plus what the run record needs to know about its collaborators.
struct Prepared {
    orchestrator: ConversationOrchestrator,
    agent_type: AgentKind,
    judge_model: String,
    user_model: String,
}

impl Prepared {
    fn record(
        &self,
        loaded: &LoadedScenario,
        outcome: ConversationOutcome,
        judgment: JudgmentResult,
    ) -> TestRunResult {
        let agent = self.orchestrator.agent();
        let mut record = TestRunResult::new(
            loaded.scenario.name.clone(),
            loaded.path.display().to_string(),
            outcome,
            judgment,
        );
        record.scenario_tags = loaded.scenario.tags.clone();
        record.agent_type = self.agent_type.to_string();
        record.judge_model = self.judge_model.clone();
        record.synthetic_user_model = self.user_model.clone();
        record.agent_model = agent.model().map(str::to_string);
        record.with_agent_config(agent.system_prompt().map(str::to_string), agent.available_tools())
    }
}

async fn build_orchestrator(
    config: &FileConfig,
    base_dir: &Path,
    args: &RunArgs,
    loaded: &LoadedScenario,
) -> CliResult<Prepared> {
    let scenario = &loaded.scenario;
    let overrides = args.overrides();

    let mut section = config.agent.clone();
    if let Some(kind) = args.agent_type {
        section.kind = kind;
    }
    let agent_llm = config.resolve_llm(Component::Agent, &overrides);
    let agent =
        agents::from_config(&section, config.mcp_server.as_ref(), &agent_llm, base_dir).await?;

    let user_llm = config
        .resolve_llm(Component::SyntheticUser, &overrides)
        .with_scenario_override(scenario.synthetic_user_override());
    let user = LlmSimulatedUser::new(
        create_provider(&user_llm)?,
        scenario.synthetic_user.clone(),
        &user_llm,
    )?;

    let judge_llm = config
        .resolve_llm(Component::Judge, &overrides)
        .with_scenario_override(scenario.judge_override());
    let judge = LlmJudge::new(create_provider(&judge_llm)?, &judge_llm);

    Ok(Prepared {
        orchestrator: ConversationOrchestrator::new(agent, Box::new(user), Box::new(judge)),
        agent_type: section.kind,
        judge_model: judge_llm.model,
        user_model: user_llm.model,
    })
}

fn report(name: &str, outcome: &ConversationOutcome, judgment: &JudgmentResult) {
    let label = if judgment.passed {
        "PASS".green().bold()
    } else {
        "FAIL".red().bold()
    };
    println!(
        "{label} {name} (score {:.2}, {} turns, {} tool calls, {})",
        judgment.score,
        outcome.agent_turns(),
        outcome.total_tool_calls().len(),
        outcome.termination_reason()
    );

    if judgment.passed {
        return;
    }
    for (criterion, met) in &judgment.correctness_results {
        if !met {
            println!("    {} {criterion}", "unmet:".red());
        }
    }
    for (condition, triggered) in &judgment.failure_results {
        if *triggered {
            println!("    {} {condition}", "triggered:".red());
        }
    }
    if !judgment.reasoning.is_empty() {
        println!("    {}", judgment.reasoning.dimmed());
    }
}
