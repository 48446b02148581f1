use std::process::ExitCode;

use clap::{Parser, Subcommand};

use orchard::commands::agent::{
    LoopCommand, NoteCommand, SpawnCmd, SpawnDiffArgs, SpawnMergeArgs, SpawnRejectArgs, SpawnStatusArgs,
    SpawnWaitCmd, StatusArgs, WorktreeCommand,
};
use orchard::commands::attach::AttachArgs;
use orchard::commands::daemon::DaemonArgs;
use orchard::commands::init::{InitArgs, SchemaArgs};
use orchard::commands::run::RunArgs;
use orchard::commands::sessions::{CancelArgs, SessionsCommand};
use orchard::commands::store::{DocArgs, IssueArgs, LogArgs, PlanArgs};
use orchard::error::kind_of;
use orchard::paths::Paths;
use orchard::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "orchard",
    version,
    about = "Detachable sessions and bounded delegation for coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a session for a loop or a profile
    Run(RunArgs),
    /// List and inspect sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Follow a running session's events
    Attach(AttachArgs),
    /// Cancel a running session
    Cancel(CancelArgs),
    /// Write a starter profiles file
    Init(InitArgs),
    /// Print the JSON Schema for the profiles file
    Schema(SchemaArgs),

    /// Show the calling session (in-agent)
    Status(StatusArgs),
    /// Plans for the project (in-agent)
    Plan(PlanArgs),
    /// Issues for the project (in-agent)
    Issue(IssueArgs),
    /// Session logs for the project (in-agent)
    Log(LogArgs),
    /// Documents for the project (in-agent)
    Doc(DocArgs),
    /// Start a child session (in-agent)
    Spawn(SpawnCmd),
    /// Show child sessions (in-agent)
    SpawnStatus(SpawnStatusArgs),
    /// Wait for a child session to end (in-agent)
    SpawnWait(SpawnWaitCmd),
    /// Show what a child changed (in-agent)
    SpawnDiff(SpawnDiffArgs),
    /// Merge a child's worktree into this one (in-agent)
    SpawnMerge(SpawnMergeArgs),
    /// Discard a child's worktree (in-agent)
    SpawnReject(SpawnRejectArgs),
    /// Session notes (in-agent)
    Note {
        #[command(subcommand)]
        command: NoteCommand,
    },
    /// Child worktrees (in-agent)
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommand,
    },
    /// Loop controls (in-agent)
    Loop {
        #[command(subcommand)]
        command: LoopCommand,
    },

    /// Run a session daemon in the foreground
    #[command(hide = true)]
    Daemon(DaemonArgs),
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Sessions { .. } => "sessions",
            Self::Attach(_) => "attach",
            Self::Cancel(_) => "cancel",
            Self::Init(_) => "init",
            Self::Schema(_) => "schema",
            Self::Status(_) => "status",
            Self::Plan(_) => "plan",
            Self::Issue(_) => "issue",
            Self::Log(_) => "log",
            Self::Doc(_) => "doc",
            Self::Spawn(_) => "spawn",
            Self::SpawnStatus(_) => "spawn-status",
            Self::SpawnWait(_) => "spawn-wait",
            Self::SpawnDiff(_) => "spawn-diff",
            Self::SpawnMerge(_) => "spawn-merge",
            Self::SpawnReject(_) => "spawn-reject",
            Self::Note { .. } => "note",
            Self::Worktree { .. } => "worktree",
            Self::Loop { .. } => "loop",
            Self::Daemon(_) => "daemon",
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if matches!(cli.command, Commands::Daemon(_)) { "info" } else { "warn" };
    let _telemetry = telemetry::init(default_level);

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = Paths::discover().and_then(|paths| match &cli.command {
        Commands::Run(args) => args.execute(&paths),
        Commands::Sessions { command } => command.execute(&paths),
        Commands::Attach(args) => args.execute(&paths),
        Commands::Cancel(args) => args.execute(&paths),
        Commands::Init(args) => args.execute(&paths),
        Commands::Schema(args) => args.execute(),
        Commands::Status(args) => args.execute(&paths),
        Commands::Plan(args) => args.execute(&paths),
        Commands::Issue(args) => args.execute(&paths),
        Commands::Log(args) => args.execute(&paths),
        Commands::Doc(args) => args.execute(&paths),
        Commands::Spawn(args) => args.execute(&paths),
        Commands::SpawnStatus(args) => args.execute(&paths),
        Commands::SpawnWait(args) => args.execute(&paths),
        Commands::SpawnDiff(args) => args.execute(&paths),
        Commands::SpawnMerge(args) => args.execute(&paths),
        Commands::SpawnReject(args) => args.execute(&paths),
        Commands::Note { command } => command.execute(&paths),
        Commands::Worktree { command } => command.execute(&paths),
        Commands::Loop { command } => command.execute(&paths),
        Commands::Daemon(args) => args.execute(&paths),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = kind_of(&e);
            tracing::debug!(kind = %kind, error = format!("{e:?}"), "command failed");
            eprintln!("error[{kind}]: {e:#}");
            ExitCode::from(kind.exit_code())
        }
    }
}
