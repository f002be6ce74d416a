mod config;
mod credentials;
mod db;
mod error;
mod github;
mod migrations;
mod model;
mod notify;
mod refresh;
mod repo_ref;
mod rest;
mod review;
mod schedule;
mod session;

use crate::config::{Config, TransportKind, load_config};
use crate::credentials::{CredentialStore, Token, TokenPrompt};
use crate::db::{db_path, open_db};
use crate::error::SyncError;
use crate::github::GitHubClient;
use crate::model::PullRequestRecord;
use crate::refresh::{FetchReport, SearchScope, dedup_scopes, load_sorted};
use crate::schedule::{RefreshSchedule, SchedulerHandle, SyncEvent, describe, load_schedule, store_schedule};
use crate::session::{Session, Transport};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use env_logger::{Builder, Env};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

const LOG_FILTER: &str = "PRWATCH_LOG";
const LOG_STYLE: &str = "PRWATCH_LOG_STYLE";

#[derive(Parser, Debug, Clone)]
#[command(name = "prwatch", version, about = "Local cache of the GitHub PRs waiting on you")]
struct CliArgs {
    /// SQLite cache location (default: the platform data dir).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// API used for fetching (overrides `transport` in config).
    #[arg(long, global = true, value_enum)]
    transport: Option<TransportKind>,

    /// Search scopes (repeatable or comma-delimited; overrides `scopes` in config).
    #[arg(long, global = true, value_enum, value_delimiter = ',')]
    scope: Vec<SearchScope>,

    /// Disable OS desktop notifications.
    #[arg(long, global = true)]
    no_notifications: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Print the cached pull requests, most recently updated first (default).
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Fetch once and report what changed.
    Sync,
    /// Stay in the foreground and refresh on the schedule.
    ///
    /// Reads commands from stdin: `schedule <value>`, `refresh`, `list`, `status`, `quit`.
    Watch,
    /// Show the refresh schedule, or set it (`off`, `30s`, `5m`, `300000`, `*/10 * * * *`).
    Schedule { value: Option<String> },
    /// Manage the stored GitHub token.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Run pending migrations of the stored settings.
    Migrate,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum TokenAction {
    /// Prompt for a token and store it.
    Set,
    /// Remove the stored token.
    Clear,
    /// Report where the token would come from.
    Status,
}

/// One buffered reader over the input, shared by the token prompt and `watch`
/// so lines typed ahead are not lost between them.
struct LinePrompt<R> {
    lines: tokio::sync::Mutex<Lines<R>>,
}

type StdinPrompt = LinePrompt<BufReader<Stdin>>;

impl<R: AsyncBufRead + Unpin> LinePrompt<R> {
    fn new(reader: R) -> Self {
        Self {
            lines: tokio::sync::Mutex::new(reader.lines()),
        }
    }

    /// `None` on EOF or a read error.
    async fn next_line(&self) -> Option<String> {
        self.lines.lock().await.next_line().await.ok().flatten()
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> TokenPrompt for LinePrompt<R> {
    /// An empty line or EOF gives up.
    async fn request_token(&self, attempt: u32, rejection: Option<&str>) -> Option<String> {
        if let Some(reason) = rejection {
            eprintln!("Token rejected: {reason}");
        }
        if attempt == 1 {
            eprintln!("Create a token at https://github.com/settings/tokens (scope: repo).");
        }
        eprint!("GitHub token (empty to cancel): ");
        let line = self.next_line().await?;
        let line = line.trim();
        if line.is_empty() { None } else { Some(line.to_string()) }
    }
}

fn init_logging() {
    let env = Env::new().filter_or(LOG_FILTER, "warn").write_style(LOG_STYLE);
    Builder::from_env(env).init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_logging();
    let args = CliArgs::parse();
    let config = load_config();

    if let Err(e) = run(args, config).await {
        eprintln!("{e}");
        if e.is_authentication() {
            eprintln!("Run `prwatch token set` to store a new token.");
        }
        std::process::exit(1);
    }
}

async fn run(args: CliArgs, config: Config) -> Result<(), SyncError> {
    let path = match &args.db {
        Some(p) => p.clone(),
        None => db_path()?,
    };
    let input = LinePrompt::new(BufReader::new(tokio::io::stdin()));
    let mut conn = open_db(&path)?;
    let from_version = migrations::stored_version(&conn)?;
    if migrations::is_migration_available(&conn)? {
        migrations::run_migrations(&mut conn)?;
    }

    match args.command.clone().unwrap_or(Command::List { json: false }) {
        Command::List { json } => print_list(&load_sorted(&conn)?, json),
        Command::Schedule { value: None } => {
            let schedule = load_schedule(&conn)?.unwrap_or_else(|| config.default_schedule());
            println!("{}", describe(&schedule));
            Ok(())
        }
        Command::Schedule { value: Some(value) } => {
            let schedule: RefreshSchedule = value.parse()?;
            store_schedule(&conn, &schedule)?;
            println!("Refresh schedule set: {}", describe(&schedule));
            Ok(())
        }
        Command::Migrate => {
            let version = migrations::stored_version(&conn)?;
            if version == from_version {
                println!("Nothing to migrate (version {version}).");
            } else {
                println!("Migrated stored settings from version {from_version} to {version}.");
            }
            Ok(())
        }
        Command::Token { action } => run_token(conn, &config, action, &input).await,
        Command::Sync => {
            let notifications = notifications_enabled(&args, &config);
            let session = open_session(conn, &args, &config, &input).await?;
            let report = session.fetch_all().await?;
            print_report(&report);
            if notifications {
                notify::notify_new_review_requests(&report.added);
            }
            Ok(())
        }
        Command::Watch => {
            let notifications = notifications_enabled(&args, &config);
            let session = Arc::new(open_session(conn, &args, &config, &input).await?);
            watch(session, &config, notifications, &input).await
        }
    }
}

fn notifications_enabled(args: &CliArgs, config: &Config) -> bool {
    !(args.no_notifications || config.no_notifications.unwrap_or(false))
}

async fn resolve_token(
    conn: &Mutex<Connection>,
    config: &Config,
    input: &StdinPrompt,
) -> Result<Token, SyncError> {
    let store = CredentialStore::new(conn, config.max_token_attempts());
    store.get_or_prompt(input).await
}

async fn open_session(
    conn: Connection,
    args: &CliArgs,
    config: &Config,
    input: &StdinPrompt,
) -> Result<Session, SyncError> {
    let conn = Mutex::new(conn);
    let token = resolve_token(&conn, config, input).await?;
    let client = Arc::new(GitHubClient::new(&token)?);
    let transport = match args.transport.or(config.transport).unwrap_or_default() {
        TransportKind::Graphql => Transport::GraphQl(client),
        TransportKind::Rest => Transport::Rest(client),
    };

    let mut options = config.fetch_options();
    if !args.scope.is_empty() {
        options.scopes = dedup_scopes(args.scope.clone());
    }
    let conn = conn.into_inner().unwrap_or_else(|p| p.into_inner());
    Ok(Session::new(conn, transport, options))
}

async fn run_token(
    conn: Connection,
    config: &Config,
    action: TokenAction,
    input: &StdinPrompt,
) -> Result<(), SyncError> {
    let conn = Mutex::new(conn);
    let store = CredentialStore::new(&conn, config.max_token_attempts()).without_env();
    match action {
        TokenAction::Set => {
            store.clear()?;
            store.get_or_prompt(input).await?;
            println!("Token stored.");
        }
        TokenAction::Clear => {
            store.clear()?;
            println!("Stored token removed.");
        }
        TokenAction::Status => {
            let from_env = credentials::env_token(std::env::var("GITHUB_TOKEN").ok().as_deref());
            if from_env.is_some() {
                println!("Using GITHUB_TOKEN from the environment.");
            } else if store.stored()?.is_some() {
                println!("Using the stored token.");
            } else {
                println!("No token; you will be prompted on the next sync.");
            }
        }
    }
    Ok(())
}

fn print_list(prs: &[PullRequestRecord], json: bool) -> Result<(), SyncError> {
    if json {
        println!("{}", serde_json::to_string_pretty(prs)?);
        return Ok(());
    }
    if prs.is_empty() {
        println!("No cached pull requests. Run `prwatch sync` first.");
        return Ok(());
    }
    let repo_width = prs.iter().map(|p| p.key.len()).max().unwrap_or(0);
    for pr in prs {
        let draft = if pr.draft { " [draft]" } else { "" };
        println!(
            "{:<17} {:<repo_width$}  {}{}",
            pr.review_status.as_str(),
            pr.key,
            pr.title,
            draft
        );
    }
    Ok(())
}

fn print_report(report: &FetchReport) {
    println!(
        "{} open pull requests ({} new, {} gone) in {:.1?}",
        report.total,
        report.added.len(),
        report.removed.len(),
        report.duration
    );
    for pr in &report.added {
        println!("  + {} {}", pr.key, pr.title);
    }
    for key in &report.removed {
        println!("  - {key}");
    }
}

fn report_event(event: SyncEvent, notifications: bool) {
    match event {
        SyncEvent::Completed(report) => {
            print_report(&report);
            if notifications {
                notify::notify_new_review_requests(&report.added);
            }
        }
        SyncEvent::Skipped => {}
        SyncEvent::Failed(e) => {
            eprintln!("Refresh failed: {e}");
            if e.is_authentication() {
                eprintln!("Run `prwatch token set` to store a new token.");
            }
        }
    }
}

async fn watch(
    session: Arc<Session>,
    config: &Config,
    notifications: bool,
    input: &StdinPrompt,
) -> Result<(), SyncError> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let handle = session.start(config.default_schedule(), Some(events_tx)).await?;
    let schedule = handle.current().await;
    if schedule.is_disabled() {
        println!("Watching; automatic refresh is off. Type `refresh` to fetch or `quit` to stop.");
    } else {
        println!("Watching; refresh {}. Type `quit` to stop.", describe(&schedule));
    }

    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events_rx.recv() => match event {
                Some(event) => report_event(event, notifications),
                None => break,
            },
            line = input.next_line(), if stdin_open => match line {
                Some(line) => {
                    if !watch_command(line.trim(), &session, &handle).await {
                        break;
                    }
                }
                // No terminal attached; keep refreshing until interrupted.
                None => stdin_open = false,
            },
        }
    }

    handle.stop().await?;
    Ok(())
}

/// Returns false when the user asked to quit.
async fn watch_command(line: &str, session: &Session, handle: &SchedulerHandle) -> bool {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let result = match cmd {
        "" => Ok(()),
        "quit" | "exit" => return false,
        "refresh" => handle.trigger().await,
        "list" => session.get_pull_requests().and_then(|prs| print_list(&prs, false)),
        "status" => {
            let state = if session.is_loading() { "fetching" } else { "idle" };
            println!("{state}; refresh {}", describe(&handle.current().await));
            Ok(())
        }
        "schedule" | "interval" => match rest.trim().parse::<RefreshSchedule>() {
            Ok(schedule) => {
                let set = handle.set_schedule(schedule.clone()).await;
                if set.is_ok() {
                    println!("Refresh schedule set: {}", describe(&schedule));
                }
                set
            }
            Err(e) => Err(e),
        },
        other => {
            eprintln!("Unknown command `{other}`; try schedule, refresh, list, status or quit.");
            Ok(())
        }
    };
    if let Err(e) = result {
        eprintln!("{e}");
    }
    true
}
