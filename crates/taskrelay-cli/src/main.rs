//! taskrelay CLI
//!
//! Watches and edits shared boards from the terminal.
//!
//! Usage:
//!   taskrelay keygen
//!   taskrelay watch <board-id> [name]
//!   taskrelay add-task <board-id> <title>
//!   taskrelay delete-task <board-id> <task-id>

use std::sync::Arc;
use std::time::Duration;

use taskrelay_protocol::Identity;
use taskrelay_relay::RelayPool;
use taskrelay_sync::engine::{EngineOptions, PublishOptions, ScopeSubscription};
use taskrelay_sync::store::{self, FileStore, KeyValueStore};
use taskrelay_sync::{Board, BoardKind, Keyring, SyncConfig, SyncEngine, Task};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for relays to finish sending stored events.
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period for queued frames to reach the socket before exit.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

enum Command {
    Keygen,
    Watch { board_id: String, name: Option<String> },
    AddTask { board_id: String, title: String },
    DeleteTask { board_id: String, task_id: String },
}

fn print_usage() {
    eprintln!("taskrelay - Sync task boards over relays");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  taskrelay keygen                          Print a new identity");
    eprintln!("  taskrelay watch <board-id> [name]         Follow a shared board");
    eprintln!("  taskrelay add-task <board-id> <title>     Publish a new task");
    eprintln!("  taskrelay delete-task <board-id> <task>   Publish a task deletion");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  TASKRELAY_RELAYS        Comma-separated relay URLs");
    eprintln!("  TASKRELAY_DATA_DIR      Data directory (default: ./taskrelay-data)");
    eprintln!("  TASKRELAY_SECRET_KEY    Hex identity secret (default: stored/generated)");
    eprintln!("  TASKRELAY_ROOT_SECRET   Root secret shared by board members");
    eprintln!("  RUST_LOG                Log filter");
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let command = args.get(1).map(String::as_str).ok_or("missing command")?;
    let arg = |i: usize, what: &str| {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires a {} argument", command, what))
    };
    match command {
        "keygen" => Ok(Command::Keygen),
        "watch" => Ok(Command::Watch {
            board_id: arg(2, "board-id")?,
            name: args.get(3).cloned(),
        }),
        "add-task" => {
            let board_id = arg(2, "board-id")?;
            let title = args.get(3..).unwrap_or_default().join(" ");
            if title.trim().is_empty() {
                return Err("add-task requires a title argument".to_string());
            }
            Ok(Command::AddTask { board_id, title })
        }
        "delete-task" => Ok(Command::DeleteTask {
            board_id: arg(2, "board-id")?,
            task_id: arg(3, "task-id")?,
        }),
        other => Err(format!("unknown command: {}", other)),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskrelay_cli=info,taskrelay_sync=info,taskrelay_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if matches!(args.get(1).map(String::as_str), Some("-h" | "--help" | "help")) {
        print_usage();
        return;
    }
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command) -> CliResult<()> {
    let client = match command {
        Command::Keygen => {
            let identity = Identity::generate();
            println!("public key: {}", identity.public_key());
            println!("secret key: {}", identity.secret_hex());
            return Ok(());
        }
        _ => {
            // wss:// relays need a process-wide TLS provider.
            let _ = rustls::crypto::ring::default_provider().install_default();
            let config = SyncConfig::from_env()?;
            let store = FileStore::open(&config.data_dir)?;
            Client::open(&config, store)?
        }
    };

    match command {
        Command::Keygen => Ok(()),
        Command::Watch { board_id, name } => client.watch(&board_id, name).await,
        Command::AddTask { board_id, title } => client.add_task(&board_id, &title).await,
        Command::DeleteTask { board_id, task_id } => client.delete_task(&board_id, &task_id).await,
    }
}

struct Client {
    engine: SyncEngine,
    pool: RelayPool,
    store: FileStore,
}

impl Client {
    fn open(config: &SyncConfig, store: FileStore) -> CliResult<Self> {
        let identity = store::load_or_create_identity(&store, config.secret_key.as_deref())?;

        let root_secret = if config.root_secret.is_empty() {
            store::load_root_secret(&store)?.unwrap_or_default()
        } else {
            store::save_root_secret(&store, &config.root_secret)?;
            config.root_secret.clone()
        };

        let relays = match store::load_relays(&store)? {
            Some(saved) if std::env::var_os("TASKRELAY_RELAYS").is_none() => saved,
            _ => config.relays.clone(),
        };
        store::save_relays(&store, &relays)?;

        let pool = RelayPool::new(config.relay_config());
        let options = EngineOptions {
            default_relays: relays,
            ..EngineOptions::from(config)
        };
        let engine = SyncEngine::new(
            identity,
            Keyring::new(root_secret.into_bytes()),
            Arc::new(pool.clone()),
            options,
        );
        let (boards, tasks) = engine.load_snapshot(&store)?;
        tracing::debug!("Restored {} boards and {} tasks", boards, tasks);
        tracing::info!("Using identity {}", engine.identity().public_key());

        Ok(Self {
            engine,
            pool,
            store,
        })
    }

    /// Local board bound to the shared id, created if missing.
    fn ensure_board(&self, board_id: &str, name: Option<String>) -> Board {
        if let Some(board) = self
            .engine
            .boards()
            .into_iter()
            .find(|b| b.shared_id() == Some(board_id))
        {
            return board;
        }
        let board = Board::new(
            board_id,
            name.unwrap_or_else(|| board_id.to_string()),
            BoardKind::Week,
        )
        .shared(board_id, Vec::new());
        self.engine.upsert_board(board.clone());
        board
    }

    /// Subscribe and process deliveries until the first EOSE or timeout.
    async fn sync(&self, board: &Board) -> CliResult<ScopeSubscription> {
        let mut subscription = self.engine.subscribe_board(&self.pool, &board.id)?;
        let synced = tokio::time::timeout(SYNC_TIMEOUT, async {
            while !self.engine.is_synced(&board.id) {
                if !subscription.process_next().await {
                    break;
                }
            }
        })
        .await;
        if synced.is_err() {
            tracing::warn!("Relays did not finish syncing board {} in time", board.id);
        }
        Ok(subscription)
    }

    async fn watch(self, board_id: &str, name: Option<String>) -> CliResult<()> {
        let board = self.ensure_board(board_id, name);
        let mut subscription = self.sync(&board).await?;
        let mut shown = self.engine.tasks_for_board(&board.id);
        print_board(&self.engine, &board.id);

        loop {
            tokio::select! {
                more = subscription.process_next() => {
                    if !more {
                        break;
                    }
                    let current = self.engine.tasks_for_board(&board.id);
                    if current != shown {
                        print_board(&self.engine, &board.id);
                        shown = current;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        subscription.unsubscribe();
        self.finish().await
    }

    async fn add_task(self, board_id: &str, title: &str) -> CliResult<()> {
        let board = self.ensure_board(board_id, None);
        let _subscription = self.sync(&board).await?;

        let mut task = Task::new(board.id.clone(), title);
        task.created_by = Some(self.engine.identity().public_key().to_string());
        task.column = self
            .engine
            .board(&board.id)
            .and_then(|b| b.column_ids().into_iter().next());

        // The CLI never owns a board's shape, so it never publishes metadata.
        let options = PublishOptions {
            skip_board_metadata: true,
        };
        if let Some(handle) = self.engine.maybe_publish_task(&task, None, options)? {
            let event = handle.wait().await?;
            println!("{}", task.id);
            tracing::info!("Published task {} as event {}", task.id, event.id);
        }
        self.finish().await
    }

    async fn delete_task(self, board_id: &str, task_id: &str) -> CliResult<()> {
        let board = self.ensure_board(board_id, None);
        let _subscription = self.sync(&board).await?;

        let task = self
            .engine
            .task(task_id)
            .unwrap_or_else(|| Task::with_id(task_id, board.id.clone(), "", 0));
        if let Some(handle) = self.engine.publish_task_deleted(&task)? {
            handle.wait().await?;
            println!("deleted {}", task_id);
        }
        self.finish().await
    }

    async fn finish(self) -> CliResult<()> {
        tokio::time::sleep(FLUSH_GRACE).await;
        self.engine.save_snapshot(&self.store as &dyn KeyValueStore)?;
        self.pool.shutdown();
        Ok(())
    }
}

fn print_board(engine: &SyncEngine, board_id: &str) {
    let Some(board) = engine.board(board_id) else {
        return;
    };
    println!();
    println!("== {} ==", board.name);
    let tasks = engine.tasks_for_board(board_id);
    if tasks.is_empty() {
        println!("(no tasks)");
    }
    for task in tasks {
        let mark = if task.completed { "x" } else { " " };
        let column = task.column.as_deref().unwrap_or("-");
        println!("[{}] {:<40} {:<8} {}", mark, task.title, column, task.id);
    }
}
