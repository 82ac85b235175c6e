//! `tasklist`: personal task list synced through a live document store.
//!
//! Reads line commands from stdin and re-renders the list whenever the store
//! pushes a new snapshot. Configuration via CLI flags, environment variables,
//! or config file (`~/.config/tasklist/config.toml`).
//!
//! ```bash
//! # In-memory store and accounts
//! cargo run --bin tasklist -- --offline
//!
//! # Against a server
//! cargo run --bin tasklist -- --server-url ws://127.0.0.1:9000/ws
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use tasklist::app::{self, Command, Edit, HELP, ParseError};
use tasklist::config::{CliArgs, ClientConfig};
use tasklist::remote::RemoteBackend;
use tasklist::session::memory::MemorySessionProvider;
use tasklist::session::{AuthError, SessionProvider};
use tasklist::store::TaskStore;
use tasklist::store::memory::MemoryTaskStore;
use tasklist::sync::{SyncState, SyncView, TaskSyncController};
use tasklist_proto::task::Identity;
use tasklist_proto::wire::FederatedProvider;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Logs go to a file; stdout belongs to the list.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(offline = config.offline, "tasklist starting");

    let result = if config.offline {
        println!("Offline mode: tasks and accounts live only in this process.");
        run(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MemorySessionProvider::new()),
            &config,
        )
        .await
    } else {
        let backend = match RemoteBackend::connect(
            &config.server_url,
            config.connect_timeout,
            config.request_timeout,
        )
        .await
        {
            Ok(b) => Arc::new(b),
            Err(e) => {
                eprintln!("Could not reach the task server: {e}");
                std::process::exit(1);
            }
        };
        println!("Connected to {}.", backend.server_url());
        run(Arc::clone(&backend), backend, &config).await
    };

    tracing::info!("tasklist exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to flush
/// buffered log entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("tasklist.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Command loop: one line in, one command out, with a re-render on every
/// projection change. List edits run on their own tasks and report failures
/// back over a channel.
async fn run<S: TaskStore, P: SessionProvider>(
    store: Arc<S>,
    session: Arc<P>,
    config: &ClientConfig,
) -> io::Result<()> {
    let controller = Arc::new(TaskSyncController::new(store));
    let follower = controller.follow(session.as_ref());
    let mut view_rx = controller.view();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();

    println!("{HELP}");
    print_list(&controller.snapshot(), session.as_ref(), config);

    loop {
        tokio::select! {
            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = view_rx.borrow_and_update().clone();
                if view.state != SyncState::Subscribing {
                    print_list(&view, session.as_ref(), config);
                }
            }
            Some(message) = failures_rx.recv() => println!("{message}"),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match Command::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => {
                        execute(command, &controller, session.as_ref(), config, &failures_tx).await;
                    }
                    Err(ParseError::Empty) => {}
                    Err(e) => println!("{e}"),
                }
            }
        }
    }

    // Every edit task holds a sender clone; the channel closes once they finish.
    drop(failures_tx);
    let drained = tokio::time::timeout(config.request_timeout, async {
        while let Some(message) = failures_rx.recv().await {
            println!("{message}");
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("abandoning edits still in flight");
    }

    follower.abort();
    controller.shutdown();
    Ok(())
}

fn print_list<P: SessionProvider>(view: &SyncView, session: &P, config: &ClientConfig) {
    let account = session.current_account();
    println!(
        "{}",
        app::render(view, account.as_deref(), &config.timestamp_format)
    );
}

async fn execute<S: TaskStore, P: SessionProvider>(
    command: Command,
    controller: &Arc<TaskSyncController<S>>,
    session: &P,
    config: &ClientConfig,
    failures: &mpsc::UnboundedSender<String>,
) {
    match command {
        Command::SignUp { email, password } => {
            report_auth(session, session.sign_up_password(&email, &password).await);
        }
        Command::SignIn { email, password } => {
            report_auth(session, session.sign_in_password(&email, &password).await);
        }
        Command::Google { subject } => {
            report_auth(
                session,
                session
                    .sign_in_federated(FederatedProvider::Google, &subject)
                    .await,
            );
        }
        Command::SignOut => {
            if let Err(e) = session.sign_out().await {
                tracing::warn!(err = %e, "sign-out failed");
                println!("{}", e.user_message());
            }
        }
        Command::Add(text) => {
            Edit::Add(text).spawn(controller, failures);
        }
        Command::Toggle(n) => match app::task_at(&controller.snapshot(), n) {
            Some(id) => {
                Edit::Toggle(id).spawn(controller, failures);
            }
            None => println!("No task number {n}."),
        },
        Command::Delete(n) => match app::task_at(&controller.snapshot(), n) {
            Some(id) => {
                Edit::Delete(id).spawn(controller, failures);
            }
            None => println!("No task number {n}."),
        },
        Command::List => print_list(&controller.snapshot(), session, config),
        Command::Retry => controller.remount(),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}

fn report_auth<P: SessionProvider>(session: &P, result: Result<Identity, AuthError>) {
    match result {
        Ok(identity) => match session.current_account() {
            Some(account) => println!("Signed in as {account}."),
            None => println!("Signed in as {identity}."),
        },
        Err(e) => {
            tracing::warn!(err = %e, "authentication failed");
            println!("{}", e.user_message());
        }
    }
}
