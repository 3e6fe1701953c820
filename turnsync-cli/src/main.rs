use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use turnsync_core::api::Authorized;
use turnsync_core::config::{default_data_dir, TurnsyncConfig};
use turnsync_core::fingerprint::{compute_file_hash, FingerprintEntry};
use turnsync_core::{
    ApiClient, AuthEvent, Credentials, FingerprintStore, OrderValidator, Reconciler, SqliteStore,
    SubmissionEvent, SubmissionOutcome, TokenManager, ValidatedOrder, ValidationError,
    WatchCoordinator, WatchedSession,
};

const NICKNAME_ENV: &str = "TURNSYNC_NICKNAME";
const APIKEY_ENV: &str = "TURNSYNC_APIKEY";

#[derive(Parser)]
#[command(author, version, about = "Turn order sync for hosted strategy games", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show data directory, configured servers and tracked fingerprints
    Status,
    /// Inspect or prune the fingerprint store
    Fingerprints {
        #[command(subcommand)]
        action: FingerprintAction,
    },
    /// Print the SHA-256 fingerprint of a file
    Hash {
        /// Path to the file
        file: PathBuf,
    },
    /// Upload one order file unless it was already submitted
    Submit {
        /// Server base URL
        #[arg(long)]
        server: String,
        /// Session ID
        #[arg(long)]
        session: String,
        /// Game year the orders are for
        #[arg(long)]
        year: u32,
        /// Path to the order file
        file: PathBuf,
    },
    /// Watch one session directory and submit saved orders (runs in foreground)
    Watch {
        /// Server base URL
        #[arg(long)]
        server: String,
        /// Session ID
        #[arg(long)]
        session: String,
        /// Player number, as in the order file name (game.x<N>)
        #[arg(long)]
        seat: usize,
        /// Session directory the game writes into
        #[arg(long)]
        dir: PathBuf,
        /// Game year the orders are for
        #[arg(long)]
        year: u32,
    },
}

#[derive(Subcommand)]
enum FingerprintAction {
    /// List tracked fingerprints
    List {
        /// Only this connection
        #[arg(long)]
        connection: Option<String>,
        /// Only this session (requires --connection)
        #[arg(long, requires = "connection")]
        session: Option<String>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget fingerprints for a connection, a session or a single key
    Forget {
        #[arg(long)]
        connection: String,
        #[arg(long)]
        session: Option<String>,
        /// Single key, e.g. order:2401 (requires --session)
        #[arg(long, requires = "session")]
        key: Option<String>,
    },
}

fn init_logging() {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn,turnsync_core=debug,turnsync=debug"),
    );
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn load_config() -> Result<TurnsyncConfig> {
    let dir = default_data_dir();
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create directory: {:?}", dir))?;
    TurnsyncConfig::load_or_default(&dir)
        .with_context(|| format!("Failed to load configuration from {:?}", dir))
}

fn open_fingerprints(config: &TurnsyncConfig) -> Result<Arc<FingerprintStore>> {
    let path = config.database_path();
    let db = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open database: {:?}", path))?;
    let store = FingerprintStore::open(Arc::new(db)).context("Failed to load fingerprints")?;
    Ok(Arc::new(store))
}

fn credentials_from_env() -> Result<Credentials> {
    let nickname = std::env::var(NICKNAME_ENV)
        .map_err(|_| anyhow!("{} is not set", NICKNAME_ENV))?;
    let apikey = std::env::var(APIKEY_ENV).map_err(|_| anyhow!("{} is not set", APIKEY_ENV))?;
    Ok(Credentials { nickname, apikey })
}

/// Accepts any non-empty file as the orders for a fixed year.
struct FixedYearValidator {
    year: u32,
}

impl OrderValidator for FixedYearValidator {
    fn validate(&self, path: &Path) -> Result<ValidatedOrder, ValidationError> {
        let data = fs::read(path)?;
        if data.is_empty() {
            return Err(ValidationError::NotReady("file is empty".into()));
        }
        Ok(ValidatedOrder {
            year: self.year,
            data,
        })
    }
}

/// An authenticated connection to one server.
struct SignedIn {
    tokens: Arc<TokenManager>,
    server: Arc<Authorized>,
}

async fn sign_in(config: &TurnsyncConfig, url: &str) -> Result<SignedIn> {
    let credentials = credentials_from_env()?;
    let client = Arc::new(
        ApiClient::new(url, config.auth.request_timeout())
            .with_context(|| format!("Invalid server URL: {}", url))?,
    );
    let tokens = Arc::new(TokenManager::new(client.clone(), config.auth.clone()));
    let info = tokens
        .connect(credentials)
        .await
        .with_context(|| format!("Failed to sign in to {}", url))?;
    log::info!("cli: signed in to {} as {}", url, info.user.nickname);

    let server = Arc::new(Authorized::new(client, tokens.clone()));
    Ok(SignedIn { tokens, server })
}

fn describe(outcome: &SubmissionOutcome) -> String {
    match outcome {
        SubmissionOutcome::Uploaded => "uploaded".to_string(),
        SubmissionOutcome::AlreadySubmitted => "already submitted".to_string(),
        SubmissionOutcome::Conflict { stored, current } => format!(
            "CONFLICT: file changed after submission (stored {}, now {})",
            stored, current
        ),
        SubmissionOutcome::YearMismatch { local, server } => format!(
            "year mismatch: orders are for {}, server is at {}",
            local, server
        ),
        SubmissionOutcome::Failed(e) => format!("failed: {}", e),
    }
}

fn print_entries(entries: &[FingerprintEntry], json: bool) -> Result<()> {
    if json {
        let rows: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "connection": e.connection,
                    "session": e.session,
                    "key": e.key,
                    "hash": e.hash,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No fingerprints tracked.");
        return Ok(());
    }
    for e in entries {
        println!("{}  {}  {}  {}", e.connection, e.session, e.key, e.hash);
    }
    println!();
    println!("{} fingerprint(s)", entries.len());
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_status() -> Result<()> {
    let config = load_config()?;

    println!("=== turnsync Status ===");
    println!();
    println!("Data directory: {:?}", config.data_dir);
    println!("Games directory: {:?}", config.games_dir());
    println!("Debounce: {} ms", config.monitor.debounce_ms);

    println!();
    if config.servers.is_empty() {
        println!("Servers: none configured");
    } else {
        println!("Servers:");
        for s in &config.servers {
            println!("  {} ({})", s.name, s.url);
        }
    }

    let fingerprints = open_fingerprints(&config)?;
    println!();
    println!("Tracked fingerprints: {}", fingerprints.tracked_count());
    Ok(())
}

fn cmd_fingerprints(action: FingerprintAction) -> Result<()> {
    let config = load_config()?;
    let fingerprints = open_fingerprints(&config)?;

    match action {
        FingerprintAction::List {
            connection,
            session,
            json,
        } => {
            let mut entries = match (connection, session) {
                (Some(c), Some(s)) => fingerprints.session_files(&c, &s),
                (Some(c), None) => fingerprints.connection_files(&c),
                _ => fingerprints.all_files(),
            };
            entries.sort_by(|a, b| {
                (&a.connection, &a.session, &a.key).cmp(&(&b.connection, &b.session, &b.key))
            });
            print_entries(&entries, json)?;
        }
        FingerprintAction::Forget {
            connection,
            session,
            key,
        } => match (session, key) {
            (Some(s), Some(k)) => {
                if fingerprints.get(&connection, &s, &k).is_none() {
                    println!("No fingerprint for {} in session {}", k, s);
                    return Ok(());
                }
                fingerprints
                    .forget(&connection, &s, &k)
                    .with_context(|| format!("Failed to forget {}", k))?;
                println!("Forgot {} in session {}", k, s);
            }
            (Some(s), None) => {
                let n = fingerprints.forget_session(&connection, &s);
                println!("Forgot {} fingerprint(s) for session {}", n, s);
            }
            (None, _) => {
                let n = fingerprints.forget_connection(&connection);
                println!("Forgot {} fingerprint(s) for {}", n, connection);
            }
        },
    }
    Ok(())
}

fn cmd_hash(file: &Path) -> Result<()> {
    let hash = compute_file_hash(file).with_context(|| format!("Failed to read {:?}", file))?;
    println!("{}  {}", hash, file.display());
    Ok(())
}

async fn cmd_submit(server: &str, session_id: &str, year: u32, file: &Path) -> Result<()> {
    let config = load_config()?;
    let fingerprints = open_fingerprints(&config)?;
    let data = fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
    if data.is_empty() {
        bail!("{:?} is empty", file);
    }

    let session = sign_in(&config, server).await?;
    let reconciler = Reconciler::new(fingerprints, session.server.clone());
    let result = reconciler.submit(server, session_id, year, &data).await;
    session.tokens.disconnect().await;

    let outcome = SubmissionOutcome::from(&result);
    println!("Year {}: {}", year, describe(&outcome));
    if !outcome.is_success() {
        bail!("submission did not complete");
    }
    Ok(())
}

async fn cmd_watch(
    server: &str,
    session_id: &str,
    seat: usize,
    dir: PathBuf,
    year: u32,
) -> Result<()> {
    if seat == 0 {
        bail!("--seat is the player number and starts at 1");
    }
    let config = load_config()?;
    let fingerprints = open_fingerprints(&config)?;
    let session = sign_in(&config, server).await?;

    let reconciler = Arc::new(Reconciler::new(fingerprints, session.server.clone()));
    let coordinator = WatchCoordinator::new(
        server,
        config.monitor.clone(),
        Arc::new(FixedYearValidator { year }),
        reconciler,
    );
    let mut events = coordinator.subscribe();
    let mut auth_events = session.tokens.subscribe();

    let watched = WatchedSession {
        connection: server.to_string(),
        connection_name: config.server_name(server).unwrap_or(server).to_string(),
        session_id: session_id.to_string(),
        seat: seat - 1,
        game_dir: dir,
    };
    let order_path = watched.order_file_path(&config.monitor.order_file_prefix);
    coordinator
        .watch(watched.clone())
        .with_context(|| format!("Failed to watch {:?}", watched.game_dir))?;

    println!("Watching {:?} for year {}", order_path, year);
    println!();
    println!("Press Ctrl+C to stop.");
    println!();

    coordinator.rescan(&watched).await;

    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(ev) => print_event(&ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("cli: missed {} submission event(s)", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            ev = auth_events.recv() => {
                if let Ok(AuthEvent::ConnectionChanged { connected: false, error: Some(e) }) = ev {
                    log::warn!("cli: token refresh failed ({}), signing in again", e);
                    if let Err(e) = session.tokens.reconnect().await {
                        eprintln!("Sign-in to {} lost: {}", server, e);
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!();
    println!("Stopping...");
    coordinator.stop_all();
    session.tokens.disconnect().await;
    Ok(())
}

fn print_event(ev: &SubmissionEvent) {
    println!(
        "[{}] year {}: {}",
        ev.session_id,
        ev.year,
        describe(&ev.outcome)
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            cmd_status()?;
        }
        Commands::Fingerprints { action } => {
            cmd_fingerprints(action)?;
        }
        Commands::Hash { file } => {
            cmd_hash(&file)?;
        }
        Commands::Submit {
            server,
            session,
            year,
            file,
        } => {
            cmd_submit(&server, &session, year, &file).await?;
        }
        Commands::Watch {
            server,
            session,
            seat,
            dir,
            year,
        } => {
            cmd_watch(&server, &session, seat, dir, year).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fixed_year_validator() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("game.x1");
        let validator = FixedYearValidator { year: 2403 };

        assert!(matches!(
            validator.validate(&path),
            Err(ValidationError::Io(_))
        ));

        fs::write(&path, b"").unwrap();
        assert!(matches!(
            validator.validate(&path),
            Err(ValidationError::NotReady(_))
        ));

        fs::write(&path, b"orders").unwrap();
        let order = validator.validate(&path).unwrap();
        assert_eq!(order.year, 2403);
        assert_eq!(order.data, b"orders");
    }

    #[test]
    fn test_describe_outcomes() {
        assert_eq!(describe(&SubmissionOutcome::Uploaded), "uploaded");
        assert!(describe(&SubmissionOutcome::YearMismatch {
            local: 2401,
            server: 2402
        })
        .contains("server is at 2402"));
        assert!(describe(&SubmissionOutcome::Conflict {
            stored: "aa".into(),
            current: "bb".into()
        })
        .starts_with("CONFLICT"));
    }

    #[test]
    fn test_cli_parses_forget_key_requires_session() {
        assert!(Cli::try_parse_from([
            "turnsync",
            "fingerprints",
            "forget",
            "--connection",
            "http://a",
            "--key",
            "order:1"
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "turnsync",
            "fingerprints",
            "forget",
            "--connection",
            "http://a",
            "--session",
            "s1",
            "--key",
            "order:1"
        ])
        .is_ok());
    }
}
