//! Per-session order file watcher.
//!
//! Watches one session directory (non-recursively) for the player's order
//! file, debounces bursts of writes, and hands the settled file to an
//! [`OrderValidator`] and then an [`OrderSubmitter`].

use crate::config::MonitorConfig;
use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher: not a directory - {0}")]
    NotADirectory(PathBuf),

    #[error("watcher: io error - {0}")]
    Io(#[from] io::Error),

    #[error("watcher: notify error - {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("order file unreadable - {0}")]
    Io(#[from] io::Error),

    #[error("order file not ready - {0}")]
    NotReady(String),

    #[error("order file malformed - {0}")]
    Malformed(String),
}

/// A session whose order file is being watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedSession {
    pub connection: String,
    pub connection_name: String,
    pub session_id: String,
    /// 0-based seat. Order files are numbered from 1.
    pub seat: usize,
    pub game_dir: PathBuf,
}

impl WatchedSession {
    pub fn order_file_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.seat + 1)
    }

    pub fn order_file_path(&self, prefix: &str) -> PathBuf {
        self.game_dir.join(self.order_file_name(prefix))
    }

    /// Path of the turn file the server generates for this seat.
    pub fn turn_file_path(&self, prefix: &str) -> PathBuf {
        self.game_dir.join(format!("{}{}", prefix, self.seat + 1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedOrder {
    pub year: u32,
    pub data: Vec<u8>,
}

pub trait OrderValidator: Send + Sync {
    fn validate(&self, path: &Path) -> Result<ValidatedOrder, ValidationError>;
}

#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    async fn submit(&self, session: &WatchedSession, year: u32, data: &[u8]) -> anyhow::Result<()>;
}

type EventRx = mpsc::UnboundedReceiver<notify::Result<Event>>;

pub struct SessionWatcher {
    session: Arc<WatchedSession>,
    order_path: PathBuf,
    stopped: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    fs_watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionWatcher {
    /// Start watching `session.game_dir`. Must be called inside a tokio runtime.
    pub fn start(
        session: WatchedSession,
        settings: &MonitorConfig,
        validator: Arc<dyn OrderValidator>,
        submitter: Arc<dyn OrderSubmitter>,
    ) -> Result<Self, WatchError> {
        let meta = std::fs::metadata(&session.game_dir)?;
        if !meta.is_dir() {
            return Err(WatchError::NotADirectory(session.game_dir.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut fs_watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        fs_watcher.watch(&session.game_dir, RecursiveMode::NonRecursive)?;

        let watcher = Self::spawn(session, settings, rx, validator, submitter);
        *watcher.fs_watcher.lock().unwrap() = Some(fs_watcher);

        log::info!(
            "monitor: watching {} for {}",
            watcher.session.game_dir.display(),
            watcher.order_path.display()
        );
        Ok(watcher)
    }

    /// Run the event loop over an externally supplied event stream.
    pub(crate) fn spawn(
        session: WatchedSession,
        settings: &MonitorConfig,
        events: EventRx,
        validator: Arc<dyn OrderValidator>,
        submitter: Arc<dyn OrderSubmitter>,
    ) -> Self {
        let session = Arc::new(session);
        let order_path = session.order_file_path(&settings.order_file_prefix);
        let stopped = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(event_loop(
            Arc::clone(&session),
            order_path.clone(),
            settings.debounce(),
            events,
            shutdown_rx,
            Arc::clone(&stopped),
            validator,
            submitter,
        ));

        Self {
            session,
            order_path,
            stopped,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            fs_watcher: Mutex::new(None),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn session(&self) -> &WatchedSession {
        &self.session
    }

    pub fn order_path(&self) -> &Path {
        &self.order_path
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop watching. Only the first call has any effect.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender wakes the loop; dropping the watcher releases the OS handle.
        self.shutdown_tx.lock().unwrap().take();
        self.fs_watcher.lock().unwrap().take();
        log::debug!("monitor: stopped watching {}", self.session.session_id);
    }

    /// Stop and wait for the event loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_order_event(event: &Event, file_name: &OsStr) -> bool {
    // A rename onto the order file counts as a create.
    let relevant = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    );
    relevant
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

#[allow(clippy::too_many_arguments)]
async fn event_loop(
    session: Arc<WatchedSession>,
    order_path: PathBuf,
    debounce: Duration,
    mut events: EventRx,
    mut shutdown_rx: mpsc::Receiver<()>,
    stopped: Arc<AtomicBool>,
    validator: Arc<dyn OrderValidator>,
    submitter: Arc<dyn OrderSubmitter>,
) {
    let file_name = match order_path.file_name() {
        Some(name) => name.to_os_string(),
        None => return,
    };
    let mut debounce_timer: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            event = events.recv() => match event {
                Some(Ok(event)) => {
                    if is_order_event(&event, &file_name) {
                        debounce_timer = Some(Instant::now() + debounce);
                    }
                }
                Some(Err(e)) => log::warn!("monitor: watch error for {}: {}", session.session_id, e),
                None => break,
            },

            _ = async {
                if let Some(deadline) = debounce_timer {
                    tokio::time::sleep_until(deadline).await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {
                debounce_timer = None;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                // A started attempt always runs to completion; stop only takes
                // effect between attempts.
                process_order(&session, &order_path, validator.as_ref(), submitter.as_ref()).await;
            }
        }
    }
}

/// Validate and submit the order file once. Validation failures are expected
/// while the game is still writing, so they only log at debug.
pub(crate) async fn process_order(
    session: &WatchedSession,
    path: &Path,
    validator: &dyn OrderValidator,
    submitter: &dyn OrderSubmitter,
) {
    let order = match validator.validate(path) {
        Ok(order) => order,
        Err(e) => {
            log::debug!("monitor: {} not submittable yet: {}", path.display(), e);
            return;
        }
    };

    if let Err(e) = submitter.submit(session, order.year, &order.data).await {
        log::warn!(
            "monitor: submission for {} year {} failed: {}",
            session.session_id,
            order.year,
            e
        );
    }
}
