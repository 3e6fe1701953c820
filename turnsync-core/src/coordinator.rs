use crate::config::MonitorConfig;
use crate::reconciler::{Applied, ReconcileError, Reconciler};
use crate::watcher::{
    process_order, OrderSubmitter, OrderValidator, SessionWatcher, WatchError, WatchedSession,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// How one submission attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Uploaded,
    AlreadySubmitted,
    /// The file for an already submitted year changed on disk.
    Conflict { stored: String, current: String },
    /// The local order is for a different year than the server's.
    YearMismatch { local: u32, server: u32 },
    Failed(String),
}

impl SubmissionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Uploaded | Self::AlreadySubmitted)
    }
}

impl From<&Result<Applied, ReconcileError>> for SubmissionOutcome {
    fn from(result: &Result<Applied, ReconcileError>) -> Self {
        match result {
            Ok(Applied::Uploaded) => Self::Uploaded,
            Ok(Applied::AlreadySubmitted) => Self::AlreadySubmitted,
            Err(ReconcileError::Conflict {
                stored, current, ..
            }) => Self::Conflict {
                stored: stored.clone(),
                current: current.clone(),
            },
            Err(ReconcileError::YearMismatch { local, server }) => Self::YearMismatch {
                local: *local,
                server: *server,
            },
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionEvent {
    pub connection: String,
    pub session_id: String,
    pub year: u32,
    pub outcome: SubmissionOutcome,
}

impl SubmissionEvent {
    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Runs the reconciler and reports exactly one event per attempt.
struct ReportingSubmitter {
    reconciler: Arc<Reconciler>,
    events_tx: broadcast::Sender<SubmissionEvent>,
}

#[async_trait]
impl OrderSubmitter for ReportingSubmitter {
    async fn submit(&self, session: &WatchedSession, year: u32, data: &[u8]) -> anyhow::Result<()> {
        let result = self
            .reconciler
            .submit(&session.connection, &session.session_id, year, data)
            .await;

        let _ = self.events_tx.send(SubmissionEvent {
            connection: session.connection.clone(),
            session_id: session.session_id.clone(),
            year,
            outcome: SubmissionOutcome::from(&result),
        });

        result.map(|_| ()).map_err(Into::into)
    }
}

/// Owns every active session watcher of one connection.
pub struct WatchCoordinator {
    connection: String,
    settings: MonitorConfig,
    validator: Arc<dyn OrderValidator>,
    submitter: Arc<ReportingSubmitter>,
    watchers: Mutex<HashMap<String, SessionWatcher>>,
    events_tx: broadcast::Sender<SubmissionEvent>,
}

impl WatchCoordinator {
    pub fn new(
        connection: impl Into<String>,
        settings: MonitorConfig,
        validator: Arc<dyn OrderValidator>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(100);
        Self {
            connection: connection.into(),
            settings,
            validator,
            submitter: Arc::new(ReportingSubmitter {
                reconciler,
                events_tx: events_tx.clone(),
            }),
            watchers: Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubmissionEvent> {
        self.events_tx.subscribe()
    }

    pub fn settings(&self) -> &MonitorConfig {
        &self.settings
    }

    /// Start watching `session`. Returns `false` when it is already watched.
    pub fn watch(&self, session: WatchedSession) -> Result<bool, WatchError> {
        let mut watchers = self.watchers.lock().unwrap();
        if watchers.contains_key(&session.session_id) {
            return Ok(false);
        }

        let id = session.session_id.clone();
        let watcher = SessionWatcher::start(
            session,
            &self.settings,
            Arc::clone(&self.validator),
            self.submitter.clone(),
        )?;
        watchers.insert(id, watcher);
        Ok(true)
    }

    pub fn unwatch(&self, session_id: &str) -> bool {
        let removed = self.watchers.lock().unwrap().remove(session_id);
        match removed {
            Some(watcher) => {
                watcher.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<SessionWatcher> = self
            .watchers
            .lock()
            .unwrap()
            .drain()
            .map(|(_, w)| w)
            .collect();
        for watcher in &drained {
            watcher.stop();
        }
        if !drained.is_empty() {
            log::info!(
                "monitor: stopped {} watchers for {}",
                drained.len(),
                self.connection
            );
        }
    }

    pub fn watched_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.watchers.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_watching(&self, session_id: &str) -> bool {
        self.watchers.lock().unwrap().contains_key(session_id)
    }

    /// Descriptor of a watched session.
    pub fn watched(&self, session_id: &str) -> Option<WatchedSession> {
        self.watchers
            .lock()
            .unwrap()
            .get(session_id)
            .map(|w| w.session().clone())
    }

    /// Push an order file that already exists through the same path as a live
    /// change. Used after (re)connecting.
    pub async fn rescan(&self, session: &WatchedSession) {
        let path = session.order_file_path(&self.settings.order_file_prefix);
        if !path.is_file() {
            log::debug!("monitor: no order file at {} to rescan", path.display());
            return;
        }
        process_order(
            session,
            &path,
            self.validator.as_ref(),
            self.submitter.as_ref(),
        )
        .await;
    }
}

impl Drop for WatchCoordinator {
    fn drop(&mut self) {
        self.stop_all();
    }
}
