//! Per-connection wiring.
//!
//! A [`ConnectionContext`] owns everything that belongs to one server: token
//! manager, notification channel, watch coordinator. The
//! [`ConnectionRegistry`] maps server URLs to their contexts.

use crate::api::{
    ApiClient, ApiError, Authorized, Credentials, SessionDirectory, TurnServer, UserInfo,
};
use crate::auth::{AuthError, AuthEvent, TokenManager};
use crate::config::{MonitorConfig, NotificationConfig, TurnsyncConfig};
use crate::coordinator::{SubmissionEvent, WatchCoordinator};
use crate::fingerprint::{FingerprintError, FingerprintStore};
use crate::notifications::{
    ChannelError, Connector, NotificationChannel, NotificationEvent, WsConnector,
};
use crate::reconciler::Reconciler;
use crate::watcher::{OrderValidator, WatchError, WatchedSession};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

const MAX_DIR_NAME_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("connection: {0}")]
    Auth(#[from] AuthError),

    #[error("connection: {0}")]
    Api(#[from] ApiError),

    #[error("connection: {0}")]
    Channel(#[from] ChannelError),

    #[error("connection: {0}")]
    Watch(#[from] WatchError),

    #[error("connection: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("connection: io error - {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ContextError>;

/// Make a server name safe to use as a directory name.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_DIR_NAME_LEN)
        .collect();
    if cleaned.is_empty() {
        "server".to_string()
    } else {
        cleaned
    }
}

/// Collaborators of one connection, for callers that build their own.
pub struct ContextParts {
    pub url: String,
    pub name: String,
    pub games_dir: PathBuf,
    pub monitor: MonitorConfig,
    pub tokens: Arc<TokenManager>,
    pub directory: Arc<dyn SessionDirectory>,
    pub server: Arc<dyn TurnServer>,
    pub channel: NotificationChannel,
    pub fingerprints: Arc<FingerprintStore>,
    pub validator: Arc<dyn OrderValidator>,
}

pub struct ConnectionContext {
    url: String,
    name: String,
    games_dir: PathBuf,
    tokens: Arc<TokenManager>,
    directory: Arc<dyn SessionDirectory>,
    server: Arc<dyn TurnServer>,
    channel: Arc<NotificationChannel>,
    coordinator: WatchCoordinator,
    fingerprints: Arc<FingerprintStore>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionContext {
    /// Build a context talking to the real server at `url`.
    pub fn open(
        config: &TurnsyncConfig,
        url: &str,
        fingerprints: Arc<FingerprintStore>,
        validator: Arc<dyn OrderValidator>,
    ) -> Result<Arc<Self>> {
        let api = Arc::new(ApiClient::new(url, config.auth.request_timeout())?);
        let tokens = Arc::new(TokenManager::new(api.clone(), config.auth.clone()));
        let authorized = Arc::new(Authorized::new(api.clone(), tokens.clone()));
        let ws_url = api.websocket_url(&config.notifications.path)?;

        Ok(Self::from_parts(ContextParts {
            url: url.to_string(),
            name: config.server_name(url).unwrap_or(url).to_string(),
            games_dir: config.games_dir(),
            monitor: config.monitor.clone(),
            tokens,
            directory: authorized.clone(),
            server: authorized,
            channel: notification_channel(Arc::new(WsConnector::new(ws_url)), &config.notifications),
            fingerprints,
            validator,
        }))
    }

    pub fn from_parts(parts: ContextParts) -> Arc<Self> {
        let reconciler = Arc::new(Reconciler::new(
            parts.fingerprints.clone(),
            Arc::clone(&parts.server),
        ));
        let coordinator =
            WatchCoordinator::new(parts.url.clone(), parts.monitor, parts.validator, reconciler);

        Arc::new(Self {
            url: parts.url,
            name: parts.name,
            games_dir: parts.games_dir,
            tokens: parts.tokens,
            directory: parts.directory,
            server: parts.server,
            channel: Arc::new(parts.channel),
            coordinator,
            fingerprints: parts.fingerprints,
            forwarders: Mutex::new(Vec::new()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn channel(&self) -> &NotificationChannel {
        &self.channel
    }

    pub fn coordinator(&self) -> &WatchCoordinator {
        &self.coordinator
    }

    pub fn subscribe_submissions(&self) -> broadcast::Receiver<SubmissionEvent> {
        self.coordinator.subscribe()
    }

    /// Working directory of one session.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.games_dir
            .join(sanitize_name(&self.name))
            .join(session_id)
    }

    /// Authenticate, keep the notification socket on the latest token, start
    /// the polling fallback, then start watching every ready session.
    pub async fn connect(self: &Arc<Self>, credentials: Credentials) -> Result<UserInfo> {
        self.stop_forwarders().await;
        self.spawn_forwarders();

        let user = self.tokens.connect(credentials).await?;
        self.channel.start_polling();

        if let Err(e) = self.start_monitoring().await {
            log::warn!("connection: could not start monitoring on {}: {}", self.url, e);
        }
        Ok(user)
    }

    /// Watch every started session in which the local player is seated and ready.
    pub async fn start_monitoring(&self) -> Result<usize> {
        let user = self.tokens.user_info().ok_or(AuthError::NotConnected)?;
        let sessions = self.directory.list_sessions().await?;

        let mut started = 0;
        for session in sessions {
            if let Some(seat) = session.ready_seat(&user.user.id) {
                match self.begin_watch(&session.id, seat).await {
                    Ok(true) => started += 1,
                    Ok(false) => {}
                    Err(e) => log::warn!("connection: cannot watch {}: {}", session.id, e),
                }
            }
        }
        if started > 0 {
            log::info!("connection: monitoring {} new sessions on {}", started, self.url);
        }
        Ok(started)
    }

    /// Re-evaluate one session after the server reports a change to it. An
    /// already watched session gets its latest turn files instead.
    pub async fn check_and_start_monitoring(&self, session_id: &str) -> Result<bool> {
        if self.coordinator.is_watching(session_id) {
            if let Err(e) = self.sync_latest_turn(session_id).await {
                log::warn!("connection: turn files for {} not synced: {}", session_id, e);
            }
            return Ok(false);
        }
        let user = self.tokens.user_info().ok_or(AuthError::NotConnected)?;
        let session = self.directory.get_session(session_id).await?;
        match session.ready_seat(&user.user.id) {
            Some(seat) => self.begin_watch(session_id, seat).await,
            None => Ok(false),
        }
    }

    async fn begin_watch(&self, session_id: &str, seat: usize) -> Result<bool> {
        let game_dir = self.session_dir(session_id);
        std::fs::create_dir_all(&game_dir)?;

        let session = WatchedSession {
            connection: self.url.clone(),
            connection_name: self.name.clone(),
            session_id: session_id.to_string(),
            seat,
            game_dir,
        };
        if !self.coordinator.watch(session.clone())? {
            return Ok(false);
        }
        if let Err(e) = self.sync_latest_turn(session_id).await {
            log::warn!("connection: turn files for {} not synced: {}", session_id, e);
        }
        self.coordinator.rescan(&session).await;
        Ok(true)
    }

    /// Download the latest universe and turn file of a watched session into
    /// its directory. Files whose content is unchanged are not rewritten.
    /// Returns how many files were written.
    pub async fn sync_latest_turn(&self, session_id: &str) -> Result<usize> {
        let session = match self.coordinator.watched(session_id) {
            Some(session) => session,
            None => return Ok(0),
        };
        let files = self.server.latest_turn(session_id).await?;
        let settings = self.coordinator.settings();

        let mut targets = Vec::with_capacity(2);
        if let Some(data) = files.universe_bytes()? {
            targets.push((session.game_dir.join(&settings.universe_file), data));
        }
        if let Some(data) = files.turn_bytes()? {
            targets.push((session.turn_file_path(&settings.turn_file_prefix), data));
        }

        let mut written = 0;
        for (path, data) in targets {
            if self
                .fingerprints
                .write_if_changed(&self.url, session_id, &data, &path)?
            {
                written += 1;
            }
        }
        if written > 0 {
            log::info!(
                "connection: saved {} turn file(s) for {} year {}",
                written,
                session_id,
                files.year
            );
        }
        Ok(written)
    }

    /// The player left the session or it was deleted remotely.
    pub fn session_ended(&self, session_id: &str) {
        self.coordinator.unwatch(session_id);
        self.fingerprints.forget_session(&self.url, session_id);
    }

    pub async fn disconnect(&self) {
        self.stop_forwarders().await;
        self.coordinator.stop_all();
        self.channel.disconnect().await;
        self.tokens.disconnect().await;
        log::info!("connection: {} disconnected", self.url);
    }

    fn spawn_forwarders(self: &Arc<Self>) {
        let tokens_rx = self.tokens.subscribe();
        let changes_rx = self.channel.subscribe();

        let token_task = tokio::spawn(forward_tokens(tokens_rx, Arc::downgrade(self)));
        let change_task = tokio::spawn(forward_changes(changes_rx, Arc::downgrade(self)));
        self.forwarders
            .lock()
            .unwrap()
            .extend([token_task, change_task]);
    }

    async fn stop_forwarders(&self) {
        let tasks: Vec<JoinHandle<()>> = self.forwarders.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

fn notification_channel(
    connector: Arc<dyn Connector>,
    settings: &NotificationConfig,
) -> NotificationChannel {
    NotificationChannel::new(connector, settings.clone())
}

async fn forward_tokens(mut rx: broadcast::Receiver<AuthEvent>, ctx: Weak<ConnectionContext>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                log::warn!("connection: skipped {} auth events", n);
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let ctx = match ctx.upgrade() {
            Some(ctx) => ctx,
            None => return,
        };

        match event {
            AuthEvent::TokenRefreshed(token) => {
                if let Err(e) = ctx.channel.reconnect(&token).await {
                    log::warn!("connection: notification socket not reopened: {}", e);
                }
            }
            // The token manager gave up refreshing; log in again once.
            AuthEvent::ConnectionChanged {
                connected: false,
                error: Some(e),
            } => {
                log::error!("connection: lost authentication on {}: {}", ctx.url, e);
                match ctx.tokens.reconnect().await {
                    Ok(_) => log::info!("connection: re-authenticated on {}", ctx.url),
                    Err(e) => log::error!("connection: re-authentication on {} failed: {}", ctx.url, e),
                }
            }
            AuthEvent::ConnectionChanged { .. } => {}
        }
    }
}

async fn forward_changes(
    mut rx: broadcast::Receiver<NotificationEvent>,
    ctx: Weak<ConnectionContext>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event @ (NotificationEvent::Change(_) | NotificationEvent::PollFallback)) => event,
            Ok(_) => continue,
            Err(RecvError::Lagged(n)) => {
                log::warn!("connection: skipped {} notifications", n);
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let ctx = match ctx.upgrade() {
            Some(ctx) => ctx,
            None => return,
        };

        match event {
            NotificationEvent::Change(change) if change.is_session_update() => {
                if let Err(e) = ctx.check_and_start_monitoring(&change.id).await {
                    log::warn!("connection: session {} not monitored: {}", change.id, e);
                }
            }
            NotificationEvent::Change(change) if change.is_session_deletion() => {
                ctx.session_ended(&change.id);
            }
            NotificationEvent::PollFallback => {
                if let Err(e) = ctx.start_monitoring().await {
                    log::debug!("connection: poll of {} failed: {}", ctx.url, e);
                }
            }
            _ => {}
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    contexts: RwLock<HashMap<String, Arc<ConnectionContext>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ctx` under its URL, returning any context it replaced.
    pub fn insert(&self, ctx: Arc<ConnectionContext>) -> Option<Arc<ConnectionContext>> {
        self.contexts
            .write()
            .unwrap()
            .insert(ctx.url().to_string(), ctx)
    }

    pub fn get(&self, url: &str) -> Option<Arc<ConnectionContext>> {
        self.contexts.read().unwrap().get(url).cloned()
    }

    /// Remove and disconnect the context for `url`.
    pub async fn remove(&self, url: &str) -> bool {
        let removed = self.contexts.write().unwrap().remove(url);
        match removed {
            Some(ctx) => {
                ctx.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Remove the connection and drop every fingerprint recorded for it.
    /// Returns how many fingerprints were forgotten, or `None` when `url` was
    /// not registered.
    pub async fn forget(&self, url: &str) -> Option<usize> {
        let removed = self.contexts.write().unwrap().remove(url);
        let ctx = removed?;
        ctx.disconnect().await;
        Some(ctx.fingerprints.forget_connection(url))
    }

    pub fn connections(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.contexts.read().unwrap().keys().cloned().collect();
        urls.sort();
        urls
    }

    pub async fn disconnect_all(&self) {
        let all: Vec<Arc<ConnectionContext>> = self
            .contexts
            .write()
            .unwrap()
            .drain()
            .map(|(_, ctx)| ctx)
            .collect();
        for ctx in all {
            ctx.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Session, SessionPlayer, TurnData, TurnFiles};
    use crate::auth::ConnectionState;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use std::sync::atomic::Ordering;
    use crate::auth::testing::{credentials, FakeAuth};
    use crate::config::AuthConfig;
    use crate::coordinator::SubmissionOutcome;
    use crate::kv::MemoryStore;
    use crate::notifications::testing::FakeConnector;
    use crate::notifications::Frame;
    use crate::reconciler::testing::FakeServer;
    use crate::watcher::testing::CountingValidator;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeDirectory {
        sessions: Mutex<Vec<Session>>,
    }

    #[async_trait]
    impl SessionDirectory for FakeDirectory {
        async fn list_sessions(&self) -> crate::api::Result<Vec<Session>> {
            Ok(self.sessions.lock().unwrap().clone())
        }

        async fn get_session(&self, session_id: &str) -> crate::api::Result<Session> {
            self.sessions
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.id == session_id)
                .cloned()
                .ok_or(ApiError::Status {
                    status: 404,
                    message: "no such session".into(),
                })
        }
    }

    fn session(id: &str, state: &str, players: &[(&str, bool)]) -> Session {
        Session {
            id: id.into(),
            name: id.into(),
            state: state.into(),
            players: players
                .iter()
                .map(|(user, ready)| SessionPlayer {
                    user_profile_id: user.to_string(),
                    ready: *ready,
                })
                .collect(),
        }
    }

    struct Harness {
        _tmp: TempDir,
        ctx: Arc<ConnectionContext>,
        directory: Arc<FakeDirectory>,
        server: Arc<FakeServer>,
        connector: Arc<FakeConnector>,
        auth: Arc<FakeAuth>,
    }

    fn harness(sessions: Vec<Session>) -> Harness {
        let tmp = TempDir::new().unwrap();
        let directory = Arc::new(FakeDirectory {
            sessions: Mutex::new(sessions),
        });
        let server = FakeServer::at_year(2400);
        let connector = Arc::new(FakeConnector::default());
        let auth = Arc::new(FakeAuth::default());
        let fingerprints =
            Arc::new(FingerprintStore::open(Arc::new(MemoryStore::new())).unwrap());

        let ctx = ConnectionContext::from_parts(ContextParts {
            url: "http://localhost:8080".into(),
            name: "My Server!".into(),
            games_dir: tmp.path().to_path_buf(),
            monitor: MonitorConfig::default(),
            tokens: Arc::new(TokenManager::new(auth.clone(), AuthConfig::default())),
            directory: directory.clone(),
            server: server.clone(),
            channel: NotificationChannel::new(connector.clone(), NotificationConfig::default()),
            fingerprints,
            validator: CountingValidator::reading(2400),
        });

        Harness {
            _tmp: tmp,
            ctx,
            directory,
            server,
            connector,
            auth,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My Server!"), "My_Server");
        assert_eq!(sanitize_name("a/b\\c..d"), "abcd");
        assert_eq!(sanitize_name(&"x".repeat(80)).len(), 50);
        assert_eq!(sanitize_name("???"), "server");
    }

    #[tokio::test]
    async fn test_connect_watches_ready_sessions_and_rescans() {
        let h = harness(vec![
            session("s-ready", "started", &[("other", true), ("user-1", true)]),
            session("s-not-ready", "started", &[("user-1", false)]),
            session("s-pending", "pending", &[("user-1", true)]),
        ]);
        let dir = h.ctx.session_dir("s-ready");
        assert!(dir.ends_with("My_Server/s-ready"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("game.x2"), b"orders").unwrap();

        let (_tx, _sent) = h.connector.push_stream();
        let mut submissions = h.ctx.subscribe_submissions();
        h.ctx.connect(credentials()).await.unwrap();

        assert_eq!(h.ctx.coordinator().watched_sessions(), vec!["s-ready".to_string()]);
        let ev = submissions.recv().await.unwrap();
        assert_eq!(ev.outcome, SubmissionOutcome::Uploaded);
        assert_eq!(h.server.submission_count(), 1);

        let ctx = h.ctx.clone();
        wait_for(move || ctx.channel().is_connected()).await;
        assert_eq!(h.connector.attempts.lock().unwrap()[0].1, "login-ann-1");

        h.ctx.disconnect().await;
        assert!(h.ctx.coordinator().watched_sessions().is_empty());
        assert!(!h.ctx.channel().is_connected());
        assert!(h.ctx.tokens().token().is_none());
    }

    #[tokio::test]
    async fn test_session_notifications_drive_watching() {
        let h = harness(vec![session("s1", "pending", &[("user-1", true)])]);
        let (tx, _sent) = h.connector.push_stream();
        h.ctx.connect(credentials()).await.unwrap();
        assert!(h.ctx.coordinator().watched_sessions().is_empty());

        let ctx = h.ctx.clone();
        wait_for(move || ctx.channel().is_connected()).await;

        *h.directory.sessions.lock().unwrap() =
            vec![session("s1", "started", &[("user-1", true)])];
        tx.send(Ok(Frame::Text(
            r#"{"type":"session","id":"s1","action":"updated"}"#.into(),
        )))
        .unwrap();
        let ctx = h.ctx.clone();
        wait_for(move || ctx.coordinator().is_watching("s1")).await;

        h.ctx
            .fingerprints
            .set(h.ctx.url(), "s1", "order:2400", "abc")
            .unwrap();
        tx.send(Ok(Frame::Text(
            r#"{"type":"session","id":"s1","action":"deleted"}"#.into(),
        )))
        .unwrap();
        let ctx = h.ctx.clone();
        wait_for(move || !ctx.coordinator().is_watching("s1")).await;
        assert!(h.ctx.fingerprints.session_files(h.ctx.url(), "s1").is_empty());

        h.ctx.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_fallback_discovers_sessions() {
        let h = harness(vec![session("s1", "pending", &[("user-1", true)])]);
        // No stream queued: the socket stays down and polling takes over.
        h.ctx.connect(credentials()).await.unwrap();
        assert!(!h.ctx.channel().is_connected());
        assert!(h.ctx.coordinator().watched_sessions().is_empty());

        *h.directory.sessions.lock().unwrap() =
            vec![session("s1", "started", &[("user-1", true)])];
        tokio::time::sleep(Duration::from_secs(31)).await;
        let ctx = h.ctx.clone();
        wait_for(move || ctx.coordinator().is_watching("s1")).await;

        h.ctx.disconnect().await;
    }

    fn turn_files(year: u32, universe: &[u8], turn: &[u8]) -> TurnFiles {
        TurnFiles {
            year,
            turn: TurnData {
                universe: STANDARD.encode(universe),
                turn: STANDARD.encode(turn),
            },
        }
    }

    #[tokio::test]
    async fn test_turn_files_written_only_when_changed() {
        let h = harness(vec![session("s1", "started", &[("other", true), ("user-1", true)])]);
        *h.server.turn.lock().unwrap() = Some(turn_files(2400, b"universe", b"turn 2400"));
        let (_tx, _sent) = h.connector.push_stream();
        h.ctx.connect(credentials()).await.unwrap();

        let dir = h.ctx.session_dir("s1");
        assert_eq!(std::fs::read(dir.join("game.xy")).unwrap(), b"universe");
        assert_eq!(std::fs::read(dir.join("game.m2")).unwrap(), b"turn 2400");

        // Same content again: nothing touches the disk.
        std::fs::write(dir.join("game.m2"), b"local edit").unwrap();
        assert_eq!(h.ctx.sync_latest_turn("s1").await.unwrap(), 0);
        assert_eq!(std::fs::read(dir.join("game.m2")).unwrap(), b"local edit");

        // A new year only rewrites the turn file.
        *h.server.turn.lock().unwrap() = Some(turn_files(2401, b"universe", b"turn 2401"));
        assert_eq!(h.ctx.sync_latest_turn("s1").await.unwrap(), 1);
        assert_eq!(std::fs::read(dir.join("game.m2")).unwrap(), b"turn 2401");

        assert_eq!(h.ctx.sync_latest_turn("not-watched").await.unwrap(), 0);
        h.ctx.disconnect().await;
    }

    #[tokio::test]
    async fn test_session_update_syncs_watched_session() {
        let h = harness(vec![session("s1", "started", &[("user-1", true)])]);
        let (tx, _sent) = h.connector.push_stream();
        h.ctx.connect(credentials()).await.unwrap();
        assert!(h.ctx.coordinator().is_watching("s1"));
        let ctx = h.ctx.clone();
        wait_for(move || ctx.channel().is_connected()).await;

        *h.server.turn.lock().unwrap() = Some(turn_files(2401, b"u", b"t"));
        tx.send(Ok(Frame::Text(
            r#"{"type":"session","id":"s1","action":"updated"}"#.into(),
        )))
        .unwrap();
        let path = h.ctx.session_dir("s1").join("game.m1");
        wait_for(move || path.exists()).await;

        h.ctx.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_logs_in_again() {
        let h = harness(Vec::new());
        h.auth.fail_refresh.store(true, Ordering::SeqCst);
        h.ctx.connect(credentials()).await.unwrap();
        assert_eq!(h.auth.logins.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(250)).await;
        let ctx = h.ctx.clone();
        wait_for(move || ctx.tokens().token().as_deref() == Some("login-ann-2")).await;
        assert_eq!(h.ctx.tokens().state(), ConnectionState::Connected);
        assert_eq!(h.auth.logins.load(Ordering::SeqCst), 2);

        h.ctx.disconnect().await;
    }

    #[tokio::test]
    async fn test_registry_forget_drops_connection_fingerprints() {
        let registry = ConnectionRegistry::new();
        let h = harness(Vec::new());
        h.ctx
            .fingerprints
            .set(h.ctx.url(), "s1", "order:2400", "abc")
            .unwrap();
        h.ctx
            .fingerprints
            .set("http://other:8080", "s1", "order:2400", "def")
            .unwrap();
        registry.insert(h.ctx.clone());

        assert_eq!(registry.forget("http://localhost:8080").await, Some(1));
        assert_eq!(registry.forget("http://localhost:8080").await, None);
        assert!(registry.connections().is_empty());
        assert_eq!(h.ctx.fingerprints.tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_removes_and_disconnects() {
        let registry = ConnectionRegistry::new();
        let h = harness(Vec::new());
        let (_tx, _sent) = h.connector.push_stream();
        h.ctx.connect(credentials()).await.unwrap();

        assert!(registry.insert(h.ctx.clone()).is_none());
        assert_eq!(registry.connections(), vec!["http://localhost:8080".to_string()]);
        assert!(registry.get("http://localhost:8080").is_some());

        assert!(registry.remove("http://localhost:8080").await);
        assert!(!registry.remove("http://localhost:8080").await);
        assert!(h.ctx.tokens().token().is_none());

        registry.insert(h.ctx.clone());
        registry.disconnect_all().await;
        assert!(registry.connections().is_empty());
    }
}
