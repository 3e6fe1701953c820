//! Bearer token lifecycle for one server connection.
//!
//! The manager authenticates, keeps the token and its expiry, and refreshes it
//! from a background loop well before it lapses. Dependents learn about new
//! tokens and connection changes through [`TokenManager::subscribe`].

use crate::api::{ApiError, AuthApi, Credentials, TokenSource, UserInfo};
use crate::config::AuthConfig;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth: nickname and api key are required")]
    MissingCredentials,

    #[error("auth: not connected")]
    NotConnected,

    #[error("auth: {0}")]
    Api(#[from] ApiError),
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Authenticating,
    Connected,
    RefreshFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    TokenRefreshed(String),
    ConnectionChanged {
        connected: bool,
        error: Option<String>,
    },
}

struct TokenState {
    state: ConnectionState,
    token: Option<String>,
    expires_at: Option<Instant>,
    credentials: Option<Credentials>,
    user: Option<UserInfo>,
}

impl TokenState {
    fn empty() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            token: None,
            expires_at: None,
            credentials: None,
            user: None,
        }
    }
}

struct Inner {
    api: Arc<dyn AuthApi>,
    settings: AuthConfig,
    state: RwLock<TokenState>,
    events_tx: broadcast::Sender<AuthEvent>,
}

struct RefreshTask {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct TokenManager {
    inner: Arc<Inner>,
    refresh: Mutex<Option<RefreshTask>>,
}

impl TokenManager {
    pub fn new(api: Arc<dyn AuthApi>, settings: AuthConfig) -> Self {
        let (events_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(Inner {
                api,
                settings,
                state: RwLock::new(TokenState::empty()),
                events_tx,
            }),
            refresh: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Authenticate, start the refresh loop, then announce the token followed
    /// by the connection.
    pub async fn connect(&self, credentials: Credentials) -> Result<UserInfo> {
        if credentials.nickname.is_empty() || credentials.apikey.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        self.stop_refresh().await;
        self.inner.state.write().unwrap().state = ConnectionState::Authenticating;

        let result = async {
            let token = self.inner.api.authenticate(&credentials).await?;
            let user = self.inner.api.user_info(&token).await?;
            Ok::<_, ApiError>((token, user))
        }
        .await;

        let (token, user) = match result {
            Ok(ok) => ok,
            Err(e) => {
                *self.inner.state.write().unwrap() = TokenState::empty();
                log::warn!("auth: authentication as {} failed: {}", credentials.nickname, e);
                return Err(e.into());
            }
        };

        {
            let mut state = self.inner.state.write().unwrap();
            state.state = ConnectionState::Connected;
            state.token = Some(token.clone());
            state.expires_at = Some(Instant::now() + self.inner.settings.token_lifetime());
            state.credentials = Some(credentials);
            state.user = Some(user.clone());
        }
        self.start_refresh();

        log::info!("auth: connected as {}", user.user.nickname);
        self.inner.emit(AuthEvent::TokenRefreshed(token));
        self.inner.emit(AuthEvent::ConnectionChanged {
            connected: true,
            error: None,
        });
        Ok(user)
    }

    /// Authenticate again with the credentials of the last successful connect.
    pub async fn reconnect(&self) -> Result<UserInfo> {
        let credentials = self
            .inner
            .state
            .read()
            .unwrap()
            .credentials
            .clone()
            .ok_or(AuthError::NotConnected)?;
        self.connect(credentials).await
    }

    /// Stop refreshing, wait for the loop to exit, then forget the token.
    pub async fn disconnect(&self) {
        self.stop_refresh().await;

        let was_connected = {
            let mut state = self.inner.state.write().unwrap();
            let was = state.token.is_some() || state.state != ConnectionState::Disconnected;
            *state = TokenState::empty();
            was
        };
        if was_connected {
            log::info!("auth: disconnected");
        }
        self.inner.emit(AuthEvent::ConnectionChanged {
            connected: false,
            error: None,
        });
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.read().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn token(&self) -> Option<String> {
        self.inner.state.read().unwrap().token.clone()
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.inner.state.read().unwrap().expires_at
    }

    pub fn user_info(&self) -> Option<UserInfo> {
        self.inner.state.read().unwrap().user.clone()
    }

    /// False without a token, or once expiry is within the safety margin.
    pub fn is_token_valid(&self) -> bool {
        let state = self.inner.state.read().unwrap();
        match (&state.token, state.expires_at) {
            (Some(_), Some(expires_at)) => {
                Instant::now() + self.inner.settings.safety_margin() < expires_at
            }
            _ => false,
        }
    }

    fn start_refresh(&self) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(refresh_loop(inner, stop_rx));
        *self.refresh.lock().unwrap() = Some(RefreshTask { stop_tx, handle });
    }

    async fn stop_refresh(&self) {
        let task = self.refresh.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.stop_tx.send(());
            let _ = task.handle.await;
        }
    }
}

impl TokenSource for TokenManager {
    fn current_token(&self) -> Option<String> {
        self.token()
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        if let Some(task) = self.refresh.lock().unwrap().take() {
            let _ = task.stop_tx.send(());
            task.handle.abort();
        }
    }
}

impl Inner {
    fn emit(&self, event: AuthEvent) {
        let _ = self.events_tx.send(event);
    }

    fn store_token(&self, token: &str) {
        let mut state = self.state.write().unwrap();
        state.token = Some(token.to_string());
        state.expires_at = Some(Instant::now() + self.settings.token_lifetime());
        state.state = ConnectionState::Connected;
    }

    /// Exchange the current token for a new one.
    async fn refresh_once(&self) -> std::result::Result<String, ApiError> {
        let token = self
            .state
            .read()
            .unwrap()
            .token
            .clone()
            .ok_or(ApiError::NotAuthenticated)?;

        let refreshed = self.api.refresh(&token).await?;
        self.store_token(&refreshed);
        Ok(refreshed)
    }
}

async fn refresh_loop(inner: Arc<Inner>, mut stop_rx: oneshot::Receiver<()>) {
    let period = inner.settings.refresh_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stop_rx => return,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = &mut stop_rx => return,
            result = inner.refresh_once() => result,
        };

        match result {
            Ok(token) => {
                log::debug!("auth: token refreshed");
                inner.emit(AuthEvent::TokenRefreshed(token));
            }
            Err(e) => {
                log::error!("auth: token refresh failed: {}", e);
                inner.state.write().unwrap().state = ConnectionState::RefreshFailed;
                inner.emit(AuthEvent::ConnectionChanged {
                    connected: false,
                    error: Some(e.to_string()),
                });
                return;
            }
        }
    }
}
