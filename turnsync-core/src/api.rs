//! HTTP bindings for the game server.
//!
//! [`ApiClient`] is stateless with respect to authentication: every call that
//! needs a bearer token takes it explicitly. [`Authorized`] pairs a client with
//! a [`TokenSource`] to implement the token-free seams ([`TurnServer`],
//! [`SessionDirectory`]) the rest of the crate is written against.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const AUTH_AUTHENTICATE: &str = "/api/v1/auth/authenticate";
pub const AUTH_REFRESH: &str = "/api/v1/auth/refresh_token";
pub const AUTH_USER_INFO: &str = "/api/v1/auth/userinfo";
pub const SESSIONS: &str = "/api/v1/sessions";

pub const SESSION_STATE_STARTED: &str = "started";

pub fn session_path(id: &str) -> String {
    format!("{}/{}", SESSIONS, id)
}

pub fn latest_turn_path(id: &str) -> String {
    format!("{}/{}/turns/latest", SESSIONS, id)
}

pub fn turn_path(id: &str, year: u32) -> String {
    format!("{}/{}/turns/{}", SESSIONS, id, year)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("api: invalid url - {0}")]
    InvalidUrl(String),

    #[error("api: not authenticated")]
    NotAuthenticated,

    #[error("api: network error - {0}")]
    Network(String),

    #[error("api: server returned {status} - {message}")]
    Status { status: u16, message: String },

    #[error("api: malformed response - {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub nickname: String,
    pub apikey: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("nickname", &self.nickname)
            .field("apikey", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPlayer {
    pub user_profile_id: String,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub players: Vec<SessionPlayer>,
}

impl Session {
    /// Seat of `user_id` when the session is started and that player is ready.
    pub fn ready_seat(&self, user_id: &str) -> Option<usize> {
        if self.state != SESSION_STATE_STARTED {
            return None;
        }
        self.players
            .iter()
            .position(|p| p.user_profile_id == user_id && p.ready)
    }
}

#[derive(Debug, Deserialize)]
struct LatestTurn {
    year: u32,
}

/// Files the server generated for one year. Both payloads are base64 and
/// either may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnFiles {
    #[serde(default)]
    pub year: u32,
    #[serde(default)]
    pub turn: TurnData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnData {
    /// The `.xy` universe file.
    #[serde(default)]
    pub universe: String,
    /// The player's `.m<N>` turn file.
    #[serde(default)]
    pub turn: String,
}

impl TurnFiles {
    pub fn universe_bytes(&self) -> Result<Option<Vec<u8>>> {
        decode_payload("universe", &self.turn.universe)
    }

    pub fn turn_bytes(&self) -> Result<Option<Vec<u8>>> {
        decode_payload("turn", &self.turn.turn)
    }
}

fn decode_payload(what: &str, b64: &str) -> Result<Option<Vec<u8>>> {
    if b64.is_empty() {
        return Ok(None);
    }
    STANDARD
        .decode(b64)
        .map(Some)
        .map_err(|e| ApiError::Decode(format!("{} data: {}", what, e)))
}

#[derive(Debug, Serialize)]
struct Order {
    b64_data: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<String>;
    async fn refresh(&self, token: &str) -> Result<String>;
    async fn user_info(&self, token: &str) -> Result<UserInfo>;
}

#[async_trait]
pub trait TurnServer: Send + Sync {
    async fn latest_year(&self, session_id: &str) -> Result<u32>;
    async fn submit_turn(&self, session_id: &str, year: u32, data: &[u8]) -> Result<()>;
    async fn latest_turn(&self, session_id: &str) -> Result<TurnFiles>;
}

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<Session>>;
    async fn get_session(&self, session_id: &str) -> Result<Session>;
}

/// Anything that can hand out the current bearer token.
pub trait TokenSource: Send + Sync {
    fn current_token(&self) -> Option<String>;
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ApiError::InvalidUrl(format!(
                    "unsupported scheme {:?}",
                    other
                )))
            }
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }

    /// Websocket endpoint for `path` on the same host.
    pub fn websocket_url(&self, path: &str) -> Result<Url> {
        let mut url = self.url(path)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ApiError::InvalidUrl(format!("cannot derive websocket url from {}", url)))?;
        Ok(url)
    }

    fn request(&self, method: Method, path: &str, token: Option<&str>) -> Result<RequestBuilder> {
        let builder = self.client.request(method, self.url(path)?);
        Ok(match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn send(builder: RequestBuilder) -> Result<Vec<u8>> {
        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();

        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok(body)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, token: &str) -> Result<T> {
        let body = Self::send(self.request(Method::GET, path, Some(token))?).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn authenticate(&self, credentials: &Credentials) -> Result<String> {
        let body = Self::send(
            self.request(Method::POST, AUTH_AUTHENTICATE, None)?
                .json(credentials),
        )
        .await?;
        parse_token(&body)
    }

    pub async fn refresh_token(&self, token: &str) -> Result<String> {
        let body = Self::send(self.request(Method::POST, AUTH_REFRESH, Some(token))?).await?;
        parse_token(&body)
    }

    pub async fn user_info(&self, token: &str) -> Result<UserInfo> {
        self.get_json(AUTH_USER_INFO, token).await
    }

    pub async fn list_sessions(&self, token: &str) -> Result<Vec<Session>> {
        self.get_json(SESSIONS, token).await
    }

    pub async fn get_session(&self, token: &str, id: &str) -> Result<Session> {
        self.get_json(&session_path(id), token).await
    }

    pub async fn latest_turn_year(&self, token: &str, id: &str) -> Result<u32> {
        let latest: LatestTurn = self.get_json(&latest_turn_path(id), token).await?;
        Ok(latest.year)
    }

    pub async fn latest_turn_files(&self, token: &str, id: &str) -> Result<TurnFiles> {
        self.get_json(&latest_turn_path(id), token).await
    }

    pub async fn turn_files(&self, token: &str, id: &str, year: u32) -> Result<TurnFiles> {
        self.get_json(&turn_path(id, year), token).await
    }

    pub async fn submit_turn(&self, token: &str, id: &str, year: u32, data: &[u8]) -> Result<()> {
        let order = Order {
            b64_data: STANDARD.encode(data),
        };
        Self::send(
            self.request(Method::PUT, &turn_path(id, year), Some(token))?
                .json(&order),
        )
        .await?;
        Ok(())
    }
}

/// Tokens come back as a bare or JSON-quoted string.
fn parse_token(body: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    let token = if text.starts_with('"') {
        serde_json::from_str::<String>(text)?
    } else {
        text.to_string()
    };
    if token.is_empty() {
        return Err(ApiError::Decode("empty token".into()));
    }
    Ok(token)
}

fn status_error(status: StatusCode, body: &[u8]) -> ApiError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .map(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    ApiError::Status {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn authenticate(&self, credentials: &Credentials) -> Result<String> {
        ApiClient::authenticate(self, credentials).await
    }

    async fn refresh(&self, token: &str) -> Result<String> {
        self.refresh_token(token).await
    }

    async fn user_info(&self, token: &str) -> Result<UserInfo> {
        ApiClient::user_info(self, token).await
    }
}

/// An [`ApiClient`] bound to whatever token its source currently holds.
pub struct Authorized {
    client: Arc<ApiClient>,
    tokens: Arc<dyn TokenSource>,
}

impl Authorized {
    pub fn new(client: Arc<ApiClient>, tokens: Arc<dyn TokenSource>) -> Self {
        Self { client, tokens }
    }

    fn token(&self) -> Result<String> {
        self.tokens.current_token().ok_or(ApiError::NotAuthenticated)
    }
}

#[async_trait]
impl TurnServer for Authorized {
    async fn latest_year(&self, session_id: &str) -> Result<u32> {
        self.client
            .latest_turn_year(&self.token()?, session_id)
            .await
    }

    async fn submit_turn(&self, session_id: &str, year: u32, data: &[u8]) -> Result<()> {
        self.client
            .submit_turn(&self.token()?, session_id, year, data)
            .await
    }

    async fn latest_turn(&self, session_id: &str) -> Result<TurnFiles> {
        self.client
            .latest_turn_files(&self.token()?, session_id)
            .await
    }
}

#[async_trait]
impl SessionDirectory for Authorized {
    async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.client.list_sessions(&self.token()?).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.client.get_session(&self.token()?, session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_plain_and_quoted() {
        assert_eq!(parse_token(b"abc.def.ghi\n").unwrap(), "abc.def.ghi");
        assert_eq!(parse_token(b"\"abc.def\"").unwrap(), "abc.def");
        assert!(parse_token(b"  ").is_err());
    }

    #[test]
    fn test_status_error_prefers_message_field() {
        let err = status_error(StatusCode::CONFLICT, br#"{"code":409,"message":"turn closed"}"#);
        match err {
            ApiError::Status { status, message } => {
                assert_eq!(status, 409);
                assert_eq!(message, "turn closed");
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = status_error(StatusCode::BAD_GATEWAY, b"upstream down");
        assert!(err.to_string().contains("upstream down"));
    }

    #[test]
    fn test_paths_and_websocket_url() {
        assert_eq!(turn_path("s1", 2400), "/api/v1/sessions/s1/turns/2400");
        assert_eq!(latest_turn_path("s1"), "/api/v1/sessions/s1/turns/latest");

        let client = ApiClient::new("https://stars.example.com/", Duration::from_secs(5)).unwrap();
        let ws = client.websocket_url("/api/v1/notifications").unwrap();
        assert_eq!(ws.as_str(), "wss://stars.example.com/api/v1/notifications");

        let client = ApiClient::new("http://localhost:8080", Duration::from_secs(5)).unwrap();
        let ws = client.websocket_url("/api/v1/notifications").unwrap();
        assert_eq!(ws.as_str(), "ws://localhost:8080/api/v1/notifications");

        assert!(ApiClient::new("ftp://nope", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_ready_seat() {
        let session: Session = serde_json::from_str(
            r#"{"id":"s","state":"started","players":[
                {"user_profile_id":"u1","ready":true},
                {"user_profile_id":"me","ready":true}]}"#,
        )
        .unwrap();
        assert_eq!(session.ready_seat("me"), Some(1));
        assert_eq!(session.ready_seat("ghost"), None);

        let pending = Session {
            state: "pending".into(),
            ..session
        };
        assert_eq!(pending.ready_seat("me"), None);
    }

    #[test]
    fn test_turn_files_decode() {
        let files: TurnFiles = serde_json::from_str(
            r#"{"year":2401,"turn":{"universe":"eHk=","turn":""}}"#,
        )
        .unwrap();
        assert_eq!(files.year, 2401);
        assert_eq!(files.universe_bytes().unwrap(), Some(b"xy".to_vec()));
        assert_eq!(files.turn_bytes().unwrap(), None);

        let bad = TurnFiles {
            turn: TurnData {
                universe: String::new(),
                turn: "not base64!".into(),
            },
            ..files
        };
        assert!(matches!(bad.turn_bytes(), Err(ApiError::Decode(_))));
    }

    #[test]
    fn test_credentials_debug_redacts_key() {
        let creds = Credentials {
            nickname: "ann".into(),
            apikey: "secret".into(),
        };
        assert!(!format!("{:?}", creds).contains("secret"));
    }
}
