use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use turnsync_core::api::{self, TurnServer};
use turnsync_core::config::MonitorConfig;
use turnsync_core::{
    FingerprintStore, OrderValidator, Reconciler, SqliteStore, SubmissionEvent,
    SubmissionOutcome, ValidatedOrder, ValidationError, WatchCoordinator, WatchedSession,
};

const SERVER: &str = "http://stars.test";

#[derive(Default)]
struct RecordingServer {
    year: u32,
    uploads: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl TurnServer for RecordingServer {
    async fn latest_year(&self, _session_id: &str) -> api::Result<u32> {
        Ok(self.year)
    }

    async fn submit_turn(&self, _session_id: &str, _year: u32, data: &[u8]) -> api::Result<()> {
        self.uploads.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn latest_turn(&self, _session_id: &str) -> api::Result<api::TurnFiles> {
        Ok(api::TurnFiles {
            year: self.year,
            ..Default::default()
        })
    }
}

/// First line of the file is the year, the rest is the order body.
struct YearHeaderValidator;

impl OrderValidator for YearHeaderValidator {
    fn validate(&self, path: &Path) -> Result<ValidatedOrder, ValidationError> {
        let data = fs::read(path)?;
        let text = String::from_utf8_lossy(&data);
        let header = text
            .lines()
            .next()
            .ok_or_else(|| ValidationError::NotReady("empty file".into()))?;
        let year = header
            .trim()
            .parse()
            .map_err(|_| ValidationError::Malformed(format!("bad year header {:?}", header)))?;
        Ok(ValidatedOrder { year, data })
    }
}

fn watched(dir: &Path) -> WatchedSession {
    WatchedSession {
        connection: SERVER.into(),
        connection_name: "Stars".into(),
        session_id: "sess-A".into(),
        seat: 2,
        game_dir: dir.to_path_buf(),
    }
}

fn coordinator(db: &Path, server: Arc<RecordingServer>) -> WatchCoordinator {
    let store = SqliteStore::open(db).unwrap();
    let fingerprints = Arc::new(FingerprintStore::open(Arc::new(store)).unwrap());
    WatchCoordinator::new(
        SERVER,
        MonitorConfig::default(),
        Arc::new(YearHeaderValidator),
        Arc::new(Reconciler::new(fingerprints, server)),
    )
}

async fn next_event(rx: &mut broadcast::Receiver<SubmissionEvent>) -> SubmissionEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no submission event")
        .unwrap()
}

#[tokio::test]
async fn test_saved_order_is_uploaded_once() {
    let tmp = TempDir::new().unwrap();
    let game_dir = tmp.path().join("game");
    fs::create_dir_all(&game_dir).unwrap();
    let server = Arc::new(RecordingServer {
        year: 2401,
        ..Default::default()
    });
    let coord = coordinator(&tmp.path().join("db.sqlite3"), server.clone());
    let mut events = coord.subscribe();

    coord.watch(watched(&game_dir)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The game rewrites the file a few times while saving.
    let order = game_dir.join("game.x3");
    fs::write(&order, b"2401\n").unwrap();
    fs::write(&order, b"2401\nmove fleet 1").unwrap();
    fs::write(&order, b"2401\nmove fleet 1\nbuild").unwrap();
    // Other seats' files are ignored.
    fs::write(game_dir.join("game.x1"), b"2401\nnot mine").unwrap();

    let ev = next_event(&mut events).await;
    assert_eq!(ev.outcome, SubmissionOutcome::Uploaded);
    assert_eq!(ev.year, 2401);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(
        server.uploads.lock().unwrap().as_slice(),
        &[b"2401\nmove fleet 1\nbuild".to_vec()]
    );

    fs::write(&order, b"2401\ntampered").unwrap();
    let ev = next_event(&mut events).await;
    assert!(matches!(ev.outcome, SubmissionOutcome::Conflict { .. }));
    assert_eq!(server.uploads.lock().unwrap().len(), 1);

    coord.stop_all();
}

#[tokio::test]
async fn test_rescan_after_restart_skips_submitted_order() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("db.sqlite3");
    let game_dir = tmp.path().join("game");
    fs::create_dir_all(&game_dir).unwrap();
    fs::write(game_dir.join("game.x3"), b"2401\norders").unwrap();

    let server = Arc::new(RecordingServer {
        year: 2401,
        ..Default::default()
    });

    {
        let coord = coordinator(&db, server.clone());
        let mut events = coord.subscribe();
        coord.rescan(&watched(&game_dir)).await;
        assert_eq!(next_event(&mut events).await.outcome, SubmissionOutcome::Uploaded);
    }

    let coord = coordinator(&db, server.clone());
    let mut events = coord.subscribe();
    coord.rescan(&watched(&game_dir)).await;
    assert_eq!(
        next_event(&mut events).await.outcome,
        SubmissionOutcome::AlreadySubmitted
    );
    assert_eq!(server.uploads.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_order_is_ignored() {
    let tmp = TempDir::new().unwrap();
    let game_dir = tmp.path().join("game");
    fs::create_dir_all(&game_dir).unwrap();
    let server = Arc::new(RecordingServer {
        year: 2401,
        ..Default::default()
    });
    let coord = coordinator(&tmp.path().join("db.sqlite3"), server.clone());
    let mut events = coord.subscribe();

    fs::write(game_dir.join("game.x3"), b"not a year\n").unwrap();
    coord.rescan(&watched(&game_dir)).await;
    assert!(events.try_recv().is_err());
    assert!(server.uploads.lock().unwrap().is_empty());
}
