//! Order submission reconciliation.
//!
//! [`classify`] is the pure decision over (stored fingerprint, current
//! content). [`Reconciler::submit`] applies it: only a new upload reaches the
//! server, and only after the local year is checked against the server's.

use crate::api::{ApiError, TurnServer};
use crate::fingerprint::{compute_hash, order_key, FingerprintStore};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Nothing recorded for this year yet.
    NewUpload,
    /// Identical content was already uploaded.
    Skip,
    /// A different file was already uploaded for this year.
    Conflict { stored: String, current: String },
}

pub fn classify(stored: Option<&str>, current: &str) -> Classification {
    match stored {
        None => Classification::NewUpload,
        Some(stored) if stored == current => Classification::Skip,
        Some(stored) => Classification::Conflict {
            stored: stored.to_string(),
            current: current.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Uploaded,
    AlreadySubmitted,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reconcile: order for year {year} changed after it was submitted (stored {stored}, now {current})")]
    Conflict {
        year: u32,
        stored: String,
        current: String,
    },

    #[error("reconcile: order is for year {local} but server is at year {server}")]
    YearMismatch { local: u32, server: u32 },

    #[error("reconcile: {0}")]
    Server(#[from] ApiError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

type SubmitKey = (String, String, u32);

pub struct Reconciler {
    fingerprints: Arc<FingerprintStore>,
    server: Arc<dyn TurnServer>,
    in_flight: DashMap<SubmitKey, Arc<AsyncMutex<()>>>,
}

impl Reconciler {
    pub fn new(fingerprints: Arc<FingerprintStore>, server: Arc<dyn TurnServer>) -> Self {
        Self {
            fingerprints,
            server,
            in_flight: DashMap::new(),
        }
    }

    pub fn fingerprints(&self) -> &Arc<FingerprintStore> {
        &self.fingerprints
    }

    pub fn classify(&self, connection: &str, session: &str, year: u32, data: &[u8]) -> Classification {
        let stored = self.fingerprints.get(connection, session, &order_key(year));
        classify(stored.as_deref(), &compute_hash(data))
    }

    /// Classify and, for a new upload, push `data` to the server.
    ///
    /// Attempts for the same (connection, session, year) are serialized, so a
    /// second attempt with identical bytes observes the first one's fingerprint
    /// and resolves to [`Applied::AlreadySubmitted`].
    pub async fn submit(
        &self,
        connection: &str,
        session: &str,
        year: u32,
        data: &[u8],
    ) -> Result<Applied> {
        let slot = (connection.to_string(), session.to_string(), year);
        let lock = self.in_flight.entry(slot.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.submit_locked(connection, session, year, data).await
        };

        // Drop the slot once no other attempt is waiting on it.
        drop(lock);
        self.in_flight
            .remove_if(&slot, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn submit_locked(
        &self,
        connection: &str,
        session: &str,
        year: u32,
        data: &[u8],
    ) -> Result<Applied> {
        let current = compute_hash(data);
        let key = order_key(year);
        let stored = self.fingerprints.get(connection, session, &key);

        match classify(stored.as_deref(), &current) {
            Classification::Skip => {
                log::debug!(
                    "reconcile: order for {} year {} already submitted, skipping",
                    session,
                    year
                );
                Ok(Applied::AlreadySubmitted)
            }
            Classification::Conflict { stored, current } => {
                log::error!(
                    "reconcile: order for {} year {} changed since submission",
                    session,
                    year
                );
                Err(ReconcileError::Conflict {
                    year,
                    stored,
                    current,
                })
            }
            Classification::NewUpload => {
                let server_year = self.server.latest_year(session).await?;
                if server_year != year {
                    return Err(ReconcileError::YearMismatch {
                        local: year,
                        server: server_year,
                    });
                }

                self.server.submit_turn(session, year, data).await?;

                if let Err(e) = self.fingerprints.set(connection, session, &key, &current) {
                    log::warn!("reconcile: submitted but fingerprint not persisted: {}", e);
                }
                log::info!("reconcile: submitted order for {} year {}", session, year);
                Ok(Applied::Uploaded)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory game server recording every submission.
    #[derive(Default)]
    pub struct FakeServer {
        pub year: Mutex<u32>,
        pub submissions: Mutex<Vec<(String, u32, Vec<u8>)>>,
        pub fail_submit: Mutex<Option<String>>,
        pub delay: Mutex<Duration>,
        /// Signalled as each upload begins.
        pub started: tokio::sync::Notify,
        pub turn: Mutex<Option<crate::api::TurnFiles>>,
    }

    impl FakeServer {
        pub fn at_year(year: u32) -> Arc<Self> {
            let server = Self::default();
            *server.year.lock().unwrap() = year;
            Arc::new(server)
        }

        pub fn submission_count(&self) -> usize {
            self.submissions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TurnServer for FakeServer {
        async fn latest_year(&self, _session_id: &str) -> crate::api::Result<u32> {
            Ok(*self.year.lock().unwrap())
        }

        async fn submit_turn(
            &self,
            session_id: &str,
            year: u32,
            data: &[u8],
        ) -> crate::api::Result<()> {
            self.started.notify_one();
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(msg) = self.fail_submit.lock().unwrap().clone() {
                return Err(ApiError::Status {
                    status: 500,
                    message: msg,
                });
            }
            self.submissions
                .lock()
                .unwrap()
                .push((session_id.to_string(), year, data.to_vec()));
            Ok(())
        }

        async fn latest_turn(&self, _session_id: &str) -> crate::api::Result<crate::api::TurnFiles> {
            self.turn.lock().unwrap().clone().ok_or(ApiError::Status {
                status: 404,
                message: "no turn generated yet".into(),
            })
        }
    }
}
