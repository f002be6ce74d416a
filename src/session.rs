//! Long-lived sync context: the cache connection, the transport and the
//! per-session state shared by the CLI and the scheduler.

use crate::db::count_prs;
use crate::error::SyncError;
use crate::github::GraphQlApi;
use crate::migrations::run_migrations;
use crate::model::PullRequestRecord;
use crate::refresh::{FetchOptions, FetchReport, fetch_graphql, fetch_rest, load_sorted, reconcile};
use crate::rest::RestApi;
use crate::schedule::{RefreshSchedule, Scheduler, SchedulerHandle, SyncEvent, load_schedule, store_schedule};
use log::{info, warn};
use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{OnceCell, mpsc};

#[derive(Clone)]
pub enum Transport {
    GraphQl(Arc<dyn GraphQlApi>),
    Rest(Arc<dyn RestApi>),
}

impl Transport {
    fn name(&self) -> &'static str {
        match self {
            Transport::GraphQl(_) => "graphql",
            Transport::Rest(_) => "rest",
        }
    }
}

struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Session {
    conn: Mutex<Connection>,
    transport: Transport,
    options: FetchOptions,
    viewer_login: OnceCell<String>,
    loading: AtomicBool,
    fetch_gate: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(conn: Connection, transport: Transport, options: FetchOptions) -> Self {
        Self {
            conn: Mutex::new(conn),
            transport,
            options,
            viewer_login: OnceCell::new(),
            loading: AtomicBool::new(false),
            fetch_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// A poisoned lock still guards a usable connection.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub async fn viewer_login(&self) -> Result<&str, SyncError> {
        let login = self
            .viewer_login
            .get_or_try_init(|| async {
                let login = match &self.transport {
                    Transport::GraphQl(api) => api.viewer_login().await?,
                    Transport::Rest(api) => api.authenticated_login().await?,
                };
                info!("Signed in to GitHub as {login}");
                Ok::<_, SyncError>(login)
            })
            .await?;
        Ok(login.as_str())
    }

    /// One fetch cycle. Fails with `FetchInProgress` while another cycle runs.
    pub async fn fetch_all(&self) -> Result<FetchReport, SyncError> {
        let Ok(_gate) = self.fetch_gate.try_lock() else {
            return Err(SyncError::FetchInProgress);
        };
        let _loading = LoadingGuard::raise(&self.loading);
        let started = Instant::now();

        let login = self.viewer_login().await?.to_string();
        info!("Fetching pull requests over {}", self.transport.name());
        let records = match &self.transport {
            Transport::GraphQl(api) => fetch_graphql(api.as_ref(), &self.options, &login).await?,
            Transport::Rest(api) => fetch_rest(api.as_ref(), &self.options, &login).await?,
        };

        let report = {
            let mut conn = self.conn();
            reconcile(&mut conn, records, started.elapsed())?
        };
        info!(
            "Fetched {} pull requests in {:.1?} ({} new, {} gone)",
            report.total,
            report.duration,
            report.added.len(),
            report.removed.len()
        );
        Ok(report)
    }

    pub fn get_pull_requests(&self) -> Result<Vec<PullRequestRecord>, SyncError> {
        load_sorted(&self.conn())
    }

    pub fn cached_count(&self) -> Result<i64, SyncError> {
        count_prs(&self.conn())
    }

    pub fn run_migrations(&self) -> Result<u32, SyncError> {
        run_migrations(&mut self.conn())
    }

    pub fn stored_schedule(&self) -> Result<Option<RefreshSchedule>, SyncError> {
        load_schedule(&self.conn())
    }

    pub fn save_schedule(&self, schedule: &RefreshSchedule) -> Result<(), SyncError> {
        store_schedule(&self.conn(), schedule)
    }

    /// Migrates, fills an empty cache, then hands refreshing to the scheduler.
    pub async fn start(
        self: &Arc<Self>,
        default_schedule: RefreshSchedule,
        events: Option<mpsc::UnboundedSender<SyncEvent>>,
    ) -> Result<SchedulerHandle, SyncError> {
        self.run_migrations()?;
        if self.cached_count()? == 0 {
            info!("Cache is empty; fetching now");
            let event = match self.fetch_all().await {
                Ok(report) => SyncEvent::Completed(report),
                Err(e) if e.is_authentication() => return Err(e),
                // The schedule still starts; the next tick retries.
                Err(e) => {
                    warn!("Initial fetch failed: {e}");
                    SyncEvent::Failed(e)
                }
            };
            if let Some(tx) = &events {
                let _ = tx.send(event);
            }
        }
        let schedule = self.stored_schedule()?.unwrap_or(default_schedule);
        Ok(Scheduler::start(self.clone(), schedule, events))
    }
}
