//! Background refresh: a single tokio task owns the only timer and takes
//! commands from [`SchedulerHandle`].

use crate::db::{REFRESH_SCHEDULE_KEY, get_value, set_value};
use crate::error::SyncError;
use crate::refresh::FetchReport;
use crate::session::Session;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use regex::Regex;
use rusqlite::Connection;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

pub const MIN_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

static SUFFIXED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)\s*(ms|s|m|h)$").unwrap());

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn expression(&self) -> &str {
        &self.expr
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshSchedule {
    Disabled,
    Interval(Duration),
    Cron(CronSchedule),
}

impl Default for RefreshSchedule {
    fn default() -> Self {
        RefreshSchedule::Interval(DEFAULT_INTERVAL)
    }
}

impl RefreshSchedule {
    pub fn interval(every: Duration) -> Self {
        RefreshSchedule::Interval(every.max(MIN_INTERVAL))
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, RefreshSchedule::Disabled)
    }

    /// Time until the next tick, or `None` when nothing should fire.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            RefreshSchedule::Disabled => None,
            RefreshSchedule::Interval(every) => Some(*every),
            RefreshSchedule::Cron(c) => {
                let next = c.schedule.after(&now).next()?;
                Some((next - now).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

/// Crontab numbers weekdays 0-7 with Sunday as 0 and 7; the `cron` crate uses 1-7 with Sunday as 1.
fn shift_weekday(value: &str) -> Option<u32> {
    match value.parse::<u32>().ok()? {
        0 | 7 => Some(1),
        n @ 1..=6 => Some(n + 1),
        _ => None,
    }
}

/// Rewrites a crontab day-of-week field into the `cron` crate's numbering.
/// Names (`Mon-Fri`) and `*` pass through unchanged.
fn crontab_weekdays(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let numeric = base.split('-').all(|p| p.bytes().all(|b| b.is_ascii_digit()) && !p.is_empty());
        if base == "*" || !numeric {
            items.push(item.to_string());
            continue;
        }
        let bad = || format!("day of week `{item}` out of range 0-7");
        let shifted = match base.split_once('-') {
            None => shift_weekday(base).ok_or_else(bad)?.to_string(),
            Some((start, "7")) => {
                let start: u32 = start.parse().map_err(|_| bad())?;
                if start == 0 {
                    "1-7".to_string()
                } else if step.is_some() {
                    return Err(format!("stepped range `{item}` ending on Sunday is not supported"));
                } else if start <= 6 {
                    // Sunday wraps to the front: 5-7 is Fri,Sat,Sun.
                    items.push(format!("{}-7", start + 1));
                    "1".to_string()
                } else if start == 7 {
                    "1".to_string()
                } else {
                    return Err(bad());
                }
            }
            Some((start, end)) => {
                let start = shift_weekday(start).ok_or_else(bad)?;
                let end = shift_weekday(end).ok_or_else(bad)?;
                format!("{start}-{end}")
            }
        };
        match step {
            Some(step) => items.push(format!("{shifted}/{step}")),
            None => items.push(shifted),
        }
    }
    Ok(items.join(","))
}

fn parse_cron(input: &str) -> Result<RefreshSchedule, SyncError> {
    let fields: Vec<&str> = input.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let weekdays = crontab_weekdays(fields[4])
                .map_err(|reason| SyncError::invalid_schedule(input, reason))?;
            format!("0 {} {weekdays}", fields[..4].join(" "))
        }
        6 | 7 => input.to_string(),
        n => {
            return Err(SyncError::invalid_schedule(
                input,
                format!("expected 5 to 7 cron fields, got {n}"),
            ));
        }
    };
    let schedule = cron::Schedule::from_str(&normalized)
        .map_err(|e| SyncError::invalid_schedule(input, e.to_string()))?;
    Ok(RefreshSchedule::Cron(CronSchedule {
        expr: input.to_string(),
        schedule,
    }))
}

impl FromStr for RefreshSchedule {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() {
            return Err(SyncError::invalid_schedule(s, "empty"));
        }
        if matches!(input.to_ascii_lowercase().as_str(), "off" | "disabled" | "-1") {
            return Ok(RefreshSchedule::Disabled);
        }
        if input.bytes().all(|b| b.is_ascii_digit()) {
            let ms: u64 = input
                .parse()
                .map_err(|_| SyncError::invalid_schedule(input, "interval out of range"))?;
            return Ok(RefreshSchedule::interval(Duration::from_millis(ms)));
        }
        if let Some(caps) = SUFFIXED.captures(input) {
            let n: u64 = caps[1]
                .parse()
                .map_err(|_| SyncError::invalid_schedule(input, "interval out of range"))?;
            let every = match &caps[2] {
                "ms" => Duration::from_millis(n),
                "s" => Duration::from_secs(n),
                "m" => Duration::from_secs(n.saturating_mul(60)),
                _ => Duration::from_secs(n.saturating_mul(3600)),
            };
            return Ok(RefreshSchedule::interval(every));
        }
        parse_cron(input)
    }
}

impl fmt::Display for RefreshSchedule {
    /// The persisted form; parses back to the same schedule.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshSchedule::Disabled => f.write_str("off"),
            RefreshSchedule::Interval(every) => write!(f, "{}", every.as_millis()),
            RefreshSchedule::Cron(c) => f.write_str(&c.expr),
        }
    }
}

/// The persisted schedule. An unreadable value is logged and ignored.
pub fn load_schedule(conn: &Connection) -> Result<Option<RefreshSchedule>, SyncError> {
    let raw = get_value(conn, REFRESH_SCHEDULE_KEY)?;
    Ok(raw.and_then(|raw| match raw.parse::<RefreshSchedule>() {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Ignoring stored refresh schedule: {e}");
            None
        }
    }))
}

pub fn store_schedule(conn: &Connection, schedule: &RefreshSchedule) -> Result<(), SyncError> {
    set_value(conn, REFRESH_SCHEDULE_KEY, &schedule.to_string())
}

#[derive(Debug)]
pub enum SyncEvent {
    Completed(FetchReport),
    /// A tick arrived while the previous fetch was still running.
    Skipped,
    Failed(SyncError),
}

#[derive(Debug)]
enum SchedulerCommand {
    SetSchedule(RefreshSchedule),
    Trigger,
    Stop,
}

#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    current: Arc<RwLock<RefreshSchedule>>,
    session: Arc<Session>,
}

impl SchedulerHandle {
    /// Persists the schedule, then swaps the timer. An in-flight fetch keeps running.
    pub async fn set_schedule(&self, schedule: RefreshSchedule) -> Result<(), SyncError> {
        self.session.save_schedule(&schedule)?;
        self.send(SchedulerCommand::SetSchedule(schedule.clone())).await?;
        *self.current.write().await = schedule;
        Ok(())
    }

    pub async fn trigger(&self) -> Result<(), SyncError> {
        self.send(SchedulerCommand::Trigger).await
    }

    pub async fn current(&self) -> RefreshSchedule {
        self.current.read().await.clone()
    }

    pub async fn stop(&self) -> Result<(), SyncError> {
        self.send(SchedulerCommand::Stop).await
    }

    async fn send(&self, command: SchedulerCommand) -> Result<(), SyncError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::SchedulerStopped)
    }
}

pub struct Scheduler;

impl Scheduler {
    pub fn start(
        session: Arc<Session>,
        schedule: RefreshSchedule,
        events: Option<mpsc::UnboundedSender<SyncEvent>>,
    ) -> SchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(16);
        let current = Arc::new(RwLock::new(schedule.clone()));
        info!("Refresh schedule: {}", describe(&schedule));

        tokio::spawn(run_scheduler(session.clone(), schedule, command_rx, events));

        SchedulerHandle {
            command_tx,
            current,
            session,
        }
    }
}

pub fn describe(schedule: &RefreshSchedule) -> String {
    match schedule {
        RefreshSchedule::Disabled => "disabled".to_string(),
        RefreshSchedule::Interval(every) => format!("every {}s", every.as_secs_f64()),
        RefreshSchedule::Cron(c) => format!("cron \"{}\"", c.expression()),
    }
}

async fn run_scheduler(
    session: Arc<Session>,
    mut schedule: RefreshSchedule,
    mut command_rx: mpsc::Receiver<SchedulerCommand>,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
) {
    loop {
        let delay = schedule.next_delay(Utc::now());
        let tick = async move {
            match delay {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tick => {
                debug!("Refresh tick");
                spawn_fetch(&session, &events);
            }
            cmd = command_rx.recv() => match cmd {
                Some(SchedulerCommand::SetSchedule(next)) => {
                    info!("Refresh schedule changed: {}", describe(&next));
                    schedule = next;
                }
                Some(SchedulerCommand::Trigger) => spawn_fetch(&session, &events),
                Some(SchedulerCommand::Stop) | None => {
                    info!("Scheduler stopped");
                    break;
                }
            }
        }
    }
}

fn spawn_fetch(session: &Arc<Session>, events: &Option<mpsc::UnboundedSender<SyncEvent>>) {
    let session = session.clone();
    let events = events.clone();
    tokio::spawn(async move {
        let event = match session.fetch_all().await {
            Ok(report) => SyncEvent::Completed(report),
            Err(SyncError::FetchInProgress) => {
                warn!("Skipping refresh: previous fetch still running");
                SyncEvent::Skipped
            }
            Err(e) => {
                warn!("Refresh failed: {e}");
                SyncEvent::Failed(e)
            }
        };
        if let Some(tx) = events {
            let _ = tx.send(event);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::tests::{FakeGraphQl, node};
    use crate::session::tests::graphql_session;
    use chrono::TimeZone;
    use tokio::sync::Notify;

    #[test]
    fn parses_disabled_forms() {
        for input in ["off", "OFF", "disabled", "-1"] {
            assert_eq!(input.parse::<RefreshSchedule>().unwrap(), RefreshSchedule::Disabled);
        }
    }

    #[test]
    fn parses_intervals_with_floor() {
        let parse = |s: &str| s.parse::<RefreshSchedule>().unwrap();
        assert_eq!(parse("300000"), RefreshSchedule::Interval(Duration::from_secs(300)));
        assert_eq!(parse("30s"), RefreshSchedule::Interval(Duration::from_secs(30)));
        assert_eq!(parse("5m"), RefreshSchedule::Interval(Duration::from_secs(300)));
        assert_eq!(parse("1h"), RefreshSchedule::Interval(Duration::from_secs(3600)));
        assert_eq!(parse("0"), RefreshSchedule::Interval(MIN_INTERVAL));
        assert_eq!(parse("10ms"), RefreshSchedule::Interval(MIN_INTERVAL));
    }

    #[test]
    fn parses_cron_expressions() {
        let five = "*/15 * * * *".parse::<RefreshSchedule>().unwrap();
        let RefreshSchedule::Cron(c) = &five else {
            panic!("expected cron, got {five:?}");
        };
        assert_eq!(c.expression(), "*/15 * * * *");
        assert!("0 0 9 * * Mon-Fri".parse::<RefreshSchedule>().is_ok());
    }

    #[test]
    fn crontab_weekdays_shift_to_cron_numbering() {
        assert_eq!(crontab_weekdays("*").unwrap(), "*");
        assert_eq!(crontab_weekdays("0").unwrap(), "1");
        assert_eq!(crontab_weekdays("7").unwrap(), "1");
        assert_eq!(crontab_weekdays("1-5").unwrap(), "2-6");
        assert_eq!(crontab_weekdays("0,3,6").unwrap(), "1,4,7");
        assert_eq!(crontab_weekdays("5-7").unwrap(), "6-7,1");
        assert_eq!(crontab_weekdays("0-7").unwrap(), "1-7");
        assert_eq!(crontab_weekdays("1-5/2").unwrap(), "2-6/2");
        assert_eq!(crontab_weekdays("Mon-Fri").unwrap(), "Mon-Fri");
        assert!(crontab_weekdays("8").is_err());
    }

    #[test]
    fn weekday_crontab_skips_the_weekend() {
        let friday = Utc.with_ymd_and_hms(2024, 5, 3, 10, 0, 0).unwrap();
        let weekdays: RefreshSchedule = "0 9 * * 1-5".parse().unwrap();
        // Next run is Monday 2024-05-06 09:00.
        assert_eq!(weekdays.next_delay(friday), Some(Duration::from_secs(71 * 3600)));

        let sundays: RefreshSchedule = "0 9 * * 0".parse().unwrap();
        assert_eq!(sundays.next_delay(friday), Some(Duration::from_secs(47 * 3600)));
        assert_eq!(sundays.to_string(), "0 9 * * 0");
    }

    #[test]
    fn rejects_garbage() {
        for input in ["", "soon", "* * *", "1 2 3 4 5 6 7 8", "99 * * * *"] {
            let err = input.parse::<RefreshSchedule>().unwrap_err();
            assert!(matches!(err, SyncError::InvalidSchedule { .. }), "input {input:?}");
        }
    }

    #[test]
    fn display_round_trips() {
        for input in ["off", "30000", "*/5 * * * *"] {
            let parsed: RefreshSchedule = input.parse().unwrap();
            assert_eq!(parsed.to_string(), input);
        }
    }

    #[test]
    fn cron_next_delay_from_fixed_instant() {
        let schedule: RefreshSchedule = "*/15 * * * *".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 7, 30).unwrap();
        assert_eq!(schedule.next_delay(now), Some(Duration::from_secs(7 * 60 + 30)));
        assert_eq!(RefreshSchedule::Disabled.next_delay(now), None);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_stops_firing_and_new_schedule_resumes() {
        let (session, api) = graphql_session(FakeGraphQl::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Scheduler::start(
            session.clone(),
            RefreshSchedule::Interval(Duration::from_secs(60)),
            Some(tx),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(matches!(rx.recv().await, Some(SyncEvent::Completed(_))));

        handle.set_schedule(RefreshSchedule::Disabled).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(api.search_calls(), 1);
        assert_eq!(handle.current().await, RefreshSchedule::Disabled);

        let every_30s = RefreshSchedule::Interval(Duration::from_secs(30));
        handle.set_schedule(every_30s.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(matches!(rx.recv().await, Some(SyncEvent::Completed(_))));
        assert_eq!(session.stored_schedule().unwrap(), Some(every_30s));

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_schedule_changes_keep_one_timer() {
        let (session, api) = graphql_session(FakeGraphQl::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Scheduler::start(session, RefreshSchedule::Disabled, Some(tx));

        for _ in 0..5 {
            handle
                .set_schedule(RefreshSchedule::Interval(Duration::from_secs(60)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(matches!(rx.recv().await, Some(SyncEvent::Completed(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(api.search_calls(), 1);
    }

    #[tokio::test]
    async fn trigger_fetches_immediately() {
        let api = FakeGraphQl::default();
        api.push_page(vec![node(1, "2024-05-02T01:00:00Z")], None);
        let (session, _api) = graphql_session(api);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Scheduler::start(session.clone(), RefreshSchedule::Disabled, Some(tx));

        handle.trigger().await.unwrap();
        let Some(SyncEvent::Completed(report)) = rx.recv().await else {
            panic!("expected a completed fetch");
        };
        assert_eq!(report.total, 1);
        assert_eq!(session.get_pull_requests().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let api = FakeGraphQl::default();
        let release = Arc::new(Notify::new());
        *api.hold.lock().unwrap() = Some(release.clone());
        let (session, _api) = graphql_session(api);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Scheduler::start(session.clone(), RefreshSchedule::Disabled, Some(tx));

        handle.trigger().await.unwrap();
        while !session.is_loading() {
            tokio::task::yield_now().await;
        }
        handle.trigger().await.unwrap();
        assert!(matches!(rx.recv().await, Some(SyncEvent::Skipped)));

        release.notify_one();
        assert!(matches!(rx.recv().await, Some(SyncEvent::Completed(_))));
    }

    #[tokio::test]
    async fn stopped_scheduler_rejects_commands() {
        let (session, _api) = graphql_session(FakeGraphQl::default());
        let handle = Scheduler::start(session, RefreshSchedule::Disabled, None);
        handle.stop().await.unwrap();
        // Wait for the task to drop its receiver.
        while !handle.command_tx.is_closed() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(handle.trigger().await, Err(SyncError::SchedulerStopped)));
    }
}
