//! One delivery attempt for one subscription.
//!
//! The attempt holds the subscription's row lease from the due check until
//! the outcome is committed, so concurrent drivers never deliver the same
//! occurrence twice. The lease is renewed before rendering and again before
//! sending; an attempt that finds it taken over stops without sending. `last_scheduled_run` is committed before anything is
//! rendered or sent: a crash mid-delivery loses that occurrence rather than
//! repeating it.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::history::{self, HistoryEntry, RunStatus};
use super::{ExecuteError, Subscription};
use crate::config::{DeliveryConfig, SchedulerConfig, SettingsSource};
use crate::delivery::{compose_snapshot, Mailer, Renderer};
use crate::report::resolve_parameters;
use crate::storage::subscriptions::{self, LockAttempt};
use crate::storage::{reports, Pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    NotDue,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Sent => "sent",
            Outcome::NotDue => "not due",
        })
    }
}

pub struct Executor {
    pool: Pool,
    renderer: Arc<dyn Renderer>,
    mailer: Arc<dyn Mailer>,
    settings: Arc<dyn SettingsSource>,
    delivery: DeliveryConfig,
    scheduler: SchedulerConfig,
}

impl Executor {
    pub fn new(
        pool: Pool,
        renderer: Arc<dyn Renderer>,
        mailer: Arc<dyn Mailer>,
        settings: Arc<dyn SettingsSource>,
        delivery: DeliveryConfig,
        scheduler: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            renderer,
            mailer,
            settings,
            delivery,
            scheduler,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Deliver subscription `id` if it is due at `now`, or unconditionally
    /// when `force_run` is set. A forced run leaves `last_scheduled_run`
    /// untouched.
    pub async fn execute(
        &self,
        id: i64,
        force_run: bool,
        now: NaiveDateTime,
    ) -> Result<Outcome, ExecuteError> {
        let holder = Uuid::new_v4().to_string();
        let sub = self.acquire(id, &holder).await?;

        if !force_run && !sub.is_due(now) {
            subscriptions::release(&self.pool, id, &holder)?;
            debug!(subscription = id, "Not due");
            return Ok(Outcome::NotDue);
        }

        let started = Instant::now();
        let result = self.deliver_locked(&sub, &holder, force_run, now).await;
        let succeeded = result.is_ok();

        let still_held = subscriptions::finish(&self.pool, id, &holder, succeeded);

        let elapsed = chrono::Duration::from_std(started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let entry = HistoryEntry {
            subscription_id: id,
            status: if succeeded { RunStatus::Sent } else { RunStatus::Failed },
            forced: force_run,
            result_summary: result.as_ref().err().map(ToString::to_string),
            started_at: now,
            finished_at: Some(now + elapsed),
        };
        if let Err(e) = history::record(&self.pool, &entry) {
            warn!(subscription = id, "Failed to record delivery history: {:#}", e);
        }

        match still_held {
            Ok(true) => {}
            Ok(false) => warn!(subscription = id, "Lease expired before the outcome was committed"),
            Err(e) => error!(subscription = id, "Failed to commit delivery outcome: {:#}", e),
        }
        result?;

        info!(subscription = id, recipient = %sub.recipient, forced = force_run, "Report sent");
        Ok(Outcome::Sent)
    }

    /// Wait for the row lease, polling until it is free or the wait budget
    /// runs out.
    async fn acquire(&self, id: i64, holder: &str) -> Result<Subscription, ExecuteError> {
        let started = Instant::now();
        loop {
            match subscriptions::try_lock(&self.pool, id, holder, self.scheduler.lease())? {
                LockAttempt::Acquired(sub) => return Ok(sub),
                LockAttempt::Missing => return Err(ExecuteError::NotFound { id }),
                LockAttempt::Held => {
                    let waited = started.elapsed();
                    if waited >= self.scheduler.lock_wait() {
                        return Err(ExecuteError::LockTimeout { id, waited });
                    }
                    debug!(subscription = id, ?waited, "Lease held elsewhere, waiting");
                    tokio::time::sleep(self.scheduler.lock_poll()).await;
                }
            }
        }
    }

    fn renew_lease(&self, id: i64, holder: &str) -> Result<(), ExecuteError> {
        if subscriptions::renew(&self.pool, id, holder, self.scheduler.lease())? {
            Ok(())
        } else {
            Err(ExecuteError::LeaseLost { id })
        }
    }

    async fn deliver_locked(
        &self,
        sub: &Subscription,
        holder: &str,
        force_run: bool,
        now: NaiveDateTime,
    ) -> Result<(), ExecuteError> {
        if !force_run && !subscriptions::mark_scheduled(&self.pool, sub.id, holder, now)? {
            return Err(ExecuteError::LeaseLost { id: sub.id });
        }

        let base_url = self
            .delivery
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                ExecuteError::Configuration("delivery.base_url is not set".to_string())
            })?;
        if !self.renderer.is_available() {
            return Err(ExecuteError::Configuration(
                "no render service configured (render.base_url)".to_string(),
            ));
        }

        let report = reports::get(&self.pool, sub.report_id)?.ok_or(ExecuteError::ReportNotFound {
            id: sub.report_id,
        })?;
        let request = resolve_parameters(
            &report,
            sub.report_parameters.as_deref(),
            self.settings.as_ref(),
            now,
        )?;

        self.renew_lease(sub.id, holder)?;
        debug!(subscription = sub.id, report = report.id, query = %request.query_string(), "Rendering");
        let document = self.renderer.render(&request).await?;

        let email = compose_snapshot(
            &report,
            sub,
            base_url,
            self.delivery.sender.as_deref(),
            document,
        )?;
        self.renew_lease(sub.id, holder)?;
        self.mailer.send(&email).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticSettings;
    use crate::delivery::{DeliveryError, Document, Email};
    use crate::report::ReportRequest;
    use crate::scheduler::{NewSubscription, Recurrence};
    use crate::storage::{self, test_pool};
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveTime};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeRenderer {
        delay: Duration,
        fail: bool,
        unavailable: bool,
        requests: Mutex<Vec<ReportRequest>>,
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        fn is_available(&self) -> bool {
            !self.unavailable
        }

        async fn render(&self, request: &ReportRequest) -> Result<Document, DeliveryError> {
            self.requests.lock().unwrap().push(request.clone());
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(DeliveryError::Render("boom".into()));
            }
            Ok(Document {
                bytes: b"%PDF".to_vec(),
                content_type: "application/pdf".into(),
            })
        }
    }

    #[derive(Default)]
    struct FakeMailer {
        sent: Mutex<Vec<Email>>,
    }

    #[async_trait]
    impl Mailer for FakeMailer {
        async fn send(&self, email: &Email) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn ts(day: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn seed(pool: &Pool) -> i64 {
        let report_id = reports::insert_report(pool, "Daily Sales", "").unwrap();
        subscriptions::insert(
            pool,
            &NewSubscription {
                report_id,
                recipient: "ops@example.com".parse().unwrap(),
                recurrence: Recurrence::Daily,
                time_of_day: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                report_parameters: Some("?region=EMEA".into()),
                email_subject: "Sales".into(),
                email_body_extra: String::new(),
            },
        )
        .unwrap()
    }

    fn executor(
        pool: &Pool,
        renderer: Arc<FakeRenderer>,
        mailer: Arc<FakeMailer>,
        base_url: Option<&str>,
        lock_wait_secs: u64,
    ) -> Executor {
        executor_with_lease(pool, renderer, mailer, base_url, lock_wait_secs, 60)
    }

    fn executor_with_lease(
        pool: &Pool,
        renderer: Arc<FakeRenderer>,
        mailer: Arc<FakeMailer>,
        base_url: Option<&str>,
        lock_wait_secs: u64,
        lease_secs: u64,
    ) -> Executor {
        Executor::new(
            pool.clone(),
            renderer,
            mailer,
            Arc::new(StaticSettings::default()),
            DeliveryConfig {
                base_url: base_url.map(Into::into),
                sender: None,
            },
            SchedulerConfig {
                lease_secs,
                lock_wait_secs,
                lock_poll_ms: 10,
            },
        )
    }

    fn setup() -> (tempfile::TempDir, Pool, i64, Arc<FakeRenderer>, Arc<FakeMailer>) {
        let (dir, pool) = test_pool();
        let id = seed(&pool);
        (dir, pool, id, Arc::default(), Arc::default())
    }

    #[tokio::test]
    async fn test_due_subscription_is_sent_and_committed() {
        let (_dir, pool, id, renderer, mailer) = setup();
        let exec = executor(&pool, renderer.clone(), mailer.clone(), Some("https://r.example.com"), 5);

        let outcome = exec.execute(id, false, ts(1, 7)).await.unwrap();
        assert_eq!(outcome, Outcome::Sent);

        let sub = subscriptions::get(&pool, id).unwrap().unwrap();
        assert_eq!(sub.last_scheduled_run, Some(ts(1, 7)));
        assert!(sub.last_run_succeeded);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Scheduled Report - Sales");
        assert_eq!(renderer.requests.lock().unwrap()[0].get("region"), Some("EMEA"));

        let hist = history::recent(&pool, Some(id), 10).unwrap();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].status, RunStatus::Sent);
    }

    #[tokio::test]
    async fn test_not_due_leaves_record_untouched() {
        let (_dir, pool, id, renderer, mailer) = setup();
        let exec = executor(&pool, renderer, mailer.clone(), Some("https://r.example.com"), 5);

        // Before time_of_day.
        assert_eq!(exec.execute(id, false, ts(1, 5)).await.unwrap(), Outcome::NotDue);

        let sub = subscriptions::get(&pool, id).unwrap().unwrap();
        assert!(sub.last_scheduled_run.is_none());
        assert!(mailer.sent.lock().unwrap().is_empty());
        assert!(history::recent(&pool, Some(id), 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_same_day_is_not_due() {
        let (_dir, pool, id, renderer, mailer) = setup();
        let exec = executor(&pool, renderer, mailer.clone(), Some("https://r.example.com"), 5);

        assert_eq!(exec.execute(id, false, ts(1, 7)).await.unwrap(), Outcome::Sent);
        assert_eq!(exec.execute(id, false, ts(1, 23)).await.unwrap(), Outcome::NotDue);
        assert_eq!(exec.execute(id, false, ts(2, 7)).await.unwrap(), Outcome::Sent);
        assert_eq!(mailer.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_forced_run_does_not_move_schedule() {
        let (_dir, pool, id, renderer, mailer) = setup();
        let exec = executor(&pool, renderer, mailer.clone(), Some("https://r.example.com"), 5);

        assert_eq!(exec.execute(id, true, ts(1, 5)).await.unwrap(), Outcome::Sent);

        let sub = subscriptions::get(&pool, id).unwrap().unwrap();
        assert!(sub.last_scheduled_run.is_none());
        assert!(sub.last_run_succeeded);
        assert!(history::recent(&pool, Some(id), 1).unwrap()[0].forced);
    }

    #[tokio::test]
    async fn test_render_failure_is_recorded_and_not_retried() {
        let (_dir, pool, id, _, mailer) = setup();
        let renderer = Arc::new(FakeRenderer {
            fail: true,
            ..Default::default()
        });
        let exec = executor(&pool, renderer, mailer.clone(), Some("https://r.example.com"), 5);

        let err = exec.execute(id, false, ts(1, 7)).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Delivery(DeliveryError::Render(_))));

        let sub = subscriptions::get(&pool, id).unwrap().unwrap();
        assert_eq!(sub.last_scheduled_run, Some(ts(1, 7)));
        assert!(!sub.last_run_succeeded);
        assert!(mailer.sent.lock().unwrap().is_empty());

        let hist = history::recent(&pool, Some(id), 10).unwrap();
        assert_eq!(hist[0].status, RunStatus::Failed);
        assert!(hist[0].result_summary.as_deref().unwrap().contains("boom"));

        // The occurrence was consumed, and the lease was released.
        assert_eq!(exec.execute(id, false, ts(1, 8)).await.unwrap(), Outcome::NotDue);
    }

    #[tokio::test]
    async fn test_missing_base_url_is_a_configuration_error() {
        let (_dir, pool, id, renderer, mailer) = setup();
        let exec = executor(&pool, renderer, mailer, None, 5);

        let err = exec.execute(id, false, ts(1, 7)).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Configuration(_)));
        let sub = subscriptions::get(&pool, id).unwrap().unwrap();
        assert!(!sub.last_run_succeeded);
    }

    #[tokio::test]
    async fn test_unavailable_renderer_is_a_configuration_error() {
        let (_dir, pool, id, _, mailer) = setup();
        let renderer = Arc::new(FakeRenderer {
            unavailable: true,
            ..Default::default()
        });
        let exec = executor(&pool, renderer, mailer, Some("https://r.example.com"), 5);

        let err = exec.execute(id, true, ts(1, 7)).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unknown_subscription() {
        let (_dir, pool, _, renderer, mailer) = setup();
        let exec = executor(&pool, renderer, mailer, Some("https://r.example.com"), 5);
        let err = exec.execute(999, false, ts(1, 7)).await.unwrap_err();
        assert!(matches!(err, ExecuteError::NotFound { id: 999 }));
    }

    #[tokio::test]
    async fn test_gives_up_when_lease_is_held() {
        let (_dir, pool, id, renderer, mailer) = setup();
        let lease = Duration::from_secs(60);
        assert!(matches!(
            subscriptions::try_lock(&pool, id, "other-process", lease).unwrap(),
            LockAttempt::Acquired(_)
        ));

        let exec = executor(&pool, renderer, mailer.clone(), Some("https://r.example.com"), 0);
        let err = exec.execute(id, false, ts(1, 7)).await.unwrap_err();
        assert!(matches!(err, ExecuteError::LockTimeout { .. }));
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_attempts_send_once() {
        let (_dir, pool, id, _, mailer) = setup();
        let renderer = Arc::new(FakeRenderer {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let exec = Arc::new(executor(&pool, renderer, mailer.clone(), Some("https://r.example.com"), 5));

        let now = ts(1, 7);
        let a = tokio::spawn({
            let exec = exec.clone();
            async move { exec.execute(id, false, now).await }
        });
        let b = tokio::spawn({
            let exec = exec.clone();
            async move { exec.execute(id, false, now).await }
        });

        let mut outcomes = vec![a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        outcomes.sort_by_key(|o| *o == Outcome::NotDue);
        assert_eq!(outcomes, vec![Outcome::Sent, Outcome::NotDue]);
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_executors_on_separate_pools_send_once() {
        let (dir, pool, id, _, mailer) = setup();
        let other_pool = storage::open_pool(dir.path().join("test.db").to_str().unwrap()).unwrap();
        let slow = || {
            Arc::new(FakeRenderer {
                delay: Duration::from_millis(200),
                ..Default::default()
            })
        };
        let a = executor(&pool, slow(), mailer.clone(), Some("https://r.example.com"), 5);
        let b = executor(&other_pool, slow(), mailer.clone(), Some("https://r.example.com"), 5);

        let now = ts(1, 7);
        let a = tokio::spawn(async move { a.execute(id, false, now).await });
        let b = tokio::spawn(async move { b.execute(id, false, now).await });

        let mut outcomes = vec![a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        outcomes.sort_by_key(|o| *o == Outcome::NotDue);
        assert_eq!(outcomes, vec![Outcome::Sent, Outcome::NotDue]);
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
        assert_eq!(history::recent(&pool, Some(id), 10).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lease_expiry_mid_render_stops_before_send() {
        let (_dir, pool, id, _, mailer) = setup();
        let renderer = Arc::new(FakeRenderer {
            delay: Duration::from_millis(2500),
            ..Default::default()
        });
        let slow = executor_with_lease(&pool, renderer, mailer.clone(), Some("https://r.example.com"), 5, 1);
        let other = executor(&pool, Arc::default(), mailer.clone(), Some("https://r.example.com"), 5);

        let now = ts(1, 7);
        let a = tokio::spawn(async move { slow.execute(id, false, now).await });
        tokio::time::sleep(Duration::from_millis(1800)).await;
        let b = other.execute(id, false, now).await;
        let a = a.await.unwrap();

        // The takeover sees the committed occurrence; the stale holder gives up.
        assert!(matches!(b, Ok(Outcome::NotDue)));
        assert!(matches!(a, Err(ExecuteError::LeaseLost { id: lost }) if lost == id));
        assert!(mailer.sent.lock().unwrap().is_empty());

        let sub = subscriptions::get(&pool, id).unwrap().unwrap();
        assert_eq!(sub.last_scheduled_run, Some(now));
        assert!(!sub.last_run_succeeded);

        let hist = history::recent(&pool, Some(id), 10).unwrap();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].status, RunStatus::Failed);
        assert!(hist[0].result_summary.as_deref().unwrap().contains("taken over"));

        // The lease is free again.
        assert!(matches!(
            subscriptions::try_lock(&pool, id, "next", Duration::from_secs(60)).unwrap(),
            LockAttempt::Acquired(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forced_run_that_loses_lease_does_not_send_twice() {
        let (_dir, pool, id, _, mailer) = setup();
        let renderer = Arc::new(FakeRenderer {
            delay: Duration::from_millis(2500),
            ..Default::default()
        });
        let slow = executor_with_lease(&pool, renderer, mailer.clone(), Some("https://r.example.com"), 5, 1);
        let other = executor(&pool, Arc::default(), mailer.clone(), Some("https://r.example.com"), 5);

        let now = ts(1, 7);
        let forced = tokio::spawn(async move { slow.execute(id, true, now).await });
        tokio::time::sleep(Duration::from_millis(1800)).await;

        // A forced run does not consume the occurrence, so the scheduled
        // driver that takes over still delivers it.
        assert_eq!(other.execute(id, false, now).await.unwrap(), Outcome::Sent);
        assert!(matches!(forced.await.unwrap(), Err(ExecuteError::LeaseLost { .. })));
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);

        let hist = history::recent(&pool, Some(id), 10).unwrap();
        let statuses: Vec<_> = hist.iter().map(|h| h.status).collect();
        assert_eq!(statuses.iter().filter(|s| **s == RunStatus::Sent).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == RunStatus::Failed).count(), 1);
    }
}
