//! Keyword monitor.
//!
//! Lifecycle: boot (best-effort token refresh) → bootstrap (first run only:
//! seed dedup state from everything currently visible, no notifications) →
//! poll every `interval` until cancelled.
//!
//! Each tick queries keywords one at a time. A failed query is logged and
//! alerted, then the tick moves on. A matching activity with the
//! timed-purchase label that is not yet in the "timed" set triggers a
//! structured notification; the id is committed only after the notification
//! succeeds, so a failed dispatch is retried next tick.
//!
//! Cancellation is checked while waiting for the next tick and between
//! keywords. An in-flight request is never interrupted.

pub mod matching;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Credentials;
use crate::client::activity::{Activity, ActivitySource, ShowStartClient};
use crate::client::ClientError;
use crate::config::{Config, MonitorConfig};
use crate::notify::{EventKind, Notifier, NotifyError, StructuredEvent, WebhookNotifier};
use crate::store::{DedupStore, StoreError};

use self::matching::{has_timed_label, keyword_matches, normalize};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("monitor cancelled")]
    Cancelled,
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notifier setup failed: {0}")]
    Notify(#[from] NotifyError),
}

/// Counters for one pass over all keywords.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub keywords_checked: usize,
    pub failed_queries: usize,
    pub matched: usize,
    pub notified: usize,
    pub failed_notifications: usize,
}

pub fn detail_url(base: &str, activity_id: i64) -> String {
    format!("{}?activityId={}", base, activity_id)
}

pub struct MonitorService {
    source: Arc<dyn ActivitySource>,
    store: Arc<DedupStore>,
    notifier: Arc<dyn Notifier>,
    keywords: Vec<String>,
    city_code: String,
    interval: Duration,
    notify_new: bool,
    detail_base_url: String,
}

impl MonitorService {
    pub fn new(
        source: Arc<dyn ActivitySource>,
        store: Arc<DedupStore>,
        notifier: Arc<dyn Notifier>,
        cfg: &MonitorConfig,
    ) -> Self {
        Self {
            source,
            store,
            notifier,
            keywords: cfg.keywords.clone(),
            city_code: cfg.city_code.clone(),
            interval: Duration::from_secs(cfg.interval_secs()),
            notify_new: cfg.notify_new_events,
            detail_base_url: cfg.detail_base_url.clone(),
        }
    }

    /// Wire up the production client, store and notifier. Fails on an
    /// unusable state directory or malformed state files.
    pub fn from_config(config: &Config) -> Result<Self, MonitorError> {
        let client = ShowStartClient::new(
            config.showstart.base_url.clone(),
            Credentials::from_config(&config.showstart),
        )?;
        let store = DedupStore::open(&config.monitor.state_dir)?;
        let notifier = WebhookNotifier::new(
            &config.monitor.webhook_url,
            &config.monitor.alert_webhook_url,
        )?;
        Ok(Self::new(
            Arc::new(client),
            Arc::new(store),
            Arc::new(notifier),
            &config.monitor,
        ))
    }

    /// Poll until `cancel` fires. Always ends with `MonitorError::Cancelled`.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), MonitorError> {
        info!(
            keywords = self.keywords.len(),
            city = %self.city_code,
            interval = ?self.interval,
            notify_new = self.notify_new,
            "starting monitor"
        );
        self.boot().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            let summary = self.tick(cancel).await?;
            debug!(?summary, "monitor tick complete");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("monitor shutting down");
                    return Err(MonitorError::Cancelled);
                }
                _ = ticker.tick() => {}
            }
        }
    }

    /// Boot, bootstrap if needed, and run exactly one tick.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<TickSummary, MonitorError> {
        info!(keywords = self.keywords.len(), "running single monitor check");
        self.boot().await;
        self.tick(cancel).await
    }

    async fn boot(&self) {
        if let Err(e) = self.source.refresh_token().await {
            warn!(error = %e, "token refresh failed, continuing with existing session");
        }
        self.ensure_initialized().await;
    }

    /// First-run bootstrap: seed dedup state without notifying.
    async fn ensure_initialized(&self) {
        if self.store.is_initialized() {
            return;
        }

        let mut seen_ids = Vec::new();
        let mut timed_ids = Vec::new();

        for keyword in &self.keywords {
            let activities = match self.source.search(&self.city_code, keyword).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(keyword = %keyword, error = %e, "bootstrap query failed");
                    self.alert(&format!(
                        "bootstrap query failed for keyword {keyword}: {e}"
                    ))
                    .await;
                    continue;
                }
            };

            let normalized = normalize(keyword);
            for activity in activities.iter().filter(|a| is_match(&normalized, a)) {
                let id = activity.id.to_string();
                if has_timed_label(&activity.labels) {
                    timed_ids.push(id.clone());
                }
                seen_ids.push(id);
            }
        }

        self.store.batch_mark(&seen_ids, &timed_ids);
        self.store.mark_initialized();
        info!(
            seen = seen_ids.len(),
            timed = timed_ids.len(),
            "monitor state bootstrapped"
        );
    }

    /// One pass over every keyword.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickSummary, MonitorError> {
        let mut summary = TickSummary::default();

        for keyword in &self.keywords {
            if let Err(e) = self.monitor_keyword(keyword, &mut summary).await {
                summary.failed_queries += 1;
                error!(keyword = %keyword, error = %e, "activity query failed");
                self.alert(&format!("activity query failed for keyword {keyword}: {e}"))
                    .await;
            }
            summary.keywords_checked += 1;

            if cancel.is_cancelled() {
                info!(
                    checked = summary.keywords_checked,
                    "monitor cancelled mid-tick"
                );
                return Err(MonitorError::Cancelled);
            }
        }

        Ok(summary)
    }

    async fn monitor_keyword(
        &self,
        keyword: &str,
        summary: &mut TickSummary,
    ) -> Result<(), ClientError> {
        let activities = self.source.search(&self.city_code, keyword).await?;
        if activities.is_empty() {
            debug!(keyword = keyword, "no activities for keyword");
            return Ok(());
        }

        let normalized = normalize(keyword);
        for activity in activities.iter().filter(|a| is_match(&normalized, a)) {
            summary.matched += 1;
            self.process_activity(activity, keyword, summary).await;
        }
        Ok(())
    }

    async fn process_activity(
        &self,
        activity: &Activity,
        keyword: &str,
        summary: &mut TickSummary,
    ) {
        let id = activity.id.to_string();

        // Set while an undelivered "new" notice must stay retryable.
        let mut new_pending = false;
        if self.notify_new && !self.store.has_seen(&id) {
            if self.dispatch(EventKind::New, activity, keyword, summary).await {
                self.store.mark_seen(&id);
                info!(keyword = keyword, activity_id = %id, title = %activity.title, "new activity");
            } else {
                new_pending = true;
            }
        }

        if has_timed_label(&activity.labels)
            && !self.store.has_timed(&id)
            && self.dispatch(EventKind::Timed, activity, keyword, summary).await
        {
            if new_pending {
                self.store.mark_timed(&id);
            } else {
                self.store.mark_timed_purchase(&id);
            }
            info!(
                keyword = keyword,
                activity_id = %id,
                title = %activity.title,
                "timed purchase available"
            );
        }
    }

    /// Send one structured notification. Returns whether it was delivered.
    async fn dispatch(
        &self,
        kind: EventKind,
        activity: &Activity,
        keyword: &str,
        summary: &mut TickSummary,
    ) -> bool {
        let event = StructuredEvent {
            kind,
            artist: keyword.to_string(),
            title: activity.title.clone(),
            show_time: activity.show_time.clone(),
            site_name: activity.site_name.clone(),
            url: detail_url(&self.detail_base_url, activity.id),
        };

        match self.notifier.send_structured(&event).await {
            Ok(()) => {
                summary.notified += 1;
                true
            }
            Err(e) => {
                summary.failed_notifications += 1;
                error!(
                    kind = %kind,
                    keyword = keyword,
                    activity_id = activity.id,
                    error = %e,
                    "notification failed"
                );
                self.alert(&format!(
                    "notification failed: kind={kind} keyword={keyword} title={} error={e}",
                    activity.title
                ))
                .await;
                false
            }
        }
    }

    async fn alert(&self, message: &str) {
        if let Err(e) = self.notifier.send_alert(message).await {
            warn!(error = %e, "alert delivery failed");
        }
    }
}

fn is_match(normalized_keyword: &str, activity: &Activity) -> bool {
    activity.id != 0
        && !activity.title.is_empty()
        && keyword_matches(normalized_keyword, &activity.title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::matching::TIMED_PURCHASE_LABEL;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSource {
        /// keyword → activities; a missing keyword fails with 401.
        results: Mutex<HashMap<String, Vec<Activity>>>,
        searches: AtomicUsize,
        refreshes: AtomicUsize,
    }

    impl FakeSource {
        fn set(&self, keyword: &str, activities: Vec<Activity>) {
            self.results
                .lock()
                .unwrap()
                .insert(keyword.to_string(), activities);
        }
    }

    #[async_trait]
    impl ActivitySource for FakeSource {
        async fn search(&self, _city: &str, keyword: &str) -> Result<Vec<Activity>, ClientError> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .get(keyword)
                .cloned()
                .ok_or(ClientError::Rejected {
                    status: 401,
                    body: "expired".to_string(),
                })
        }

        async fn refresh_token(&self) -> Result<(), ClientError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Api {
                state: "-1".to_string(),
                msg: "no".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<StructuredEvent>>,
        alerts: Mutex<Vec<String>>,
        failing: AtomicBool,
        /// Number of upcoming structured sends to reject.
        fail_next: AtomicUsize,
    }

    impl RecordingNotifier {
        fn events(&self) -> Vec<StructuredEvent> {
            self.events.lock().unwrap().clone()
        }

        fn alerts(&self) -> Vec<String> {
            self.alerts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, _message: &str) -> Result<(), NotifyError> {
            Ok(())
        }

        async fn send_structured(&self, event: &StructuredEvent) -> Result<(), NotifyError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(NotifyError::NoEndpoints);
            }
            if self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(NotifyError::NoEndpoints);
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn send_alert(&self, message: &str) -> Result<(), NotifyError> {
            self.alerts.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn activity(id: i64, title: &str, timed: bool) -> Activity {
        Activity {
            id,
            title: title.to_string(),
            show_time: "2025.05.01 20:00".to_string(),
            site_name: "Arena".to_string(),
            labels: if timed {
                vec![TIMED_PURCHASE_LABEL.to_string()]
            } else {
                Vec::new()
            },
        }
    }

    struct Harness {
        source: Arc<FakeSource>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<DedupStore>,
        service: MonitorService,
        _dir: tempfile::TempDir,
    }

    fn harness(keywords: &[&str], notify_new: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        harness_in(dir, keywords, notify_new)
    }

    fn harness_in(dir: tempfile::TempDir, keywords: &[&str], notify_new: bool) -> Harness {
        let source = Arc::new(FakeSource::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(DedupStore::open(dir.path()).unwrap());
        let cfg = MonitorConfig {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            notify_new_events: notify_new,
            detail_base_url: "https://wap.showstart.com/pages/activity/detail/detail".to_string(),
            ..MonitorConfig::default()
        };
        let service = MonitorService::new(
            source.clone(),
            store.clone(),
            notifier.clone(),
            &cfg,
        );
        Harness {
            source,
            notifier,
            store,
            service,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_timed_purchase_scenario() {
        let h = harness(&["LANY"], false);
        h.store.mark_initialized();
        h.source
            .set("LANY", vec![activity(123, "LANY 2025 巡演", true)]);

        let summary = h.service.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.notified, 1);

        let events = h.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Timed);
        assert_eq!(events[0].artist, "LANY");
        assert_eq!(events[0].title, "LANY 2025 巡演");
        assert_eq!(events[0].site_name, "Arena");
        assert!(events[0].url.ends_with("/detail?activityId=123"));
        assert!(h.store.has_timed("123"));
        assert!(h.store.has_seen("123"));

        // Committed ids never notify twice.
        h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(h.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_without_notifying() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let h = harness_in(dir, &["五月天", "LANY"], true);
        h.source.set(
            "五月天",
            vec![
                activity(1, "2024五月天巡演", true),
                activity(2, "五月天 演唱会", false),
                activity(3, "周杰伦", true),
            ],
        );
        h.source.set("LANY", vec![activity(4, "LANY Live", false)]);

        let summary = h.service.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.notified, 0);
        assert!(h.notifier.events().is_empty());
        assert!(h.store.is_initialized());
        for id in ["1", "2", "4"] {
            assert!(h.store.has_seen(id), "{id} should be seen");
        }
        assert!(!h.store.has_seen("3"));
        assert!(h.store.has_timed("1"));
        assert!(!h.store.has_timed("2"));
        assert_eq!(h.source.refreshes.load(Ordering::SeqCst), 1);

        // A later run against the same directory stays quiet.
        let store = Arc::new(DedupStore::open(&path).unwrap());
        assert!(store.is_initialized());
        let service = MonitorService::new(
            h.source.clone(),
            store,
            h.notifier.clone(),
            &MonitorConfig {
                keywords: vec!["五月天".to_string(), "LANY".to_string()],
                notify_new_events: true,
                ..MonitorConfig::default()
            },
        );
        service.run_once(&CancellationToken::new()).await.unwrap();
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_notification_retried_next_tick() {
        let h = harness(&["LANY"], false);
        h.store.mark_initialized();
        h.source.set("LANY", vec![activity(9, "LANY", true)]);
        h.notifier.failing.store(true, Ordering::SeqCst);

        let summary = h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.failed_notifications, 1);
        assert!(!h.store.has_timed("9"));
        assert_eq!(h.notifier.alerts().len(), 1);

        h.notifier.failing.store(false, Ordering::SeqCst);
        let summary = h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.notified, 1);
        assert!(h.store.has_timed("9"));
    }

    #[tokio::test]
    async fn test_query_failure_does_not_abort_tick() {
        let h = harness(&["broken", "LANY"], false);
        h.store.mark_initialized();
        h.source.set("LANY", vec![activity(5, "LANY tour", true)]);

        let summary = h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.keywords_checked, 2);
        assert_eq!(summary.failed_queries, 1);
        assert_eq!(summary.notified, 1);
        let alerts = h.notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("broken"));
    }

    #[tokio::test]
    async fn test_skips_invalid_and_unmatched_activities() {
        let h = harness(&["Taylor Swift"], false);
        h.store.mark_initialized();
        h.source.set(
            "Taylor Swift",
            vec![
                activity(0, "Taylor Swift", true),
                activity(10, "", true),
                activity(11, "Ed Sheeran", true),
                activity(12, "TAYLOR-SWIFT | The Eras", true),
            ],
        );

        let summary = h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.matched, 1);
        let events = h.notifier.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].url.ends_with("activityId=12"));
    }

    #[tokio::test]
    async fn test_new_event_toggle() {
        let h = harness(&["LANY"], true);
        h.store.mark_initialized();
        h.source.set(
            "LANY",
            vec![activity(20, "LANY", false), activity(21, "LANY 2", true)],
        );

        h.service.tick(&CancellationToken::new()).await.unwrap();
        let kinds: Vec<(EventKind, String)> = h
            .notifier
            .events()
            .into_iter()
            .map(|e| (e.kind, e.url))
            .collect();
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[0].0, EventKind::New);
        assert_eq!(kinds[1].0, EventKind::New);
        assert_eq!(kinds[2].0, EventKind::Timed);
        assert!(kinds[2].1.ends_with("activityId=21"));
        assert!(h.store.has_seen("20"));
        assert!(!h.store.has_timed("20"));

        h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(h.notifier.events().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_new_notice_stays_retryable_after_timed_delivery() {
        let h = harness(&["LANY"], true);
        h.store.mark_initialized();
        h.source.set("LANY", vec![activity(77, "LANY", true)]);
        h.notifier.fail_next.store(1, Ordering::SeqCst);

        let summary = h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.failed_notifications, 1);
        assert_eq!(summary.notified, 1);
        assert!(h.store.has_timed("77"));
        assert!(!h.store.has_seen("77"));

        h.service.tick(&CancellationToken::new()).await.unwrap();
        let kinds: Vec<EventKind> = h.notifier.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Timed, EventKind::New]);
        assert!(h.store.has_seen("77"));

        h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(h.notifier.events().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_observed_between_keywords() {
        let h = harness(&["a", "b", "c"], false);
        h.store.mark_initialized();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.service.tick(&cancel).await.unwrap_err();
        assert!(matches!(err, MonitorError::Cancelled));
        assert_eq!(h.source.searches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_on_interval_until_cancelled() {
        let h = harness(&["LANY"], false);
        h.store.mark_initialized();
        h.source.set("LANY", Vec::new());
        let Harness {
            source,
            service,
            _dir,
            ..
        } = h;

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(&cancel).await })
        };

        // Ticks at t=0 and t=180s.
        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(source.searches.load(Ordering::SeqCst), 2);

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(MonitorError::Cancelled)));
        assert_eq!(source.searches.load(Ordering::SeqCst), 2);
    }
}
