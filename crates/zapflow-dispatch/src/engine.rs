//! Dispatch Engine. Runs one job with recipients strictly in order, one channel
//! pick per recipient, every planned step awaited before the next.
//!
//! ```text
//! Pending ─► Running ─┬─► Completed        (no failures)
//!                     ├─► PartiallyFailed  (some recipients failed)
//!                     ├─► Failed           (no eligible channel, remaining skipped)
//!                     └─► Cancelled        (stop signal seen between recipients)
//! ```

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use zapflow_channels::ChannelRegistry;
use zapflow_core::error::{Result, ZapflowError};
use zapflow_core::types::{Channel, DeliveryOutcome};

use crate::balancer::select_channel;
use crate::cancel::{CancelToken, CancellationRegistry, ClaimGuard};
use crate::history::DeliveryLog;
use crate::humanizer::{Humanizer, PacingConfig};
use crate::job::{
    ChannelPolicy, DispatchErrorKind, DispatchJob, DispatchReport, JobState, Recipient, render_template,
};
use crate::progress::{CurrentRecipient, ProgressStore};
use crate::variator::{VariantSet, Variator};

/// Progress error text for a job whose task died.
pub const ABORTED_REASON: &str = "internal_error";

pub struct DispatchEngine {
    registry: Arc<ChannelRegistry>,
    progress: Arc<dyn ProgressStore>,
    humanizer: Humanizer,
    variator: Option<Arc<dyn Variator>>,
    history: Option<Arc<dyn DeliveryLog>>,
    cancellations: Arc<CancellationRegistry>,
    default_pacing: PacingConfig,
}

impl DispatchEngine {
    pub fn new(registry: Arc<ChannelRegistry>, progress: Arc<dyn ProgressStore>) -> Self {
        Self {
            registry,
            progress,
            humanizer: Humanizer::default(),
            variator: None,
            history: None,
            cancellations: Arc::new(CancellationRegistry::new()),
            default_pacing: PacingConfig::immediate(),
        }
    }

    pub fn with_humanizer(mut self, humanizer: Humanizer) -> Self {
        self.humanizer = humanizer;
        self
    }

    pub fn with_variator(mut self, variator: Arc<dyn Variator>) -> Self {
        self.variator = Some(variator);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn DeliveryLog>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_cancellations(mut self, cancellations: Arc<CancellationRegistry>) -> Self {
        self.cancellations = cancellations;
        self
    }

    /// Pacing for jobs that do not bring their own.
    pub fn with_default_pacing(mut self, pacing: PacingConfig) -> Self {
        self.default_pacing = pacing;
        self
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn progress(&self) -> &Arc<dyn ProgressStore> {
        &self.progress
    }

    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    pub fn history(&self) -> Option<&Arc<dyn DeliveryLog>> {
        self.history.as_ref()
    }

    /// Validate and run the job in the background. The stop token exists
    /// before this returns, so a stop right after submission is not lost.
    /// A session id still held by a live job is rejected.
    ///
    /// If the job task dies, the record is moved to `error` before the id is
    /// released.
    pub fn spawn(self: &Arc<Self>, job: DispatchJob) -> Result<JoinHandle<Result<DispatchReport>>> {
        job.validate()?;
        let token = self.claim(&job.session_id)?;
        let session_id = job.session_id.clone();
        let claim = ClaimGuard::new(Arc::clone(&self.cancellations), session_id.clone());

        let engine = Arc::clone(self);
        let worker = tokio::spawn(async move { engine.execute(job, token).await });
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _claim = claim;
            match worker.await {
                Ok(report) => Ok(report),
                Err(e) => {
                    tracing::error!("💥 Dispatch {} aborted: {e}", session_id);
                    let reason = Some(ABORTED_REASON.to_string());
                    engine.track(&session_id, engine.progress.mark_error(&session_id, reason).await);
                    Err(ZapflowError::Other(format!("dispatch {session_id} aborted: {e}")))
                }
            }
        }))
    }

    /// Run a job to a terminal state on the current task. Only an invalid job
    /// (or a session id already in use) is an `Err`; every other outcome,
    /// fatal aborts included, comes back as a report.
    pub async fn run(&self, job: DispatchJob) -> Result<DispatchReport> {
        job.validate()?;
        let token = self.claim(&job.session_id)?;
        let _claim = ClaimGuard::new(Arc::clone(&self.cancellations), job.session_id.clone());
        Ok(self.execute(job, token).await)
    }

    fn claim(&self, session_id: &str) -> Result<CancelToken> {
        self.cancellations
            .claim(session_id)
            .ok_or_else(|| ZapflowError::InvalidJob(format!("session {session_id} already running")))
    }

    async fn execute(&self, job: DispatchJob, token: CancelToken) -> DispatchReport {
        let session_id = job.session_id.clone();
        let total = job.total();
        let started_at = Utc::now();
        self.cancellations.set_state(&session_id, JobState::Running);

        tracing::info!(
            "🚀 Dispatch {} started: {} recipients via {} (owner={})",
            session_id,
            total,
            job.family,
            job.owner_user_id
        );
        self.track(&session_id, self.progress.start(&session_id, total).await);

        let mut warnings = Vec::new();
        let (variants, variator_error) = VariantSet::resolve(
            self.variator.as_deref(),
            &job.message,
            job.variant_count.min(job.recipients.len()),
        )
        .await;
        if let Some(e) = variator_error {
            tracing::warn!("⚠️ Dispatch {}: variator unavailable, sending template ({e})", session_id);
            warnings.push(DispatchErrorKind::VariatorUnavailable);
        }

        let pacing = job.pacing.unwrap_or(self.default_pacing);
        let mut sent = 0u32;
        let mut failed = 0u32;
        let mut outcome: Option<(JobState, Option<DispatchErrorKind>)> = None;

        for (index, recipient) in job.recipients.iter().enumerate() {
            if token.is_cancelled() {
                tracing::info!("🛑 Dispatch {} stopped after {} recipients", session_id, index);
                self.track(&session_id, self.progress.mark_error(&session_id, Some("cancelled".into())).await);
                outcome = Some((JobState::Cancelled, None));
                break;
            }

            let template = recipient.message.as_deref().unwrap_or_else(|| variants.get(index));
            let text = render_template(template, recipient.name.as_deref());

            let Some(channel) = self.pick_channel(&job) else {
                tracing::warn!(
                    "⚠️ Dispatch {}: no eligible {} channel for {}, aborting {} remaining",
                    session_id,
                    job.family,
                    job.owner_user_id,
                    job.recipients.len() - index
                );
                let reason = DispatchErrorKind::NoChannelAvailable.as_str().to_string();
                self.track(&session_id, self.progress.mark_error(&session_id, Some(reason)).await);
                outcome = Some((JobState::Failed, Some(DispatchErrorKind::NoChannelAvailable)));
                break;
            };

            let current = CurrentRecipient {
                address: recipient.address.clone(),
                name: recipient.name.clone(),
                channel_id: Some(channel.channel_id.clone()),
            };
            self.track(&session_id, self.progress.update_current(&session_id, Some(current)).await);

            let delivery = match self.deliver(&channel, recipient, &text, &pacing).await {
                Ok(steps) => {
                    sent += 1;
                    tracing::debug!(
                        "✅ {} → {} via {} ({} step(s))",
                        session_id,
                        recipient.address,
                        channel.channel_id,
                        steps
                    );
                    self.track(&session_id, self.progress.mark_sent(&session_id).await);
                    DeliveryOutcome::sent(&recipient.address, &channel.channel_id)
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        "⚠️ Dispatch {}: {} failed via {} [{}]: {e}",
                        session_id,
                        recipient.address,
                        channel.channel_id,
                        DispatchErrorKind::classify(&e).as_str()
                    );
                    self.track(&session_id, self.progress.mark_failed(&session_id).await);
                    DeliveryOutcome::failed(&recipient.address, Some(&channel.channel_id), e.to_string())
                }
            };
            self.log_outcome(&session_id, &delivery);
        }

        let (state, error) = match outcome {
            Some(terminal) => terminal,
            None => {
                self.track(&session_id, self.progress.finish(&session_id).await);
                if failed == 0 {
                    (JobState::Completed, None)
                } else {
                    (JobState::PartiallyFailed, None)
                }
            }
        };
        let report = DispatchReport {
            session_id: session_id.clone(),
            state,
            total_messages: total,
            sent_messages: sent,
            failed_messages: failed,
            error,
            warnings,
            started_at,
            finished_at: Utc::now(),
        };
        if let Some(history) = &self.history
            && let Err(e) = history.record_job(&job.owner_user_id, job.family, &report)
        {
            tracing::warn!("⚠️ Dispatch {}: could not store summary: {e}", session_id);
        }

        tracing::info!(
            "🏁 Dispatch {} {}: {}/{} sent, {} failed",
            session_id,
            state,
            sent,
            total,
            failed
        );
        report
    }

    fn pick_channel(&self, job: &DispatchJob) -> Option<Channel> {
        match &job.channel_policy {
            ChannelPolicy::Single { channel_id } => self
                .registry
                .get(channel_id)
                .filter(|c| c.is_connected() && c.family == job.family && c.owner_user_id == job.owner_user_id),
            ChannelPolicy::Balanced { strategy } => {
                let eligible = self.registry.list_eligible(&job.owner_user_id, job.family);
                select_channel(&eligible, *strategy)
            }
        }
    }

    /// Send every planned step; the first failing step fails the recipient.
    async fn deliver(
        &self,
        channel: &Channel,
        recipient: &Recipient,
        text: &str,
        pacing: &PacingConfig,
    ) -> Result<usize> {
        let gateway = self
            .registry
            .gateway(channel.family)
            .ok_or_else(|| ZapflowError::Channel(format!("no gateway for {}", channel.family)))?;

        let steps = self.humanizer.plan_steps(text, pacing);
        for step in &steps {
            if step.delay_before_ms > 0 {
                tokio::time::sleep(Duration::from_millis(step.delay_before_ms)).await;
            }
            match gateway.send_text(channel, &recipient.address, &step.text).await {
                Ok(_) => self.registry.record_success(&channel.channel_id, 1),
                Err(e) => {
                    // A bad address says nothing about the channel.
                    if !matches!(e, ZapflowError::InvalidRecipient(_)) {
                        self.registry.record_failure(&channel.channel_id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(steps.len())
    }

    fn track(&self, session_id: &str, result: Result<()>) {
        if let Err(e) = result {
            tracing::warn!("⚠️ Progress update for {} failed: {e}", session_id);
        }
    }

    fn log_outcome(&self, session_id: &str, outcome: &DeliveryOutcome) {
        if let Some(history) = &self.history
            && let Err(e) = history.record_outcome(session_id, outcome)
        {
            tracing::warn!("⚠️ Dispatch {}: could not log outcome: {e}", session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::Strategy;
    use crate::history::SqliteDeliveryLog;
    use crate::progress::{InMemoryProgressStore, ProgressStatus};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use zapflow_channels::Gateways;
    use zapflow_core::traits::Gateway;
    use zapflow_core::types::{ChannelEndpoint, ChannelFamily, ConnectionState};

    type SendHook = Box<dyn Fn() + Send + Sync>;

    #[derive(Default)]
    struct ScriptedGateway {
        sends: Mutex<Vec<(String, String, String)>>,
        failing_recipients: HashSet<String>,
        failing_texts: HashSet<String>,
        on_send: Option<SendHook>,
    }

    impl ScriptedGateway {
        fn sends(&self) -> Vec<(String, String, String)> {
            self.sends.lock().unwrap().clone()
        }

        fn recipients(&self) -> Vec<String> {
            self.sends().into_iter().map(|(_, r, _)| r).collect()
        }
    }

    #[async_trait]
    impl Gateway for ScriptedGateway {
        fn family(&self) -> ChannelFamily {
            ChannelFamily::Waha
        }

        async fn check_health(&self, _channel: &Channel) -> ConnectionState {
            ConnectionState::Connected
        }

        async fn send_text(&self, channel: &Channel, recipient: &str, text: &str) -> Result<Option<String>> {
            if recipient == "invalid" {
                return Err(ZapflowError::InvalidRecipient(recipient.into()));
            }
            self.sends
                .lock()
                .unwrap()
                .push((channel.channel_id.clone(), recipient.into(), text.into()));
            if let Some(hook) = &self.on_send {
                hook();
            }
            if self.failing_recipients.contains(recipient) || self.failing_texts.contains(text) {
                return Err(ZapflowError::GatewaySend("HTTP 500".into()));
            }
            Ok(Some(format!("msg-{recipient}")))
        }
    }

    fn channel(id: &str, owner: &str) -> Channel {
        Channel::new(
            id,
            ChannelFamily::Waha,
            id,
            owner,
            ChannelEndpoint {
                base_url: "http://localhost".into(),
                credential: String::new(),
                remote_name: "default".into(),
            },
        )
        .with_state(ConnectionState::Connected)
    }

    fn setup(gateway: ScriptedGateway, channels: &[&str], max_failures: u32) -> (Arc<ScriptedGateway>, DispatchEngine) {
        let gateway = Arc::new(gateway);
        let mut gateways = Gateways::new();
        gateways.register(gateway.clone());
        let registry = Arc::new(ChannelRegistry::new(gateways, max_failures));
        for id in channels {
            registry.register(channel(id, "u1"));
        }
        let engine = DispatchEngine::new(registry, Arc::new(InMemoryProgressStore::new()))
            .with_humanizer(Humanizer::new(vec!["Oi!".into()], vec!["Tudo bem?".into()], 0, 0));
        (gateway, engine)
    }

    fn job(addresses: &[&str]) -> DispatchJob {
        DispatchJob::new(
            "u1",
            ChannelFamily::Waha,
            "Olá {{name}}, temos novidades",
            addresses.iter().map(|a| Recipient::new(*a)).collect(),
        )
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let gateway = ScriptedGateway {
            failing_recipients: HashSet::from(["r3".to_string()]),
            ..Default::default()
        };
        let (gateway, engine) = setup(gateway, &["w1"], 10);
        let job = job(&["r1", "r2", "r3", "r4", "r5"]);
        let session = job.session_id.clone();

        let report = engine.run(job).await.unwrap();
        assert_eq!(gateway.recipients(), vec!["r1", "r2", "r3", "r4", "r5"]);
        assert_eq!(report.state, JobState::PartiallyFailed);
        assert_eq!((report.sent_messages, report.failed_messages), (4, 1));
        assert!(report.error.is_none());

        let progress = engine.progress().read(&session).await.unwrap().unwrap();
        assert_eq!(progress.status, ProgressStatus::Success);
        assert_eq!(progress.progress_percent, 100);
        assert_eq!((progress.sent_messages, progress.failed_messages), (4, 1));
        assert_eq!(engine.registry().get("w1").unwrap().total_sent, 4);
    }

    #[tokio::test]
    async fn clean_run_completes() {
        let (gateway, engine) = setup(ScriptedGateway::default(), &["w1"], 3);
        let mut job = job(&["r1", "r2"]);
        job.recipients[0].name = Some("Ana".into());

        let report = engine.run(job).await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.sent_messages, 2);
        let texts: Vec<String> = gateway.sends().into_iter().map(|(_, _, t)| t).collect();
        assert_eq!(texts, vec!["Olá Ana, temos novidades", "Olá, temos novidades"]);
    }

    #[tokio::test]
    async fn failed_greeting_fails_the_whole_recipient() {
        let gateway = ScriptedGateway {
            failing_texts: HashSet::from(["Oi!".to_string()]),
            ..Default::default()
        };
        let (gateway, engine) = setup(gateway, &["w1"], 10);
        let mut job = job(&["r1"]);
        job.pacing = Some(PacingConfig {
            humanize: true,
            base_delay_ms: 0,
            jitter_ms: 0,
        });

        let report = engine.run(job).await.unwrap();
        assert_eq!((report.sent_messages, report.failed_messages), (0, 1));
        assert_eq!(gateway.sends().len(), 1);
    }

    #[tokio::test]
    async fn humanized_recipient_gets_three_messages() {
        let (gateway, engine) = setup(ScriptedGateway::default(), &["w1"], 3);
        let mut job = job(&["r1"]);
        job.pacing = Some(PacingConfig {
            humanize: true,
            base_delay_ms: 0,
            jitter_ms: 0,
        });

        let report = engine.run(job).await.unwrap();
        assert_eq!(report.sent_messages, 1);
        let texts: Vec<String> = gateway.sends().into_iter().map(|(_, _, t)| t).collect();
        assert_eq!(texts, vec!["Oi!", "Tudo bem?", "Olá, temos novidades"]);
        assert_eq!(engine.registry().get("w1").unwrap().total_sent, 3);
    }

    #[tokio::test]
    async fn no_channel_is_a_fatal_report_not_a_panic() {
        let (gateway, engine) = setup(ScriptedGateway::default(), &[], 3);
        let job = job(&["r1", "r2"]);
        let session = job.session_id.clone();

        let report = engine.run(job).await.unwrap();
        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.error, Some(DispatchErrorKind::NoChannelAvailable));
        assert_eq!(report.processed(), 0);
        assert!(gateway.sends().is_empty());

        let progress = engine.progress().read(&session).await.unwrap().unwrap();
        assert_eq!(progress.status, ProgressStatus::Error);
        assert_eq!(progress.error_message.as_deref(), Some("no_channel_available"));
    }

    #[tokio::test]
    async fn demoted_channel_mid_job_aborts_the_rest() {
        let gateway = ScriptedGateway {
            failing_recipients: HashSet::from(["r1".to_string()]),
            ..Default::default()
        };
        let (gateway, engine) = setup(gateway, &["w1"], 1);
        let report = engine.run(job(&["r1", "r2", "r3"])).await.unwrap();

        assert_eq!(report.state, JobState::Failed);
        assert_eq!((report.sent_messages, report.failed_messages), (0, 1));
        assert_eq!(gateway.recipients(), vec!["r1"]);
    }

    #[tokio::test]
    async fn invalid_addresses_do_not_demote_the_channel() {
        let (_gateway, engine) = setup(ScriptedGateway::default(), &["w1"], 2);
        let report = engine.run(job(&["invalid", "invalid", "invalid", "r4"])).await.unwrap();
        assert_eq!((report.sent_messages, report.failed_messages), (1, 3));
        assert!(engine.registry().get("w1").unwrap().is_connected());
    }

    #[tokio::test]
    async fn single_channel_policy() {
        let (gateway, engine) = setup(ScriptedGateway::default(), &["w1", "w2"], 3);
        let mut job = job(&["r1", "r2", "r3"]);
        job.channel_policy = ChannelPolicy::Single {
            channel_id: "w2".into(),
        };
        engine.run(job).await.unwrap();
        assert!(gateway.sends().iter().all(|(ch, _, _)| ch == "w2"));

        engine
            .registry()
            .set_state("w2", ConnectionState::Disconnected)
            .unwrap();
        let mut job2 = self::job(&["r1"]);
        job2.channel_policy = ChannelPolicy::Single {
            channel_id: "w2".into(),
        };
        let report = engine.run(job2).await.unwrap();
        assert_eq!(report.state, JobState::Failed);
    }

    #[tokio::test]
    async fn least_loaded_spreads_across_channels() {
        let (gateway, engine) = setup(ScriptedGateway::default(), &["w1", "w2"], 3);
        let mut job = job(&["r1", "r2", "r3", "r4"]);
        job.channel_policy = ChannelPolicy::Balanced {
            strategy: Strategy::LeastLoaded,
        };
        engine.run(job).await.unwrap();
        let channels: Vec<String> = gateway.sends().into_iter().map(|(c, _, _)| c).collect();
        assert_eq!(channels, vec!["w1", "w2", "w1", "w2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_planned_delays_between_recipients() {
        let (_gateway, engine) = setup(ScriptedGateway::default(), &["w1"], 3);
        let mut job = job(&["r1", "r2", "r3"]);
        job.pacing = Some(PacingConfig {
            humanize: false,
            base_delay_ms: 1_000,
            jitter_ms: 0,
        });

        let start = tokio::time::Instant::now();
        let report = engine.run(job).await.unwrap();
        assert_eq!(report.sent_messages, 3);
        assert!(start.elapsed() >= Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn stop_signal_is_honoured_between_recipients() {
        let cancellations = Arc::new(CancellationRegistry::new());
        let job = job(&["r1", "r2", "r3"]);
        let session = job.session_id.clone();

        let hook_registry = cancellations.clone();
        let hook_session = session.clone();
        let gateway = ScriptedGateway {
            on_send: Some(Box::new(move || {
                hook_registry.cancel(&hook_session);
            })),
            ..Default::default()
        };
        let (gateway, engine) = setup(gateway, &["w1"], 3);
        let engine = engine.with_cancellations(cancellations.clone());

        let report = engine.run(job).await.unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(report.sent_messages, 1);
        assert_eq!(gateway.recipients(), vec!["r1"]);
        assert_eq!(cancellations.active(), 0);

        let progress = engine.progress().read(&session).await.unwrap().unwrap();
        assert_eq!(progress.status, ProgressStatus::Error);
        assert_eq!(progress.error_message.as_deref(), Some("cancelled"));
    }

    struct ListVariator(Vec<String>);

    #[async_trait]
    impl Variator for ListVariator {
        async fn variations(&self, _template: &str, _quantity: usize) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct DownVariator;

    #[async_trait]
    impl Variator for DownVariator {
        async fn variations(&self, _template: &str, _quantity: usize) -> Result<Vec<String>> {
            Err(ZapflowError::Variator("service unavailable".into()))
        }
    }

    #[tokio::test]
    async fn variants_rotate_by_recipient_index() {
        let (gateway, engine) = setup(ScriptedGateway::default(), &["w1"], 3);
        let engine = engine.with_variator(Arc::new(ListVariator(vec!["A {{name}}".into(), "B {{name}}".into()])));
        let mut job = DispatchJob::new(
            "u1",
            ChannelFamily::Waha,
            "T {{name}}",
            vec![
                Recipient::named("r1", "Ana"),
                Recipient::named("r2", "Bia"),
                Recipient::named("r3", "Caio"),
            ],
        );
        job.variant_count = 2;
        job.recipients[2].message = Some("Custom {{nome}}".into());

        engine.run(job).await.unwrap();
        let texts: Vec<String> = gateway.sends().into_iter().map(|(_, _, t)| t).collect();
        assert_eq!(texts, vec!["A Ana", "B Bia", "Custom Caio"]);
    }

    #[tokio::test]
    async fn variator_outage_falls_back_to_template() {
        let (gateway, engine) = setup(ScriptedGateway::default(), &["w1"], 3);
        let engine = engine.with_variator(Arc::new(DownVariator));
        let mut job = job(&["r1", "r2"]);
        job.variant_count = 2;

        let report = engine.run(job).await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.warnings, vec![DispatchErrorKind::VariatorUnavailable]);
        assert!(gateway.sends().iter().all(|(_, _, t)| t == "Olá, temos novidades"));
    }

    #[tokio::test]
    async fn outcomes_and_summary_are_logged() {
        let gateway = ScriptedGateway {
            failing_recipients: HashSet::from(["r2".to_string()]),
            ..Default::default()
        };
        let (_gateway, engine) = setup(gateway, &["w1"], 10);
        let log = Arc::new(SqliteDeliveryLog::open_in_memory().unwrap());
        let engine = engine.with_history(log.clone());
        let job = job(&["r1", "r2"]);
        let session = job.session_id.clone();

        engine.run(job).await.unwrap();
        let outcomes = log.outcomes(&session).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert_eq!(log.job(&session).unwrap().unwrap().state, "partially_failed");
    }

    #[tokio::test]
    async fn invalid_job_is_rejected_up_front() {
        let (_gateway, engine) = setup(ScriptedGateway::default(), &["w1"], 3);
        let engine = Arc::new(engine);
        assert!(matches!(engine.run(job(&[])).await, Err(ZapflowError::InvalidJob(_))));
        assert!(engine.spawn(job(&[])).is_err());

        let mut slow = job(&["r1"]);
        slow.pacing = Some(PacingConfig {
            humanize: false,
            base_delay_ms: u64::MAX,
            jitter_ms: 10,
        });
        assert!(matches!(engine.spawn(slow), Err(ZapflowError::InvalidJob(_))));
        assert_eq!(engine.cancellations().active(), 0);

        let handle = engine.spawn(job(&["r1"])).unwrap();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.state, JobState::Completed);
    }

    #[tokio::test]
    async fn session_id_in_use_is_rejected() {
        let (gateway, engine) = setup(ScriptedGateway::default(), &["w1"], 3);
        let engine = Arc::new(engine);
        let first = job(&["r1", "r2"]);
        let session = first.session_id.clone();
        let mut second = job(&["r3", "r4", "r5"]);
        second.session_id = session.clone();

        let handle = engine.spawn(first).unwrap();
        assert_eq!(engine.cancellations().state(&session), Some(JobState::Pending));
        assert!(matches!(engine.spawn(second.clone()), Err(ZapflowError::InvalidJob(_))));
        assert!(matches!(engine.run(second.clone()).await, Err(ZapflowError::InvalidJob(_))));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.total_messages, 2);
        assert_eq!(gateway.recipients(), vec!["r1", "r2"]);
        let progress = engine.progress().read(&session).await.unwrap().unwrap();
        assert_eq!(progress.total_messages, 2);
        assert_eq!(progress.sent_messages, 2);
        assert_eq!(engine.cancellations().state(&session), None);

        // the id is free again once the first job is done
        let report = engine.spawn(second).unwrap().await.unwrap().unwrap();
        assert_eq!(report.sent_messages, 3);
    }

    #[tokio::test]
    async fn rejected_duplicate_keeps_the_stop_signal() {
        let (gateway, engine) = setup(ScriptedGateway::default(), &["w1"], 3);
        let engine = Arc::new(engine);
        let first = job(&["r1", "r2"]);
        let session = first.session_id.clone();
        let mut duplicate = job(&["r3"]);
        duplicate.session_id = session.clone();

        let handle = engine.spawn(first).unwrap();
        assert!(engine.spawn(duplicate).is_err());
        assert!(engine.cancellations().cancel(&session));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert!(gateway.sends().is_empty());
    }

    #[tokio::test]
    async fn job_is_running_while_it_sends() {
        let cancellations = Arc::new(CancellationRegistry::new());
        let job = job(&["r1", "r2"]);
        let session = job.session_id.clone();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (hook_registry, hook_session, hook_seen) = (cancellations.clone(), session.clone(), seen.clone());
        let gateway = ScriptedGateway {
            on_send: Some(Box::new(move || {
                hook_seen.lock().unwrap().push(hook_registry.state(&hook_session));
            })),
            ..Default::default()
        };
        let (_gateway, engine) = setup(gateway, &["w1"], 3);
        let engine = engine.with_cancellations(cancellations.clone());

        engine.run(job).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some(JobState::Running); 2]);
        assert_eq!(cancellations.state(&session), None);
    }

    #[tokio::test]
    async fn crashed_job_settles_progress_and_frees_the_id() {
        fn explode() {
            panic!("adapter bug");
        }
        let gateway = ScriptedGateway {
            on_send: Some(Box::new(explode)),
            ..Default::default()
        };
        let (_gateway, engine) = setup(gateway, &["w1"], 3);
        let engine = Arc::new(engine);
        let job = job(&["r1", "r2"]);
        let session = job.session_id.clone();

        let result = engine.spawn(job).unwrap().await.unwrap();
        assert!(matches!(result, Err(ZapflowError::Other(_))));

        let progress = engine.progress().read(&session).await.unwrap().unwrap();
        assert_eq!(progress.status, ProgressStatus::Error);
        assert_eq!(progress.error_message.as_deref(), Some(ABORTED_REASON));
        assert_eq!(engine.cancellations().active(), 0);
    }
}
