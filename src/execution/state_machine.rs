//! Trade execution state machine
//!
//! Drives a single intent through the brokerage surface as an explicit state
//! machine with durable checkpoints. Every transition is persisted before
//! control returns, so a crash at any point leaves a record the pipeline can
//! resume from — never from the beginning, and never by repeating the
//! submission.
//!
//! Submission is the single irreversible step. The external transaction
//! count is captured immediately before submit; afterward the machine
//! verifies `post == pre + 1`. Any other outcome of an apparently-successful
//! submit is a verification mismatch that escalates to manual intervention
//! rather than retrying.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::brokerage::{BrokerageSurface, NavTarget};
use crate::config::ExecutionConfig;
use crate::domain::TradeIntent;
use crate::error::{BotError, Result};
use crate::persistence::SharedStore;

/// Execution states for a single trade intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Init,
    Authenticated,
    OnOrderForm,
    FormFilled,
    NotesFilled,
    Previewed,
    Submitted,
    /// Terminal success: the platform confirmed exactly one new transaction
    Verified,
    /// Terminal failure
    Failed,
    /// Terminal: blocked before dispatch (breaker, budget, divergence)
    Aborted,
}

impl TradeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed | Self::Aborted)
    }

    /// The single forward successor in the happy path.
    fn successor(&self) -> Option<TradeState> {
        match self {
            Self::Init => Some(Self::Authenticated),
            Self::Authenticated => Some(Self::OnOrderForm),
            Self::OnOrderForm => Some(Self::FormFilled),
            Self::FormFilled => Some(Self::NotesFilled),
            Self::NotesFilled => Some(Self::Previewed),
            Self::Previewed => Some(Self::Submitted),
            Self::Submitted => Some(Self::Verified),
            Self::Verified | Self::Failed | Self::Aborted => None,
        }
    }

    fn can_advance_to(&self, next: TradeState) -> bool {
        if matches!(next, Self::Failed | Self::Aborted) {
            return !self.is_terminal();
        }
        self.successor() == Some(next)
    }
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Authenticated => "AUTHENTICATED",
            Self::OnOrderForm => "ON_ORDER_FORM",
            Self::FormFilled => "FORM_FILLED",
            Self::NotesFilled => "NOTES_FILLED",
            Self::Previewed => "PREVIEWED",
            Self::Submitted => "SUBMITTED",
            Self::Verified => "VERIFIED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        };
        write!(f, "{s}")
    }
}

/// One persisted transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: TradeState,
    pub at: DateTime<Utc>,
    pub attempt: u32,
    #[serde(default)]
    pub artifact: Option<String>,
}

/// Durable record of one intent's journey through the machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub run_id: String,
    pub intent: TradeIntent,
    pub state: TradeState,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Total brokerage call attempts across all steps
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Platform transaction count captured immediately before submit
    #[serde(default)]
    pub pre_submit_tx_count: Option<u64>,
    /// Whether the submit call itself returned success
    #[serde(default)]
    pub submit_ack: bool,
    /// Set when verification found a transaction-count mismatch; these are
    /// escalated, never retried
    #[serde(default)]
    pub verification_mismatch: bool,
    /// Whether this record was created by a dry run. Persisted so that a
    /// resumed rehearsal can never turn into a real submission.
    #[serde(default)]
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(intent: TradeIntent) -> Self {
        Self {
            run_id: intent.run_id.clone(),
            intent,
            state: TradeState::Init,
            checkpoints: Vec::new(),
            attempt_count: 0,
            last_error: None,
            pre_submit_tx_count: None,
            submit_ack: false,
            verification_mismatch: false,
            dry_run: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Executes intents against a brokerage surface with durable checkpoints.
pub struct ExecutionPipeline {
    surface: Arc<dyn BrokerageSurface>,
    store: SharedStore,
    cfg: ExecutionConfig,
    dry_run: bool,
}

impl ExecutionPipeline {
    pub fn new(
        surface: Arc<dyn BrokerageSurface>,
        store: SharedStore,
        cfg: ExecutionConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            surface,
            store,
            cfg,
            dry_run,
        }
    }

    /// Execute a fresh intent from `INIT` to a terminal state.
    pub async fn execute(&self, intent: TradeIntent) -> Result<ExecutionRecord> {
        let mut record = ExecutionRecord::new(intent);
        record.dry_run = self.dry_run;
        self.persist_record(&record).await?;
        info!(
            run_id = %record.run_id,
            ticker = %record.intent.ticker,
            side = %record.intent.side,
            quantity = record.intent.quantity,
            "execution started"
        );
        self.drive(&mut record).await;
        self.finalize(&mut record).await?;
        Ok(record)
    }

    /// Resume a previously persisted, non-terminal record.
    ///
    /// Resumption branches on the last persisted checkpoint. A record left in
    /// `SUBMITTED` re-enters at verification only — the submit call is never
    /// repeated.
    pub async fn resume(&self, mut record: ExecutionRecord) -> Result<ExecutionRecord> {
        if record.state.is_terminal() {
            return Ok(record);
        }
        warn!(
            run_id = %record.run_id,
            state = %record.state,
            "resuming interrupted execution"
        );
        self.drive(&mut record).await;
        self.finalize(&mut record).await?;
        Ok(record)
    }

    /// Advance the record until a terminal state is reached or, in dry-run
    /// mode, until `PREVIEWED`.
    async fn drive(&self, record: &mut ExecutionRecord) {
        loop {
            let step = match record.state {
                TradeState::Init => self.step_authenticate(record).await,
                TradeState::Authenticated => self.step_navigate(record).await,
                TradeState::OnOrderForm => self.step_fill_form(record).await,
                TradeState::FormFilled => self.step_fill_notes(record).await,
                TradeState::NotesFilled => self.step_preview(record).await,
                TradeState::Previewed => {
                    // The record's own flag governs, so a resumed rehearsal
                    // stops here even under a live pipeline.
                    if record.dry_run {
                        info!(run_id = %record.run_id, "dry run, stopping after preview");
                        return;
                    }
                    self.step_submit(record).await
                }
                TradeState::Submitted => self.step_verify(record).await,
                TradeState::Verified | TradeState::Failed | TradeState::Aborted => return,
            };

            if let Err(e) = step {
                if matches!(e, BotError::VerificationMismatch { .. }) {
                    record.verification_mismatch = true;
                }
                record.last_error = Some(e.to_string());
                let failed_state = record.state;
                if let Err(persist_err) = self.advance(record, TradeState::Failed, None).await {
                    error!(error = %persist_err, "failed to persist FAILED state");
                    record.state = TradeState::Failed;
                }
                error!(
                    run_id = %record.run_id,
                    ticker = %record.intent.ticker,
                    from = %failed_state,
                    error = %e,
                    "execution failed"
                );
                return;
            }
        }
    }

    async fn step_authenticate(&self, record: &mut ExecutionRecord) -> Result<()> {
        let surface = self.surface.clone();
        let resp = self
            .run_step(record, "authenticate", || {
                let surface = surface.clone();
                async move { surface.authenticate().await }
            })
            .await?;
        self.advance(record, TradeState::Authenticated, resp.artifact)
            .await
    }

    async fn step_navigate(&self, record: &mut ExecutionRecord) -> Result<()> {
        let surface = self.surface.clone();
        let ticker = record.intent.ticker.clone();
        let resp = self
            .run_step(record, "navigate", || {
                let surface = surface.clone();
                let target = NavTarget::OrderForm {
                    ticker: ticker.clone(),
                };
                async move { surface.navigate(target).await }
            })
            .await?;
        self.advance(record, TradeState::OnOrderForm, resp.artifact)
            .await
    }

    async fn step_fill_form(&self, record: &mut ExecutionRecord) -> Result<()> {
        let surface = self.surface.clone();
        let intent = record.intent.clone();
        let resp = self
            .run_step(record, "fill_order_form", || {
                let surface = surface.clone();
                let intent = intent.clone();
                async move { surface.fill_order_form(&intent).await }
            })
            .await?;
        self.advance(record, TradeState::FormFilled, resp.artifact)
            .await
    }

    async fn step_fill_notes(&self, record: &mut ExecutionRecord) -> Result<()> {
        let surface = self.surface.clone();
        let intent = record.intent.clone();
        let resp = self
            .run_step(record, "fill_trade_notes", || {
                let surface = surface.clone();
                let intent = intent.clone();
                async move { surface.fill_trade_notes(&intent).await }
            })
            .await?;
        self.advance(record, TradeState::NotesFilled, resp.artifact)
            .await
    }

    async fn step_preview(&self, record: &mut ExecutionRecord) -> Result<()> {
        let surface = self.surface.clone();
        let intent = record.intent.clone();
        let preview = self
            .run_step(record, "preview_order", || {
                let surface = surface.clone();
                let intent = intent.clone();
                async move { surface.preview_order(&intent).await }
            })
            .await?;
        if let Some(price) = preview.estimated_price {
            debug!(run_id = %record.run_id, %price, "order previewed");
        }
        self.advance(record, TradeState::Previewed, preview.artifact)
            .await
    }

    /// The irreversible step: capture the pre-submit transaction count, then
    /// call submit exactly once. The `SUBMITTED` checkpoint is persisted
    /// whether or not the call succeeded, because a failed call may still
    /// have placed the order.
    async fn step_submit(&self, record: &mut ExecutionRecord) -> Result<()> {
        let surface = self.surface.clone();
        let pre = self
            .run_step(record, "read_transaction_count", || {
                let surface = surface.clone();
                async move { surface.read_transaction_count().await }
            })
            .await?;
        record.pre_submit_tx_count = Some(pre);
        self.persist_record(record).await?;

        record.attempt_count += 1;
        let submit_result = tokio::time::timeout(
            Duration::from_millis(self.cfg.step_timeout_ms),
            self.surface.submit_order(&record.intent),
        )
        .await;

        match submit_result {
            Ok(Ok(resp)) => {
                record.submit_ack = true;
                self.advance(record, TradeState::Submitted, resp.artifact)
                    .await
            }
            Ok(Err(e)) => {
                record.submit_ack = false;
                record.last_error = Some(e.to_string());
                warn!(run_id = %record.run_id, error = %e, "submit returned an error, verifying anyway");
                self.advance(record, TradeState::Submitted, None).await
            }
            Err(_) => {
                record.submit_ack = false;
                record.last_error = Some(format!(
                    "submit timed out after {}ms",
                    self.cfg.step_timeout_ms
                ));
                warn!(run_id = %record.run_id, "submit timed out, verifying anyway");
                self.advance(record, TradeState::Submitted, None).await
            }
        }
    }

    /// Verify `post == pre + 1` against the platform's transaction count.
    async fn step_verify(&self, record: &mut ExecutionRecord) -> Result<()> {
        let pre = record.pre_submit_tx_count.ok_or_else(|| {
            BotError::InvalidState(format!(
                "record {} reached SUBMITTED without a pre-submit count",
                record.run_id
            ))
        })?;

        let surface = self.surface.clone();
        let post = self
            .run_step(record, "read_transaction_count", || {
                let surface = surface.clone();
                async move { surface.read_transaction_count().await }
            })
            .await?;

        let delta = post.saturating_sub(pre);
        match delta {
            1 => {
                self.advance(record, TradeState::Verified, None).await?;
                info!(run_id = %record.run_id, "execution verified");
                Ok(())
            }
            0 if post == pre && !record.submit_ack => {
                // The platform never saw the order and the submit call itself
                // reported a definite error: an ordinary failure.
                let reason = record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "submit failed".to_string());
                Err(BotError::Internal(format!("order not placed: {reason}")))
            }
            _ => {
                error!(
                    run_id = %record.run_id,
                    pre,
                    post,
                    "transaction count mismatch after submit, manual intervention required"
                );
                Err(BotError::VerificationMismatch {
                    expected: pre + 1,
                    observed: post,
                })
            }
        }
    }

    /// Run one retriable step: bounded attempts, per-call timeout,
    /// exponential backoff with jitter between transient failures.
    async fn run_step<T, F, Fut>(
        &self,
        record: &mut ExecutionRecord,
        step: &str,
        make_call: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = BotError::Internal(format!("step {step} never attempted"));

        for attempt in 1..=self.cfg.max_step_attempts {
            record.attempt_count += 1;

            let outcome =
                tokio::time::timeout(Duration::from_millis(self.cfg.step_timeout_ms), make_call())
                    .await;

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => BotError::StepTimeout {
                    step: step.to_string(),
                    elapsed_ms: self.cfg.step_timeout_ms,
                },
            };

            if !err.is_transient() {
                return Err(err);
            }

            warn!(
                run_id = %record.run_id,
                step,
                attempt,
                max = self.cfg.max_step_attempts,
                error = %err,
                "step failed"
            );
            last_err = err;

            if attempt < self.cfg.max_step_attempts {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }

        Err(last_err)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .cfg
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16).saturating_sub(1))
            .min(self.cfg.backoff_max_ms);
        let jitter_ceiling = (base / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
        Duration::from_millis(base + jitter)
    }

    /// Persist a state transition before returning control.
    async fn advance(
        &self,
        record: &mut ExecutionRecord,
        next: TradeState,
        artifact: Option<String>,
    ) -> Result<()> {
        if !record.state.can_advance_to(next) {
            return Err(BotError::InvalidStateTransition {
                from: record.state.to_string(),
                to: next.to_string(),
            });
        }
        record.state = next;
        record.checkpoints.push(Checkpoint {
            state: next,
            at: Utc::now(),
            attempt: record.attempt_count,
            artifact,
        });
        debug!(run_id = %record.run_id, state = %next, "checkpoint");
        self.persist_record(record).await
    }

    async fn persist_record(&self, record: &ExecutionRecord) -> Result<()> {
        let mut store = self.store.lock().await;
        store
            .state_mut()
            .executions
            .insert(record.run_id.clone(), record.clone());
        store.persist().await
    }

    /// Archive a finished record: stamp the finish time and move it from the
    /// active table into the append-only history.
    async fn finalize(&self, record: &mut ExecutionRecord) -> Result<()> {
        record.finished_at = Some(Utc::now());
        let mut store = self.store.lock().await;
        store.state_mut().executions.remove(&record.run_id);
        store.state_mut().execution_history.push(record.clone());
        if record.state == TradeState::Failed {
            let message = record
                .last_error
                .clone()
                .unwrap_or_else(|| "execution failed".to_string());
            store.state_mut().record_error(&message);
        }
        store.persist().await
    }
}
