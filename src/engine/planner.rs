//! Transaction step planning and execution
//!
//! A conversion takes one to three transactions. Buying with collateral may
//! first need the market maker's allowance reset to zero and then raised to the
//! order amount; selling needs no approval. Steps run strictly in order, each
//! waiting on the previous one, and a failed step halts the plan.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use super::amount::Amount;
use super::cancel::CancelToken;
use super::chain::{Address, ConversionDirection, ConversionGateway, TransactionReceipt, TxHash};
use super::error::{ChainError, PlanError};
use super::quote::ConversionQuote;
use super::receipt::converted_amount;

/// Pause before a fresh plan is revealed.
pub const REVEAL_DELAY: Duration = Duration::from_millis(900);

/// Interval between receipt polls while an order is pending.
pub const RECEIPT_POLL: Duration = Duration::from_millis(250);

/// Everything needed to place one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderRequest {
    pub account: Address,
    /// Market maker, the spender of the collateral allowance.
    pub spender: Address,
    /// Amount the order is placed with. For buys this is the deposit left
    /// after the entry tribute.
    pub amount: Amount,
    /// Collateral the whole conversion may pull, tribute included. The
    /// allowance is raised to this figure.
    pub spend: Amount,
    pub direction: ConversionDirection,
    pub minimum_return: Amount,
}

impl OrderRequest {
    pub fn from_quote(account: Address, spender: Address, quote: &ConversionQuote) -> Self {
        let source = quote.request.source_amount;
        let amount = if quote.request.direction.is_buy() {
            source.saturating_sub(quote.tribute_retained)
        } else {
            source
        };
        Self {
            account,
            spender,
            amount,
            spend: source,
            direction: quote.request.direction,
            minimum_return: quote.minimum_received_with_slippage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    ResetApproval,
    RaiseApproval {
        amount: Amount,
    },
    SubmitOrder {
        amount: Amount,
        direction: ConversionDirection,
        minimum_return: Amount,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionStep {
    pub label: String,
    pub action: StepAction,
}

/// Ordered steps for one order. Never changes once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepPlan {
    order: OrderRequest,
    steps: Vec<TransactionStep>,
}

impl StepPlan {
    pub fn order(&self) -> &OrderRequest {
        &self.order
    }

    pub fn steps(&self) -> &[TransactionStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.label.as_str()).collect()
    }
}

/// Derive the steps for `order` given the current collateral allowance.
///
/// `allowance` is only consulted for buy orders. A non-zero allowance that is
/// too small is reset to zero before being raised, since collateral tokens may
/// refuse to move an allowance directly between two non-zero values.
pub fn build_plan(order: &OrderRequest, allowance: Amount) -> StepPlan {
    let mut steps = Vec::with_capacity(3);

    if order.direction.is_buy() && allowance < order.spend {
        if !allowance.is_zero() {
            steps.push(TransactionStep {
                label: "Reset approval".to_string(),
                action: StepAction::ResetApproval,
            });
        }
        steps.push(TransactionStep {
            label: "Raise approval".to_string(),
            action: StepAction::RaiseApproval {
                amount: order.spend,
            },
        });
    }

    let side = if order.direction.is_buy() { "buy" } else { "sell" };
    steps.push(TransactionStep {
        label: format!("Make {} order", side),
        action: StepAction::SubmitOrder {
            amount: order.amount,
            direction: order.direction,
            minimum_return: order.minimum_return,
        },
    });

    StepPlan {
        order: *order,
        steps,
    }
}

/// Outcome of a settled order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderReceipt {
    pub transaction_hash: TxHash,
    pub direction: ConversionDirection,
    pub source_amount: Amount,
    pub converted_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    /// Handed to the signer.
    Prompting,
    /// Broadcast, waiting to be mined.
    Broadcast { hash: TxHash },
    Confirmed { hash: TxHash },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepView {
    pub label: String,
    pub action: StepAction,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlannerState {
    Idle,
    Planning,
    /// Steps are known and revealed; nothing submitted yet.
    Ready,
    Executing { step: usize },
    Done { receipt: OrderReceipt },
    Failed { step: Option<usize>, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanProgress {
    pub state: PlannerState,
    pub steps: Vec<StepView>,
}

impl Default for PlanProgress {
    fn default() -> Self {
        Self {
            state: PlannerState::Idle,
            steps: Vec::new(),
        }
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Plans and drives the transactions of one conversion at a time.
pub struct StepPlanner {
    gateway: Arc<dyn ConversionGateway>,
    reveal_delay: Duration,
    receipt_poll: Duration,
    plan: Mutex<Option<StepPlan>>,
    running: AtomicBool,
    progress: watch::Sender<PlanProgress>,
}

impl StepPlanner {
    pub fn new(gateway: Arc<dyn ConversionGateway>) -> Self {
        let (progress, _) = watch::channel(PlanProgress::default());
        Self {
            gateway,
            reveal_delay: REVEAL_DELAY,
            receipt_poll: RECEIPT_POLL,
            plan: Mutex::new(None),
            running: AtomicBool::new(false),
            progress,
        }
    }

    pub fn with_reveal_delay(mut self, delay: Duration) -> Self {
        self.reveal_delay = delay;
        self
    }

    pub fn with_receipt_poll(mut self, poll: Duration) -> Self {
        self.receipt_poll = poll;
        self
    }

    pub fn progress(&self) -> PlanProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlanProgress> {
        self.progress.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<RunGuard<'_>, PlanError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PlanError::Busy);
        }
        Ok(RunGuard(&self.running))
    }

    fn stored_plan(&self) -> MutexGuard<'_, Option<StepPlan>> {
        self.plan.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, index: usize, status: StepStatus) {
        self.progress.send_modify(|p| {
            if let Some(step) = p.steps.get_mut(index) {
                step.status = status;
            }
        });
    }

    /// Publish a failure. A cancelled run publishes nothing; its last state stays.
    fn fail(&self, step: Option<usize>, err: PlanError) -> PlanError {
        if matches!(err, PlanError::Cancelled) {
            tracing::info!("Conversion cancelled at step {:?}", step);
            return err;
        }
        let error = err.to_string();
        tracing::error!("Conversion failed at step {:?}: {}", step, error);
        self.progress.send_modify(|p| {
            if let Some(step) = step.and_then(|i| p.steps.get_mut(i)) {
                step.status = StepStatus::Failed {
                    error: error.clone(),
                };
            }
            p.state = PlannerState::Failed { step, error };
        });
        err
    }

    /// Read the allowance (buy orders only) and derive the steps.
    pub async fn plan(&self, order: OrderRequest, cancel: &CancelToken) -> Result<StepPlan, PlanError> {
        let _guard = self.begin()?;
        *self.stored_plan() = None;
        self.progress.send_replace(PlanProgress {
            state: PlannerState::Planning,
            steps: Vec::new(),
        });

        let allowance = if order.direction.is_buy() {
            match self.gateway.allowance(order.account, order.spender).await {
                Ok(allowance) => allowance,
                Err(e) => return Err(self.fail(None, PlanError::Allowance(e))),
            }
        } else {
            Amount::ZERO
        };

        let plan = build_plan(&order, allowance);
        tracing::info!(
            "Planned {} step(s) for {} {:?} (allowance {}): {:?}",
            plan.len(),
            order.amount,
            order.direction,
            allowance,
            plan.labels()
        );

        if !self.reveal_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.reveal_delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(self.fail(None, PlanError::Cancelled));
        }

        self.progress.send_replace(PlanProgress {
            state: PlannerState::Ready,
            steps: plan
                .steps
                .iter()
                .map(|s| StepView {
                    label: s.label.clone(),
                    action: s.action,
                    status: StepStatus::Waiting,
                })
                .collect(),
        });
        *self.stored_plan() = Some(plan.clone());
        Ok(plan)
    }

    /// Run the planned steps in order. A plan executes at most once.
    pub async fn execute(&self, cancel: &CancelToken) -> Result<OrderReceipt, PlanError> {
        let _guard = self.begin()?;
        let plan = self.stored_plan().take().ok_or(PlanError::NotPlanned)?;
        let total = plan.len();

        for (index, step) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(self.fail(Some(index), PlanError::Cancelled));
            }
            self.progress.send_modify(|p| {
                p.state = PlannerState::Executing { step: index };
                if let Some(view) = p.steps.get_mut(index) {
                    view.status = StepStatus::Prompting;
                }
            });
            tracing::info!("Step {}/{}: {}", index + 1, total, step.label);

            let submitted = |source: ChainError| PlanError::Submission {
                index,
                label: step.label.clone(),
                source,
            };

            match step.action {
                StepAction::ResetApproval | StepAction::RaiseApproval { .. } => {
                    let amount = match step.action {
                        StepAction::RaiseApproval { amount } => amount,
                        _ => Amount::ZERO,
                    };
                    let hash = self
                        .gateway
                        .approve(plan.order.spender, amount)
                        .await
                        .map_err(|e| self.fail(Some(index), submitted(e)))?;
                    tracing::info!("{} broadcast as {}", step.label, hash);
                    self.set_status(index, StepStatus::Confirmed { hash });
                }
                StepAction::SubmitOrder {
                    amount,
                    direction,
                    minimum_return,
                } => {
                    let hash = self
                        .gateway
                        .submit_order(plan.order.account, amount, direction, minimum_return)
                        .await
                        .map_err(|e| self.fail(Some(index), submitted(e)))?;
                    self.set_status(index, StepStatus::Broadcast { hash });
                    tracing::info!("{} broadcast as {}, waiting to be mined", step.label, hash);

                    let receipt = self
                        .wait_mined(hash, cancel)
                        .await
                        .map_err(|e| self.fail(Some(index), e))?;
                    let converted = converted_amount(&receipt, direction)
                        .map_err(|e| self.fail(Some(index), PlanError::Receipt(e)))?;

                    let receipt = OrderReceipt {
                        transaction_hash: hash,
                        direction,
                        source_amount: amount,
                        converted_amount: converted,
                    };
                    tracing::info!("Order {} settled, received {}", hash, converted);
                    self.progress.send_modify(|p| {
                        if let Some(view) = p.steps.get_mut(index) {
                            view.status = StepStatus::Confirmed { hash };
                        }
                        p.state = PlannerState::Done { receipt };
                    });
                    return Ok(receipt);
                }
            }
        }

        // a plan always ends with its order
        Err(self.fail(None, PlanError::NotPlanned))
    }

    /// Plan and execute in one go.
    pub async fn run(&self, order: OrderRequest, cancel: &CancelToken) -> Result<OrderReceipt, PlanError> {
        self.plan(order, cancel).await?;
        self.execute(cancel).await
    }

    /// Back to idle, dropping any plan that was not executed.
    pub fn reset(&self) -> Result<(), PlanError> {
        let _guard = self.begin()?;
        *self.stored_plan() = None;
        self.progress.send_replace(PlanProgress::default());
        Ok(())
    }

    async fn wait_mined(&self, hash: TxHash, cancel: &CancelToken) -> Result<TransactionReceipt, PlanError> {
        loop {
            match self.gateway.transaction_receipt(hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(ChainError::Read(e)) => {
                    tracing::warn!("Receipt poll for {} failed: {}", hash, e);
                }
                Err(e) => return Err(PlanError::Receipt(e.into())),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(PlanError::Cancelled),
                _ = tokio::time::sleep(self.receipt_poll) => {}
            }
        }
    }
}
