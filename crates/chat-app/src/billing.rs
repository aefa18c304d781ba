use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kindred_storage::{AccountId, AccountStore, BoxFuture, StorageError};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::chat::Route;

static COMMON_FEATURES: [&str; 3] = ["Unlimited conversations", "Conversation history", "24/7 access"];

/// One purchasable subscription plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub id: &'static str,
    pub name: &'static str,
    pub price_cents: u32,
    pub description: &'static str,
    pub extra_features: &'static [&'static str],
}

impl Plan {
    pub fn price_label(&self) -> String {
        format!("${}.{:02}", self.price_cents / 100, self.price_cents % 100)
    }

    pub fn features(&self) -> impl Iterator<Item = &'static str> + '_ {
        COMMON_FEATURES
            .iter()
            .copied()
            .chain(self.extra_features.iter().copied())
    }
}

pub static PLANS: [Plan; 3] = [
    Plan {
        id: "monthly",
        name: "Monthly",
        price_cents: 2_999,
        description: "Billed monthly",
        extra_features: &[],
    },
    Plan {
        id: "quarterly",
        name: "Quarterly",
        price_cents: 7_999,
        description: "Billed every 3 months",
        extra_features: &["10% savings"],
    },
    Plan {
        id: "annual",
        name: "Annual",
        price_cents: 29_999,
        description: "Billed annually",
        extra_features: &["15% savings", "Priority support"],
    },
];

pub fn find_plan(plan_id: &str) -> Option<&'static Plan> {
    PLANS.iter().find(|plan| plan.id == plan_id.trim())
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BillingError {
    #[snafu(display("unknown subscription plan '{plan_id}'"))]
    UnknownPlan { stage: &'static str, plan_id: String },
    #[snafu(display("billing backend failed on `{stage}`: {details}"))]
    BillingBackend {
        stage: &'static str,
        details: String,
    },
}

pub type BillingResult<T> = Result<T, BillingError>;

/// External payment collaborator. `Ok(false)` is a declined charge.
pub trait BillingBackend: Send + Sync {
    fn subscribe<'a>(
        &'a self,
        account_id: AccountId,
        plan_id: &'a str,
    ) -> BoxFuture<'a, BillingResult<bool>>;
}

/// Always-approving billing placeholder.
#[derive(Debug, Clone)]
pub struct StubBilling {
    delay: Duration,
}

impl StubBilling {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BillingBackend for StubBilling {
    fn subscribe<'a>(
        &'a self,
        account_id: AccountId,
        plan_id: &'a str,
    ) -> BoxFuture<'a, BillingResult<bool>> {
        Box::pin(async move {
            tracing::info!(account_id = %account_id, plan_id, "subscribing account to plan");
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(true)
        })
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CheckoutError {
    #[snafu(display("no plan selected"))]
    NoPlanSelected { stage: &'static str },
    #[snafu(display("a checkout is already processing"))]
    AlreadyProcessing { stage: &'static str },
    #[snafu(display("billing declined plan '{plan_id}'"))]
    Declined { stage: &'static str, plan_id: String },
    #[snafu(display("billing failed on `{stage}`: {source}"))]
    Billing {
        stage: &'static str,
        source: BillingError,
    },
    #[snafu(display("failed to record plan on `{stage}`: {source}"))]
    RecordPlan {
        stage: &'static str,
        source: StorageError,
    },
}

impl CheckoutError {
    /// Text shown to the user for this failure.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NoPlanSelected { .. } => "Please select a plan",
            Self::AlreadyProcessing { .. } => "Processing...",
            Self::Declined { .. } => "Failed to process subscription. Please try again.",
            Self::Billing { .. } | Self::RecordPlan { .. } => "An error occurred. Please try again.",
        }
    }
}

pub type CheckoutResult<T> = Result<T, CheckoutError>;

/// Plan selection and checkout for one subscription screen.
pub struct SubscriptionFlow {
    billing: Arc<dyn BillingBackend>,
    accounts: Arc<dyn AccountStore>,
    selected: Mutex<Option<&'static Plan>>,
    last_error: Mutex<Option<&'static str>>,
    processing: AtomicBool,
}

impl SubscriptionFlow {
    pub fn new(billing: Arc<dyn BillingBackend>, accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            billing,
            accounts,
            selected: Mutex::new(None),
            last_error: Mutex::new(None),
            processing: AtomicBool::new(false),
        }
    }

    pub fn select(&self, plan_id: &str) -> BillingResult<&'static Plan> {
        let plan = find_plan(plan_id).context(UnknownPlanSnafu {
            stage: "subscription-select-plan",
            plan_id,
        })?;
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = Some(plan);
        Ok(plan)
    }

    pub fn selected(&self) -> Option<&'static Plan> {
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_error(&self) -> Option<&'static str> {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Charges the selected plan and records it on the account. Success routes
    /// to the chat view.
    pub async fn checkout(&self, account_id: AccountId) -> CheckoutResult<Route> {
        let result = self.run_checkout(account_id).await;
        let message = result.as_ref().err().map(CheckoutError::user_message);
        if let Err(error) = &result {
            tracing::error!(account_id = %account_id, error = %error, "subscription checkout failed");
        }
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = message;
        result
    }

    async fn run_checkout(&self, account_id: AccountId) -> CheckoutResult<Route> {
        let plan = self.selected().context(NoPlanSelectedSnafu {
            stage: "subscription-checkout-selection",
        })?;

        ensure!(
            self.processing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            AlreadyProcessingSnafu {
                stage: "subscription-checkout-begin",
            }
        );
        let _processing = ProcessingGuard(&self.processing);

        let approved = self
            .billing
            .subscribe(account_id, plan.id)
            .await
            .context(BillingSnafu {
                stage: "subscription-checkout-charge",
            })?;
        ensure!(
            approved,
            DeclinedSnafu {
                stage: "subscription-checkout-charge",
                plan_id: plan.id,
            }
        );

        self.accounts
            .set_subscription_plan(account_id, Some(plan.id.to_string()))
            .await
            .context(RecordPlanSnafu {
                stage: "subscription-checkout-record-plan",
            })?;

        tracing::info!(account_id = %account_id, plan_id = plan.id, "subscription active");
        Ok(Route::Chat)
    }
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
