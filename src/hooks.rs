//! Lifecycle hooks around payment verification and settlement.
//!
//! Handlers on a channel run one after another in registration order, each
//! awaited before the next starts. A failing (or panicking) handler is logged
//! and reported once on the `onError` channel; the remaining handlers still
//! run. Failures of `onError` handlers are only logged.

use crate::model::SettlementOutcome;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type HookResult = anyhow::Result<()>;

type Handler<E> = Arc<dyn Fn(E) -> BoxFuture<'static, HookResult> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookChannel {
    BeforeVerify,
    AfterVerify,
    BeforeSettle,
    AfterSettle,
    OnError,
}

impl HookChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookChannel::BeforeVerify => "beforeVerify",
            HookChannel::AfterVerify => "afterVerify",
            HookChannel::BeforeSettle => "beforeSettle",
            HookChannel::AfterSettle => "afterSettle",
            HookChannel::OnError => "onError",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub request_id: String,
    pub resource: String,
    pub amount: String,
    pub network: String,
    pub payer: String,
    pub payee: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyEvent {
    #[serde(flatten)]
    pub payment: PaymentEvent,
    pub valid: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettleEvent {
    #[serde(flatten)]
    pub payment: PaymentEvent,
    pub success: bool,
    pub error: Option<String>,
    pub transaction: Option<String>,
}

/// A handler failure, carrying the payload the handler was given.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HookErrorEvent {
    pub channel: HookChannel,
    pub event: Box<HookEvent>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "channel", content = "payload", rename_all = "camelCase")]
pub enum HookEvent {
    BeforeVerify(PaymentEvent),
    AfterVerify(VerifyEvent),
    BeforeSettle(PaymentEvent),
    AfterSettle(SettleEvent),
    OnError(HookErrorEvent),
}

impl HookEvent {
    pub fn channel(&self) -> HookChannel {
        match self {
            HookEvent::BeforeVerify(_) => HookChannel::BeforeVerify,
            HookEvent::AfterVerify(_) => HookChannel::AfterVerify,
            HookEvent::BeforeSettle(_) => HookChannel::BeforeSettle,
            HookEvent::AfterSettle(_) => HookChannel::AfterSettle,
            HookEvent::OnError(_) => HookChannel::OnError,
        }
    }
}

struct Channel<E> {
    handlers: RwLock<Vec<(u64, Handler<E>)>>,
}

impl<E> Channel<E> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(Vec::new()),
        })
    }

    fn snapshot(&self) -> Vec<Handler<E>> {
        self.handlers.read().iter().map(|(_, h)| h.clone()).collect()
    }

    fn len(&self) -> usize {
        self.handlers.read().len()
    }

    fn remove(&self, id: u64) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }
}

/// Handle returned by the `on_*` methods; removes exactly that handler.
pub struct Unsubscribe {
    remove: Box<dyn FnOnce() -> bool + Send + Sync>,
}

impl Unsubscribe {
    /// Returns false if the handler was already gone (e.g. after `clear`).
    pub fn unsubscribe(self) -> bool {
        (self.remove)()
    }
}

pub struct HookBus {
    next_id: AtomicU64,
    before_verify: Arc<Channel<PaymentEvent>>,
    after_verify: Arc<Channel<VerifyEvent>>,
    before_settle: Arc<Channel<PaymentEvent>>,
    after_settle: Arc<Channel<SettleEvent>>,
    on_error: Arc<Channel<HookErrorEvent>>,
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HookBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            before_verify: Channel::new(),
            after_verify: Channel::new(),
            before_settle: Channel::new(),
            after_settle: Channel::new(),
            on_error: Channel::new(),
        }
    }

    fn subscribe<E, F, Fut>(&self, channel: &Arc<Channel<E>>, handler: F) -> Unsubscribe
    where
        E: Send + Sync + 'static,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler<E> = Arc::new(move |event| handler(event).boxed());
        channel.handlers.write().push((id, handler));

        let weak: Weak<Channel<E>> = Arc::downgrade(channel);
        Unsubscribe {
            remove: Box::new(move || weak.upgrade().map(|c| c.remove(id)).unwrap_or(false)),
        }
    }

    pub fn on_before_verify<F, Fut>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(PaymentEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.subscribe(&self.before_verify, handler)
    }

    pub fn on_after_verify<F, Fut>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(VerifyEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.subscribe(&self.after_verify, handler)
    }

    pub fn on_before_settle<F, Fut>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(PaymentEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.subscribe(&self.before_settle, handler)
    }

    pub fn on_after_settle<F, Fut>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(SettleEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.subscribe(&self.after_settle, handler)
    }

    pub fn on_error<F, Fut>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(HookErrorEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.subscribe(&self.on_error, handler)
    }

    pub fn handler_count(&self, channel: HookChannel) -> usize {
        match channel {
            HookChannel::BeforeVerify => self.before_verify.len(),
            HookChannel::AfterVerify => self.after_verify.len(),
            HookChannel::BeforeSettle => self.before_settle.len(),
            HookChannel::AfterSettle => self.after_settle.len(),
            HookChannel::OnError => self.on_error.len(),
        }
    }

    pub fn clear(&self) {
        self.before_verify.handlers.write().clear();
        self.after_verify.handlers.write().clear();
        self.before_settle.handlers.write().clear();
        self.after_settle.handlers.write().clear();
        self.on_error.handlers.write().clear();
    }

    /// Delivers `event` to every handler on its channel.
    pub async fn emit(&self, event: HookEvent) {
        match event {
            HookEvent::BeforeVerify(e) => self.run(HookChannel::BeforeVerify, &self.before_verify, e, HookEvent::BeforeVerify).await,
            HookEvent::AfterVerify(e) => self.run(HookChannel::AfterVerify, &self.after_verify, e, HookEvent::AfterVerify).await,
            HookEvent::BeforeSettle(e) => self.run(HookChannel::BeforeSettle, &self.before_settle, e, HookEvent::BeforeSettle).await,
            HookEvent::AfterSettle(e) => self.run(HookChannel::AfterSettle, &self.after_settle, e, HookEvent::AfterSettle).await,
            HookEvent::OnError(e) => self.run_error_handlers(e).await,
        }
    }

    async fn run<E: Clone>(
        &self,
        channel: HookChannel,
        handlers: &Channel<E>,
        payload: E,
        wrap: fn(E) -> HookEvent,
    ) {
        for handler in handlers.snapshot() {
            if let Err(error) = invoke(&handler, payload.clone()).await {
                tracing::error!(channel = channel.as_str(), error = %error, "Hook handler failed");
                self.run_error_handlers(HookErrorEvent {
                    channel,
                    event: Box::new(wrap(payload.clone())),
                    error: format!("{:#}", error),
                })
                .await;
            }
        }
    }

    async fn run_error_handlers(&self, event: HookErrorEvent) {
        for handler in self.on_error.snapshot() {
            if let Err(error) = invoke(&handler, event.clone()).await {
                tracing::error!(channel = HookChannel::OnError.as_str(), error = %error, "Hook handler failed");
            }
        }
    }

    /// Runs `verify` between `beforeVerify` and `afterVerify`.
    ///
    /// A verification error is reported on `afterVerify` with `valid = false`
    /// and then returned unchanged.
    pub async fn with_verify<F, Fut, E>(&self, event: PaymentEvent, verify: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: Display,
    {
        self.emit(HookEvent::BeforeVerify(event.clone())).await;
        let result = verify().await;
        let after = match &result {
            Ok(valid) => VerifyEvent {
                payment: event,
                valid: *valid,
                error: None,
            },
            Err(e) => VerifyEvent {
                payment: event,
                valid: false,
                error: Some(e.to_string()),
            },
        };
        self.emit(HookEvent::AfterVerify(after)).await;
        result
    }

    /// Runs `settle` between `beforeSettle` and `afterSettle`, passing the
    /// settlement's transaction hash on to `afterSettle`.
    pub async fn with_settle<F, Fut, E>(&self, event: PaymentEvent, settle: F) -> Result<SettlementOutcome, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SettlementOutcome, E>>,
        E: Display,
    {
        self.emit(HookEvent::BeforeSettle(event.clone())).await;
        let result = settle().await;
        let after = match &result {
            Ok(outcome) => SettleEvent {
                payment: event,
                success: outcome.success,
                error: outcome.error.clone(),
                transaction: outcome.transaction.clone(),
            },
            Err(e) => SettleEvent {
                payment: event,
                success: false,
                error: Some(e.to_string()),
                transaction: None,
            },
        };
        self.emit(HookEvent::AfterSettle(after)).await;
        result
    }
}

async fn invoke<E>(handler: &Handler<E>, payload: E) -> HookResult {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
        Ok(future) => future,
        Err(_) => return Err(anyhow::anyhow!("hook handler panicked")),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("hook handler panicked")),
    }
}
