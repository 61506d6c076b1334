use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::rest::{Backend, Filter};
use crate::error::{Result, SyncError};
use crate::feeds::realtime::{ChangeKind, Realtime, SubscriptionGuard, SubscriptionSpec};
use crate::session::Session;
use crate::state::{balance_from_record, WalletSnapshot};

pub const WALLET_TABLE: &str = "wallets";

struct Shared {
    state: watch::Sender<WalletSnapshot>,
    /// Bumped on every session change. Work started under an older value
    /// must not write.
    generation: AtomicU64,
}

impl Shared {
    fn write_balance(&self, generation: u64, balance: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.state.send_replace(WalletSnapshot {
            balance,
            is_loading: false,
        });
    }
}

/// Keeps a cached wallet balance in step with the authority.
///
/// Owns the only writer of the snapshot; everyone else gets a
/// `watch::Receiver` from [`WalletSync::subscribe`].
pub struct WalletSync<B: Backend> {
    backend: Arc<B>,
    realtime: Realtime,
    shared: Arc<Shared>,
    user_id: Option<String>,
    subscription: Option<SubscriptionGuard>,
}

impl<B: Backend> WalletSync<B> {
    pub fn new(backend: Arc<B>, realtime: Realtime) -> Self {
        let (state, _) = watch::channel(WalletSnapshot::signed_out());
        Self {
            backend,
            realtime,
            shared: Arc::new(Shared {
                state,
                generation: AtomicU64::new(0),
            }),
            user_id: None,
            subscription: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WalletSnapshot> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        *self.shared.state.borrow()
    }

    /// Follow a session change: tear down whatever was bound to the old
    /// user, then either zero out or start loading for the new one.
    pub fn set_session(&mut self, session: Option<&Session>) {
        let user_id = session.map(|s| s.user_id.clone());
        if user_id == self.user_id && (user_id.is_none() || self.subscription.is_some()) {
            return;
        }

        self.teardown();
        self.user_id = user_id;

        let Some(user_id) = self.user_id.clone() else {
            self.shared.state.send_replace(WalletSnapshot::signed_out());
            return;
        };

        tracing::info!(user_id = %user_id, "wallet sync started");
        self.shared.state.send_replace(WalletSnapshot::loading());
        self.fetch_balance();
        self.open_subscription(&user_id);
    }

    /// Refetch the balance. Safe to call while another fetch is in flight:
    /// whichever completes last wins.
    pub fn fetch_balance(&self) -> Option<JoinHandle<()>> {
        let user_id = self.user_id.clone()?;
        let backend = self.backend.clone();
        let shared = self.shared.clone();
        let generation = shared.generation.load(Ordering::SeqCst);

        Some(tokio::spawn(async move {
            match load_balance(backend.as_ref(), &user_id).await {
                Ok(balance) => shared.write_balance(generation, balance),
                Err(e) => tracing::warn!(user_id = %user_id, "balance fetch failed, keeping last value: {}", e),
            }
        }))
    }

    fn open_subscription(&mut self, user_id: &str) {
        let spec = SubscriptionSpec::new(format!("wallet-{}", user_id), WALLET_TABLE, ChangeKind::Update)
            .eq_filter("user_id", user_id);
        let (guard, mut rx) = self.realtime.subscribe(spec).split();
        let shared = self.shared.clone();
        let generation = shared.generation.load(Ordering::SeqCst);

        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                match balance_from_record(&change.new) {
                    Some(balance) => shared.write_balance(generation, balance),
                    None => tracing::debug!("wallet push without usable balance, ignored"),
                }
            }
        });
        self.subscription = Some(guard);
    }

    fn teardown(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.subscription = None;
    }

    /// Follow the session watch until it closes.
    pub fn run(mut self, mut session_rx: watch::Receiver<Option<Session>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let session = session_rx.borrow_and_update().clone();
                self.set_session(session.as_ref());
                if session_rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }
}

impl<B: Backend> Drop for WalletSync<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn load_balance<B: Backend>(backend: &B, user_id: &str) -> Result<u64> {
    let row = backend
        .query_single(WALLET_TABLE, &Filter::new().eq("user_id", user_id))
        .await?;
    balance_from_record(&row).ok_or(SyncError::MissingField("balance"))
}
