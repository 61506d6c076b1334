use tokio::sync::watch;

/// An authenticated user, as handed to us by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
}

/// Owner side of the session context. Consumers hold a `watch::Receiver`
/// and react to changes; only the auth layer writes.
pub struct SessionContext {
    tx: watch::Sender<Option<Session>>,
}

impl SessionContext {
    pub fn new(initial: Option<Session>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub fn sign_in(&self, session: Session) {
        self.tx.send_replace(Some(session));
    }

    pub fn sign_out(&self) {
        self.tx.send_replace(None);
    }
}
