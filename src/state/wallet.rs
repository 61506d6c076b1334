use serde_json::Value;

/// Cached projection of the user's wallet.
///
/// The initial value is a placeholder: `balance` is 0 and must not be shown
/// as real until `is_loading` has been cleared by a fetch or a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalletSnapshot {
    pub balance: u64,
    pub is_loading: bool,
}

impl WalletSnapshot {
    pub fn signed_out() -> Self {
        Self {
            balance: 0,
            is_loading: false,
        }
    }

    pub fn loading() -> Self {
        Self {
            balance: 0,
            is_loading: true,
        }
    }

    /// Balance-dependent actions are gated on loading.
    pub fn can_spend(&self, amount: u64) -> bool {
        !self.is_loading && self.balance >= amount
    }
}

/// Pull a usable balance out of a wallet row. Missing, negative or
/// fractional values are not an update.
pub fn balance_from_record(record: &Value) -> Option<u64> {
    record.get("balance")?.as_u64()
}
