mod round;
mod setting;
mod wallet;

pub use round::{RoundDuration, RoundPhase, RoundRecord, RoundView};
pub use setting::ControllerSetting;
pub use wallet::{balance_from_record, WalletSnapshot};
