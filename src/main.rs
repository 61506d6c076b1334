mod api;
mod config;
mod countdown;
mod error;
mod events;
mod feeds;
mod heartbeat;
mod referral;
mod round;
mod scheduler;
mod selector;
mod session;
mod state;
mod wallet;

#[cfg(test)]
mod test_helpers;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use api::rest::RestClient;
use config::Config;
use events::Event;
use feeds::realtime::{spawn_transport, Realtime};
use heartbeat::{Heartbeat, HeartbeatSchedule};
use referral::{FileStore, LogNavigator};
use round::RoundCommand;
use selector::DurationSelector;
use session::{Session, SessionContext};
use state::RoundView;
use wallet::WalletSync;

struct Args {
    config_path: String,
    referral_code: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut referral_code = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--ref" => {
                let code = args.next().ok_or_else(|| anyhow!("--ref requires a code"))?;
                referral_code = Some(code);
            }
            other if other.starts_with("--") => return Err(anyhow!("unknown flag {}", other)),
            other => config_path = Some(other.to_string()),
        }
    }

    Ok(Args {
        config_path: config_path.unwrap_or_else(|| "config.toml".to_string()),
        referral_code,
    })
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn realtime_url(base: &str, api_key: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}apikey={}&vsn=1.0.0", base, sep, api_key)
}

/// Turn every value of a watch into an event, starting with the current one.
fn forward<T, F>(mut rx: watch::Receiver<T>, tx: mpsc::Sender<Event>, to_event: F)
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Event + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = to_event(&rx.borrow_and_update());
            if tx.send(event).await.is_err() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    });
}

/// Read commands from stdin: a round length, `login` or `logout`.
/// Selection needs a session; `login` restores the configured one.
fn spawn_input(tx: mpsc::Sender<Event>, sessions: Arc<SessionContext>, configured: Option<Session>) {
    tokio::spawn(async move {
        let mut selector = DurationSelector::new(tx);
        let choices: Vec<String> = selector.options().iter().map(|d| d.minutes().to_string()).collect();
        tracing::info!("type a round length ({}), login or logout, and press enter", choices.join("/"));

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim() {
                "logout" => sessions.sign_out(),
                "login" => match &configured {
                    Some(session) => sessions.sign_in(session.clone()),
                    None => tracing::info!("no session configured"),
                },
                other => match selector::parse_choice(other) {
                    Some(duration) => {
                        selector.set_disabled(sessions.current().is_none());
                        selector.select(duration, tokio::time::Instant::now());
                    }
                    None => tracing::info!("unknown choice {:?}", other),
                },
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = parse_args()?;
    let cfg = Config::load(&args.config_path)?;
    init_tracing(&cfg.general.log_level);
    tracing::info!(path = %args.config_path, "loaded config");

    if let Some(code) = args.referral_code.as_deref() {
        let mut store = FileStore::open(&cfg.storage.path)?;
        let mut nav = LogNavigator::default();
        referral::capture(Some(code), &mut store, &mut nav);
    }

    let session = match (&cfg.session.user_id, &cfg.session.access_token) {
        (Some(user_id), Some(access_token)) => Some(Session {
            user_id: user_id.clone(),
            access_token: access_token.clone(),
        }),
        _ => {
            tracing::info!("no session configured, running signed out");
            None
        }
    };
    let token = session.as_ref().map(|s| s.access_token.clone());
    let sessions = Arc::new(SessionContext::new(session.clone()));

    let backend = Arc::new(RestClient::new(&cfg.backend.rest_url, &cfg.backend.anon_key, token.clone()));
    let realtime = Realtime::new();
    spawn_transport(
        realtime.clone(),
        realtime_url(&cfg.backend.realtime_url, &cfg.backend.anon_key),
        token.unwrap_or_else(|| cfg.backend.anon_key.clone()),
    );

    // Create the event channel
    let (tx, mut rx) = mpsc::channel::<Event>(100);

    // Wallet
    let wallet = WalletSync::new(backend.clone(), realtime.clone());
    forward(wallet.subscribe(), tx.clone(), |w| Event::BalanceChanged(*w));
    wallet.run(sessions.subscribe());

    // Auto-controller heartbeat
    let (setting_rx, _) = heartbeat::spawn_setting_sync(backend.clone(), realtime.clone());
    forward(setting_rx.clone(), tx.clone(), |s| Event::ControllerToggled { enabled: s.enabled });
    Heartbeat::new(backend.clone(), HeartbeatSchedule::from_config(&cfg.heartbeat))
        .run(sessions.subscribe(), setting_rx);

    // Round + countdown
    let (end_rx, round_cmds, _) = round::spawn(backend.clone(), realtime.clone(), cfg.round.duration(), tx.clone());
    countdown::spawn(end_rx, tx.clone(), || Utc::now().timestamp_millis());

    spawn_input(tx.clone(), sessions.clone(), session);

    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(Event::Shutdown).await;
        }
    });
    drop(tx);

    // Main event loop
    tracing::info!("starting event loop (Ctrl+C to quit)");
    while let Some(event) = rx.recv().await {
        match event {
            Event::RoundChanged(view) => match view {
                RoundView::NoRound => tracing::info!("waiting for next round..."),
                RoundView::OpenRound { round_id, duration, .. } => {
                    let minutes = duration.map(|d| d.minutes()).unwrap_or_default();
                    tracing::info!(round_id = %round_id, minutes, "round open");
                }
                RoundView::ClosedRound { round_id, result } => {
                    tracing::info!(round_id = %round_id, result = ?result, "round closed");
                }
            },
            Event::Countdown { remaining, urgency } => {
                let clock = countdown::format_mmss(remaining);
                match urgency {
                    Some(u) => tracing::info!(urgency = u, "{}", clock),
                    None => tracing::info!("{}", clock),
                }
            }
            Event::RoundExpired { end_time_ms } => {
                let _ = round_cmds.send(RoundCommand::Expired { end_time_ms }).await;
            }
            Event::BalanceChanged(wallet) => {
                if wallet.is_loading {
                    tracing::info!("balance: loading...");
                } else {
                    tracing::info!(balance = wallet.balance, funded = wallet.can_spend(1), "balance");
                }
            }
            Event::ControllerToggled { enabled } => {
                tracing::info!(enabled, "auto-controller");
            }
            Event::DurationSelected(duration) => {
                let _ = round_cmds.send(RoundCommand::SelectDuration(duration)).await;
            }
            Event::Shutdown => {
                tracing::info!("shutting down...");
                break;
            }
        }
    }

    Ok(())
}
