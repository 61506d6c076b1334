//! Auto-controller heartbeat.
//!
//! While a session is present and the remote `auto_controller` flag is on,
//! periodically nudge the authority to advance rounds. This is a background
//! courtesy: the authority advances on its own too, so every failure here is
//! swallowed and nothing is ever surfaced to the user.

use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::rest::{Backend, Filter};
use crate::config::HeartbeatConfig;
use crate::feeds::realtime::{ChangeKind, Realtime, SubscriptionSpec};
use crate::scheduler::{self, TaskHandle};
use crate::session::Session;
use crate::state::ControllerSetting;

pub const SETTINGS_TABLE: &str = "controller_settings";
pub const SETTING_KEY: &str = "auto_controller";

/// Both conditions must hold for the heartbeat to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatGate {
    pub session_present: bool,
    pub enabled: bool,
}

impl HeartbeatGate {
    pub fn is_open(&self) -> bool {
        self.session_present && self.enabled
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    pub function: String,
    pub method: Method,
    pub startup_delay: Duration,
    pub period: Duration,
}

impl HeartbeatSchedule {
    pub fn from_config(cfg: &HeartbeatConfig) -> Self {
        Self {
            function: cfg.function.clone(),
            method: Method::from_bytes(cfg.method.as_bytes()).unwrap_or(Method::POST),
            startup_delay: cfg.startup_delay(),
            period: cfg.period(),
        }
    }
}

impl Default for HeartbeatSchedule {
    fn default() -> Self {
        Self::from_config(&HeartbeatConfig::default())
    }
}

pub struct Heartbeat<B: Backend> {
    backend: Arc<B>,
    schedule: HeartbeatSchedule,
    gate_open: bool,
    /// Set once the delayed first invocation of the current arming has run
    startup_fired: Arc<AtomicBool>,
    task: Option<TaskHandle>,
}

impl<B: Backend> Heartbeat<B> {
    pub fn new(backend: Arc<B>, schedule: HeartbeatSchedule) -> Self {
        Self {
            backend,
            schedule,
            gate_open: false,
            startup_fired: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Re-evaluate the gate. Arms on a closed->open edge and cancels
    /// everything pending on an open->closed edge; otherwise a no-op.
    pub fn update(&mut self, gate: HeartbeatGate) {
        let open = gate.is_open();
        if open == self.gate_open {
            return;
        }
        self.gate_open = open;

        if open {
            self.arm();
        } else {
            self.disarm();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(TaskHandle::is_active)
    }

    pub fn startup_fired(&self) -> bool {
        self.startup_fired.load(Ordering::SeqCst)
    }

    fn arm(&mut self) {
        // Fresh latch per arming; a stale job can only touch the old one
        let fired = Arc::new(AtomicBool::new(false));
        self.startup_fired = fired.clone();

        let backend = self.backend.clone();
        let function = self.schedule.function.clone();
        let method = self.schedule.method.clone();

        tracing::info!(
            delay_ms = self.schedule.startup_delay.as_millis() as u64,
            period_ms = self.schedule.period.as_millis() as u64,
            "heartbeat armed"
        );

        self.task = Some(scheduler::schedule(
            self.schedule.startup_delay,
            Some(self.schedule.period),
            move || {
                fired.store(true, Ordering::SeqCst);
                nudge(backend.clone(), function.clone(), method.clone());
                future::ready(())
            },
        ));
    }

    fn disarm(&mut self) {
        if !self.is_running() {
            self.task = None;
            return;
        }
        let startup_fired = self.startup_fired();
        if let Some(mut task) = self.task.take() {
            task.cancel();
            tracing::info!(startup_fired, "heartbeat stopped");
        }
    }

    /// Follow session and setting changes until either source closes.
    pub fn run(
        mut self,
        mut session_rx: watch::Receiver<Option<Session>>,
        mut setting_rx: watch::Receiver<ControllerSetting>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let gate = HeartbeatGate {
                    session_present: session_rx.borrow_and_update().is_some(),
                    enabled: setting_rx.borrow_and_update().enabled,
                };
                self.update(gate);

                let closed = tokio::select! {
                    changed = session_rx.changed() => changed.is_err(),
                    changed = setting_rx.changed() => changed.is_err(),
                };
                if closed {
                    self.disarm();
                    return;
                }
            }
        })
    }
}

/// Fire-and-forget: the call is detached from the schedule, so cancelling
/// the heartbeat stops future nudges but leaves one in flight alone.
fn nudge<B: Backend>(backend: Arc<B>, function: String, method: Method) {
    tokio::spawn(async move {
        match backend.invoke(&function, method).await {
            Ok(()) => tracing::debug!(function = %function, "controller nudged"),
            Err(e) => tracing::debug!(function = %function, "controller nudge failed: {}", e),
        }
    });
}

/// Read the flag once. Any failure reads as enabled.
pub async fn fetch_setting<B: Backend>(backend: &B) -> ControllerSetting {
    match backend
        .query_single(SETTINGS_TABLE, &Filter::new().eq("key", SETTING_KEY))
        .await
    {
        Ok(row) => ControllerSetting::from_record(&row),
        Err(e) => {
            tracing::debug!("controller setting unavailable, assuming enabled: {}", e);
            ControllerSetting::default()
        }
    }
}

/// Keep a `ControllerSetting` current: one read, then pushes on the
/// setting row replace it wholesale.
pub fn spawn_setting_sync<B: Backend>(
    backend: Arc<B>,
    realtime: Realtime,
) -> (watch::Receiver<ControllerSetting>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(ControllerSetting::default());
    // Subscribe before the read so no change slips between them
    let mut sub = realtime.subscribe(
        SubscriptionSpec::new("controller-settings", SETTINGS_TABLE, ChangeKind::All).eq_filter("key", SETTING_KEY),
    );

    let task = tokio::spawn(async move {
        let initial = fetch_setting(backend.as_ref()).await;
        tx.send_replace(initial);

        while let Some(change) = sub.recv().await {
            let setting = ControllerSetting::from_record(&change.new);
            tracing::info!(enabled = setting.enabled, "controller setting changed");
            tx.send_replace(setting);
        }
    });
    (rx, task)
}
