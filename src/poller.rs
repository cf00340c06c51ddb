use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LiveError;
use crate::visibility::VisibilitySignal;

/// Lower bound for polling cadence.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

pub type TickFuture = Pin<Box<dyn Future<Output = Result<(), LiveError>> + Send>>;
pub type TickFn = Arc<dyn Fn() -> TickFuture + Send + Sync>;
pub type TickErrorFn = Arc<dyn Fn(&LiveError) + Send + Sync>;

/// Per-subscription configuration.
#[derive(Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub on_tick: TickFn,
    pub on_error: Option<TickErrorFn>,
    /// Run the first tick right away instead of one interval out.
    pub immediate: bool,
    /// Suspend while the hosting document is hidden.
    pub pause_when_hidden: bool,
}

impl PollConfig {
    pub fn new(interval: Duration, on_tick: TickFn) -> Self {
        Self {
            interval,
            on_tick,
            on_error: None,
            immediate: false,
            pause_when_hidden: true,
        }
    }
}

/// Live snapshot of a subscription.
#[derive(Debug, Clone, Default)]
pub struct PollState {
    pub active: bool,
    pub paused: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub next_tick_at: Option<DateTime<Utc>>,
    pub tick_count: u64,
    pub error_count: u64,
    pub executing: bool,
    pub paused_by_visibility: bool,
}

enum Command {
    Pause { by_visibility: bool },
    Resume { by_visibility: bool },
    Trigger { done: oneshot::Sender<()> },
    SetInterval(Duration),
    Stop,
}

struct SubHandle {
    cmd: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<PollState>>,
    pause_when_hidden: bool,
    _task: JoinHandle<()>,
}

/// Per-subscription periodic execution with pause, resume, manual
/// trigger, and visibility-aware suspension.
///
/// Each subscription runs as one actor task: a single pending wake-up
/// deadline, at most one executing tick (spawned so commands stay
/// responsive), and rescheduling strictly after tick resolution.
pub struct Poller {
    subs: Arc<DashMap<String, SubHandle>>,
    visibility_task: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            subs: Arc::new(DashMap::new()),
            visibility_task: None,
        }
    }

    /// A poller that suspends `pause_when_hidden` subscriptions while
    /// the host document is hidden.
    pub fn with_visibility(signal: &VisibilitySignal) -> Self {
        let subs: Arc<DashMap<String, SubHandle>> = Arc::new(DashMap::new());
        let task = spawn_visibility_listener(Arc::clone(&subs), signal.subscribe());
        Self {
            subs,
            visibility_task: Some(task),
        }
    }

    /// Register and schedule a subscription. Fails on a duplicate id
    /// or an interval below the 1 s floor.
    pub fn start(&self, id: &str, config: PollConfig) -> Result<(), LiveError> {
        if config.interval < MIN_POLL_INTERVAL {
            return Err(LiveError::Misconfiguration(format!(
                "poll interval {}ms is below the {}ms minimum",
                config.interval.as_millis(),
                MIN_POLL_INTERVAL.as_millis()
            )));
        }
        match self.subs.entry(id.to_string()) {
            Entry::Occupied(_) => Err(LiveError::Misconfiguration(format!(
                "poll subscription '{}' already exists",
                id
            ))),
            Entry::Vacant(slot) => {
                let state = Arc::new(RwLock::new(PollState {
                    active: true,
                    ..PollState::default()
                }));
                let (tx, rx) = mpsc::unbounded_channel();
                let pause_when_hidden = config.pause_when_hidden;
                let task = tokio::spawn(run_subscription(
                    id.to_string(),
                    config,
                    Arc::clone(&state),
                    rx,
                ));
                slot.insert(SubHandle {
                    cmd: tx,
                    state,
                    pause_when_hidden,
                    _task: task,
                });
                debug!(id, "poll subscription started");
                Ok(())
            }
        }
    }

    /// Remove a subscription, aborting its in-flight tick.
    pub fn stop(&self, id: &str) -> bool {
        if let Some((_, handle)) = self.subs.remove(id) {
            let _ = handle.cmd.send(Command::Stop);
            true
        } else {
            false
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.subs.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    pub fn pause(&self, id: &str) {
        self.send(id, Command::Pause {
            by_visibility: false,
        });
    }

    pub fn pause_all(&self) {
        for entry in self.subs.iter() {
            let _ = entry.cmd.send(Command::Pause {
                by_visibility: false,
            });
        }
    }

    pub fn resume(&self, id: &str) {
        self.send(id, Command::Resume {
            by_visibility: false,
        });
    }

    pub fn resume_all(&self) {
        for entry in self.subs.iter() {
            let _ = entry.cmd.send(Command::Resume {
                by_visibility: false,
            });
        }
    }

    /// Force a tick now, resolving once it completes. The armed timer
    /// is left alone; an already-executing tick makes this a no-op.
    pub async fn trigger_now(&self, id: &str) -> Result<(), LiveError> {
        let sender = self
            .subs
            .get(id)
            .map(|entry| entry.cmd.clone())
            .ok_or_else(|| {
                LiveError::Misconfiguration(format!("unknown poll subscription '{}'", id))
            })?;
        let (done_tx, done_rx) = oneshot::channel();
        sender
            .send(Command::Trigger { done: done_tx })
            .map_err(|_| {
                LiveError::Misconfiguration(format!("poll subscription '{}' has stopped", id))
            })?;
        let _ = done_rx.await;
        Ok(())
    }

    /// Change the cadence. An armed, unpaused timer is re-armed from
    /// now; an executing tick picks the new interval up when it
    /// reschedules.
    pub fn set_interval(&self, id: &str, interval: Duration) -> Result<(), LiveError> {
        if interval < MIN_POLL_INTERVAL {
            return Err(LiveError::Misconfiguration(format!(
                "poll interval {}ms is below the {}ms minimum",
                interval.as_millis(),
                MIN_POLL_INTERVAL.as_millis()
            )));
        }
        let entry = self.subs.get(id).ok_or_else(|| {
            LiveError::Misconfiguration(format!("unknown poll subscription '{}'", id))
        })?;
        let _ = entry.cmd.send(Command::SetInterval(interval));
        Ok(())
    }

    pub fn state(&self, id: &str) -> Option<PollState> {
        self.subs
            .get(id)
            .map(|entry| entry.state.read().expect("poll state lock poisoned").clone())
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.subs.iter().map(|e| e.key().clone()).collect()
    }

    pub fn has(&self, id: &str) -> bool {
        self.subs.contains_key(id)
    }

    /// Stop everything and detach from the visibility signal.
    pub fn destroy(&self) {
        self.stop_all();
        if let Some(task) = &self.visibility_task {
            task.abort();
        }
    }

    fn send(&self, id: &str, command: Command) {
        if let Some(entry) = self.subs.get(id) {
            let _ = entry.cmd.send(command);
        }
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(task) = &self.visibility_task {
            task.abort();
        }
    }
}

fn spawn_visibility_listener(
    subs: Arc<DashMap<String, SubHandle>>,
    mut rx: tokio::sync::watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let visible = *rx.borrow();
            debug!(visible, "document visibility changed");
            for entry in subs.iter() {
                if visible {
                    let _ = entry.cmd.send(Command::Resume {
                        by_visibility: true,
                    });
                } else if entry.pause_when_hidden {
                    let _ = entry.cmd.send(Command::Pause {
                        by_visibility: true,
                    });
                }
            }
        }
    })
}

/// Wall-clock projection of a scheduling deadline.
fn wall_time_for(deadline: Option<Instant>) -> Option<DateTime<Utc>> {
    deadline.map(|d| {
        let remaining = d.saturating_duration_since(Instant::now());
        Utc::now() + chrono::Duration::milliseconds(remaining.as_millis() as i64)
    })
}

struct ExecutingTick {
    task: JoinHandle<()>,
    acks: Vec<oneshot::Sender<()>>,
    /// Whether the tick came from the timer (reschedules on
    /// completion) rather than a manual trigger (does not).
    scheduled: bool,
}

#[allow(clippy::too_many_lines)]
async fn run_subscription(
    id: String,
    config: PollConfig,
    state: Arc<RwLock<PollState>>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut interval = config.interval;
    let mut paused = false;
    let mut deadline: Option<Instant> = Some(if config.immediate {
        Instant::now()
    } else {
        Instant::now() + interval
    });
    let mut executing: Option<ExecutingTick> = None;
    let mut done_rx: Option<oneshot::Receiver<Result<(), LiveError>>> = None;
    // Set when the timer fires during a manually triggered tick; the
    // wake-up is absorbed and re-armed once that tick resolves.
    let mut missed_deadline = false;

    {
        let mut s = state.write().expect("poll state lock poisoned");
        s.next_tick_at = wall_time_for(deadline);
    }

    let start_tick = |scheduled: bool,
                      acks: Vec<oneshot::Sender<()>>,
                      state: &Arc<RwLock<PollState>>|
     -> (ExecutingTick, oneshot::Receiver<Result<(), LiveError>>) {
        {
            let mut s = state.write().expect("poll state lock poisoned");
            s.executing = true;
            s.tick_count += 1;
            s.last_tick_at = Some(Utc::now());
        }
        let (tx, rx) = oneshot::channel();
        let fut = (config.on_tick)();
        let task = tokio::spawn(async move {
            let result = fut.await;
            let _ = tx.send(result);
        });
        (
            ExecutingTick {
                task,
                acks,
                scheduled,
            },
            rx,
        )
    };

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    None | Some(Command::Stop) => {
                        if let Some(tick) = executing.take() {
                            tick.task.abort();
                            for ack in tick.acks {
                                let _ = ack.send(());
                            }
                        }
                        break;
                    }
                    Some(Command::Pause { by_visibility }) => {
                        if paused {
                            // A user pause outranks a visibility pause.
                            if !by_visibility {
                                let mut s = state.write().expect("poll state lock poisoned");
                                s.paused_by_visibility = false;
                            }
                        } else {
                            paused = true;
                            deadline = None;
                            missed_deadline = false;
                            let mut s = state.write().expect("poll state lock poisoned");
                            s.paused = true;
                            s.paused_by_visibility = by_visibility;
                            s.next_tick_at = None;
                        }
                    }
                    Some(Command::Resume { by_visibility }) => {
                        let tagged = state
                            .read()
                            .expect("poll state lock poisoned")
                            .paused_by_visibility;
                        let applies = paused && (!by_visibility || tagged);
                        if applies {
                            paused = false;
                            if executing.is_none() {
                                deadline = Some(Instant::now() + interval);
                            }
                            let mut s = state.write().expect("poll state lock poisoned");
                            s.paused = false;
                            s.paused_by_visibility = false;
                            s.next_tick_at = wall_time_for(deadline);
                        }
                    }
                    Some(Command::Trigger { done }) => {
                        if executing.is_some() {
                            // Non-overlap: a running tick makes the
                            // trigger a no-op; resolve the caller now.
                            let _ = done.send(());
                        } else {
                            let (tick, tick_rx) = start_tick(false, vec![done], &state);
                            executing = Some(tick);
                            done_rx = Some(tick_rx);
                        }
                    }
                    Some(Command::SetInterval(new_interval)) => {
                        interval = new_interval;
                        if deadline.is_some() && !paused {
                            deadline = Some(Instant::now() + interval);
                        }
                        let mut s = state.write().expect("poll state lock poisoned");
                        s.next_tick_at = wall_time_for(deadline);
                    }
                }
            }
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                deadline = None;
                if executing.is_some() {
                    missed_deadline = true;
                } else {
                    let (tick, tick_rx) = start_tick(true, Vec::new(), &state);
                    executing = Some(tick);
                    done_rx = Some(tick_rx);
                }
                let mut s = state.write().expect("poll state lock poisoned");
                s.next_tick_at = None;
            }
            result = async { done_rx.as_mut().expect("guarded by arm condition").await },
                if done_rx.is_some() =>
            {
                done_rx = None;
                let tick = executing.take().expect("tick bookkeeping out of sync");
                for ack in tick.acks {
                    let _ = ack.send(());
                }

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(id = %id, error = %err, "poll tick failed");
                        {
                            let mut s = state.write().expect("poll state lock poisoned");
                            s.error_count += 1;
                        }
                        if let Some(on_error) = &config.on_error {
                            on_error(&err);
                        }
                    }
                    Err(_) => {
                        warn!(id = %id, "poll tick task dropped without a result");
                        let mut s = state.write().expect("poll state lock poisoned");
                        s.error_count += 1;
                    }
                }

                // Reschedule strictly after resolution. A triggered
                // tick leaves a still-armed timer untouched.
                if !paused && deadline.is_none() && (tick.scheduled || missed_deadline) {
                    deadline = Some(Instant::now() + interval);
                }
                missed_deadline = false;

                let mut s = state.write().expect("poll state lock poisoned");
                s.executing = false;
                s.next_tick_at = wall_time_for(deadline);
            }
        }
    }

    let mut s = state.write().expect("poll state lock poisoned");
    s.active = false;
    s.executing = false;
    s.paused = false;
    s.next_tick_at = None;
    debug!(id = %id, "poll subscription stopped");
}
