//! A background loop that runs a callback on an interval or at fixed times
//! of day, with lifecycle hooks and reconnect-style retries.

mod sleep;

pub use sleep::SleepHandle;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::backoff::ExponentialBackoff;
use crate::error::{Result, VoiceError};
use crate::latch::Latch;

type Callback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type Hook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type ErrorHook = Arc<dyn Fn(anyhow::Error) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed delay between the starts of two iterations.
    Interval(Duration),
    /// Times of day in UTC.
    Times(Vec<NaiveTime>),
}

impl Schedule {
    /// Builds a time-of-day schedule, dropping duplicates and sorting.
    pub fn times(times: impl IntoIterator<Item = NaiveTime>) -> Result<Self> {
        let mut times: Vec<NaiveTime> = times.into_iter().collect();
        times.sort();
        times.dedup();
        if times.is_empty() {
            return Err(VoiceError::Config("time schedule must not be empty".into()));
        }
        Ok(Schedule::Times(times))
    }

    fn validated(self) -> Result<Self> {
        match self {
            Schedule::Times(times) => Schedule::times(times),
            interval => Ok(interval),
        }
    }
}

#[derive(Debug)]
struct LoopState {
    schedule: Schedule,
    count: Option<u32>,
    reconnect: bool,
    current_loop: u32,
    time_index: usize,
    last_iteration: Option<DateTime<Utc>>,
    next_iteration: Option<DateTime<Utc>>,
    handle: Option<Arc<SleepHandle>>,
    stop_next_iteration: bool,
    being_cancelled: bool,
    has_failed: bool,
}

fn at(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    date.and_time(time).and_utc()
}

fn tomorrow(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    today.succ_opt().unwrap_or(today)
}

impl LoopState {
    fn new(schedule: Schedule, count: Option<u32>, reconnect: bool) -> Self {
        Self {
            schedule,
            count,
            reconnect,
            current_loop: 0,
            time_index: 0,
            last_iteration: None,
            next_iteration: None,
            handle: None,
            stop_next_iteration: false,
            being_cancelled: false,
            has_failed: false,
        }
    }

    fn next_sleep_time(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let times = match &self.schedule {
            Schedule::Interval(every) => {
                let last = self.last_iteration.unwrap_or(now);
                return TimeDelta::from_std(*every)
                    .ok()
                    .and_then(|delta| last.checked_add_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
            }
            Schedule::Times(times) => times.clone(),
        };

        if self.time_index >= times.len() {
            self.time_index = 0;
            if self.current_loop == 0 {
                // past the last time on the first run: first time tomorrow
                return at(tomorrow(now), times[0]);
            }
        }

        let next_time = times[self.time_index];
        self.time_index += 1;

        if self.current_loop == 0 {
            return if next_time > now.time() {
                at(now.date_naive(), next_time)
            } else {
                at(tomorrow(now), next_time)
            };
        }

        let last = self.last_iteration.unwrap_or(now);
        let date = if next_time < last.time() {
            tomorrow(last)
        } else {
            last.date_naive()
        };
        at(date, next_time)
    }

    /// Points the time cursor at the first time not before `now`.
    fn prepare_time_index(&mut self, now: DateTime<Utc>) {
        if let Schedule::Times(times) = &self.schedule {
            let now = now.time();
            self.time_index = times.iter().position(|t| *t >= now).unwrap_or(0);
        }
    }
}

struct Core {
    state: Mutex<LoopState>,
    cancelled: Latch,
}

impl Core {
    fn state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep_until(&self, at: DateTime<Utc>) {
        let handle = Arc::new(SleepHandle::new(at));
        self.state().handle = Some(handle.clone());
        handle.wait().await;
    }
}

#[derive(Clone, Default)]
struct Hooks {
    before_loop: Option<Hook>,
    after_loop: Option<Hook>,
    on_error: Option<ErrorHook>,
}

/// Errors worth another try after a backoff when `reconnect` is set.
fn is_transient(e: &anyhow::Error) -> bool {
    if let Some(voice) = e.downcast_ref::<VoiceError>() {
        return voice.is_retryable() || matches!(voice, VoiceError::Io(_));
    }
    e.downcast_ref::<std::io::Error>().is_some()
        || e.downcast_ref::<tokio::time::error::Elapsed>().is_some()
}

pub struct Loop {
    callback: Callback,
    hooks: Hooks,
    core: Arc<Core>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Loop {
    pub fn new<F, Fut>(
        callback: F,
        schedule: Schedule,
        count: Option<u32>,
        reconnect: bool,
    ) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if count == Some(0) {
            return Err(VoiceError::Config("count must be greater than 0 or None".into()));
        }
        let schedule = schedule.validated()?;

        Ok(Self {
            callback: Arc::new(move || callback().boxed()),
            hooks: Hooks::default(),
            core: Arc::new(Core {
                state: Mutex::new(LoopState::new(schedule, count, reconnect)),
                cancelled: Latch::new(),
            }),
            task: Arc::new(Mutex::new(None)),
        })
    }

    pub fn before_loop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.before_loop = Some(Arc::new(move || hook().boxed()));
        self
    }

    pub fn after_loop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.after_loop = Some(Arc::new(move || hook().boxed()));
        self
    }

    /// Called with the error that ended the loop. Without one, the error is logged.
    pub fn on_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(anyhow::Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.on_error = Some(Arc::new(move |e| hook(e).boxed()));
        self
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(&self) -> Result<()> {
        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(VoiceError::Task(
                "task is already launched and is not completed".into(),
            ));
        }
        self.core.cancelled.clear();
        *task = Some(tokio::spawn(run(
            self.core.clone(),
            self.callback.clone(),
            self.hooks.clone(),
        )));
        Ok(())
    }

    /// Lets the current iteration finish, then ends the loop.
    pub fn stop(&self) {
        if self.is_running() {
            self.core.state().stop_next_iteration = true;
        }
    }

    /// Ends the loop at its next suspension point. `after_loop` still runs.
    pub fn cancel(&self) {
        if self.is_running() && !self.is_being_cancelled() {
            self.core.cancelled.set();
        }
    }

    /// Cancels the running loop and starts it again once it has wound down.
    pub fn restart(&self) {
        let mut task = self.task();
        let old = match task.take() {
            Some(old) if !old.is_finished() => old,
            _ => {
                drop(task);
                if let Err(e) = self.start() {
                    log::warn!("Failed to restart loop: {}", e);
                }
                return;
            }
        };

        self.core.cancelled.set();
        let core = self.core.clone();
        let callback = self.callback.clone();
        let hooks = self.hooks.clone();
        *task = Some(tokio::spawn(async move {
            let _ = old.await;
            core.cancelled.clear();
            run(core, callback, hooks).await;
        }));
    }

    /// Waits for the loop to end.
    pub async fn join(&self) {
        let handle = self.task().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Loop task panicked: {}", e);
            }
        }
    }

    pub fn change_interval(&self, schedule: Schedule) -> Result<()> {
        let schedule = schedule.validated()?;
        let running = self.is_running();

        let mut state = self.core.state();
        state.schedule = schedule;
        // a loop still in before_loop has no last iteration yet
        if let (true, Some(last)) = (running, state.last_iteration) {
            state.prepare_time_index(last);
            let next = state.next_sleep_time(Utc::now());
            state.next_iteration = Some(next);
            if let Some(handle) = state.handle.as_ref().filter(|h| !h.done()) {
                handle.recalculate(next);
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn is_being_cancelled(&self) -> bool {
        self.core.state().being_cancelled
    }

    /// Whether the last run ended with an error.
    pub fn failed(&self) -> bool {
        self.core.state().has_failed
    }

    pub fn current_loop(&self) -> u32 {
        self.core.state().current_loop
    }

    pub fn next_iteration(&self) -> Option<DateTime<Utc>> {
        if !self.is_running() {
            return None;
        }
        let state = self.core.state();
        if state.stop_next_iteration {
            return None;
        }
        state.next_iteration
    }

    pub fn schedule(&self) -> Schedule {
        self.core.state().schedule.clone()
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        if let Some(task) = self.task().take() {
            task.abort();
        }
    }
}

async fn run(core: Arc<Core>, callback: Callback, hooks: Hooks) {
    {
        let mut state = core.state();
        state.has_failed = false;
        state.current_loop = 0;
    }
    if let Some(before) = &hooks.before_loop {
        before().await;
    }

    let result = tokio::select! {
        result = iterate(&core, &callback) => result,
        _ = core.cancelled.wait() => {
            core.state().being_cancelled = true;
            Ok(())
        }
    };

    if let Err(e) = result {
        core.state().has_failed = true;
        match &hooks.on_error {
            Some(on_error) => on_error(e).await,
            None => log::error!("Unhandled error in background loop: {:?}", e),
        }
    }

    if let Some(after) = &hooks.after_loop {
        after().await;
    }

    let mut state = core.state();
    if let Some(handle) = state.handle.take() {
        handle.cancel();
    }
    state.being_cancelled = false;
    state.current_loop = 0;
    state.stop_next_iteration = false;
}

async fn iterate(core: &Core, callback: &Callback) -> anyhow::Result<()> {
    let mut backoff = ExponentialBackoff::default();
    let (first, reconnect) = {
        let mut state = core.state();
        let now = Utc::now();
        let first = if matches!(state.schedule, Schedule::Times(_)) {
            state.prepare_time_index(now.with_nanosecond(0).unwrap_or(now));
            state.next_sleep_time(now)
        } else {
            now
        };
        state.next_iteration = Some(first);
        (first, state.reconnect)
    };
    core.sleep_until(first).await;

    let mut last_failed = false;
    loop {
        if !last_failed {
            let mut state = core.state();
            state.last_iteration = state.next_iteration;
            let next = state.next_sleep_time(Utc::now());
            state.next_iteration = Some(next);
        }

        match callback().await {
            Ok(()) => last_failed = false,
            Err(e) if is_transient(&e) => {
                last_failed = true;
                if !reconnect {
                    return Err(e);
                }
                let retry = backoff.delay();
                log::warn!("Loop iteration failed ({}), retrying in {:.2}s", e, retry.as_secs_f64());
                tokio::time::sleep(retry).await;
                continue;
            }
            Err(e) => return Err(e),
        }

        let next = core.state().next_iteration.unwrap_or_else(Utc::now);
        core.sleep_until(next).await;

        let mut state = core.state();
        if state.stop_next_iteration {
            return Ok(());
        }

        let now = Utc::now();
        if state.next_iteration.is_some_and(|next| now > next) {
            state.next_iteration = Some(now);
            state.prepare_time_index(now);
        }

        state.current_loop += 1;
        if Some(state.current_loop) == state.count {
            return Ok(());
        }
    }
}
