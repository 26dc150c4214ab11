use crate::errors::AlarmError;
use crate::types::{EventSender, TaskEvent};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), AlarmError>;

    fn now_ms(&self) -> u64 {
        system_time_ms(self.now())
    }
}

pub fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, AlarmError>;
    /// `Some(exit_code)` once the process has exited, `None` while it is still running.
    fn try_wait(&self, handle: u64) -> Result<Option<i32>, AlarmError>;
    fn kill(&self, handle: u64) -> Result<(), AlarmError>;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, AlarmError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn stdin_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), AlarmError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedAudio {
    pub path: PathBuf,
    pub duration: Option<Duration>,
}

/// Plays a loaded resource without blocking and posts `TaskEvent::AudioFinished` on `events`
/// when playback ends on its own.
pub trait AudioBackend: Send + Sync {
    fn load(&self, resource: &Path) -> Result<LoadedAudio, AlarmError>;
    fn start(&self, audio: &LoadedAudio, events: EventSender) -> Result<u64, AlarmError>;
    fn stop(&self, handle: u64) -> Result<(), AlarmError>;
}

#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub trait Timer: Send + Sync {
    fn schedule(&self, after: Duration, event: TaskEvent, sink: EventSender) -> TimerHandle;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), AlarmError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, AlarmError> {
        std::fs::read_to_string(path).map_err(|e| AlarmError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, std::process::Child>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, AlarmError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let child = cmd
            .spawn()
            .map_err(|e| AlarmError::AudioResource(format!("{}: {e}", request.program)))?;
        let mut state = self.state.lock().expect("process lock poisoned");
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(handle, child);
        Ok(handle)
    }

    fn try_wait(&self, handle: u64) -> Result<Option<i32>, AlarmError> {
        let mut state = self.state.lock().expect("process lock poisoned");
        let child = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| AlarmError::Io(format!("unknown handle {handle}")))?;
        let status = child.try_wait().map_err(|e| AlarmError::Io(e.to_string()))?;
        match status {
            Some(status) => {
                state.children.remove(&handle);
                Ok(Some(status.code().unwrap_or(-1)))
            }
            None => Ok(None),
        }
    }

    fn kill(&self, handle: u64) -> Result<(), AlarmError> {
        let mut child = {
            let mut state = self.state.lock().expect("process lock poisoned");
            state.children.remove(&handle)
        }
        .ok_or_else(|| AlarmError::Io(format!("unknown handle {handle}")))?;

        child.kill().map_err(|e| AlarmError::Io(e.to_string()))?;
        let _ = child.wait();
        Ok(())
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdin_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdin())
    }

    fn write_line(&self, line: &str) -> Result<(), AlarmError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| AlarmError::Io(e.to_string()))
    }
}

pub struct ProductionTimer {
    clock: Arc<dyn Clock>,
}

impl ProductionTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Timer for ProductionTimer {
    fn schedule(&self, after: Duration, event: TaskEvent, sink: EventSender) -> TimerHandle {
        let handle = TimerHandle::default();
        let watched = handle.clone();
        let clock = Arc::clone(&self.clock);
        let deadline = clock.now() + after;
        std::thread::spawn(move || {
            if clock.sleep_until(deadline).is_err() {
                return;
            }
            if !watched.is_cancelled() {
                // Receiver gone means the session already ended.
                let _ = sink.send(event);
            }
        });
        handle
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
    pub timer: Arc<dyn Timer>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(ProductionClock);
        Self {
            timer: Arc::new(ProductionTimer::new(Arc::clone(&clock))),
            clock,
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), AlarmError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        *self.now.lock().expect("clock lock") = deadline;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.insert(path, contents);
        fs
    }

    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, AlarmError> {
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| AlarmError::Io(format!("missing file {}", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    pub is_tty: bool,
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new(is_tty: bool) -> Self {
        Self {
            is_tty,
            ..Self::default()
        }
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn stdin_is_tty(&self) -> bool {
        self.is_tty
    }

    fn write_line(&self, line: &str) -> Result<(), AlarmError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    exited: Arc<Mutex<HashMap<u64, i32>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
    fail_next_spawn: Arc<Mutex<Option<AlarmError>>>,
}

impl FakeProcessRunner {
    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }

    pub fn finish(&self, handle: u64, exit_code: i32) {
        self.exited
            .lock()
            .expect("exited lock")
            .insert(handle, exit_code);
    }

    pub fn set_fail_next_spawn(&self, error: AlarmError) {
        *self.fail_next_spawn.lock().expect("fail lock") = Some(error);
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, AlarmError> {
        if let Some(err) = self.fail_next_spawn.lock().expect("fail lock").take() {
            return Err(err);
        }
        self.spawned.lock().expect("spawned lock").push(request);
        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        Ok(handle)
    }

    fn try_wait(&self, handle: u64) -> Result<Option<i32>, AlarmError> {
        Ok(self.exited.lock().expect("exited lock").get(&handle).copied())
    }

    fn kill(&self, handle: u64) -> Result<(), AlarmError> {
        self.kills.lock().expect("kills lock").push(handle);
        self.exited.lock().expect("exited lock").insert(handle, -9);
        Ok(())
    }
}

struct ScheduledTimer {
    event: TaskEvent,
    sink: EventSender,
    handle: TimerHandle,
}

/// Holds scheduled timers until the test fires them.
#[derive(Default, Clone)]
pub struct FakeTimer {
    pending: Arc<Mutex<Vec<ScheduledTimer>>>,
    history: Arc<Mutex<Vec<Duration>>>,
}

impl FakeTimer {
    pub fn scheduled(&self) -> Vec<Duration> {
        self.history.lock().expect("timer lock").clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .expect("timer lock")
            .iter()
            .filter(|timer| !timer.handle.is_cancelled())
            .count()
    }

    /// Delivers every non-cancelled timer event and returns how many were sent.
    pub fn fire_all(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock().expect("timer lock"));
        let mut fired = 0;
        for timer in pending {
            if timer.handle.is_cancelled() {
                continue;
            }
            if timer.sink.send(timer.event).is_ok() {
                fired += 1;
            }
        }
        fired
    }
}

impl Timer for FakeTimer {
    fn schedule(&self, after: Duration, event: TaskEvent, sink: EventSender) -> TimerHandle {
        let handle = TimerHandle::default();
        self.history.lock().expect("timer lock").push(after);
        self.pending.lock().expect("timer lock").push(ScheduledTimer {
            event,
            sink,
            handle: handle.clone(),
        });
        handle
    }
}

#[derive(Default)]
struct FakeAudioState {
    missing: HashSet<PathBuf>,
    duration: Option<Duration>,
    next_handle: u64,
    sinks: HashMap<u64, EventSender>,
    started: Vec<PathBuf>,
    stopped: Vec<u64>,
}

#[derive(Default, Clone)]
pub struct FakeAudioBackend {
    state: Arc<Mutex<FakeAudioState>>,
}

impl FakeAudioBackend {
    pub fn with_missing(path: impl Into<PathBuf>) -> Self {
        let backend = Self::default();
        backend
            .state
            .lock()
            .expect("audio lock")
            .missing
            .insert(path.into());
        backend
    }

    pub fn with_duration(duration: Duration) -> Self {
        let backend = Self::default();
        backend.state.lock().expect("audio lock").duration = Some(duration);
        backend
    }

    pub fn started(&self) -> Vec<PathBuf> {
        self.state.lock().expect("audio lock").started.clone()
    }

    pub fn stopped(&self) -> Vec<u64> {
        self.state.lock().expect("audio lock").stopped.clone()
    }

    pub fn is_playing(&self) -> bool {
        !self.state.lock().expect("audio lock").sinks.is_empty()
    }

    /// Simulates playback reaching its natural end.
    pub fn finish(&self, handle: u64) -> bool {
        let sink = self.state.lock().expect("audio lock").sinks.remove(&handle);
        sink.map(|sink| sink.send(TaskEvent::AudioFinished).is_ok())
            .unwrap_or(false)
    }
}

impl AudioBackend for FakeAudioBackend {
    fn load(&self, resource: &Path) -> Result<LoadedAudio, AlarmError> {
        let state = self.state.lock().expect("audio lock");
        if state.missing.contains(resource) {
            return Err(AlarmError::AudioResource(format!(
                "cannot load {}",
                resource.display()
            )));
        }
        Ok(LoadedAudio {
            path: resource.to_path_buf(),
            duration: state.duration,
        })
    }

    fn start(&self, audio: &LoadedAudio, events: EventSender) -> Result<u64, AlarmError> {
        let mut state = self.state.lock().expect("audio lock");
        let handle = state.next_handle;
        state.next_handle += 1;
        state.sinks.insert(handle, events);
        state.started.push(audio.path.clone());
        Ok(handle)
    }

    fn stop(&self, handle: u64) -> Result<(), AlarmError> {
        let mut state = self.state.lock().expect("audio lock");
        state.sinks.remove(&handle);
        state.stopped.push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::event_channel;

    #[test]
    fn fake_timer_skips_cancelled_handles() {
        let timer = FakeTimer::default();
        let (tx, mut rx) = event_channel();
        let kept = timer.schedule(Duration::from_secs(5), TaskEvent::TimedOut, tx.clone());
        let dropped = timer.schedule(Duration::from_secs(9), TaskEvent::TimedOut, tx);
        dropped.cancel();

        assert_eq!(timer.pending_count(), 1);
        assert_eq!(timer.fire_all(), 1);
        assert!(!kept.is_cancelled());
        assert_eq!(rx.try_recv().expect("one event"), TaskEvent::TimedOut);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            timer.scheduled(),
            vec![Duration::from_secs(5), Duration::from_secs(9)]
        );
    }

    #[test]
    fn production_timer_delivers_unless_cancelled() {
        let timer = ProductionTimer::new(Arc::new(ProductionClock));
        let (tx, mut rx) = event_channel();
        let cancelled = timer.schedule(Duration::from_millis(5), TaskEvent::Action, tx.clone());
        cancelled.cancel();
        timer.schedule(Duration::from_millis(10), TaskEvent::TimedOut, tx);

        assert_eq!(rx.blocking_recv(), Some(TaskEvent::TimedOut));
    }

    #[test]
    fn fake_clock_advances_and_records_sleeps() {
        let clock = FakeClock::default();
        let start = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_ms() - system_time_ms(start), 250);
        let deadline = clock.now() + Duration::from_secs(1);
        clock.sleep_until(deadline).expect("sleep");
        assert_eq!(clock.sleeps(), vec![deadline]);
        assert_eq!(clock.now(), deadline);
    }
}
