use crate::errors::AlarmError;
use crate::logging::append_run_log;
use crate::runtime::{AudioBackend, LoadedAudio, ProcessRequest, ProcessRunner};
use crate::types::{EventSender, TaskEvent};
use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The alarm sound for one session. Playback never blocks the caller; `stop` is idempotent
/// and never fails.
pub struct AudioCue {
    backend: Arc<dyn AudioBackend>,
    resource: PathBuf,
    loaded: Option<LoadedAudio>,
    playing: Option<u64>,
}

impl AudioCue {
    pub fn new(backend: Arc<dyn AudioBackend>, resource: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            resource: resource.into(),
            loaded: None,
            playing: None,
        }
    }

    pub fn load(&mut self) -> Result<&LoadedAudio, AlarmError> {
        if self.loaded.is_none() {
            self.loaded = Some(self.backend.load(&self.resource)?);
        }
        self.loaded
            .as_ref()
            .ok_or_else(|| AlarmError::AudioResource("audio not loaded".to_string()))
    }

    /// Duration reported by the resource itself, once loaded.
    pub fn duration(&self) -> Option<Duration> {
        self.loaded.as_ref().and_then(|loaded| loaded.duration)
    }

    pub fn play(&mut self, events: EventSender) -> Result<(), AlarmError> {
        self.stop();
        let loaded = self.load()?.clone();
        let handle = self.backend.start(&loaded, events)?;
        self.playing = Some(handle);
        append_run_log(
            "debug",
            "alarm.audio.started",
            json!({
                "resource": self.resource.display().to_string(),
                "handle": handle,
            }),
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.playing.take() else {
            return;
        };
        if let Err(err) = self.backend.stop(handle) {
            append_run_log(
                "debug",
                "alarm.audio.stop_failed",
                json!({
                    "handle": handle,
                    "error": err.to_string(),
                }),
            );
        }
    }

    /// Playback ended on its own.
    pub fn mark_finished(&mut self) {
        self.playing = None;
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }
}

/// Plays resources through an external player program (`aplay`, `afplay`, ...).
pub struct CommandAudioBackend {
    runner: Arc<dyn ProcessRunner>,
    player: String,
    player_args: Vec<String>,
    poll_interval: Duration,
    stopped: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl CommandAudioBackend {
    pub fn new(runner: Arc<dyn ProcessRunner>, player: &str, player_args: &[String]) -> Self {
        Self {
            runner,
            player: player.to_string(),
            player_args: player_args.to_vec(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stopped: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl AudioBackend for CommandAudioBackend {
    fn load(&self, resource: &Path) -> Result<LoadedAudio, AlarmError> {
        if !resource.is_file() {
            return Err(AlarmError::AudioResource(format!(
                "{} does not exist or is not a file",
                resource.display()
            )));
        }
        File::open(resource)
            .map_err(|e| AlarmError::AudioResource(format!("{}: {e}", resource.display())))?;
        let duration = if is_wav(resource) {
            Some(read_wav_duration(resource)?)
        } else {
            None
        };
        Ok(LoadedAudio {
            path: resource.to_path_buf(),
            duration,
        })
    }

    fn start(&self, audio: &LoadedAudio, events: EventSender) -> Result<u64, AlarmError> {
        let mut args = self.player_args.clone();
        args.push(audio.path.display().to_string());
        let handle = self
            .runner
            .spawn(ProcessRequest {
                program: self.player.clone(),
                args,
                cwd: None,
            })
            .map_err(|e| AlarmError::AudioResource(e.to_string()))?;

        let stopped = Arc::new(AtomicBool::new(false));
        self.stopped
            .lock()
            .expect("audio stop lock")
            .insert(handle, Arc::clone(&stopped));

        let runner = Arc::clone(&self.runner);
        let poll_interval = self.poll_interval;
        std::thread::spawn(move || loop {
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            match runner.try_wait(handle) {
                Ok(Some(_)) => {
                    if !stopped.load(Ordering::SeqCst) {
                        let _ = events.send(TaskEvent::AudioFinished);
                    }
                    return;
                }
                Ok(None) => std::thread::sleep(poll_interval),
                Err(_) => return,
            }
        });
        Ok(handle)
    }

    fn stop(&self, handle: u64) -> Result<(), AlarmError> {
        let flag = self
            .stopped
            .lock()
            .expect("audio stop lock")
            .remove(&handle);
        let Some(flag) = flag else {
            return Ok(());
        };
        flag.store(true, Ordering::SeqCst);
        // The player may already have exited, in which case there is nothing to kill.
        let _ = self.runner.kill(handle);
        Ok(())
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
}

pub fn read_wav_duration(path: &Path) -> Result<Duration, AlarmError> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| AlarmError::AudioResource(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(AlarmError::AudioResource(format!(
            "{}: zero sample rate",
            path.display()
        )));
    }
    let frames = u64::from(reader.duration());
    Ok(Duration::from_millis(
        frames * 1000 / u64::from(spec.sample_rate),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeAudioBackend, FakeProcessRunner};
    use crate::types::event_channel;

    fn write_wav(path: &Path, seconds: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("wav writer");
        for _ in 0..(8_000 * seconds) {
            writer.write_sample(0i16).expect("sample");
        }
        writer.finalize().expect("finalize");
    }

    #[test]
    fn wav_resources_report_their_duration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alarm.wav");
        write_wav(&path, 2);
        let backend = CommandAudioBackend::new(Arc::new(FakeProcessRunner::default()), "aplay", &[]);
        let loaded = backend.load(&path).expect("load");
        assert_eq!(loaded.duration, Some(Duration::from_secs(2)));
    }

    #[test]
    fn missing_and_malformed_resources_fail_to_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = CommandAudioBackend::new(Arc::new(FakeProcessRunner::default()), "aplay", &[]);
        let err = backend
            .load(&dir.path().join("missing.wav"))
            .expect_err("missing");
        assert!(matches!(err, AlarmError::AudioResource(_)));

        let bogus = dir.path().join("bogus.wav");
        std::fs::write(&bogus, b"not a wav").expect("write");
        assert!(matches!(
            backend.load(&bogus),
            Err(AlarmError::AudioResource(_))
        ));

        let other = dir.path().join("alarm.aiff");
        std::fs::write(&other, b"opaque").expect("write");
        assert_eq!(backend.load(&other).expect("load").duration, None);
    }

    #[test]
    fn player_exit_posts_audio_finished() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alarm.wav");
        write_wav(&path, 1);
        let runner = FakeProcessRunner::default();
        let backend = CommandAudioBackend::new(
            Arc::new(runner.clone()),
            "aplay",
            &["-q".to_string()],
        )
        .with_poll_interval(Duration::from_millis(1));
        let (tx, mut rx) = event_channel();
        let loaded = backend.load(&path).expect("load");
        let handle = backend.start(&loaded, tx).expect("start");

        let spawned = runner.spawned();
        assert_eq!(spawned[0].program, "aplay");
        assert_eq!(spawned[0].args[0], "-q");
        assert!(spawned[0].args[1].ends_with("alarm.wav"));

        runner.finish(handle, 0);
        assert_eq!(rx.blocking_recv(), Some(TaskEvent::AudioFinished));
    }

    #[test]
    fn player_spawn_failure_is_an_audio_error() {
        let runner = FakeProcessRunner::default();
        runner.set_fail_next_spawn(AlarmError::Io("no such program".to_string()));
        let backend = CommandAudioBackend::new(Arc::new(runner), "aplay", &[]);
        let (tx, _rx) = event_channel();
        let loaded = LoadedAudio {
            path: PathBuf::from("/sounds/alarm.aiff"),
            duration: None,
        };
        let err = backend.start(&loaded, tx).expect_err("spawn fails");
        assert!(matches!(err, AlarmError::AudioResource(message) if message.contains("no such program")));
    }

    #[test]
    fn stopped_playback_is_killed_and_stays_silent() {
        let runner = FakeProcessRunner::default();
        let backend = CommandAudioBackend::new(Arc::new(runner.clone()), "aplay", &[])
            .with_poll_interval(Duration::from_millis(1));
        let (tx, mut rx) = event_channel();
        let loaded = LoadedAudio {
            path: PathBuf::from("/sounds/alarm.aiff"),
            duration: None,
        };
        let handle = backend.start(&loaded, tx).expect("start");
        backend.stop(handle).expect("stop");
        backend.stop(handle).expect("stop is idempotent");
        assert_eq!(runner.kills(), vec![handle]);
        // The watcher exits without sending and drops the last sender.
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn cue_stop_is_idempotent_and_reloads_lazily() {
        let backend = FakeAudioBackend::default();
        let mut cue = AudioCue::new(Arc::new(backend.clone()), "/sounds/alarm.wav");
        cue.stop();
        let (tx, _rx) = event_channel();
        cue.play(tx).expect("play");
        assert!(cue.is_playing());
        cue.stop();
        cue.stop();
        assert!(!cue.is_playing());
        assert_eq!(backend.started().len(), 1);
        assert_eq!(backend.stopped(), vec![0]);
    }

    #[test]
    fn cue_surfaces_load_failures() {
        let backend = FakeAudioBackend::with_missing("/sounds/missing.wav");
        let mut cue = AudioCue::new(Arc::new(backend), "/sounds/missing.wav");
        let (tx, _rx) = event_channel();
        let err = cue.play(tx).expect_err("missing");
        assert!(matches!(err, AlarmError::AudioResource(_)));
        assert!(!cue.is_playing());
    }
}
