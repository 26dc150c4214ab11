use crate::errors::AlarmError;
use crate::runtime::FileSystem;
use crate::types::ResponseMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const RAW_DATA_SUFFIX: &str = "_raw.jsonl";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub data_directory: Option<PathBuf>,
    pub task_name: Option<String>,
    pub no_audio: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmConfig {
    pub task: TaskConfig,
    pub audio: AudioConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: String,
    pub data_directory: PathBuf,
    pub prompt: String,
    pub require_sequence: bool,
    pub sequence: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    pub resource: Option<PathBuf>,
    pub duration_seconds: Option<f64>,
    pub player: String,
    pub player_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub run_log: Option<PathBuf>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig {
                name: String::new(),
                data_directory: PathBuf::from("data"),
                prompt: "Please respond.".to_string(),
                require_sequence: false,
                sequence: None,
            },
            audio: AudioConfig {
                resource: None,
                duration_seconds: None,
                player: "aplay".to_string(),
                player_args: Vec::new(),
            },
            logging: LoggingConfig { run_log: None },
        }
    }
}

impl AlarmConfig {
    pub fn response_mode(&self) -> ResponseMode {
        if self.task.require_sequence {
            ResponseMode::Sequence
        } else {
            ResponseMode::SingleAction
        }
    }

    pub fn required_sequence(&self) -> Vec<char> {
        self.task
            .sequence
            .as_deref()
            .map(|sequence| sequence.trim().chars().collect())
            .unwrap_or_default()
    }

    pub fn audio_duration(&self) -> Option<Duration> {
        self.audio
            .duration_seconds
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn raw_data_file_name(&self) -> String {
        format!("{}{RAW_DATA_SUFFIX}", slug(&self.task.name))
    }

    pub fn raw_data_path(&self) -> PathBuf {
        self.task.data_directory.join(self.raw_data_file_name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAlarmConfig {
    task: Option<PartialTaskConfig>,
    audio: Option<PartialAudioConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialTaskConfig {
    name: Option<String>,
    data_directory: Option<PathBuf>,
    prompt: Option<String>,
    require_sequence: Option<bool>,
    sequence: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAudioConfig {
    resource: Option<PathBuf>,
    duration_seconds: Option<f64>,
    player: Option<String>,
    player_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialLoggingConfig {
    run_log: Option<PathBuf>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AlarmConfig, AlarmError> {
    let mut cfg = AlarmConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        cfg = parse_config(&file_contents)?;
    }

    apply_cli_overrides(&mut cfg, overrides);
    absolutize_paths(&mut cfg, process_cwd);
    Ok(cfg)
}

pub fn parse_config(text: &str) -> Result<AlarmConfig, AlarmError> {
    let partial: PartialAlarmConfig =
        toml::from_str(text).map_err(|e| AlarmError::ConfigParse(e.to_string()))?;
    let mut cfg = AlarmConfig::default();
    merge_partial_config(&mut cfg, partial);
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AlarmConfig, partial: PartialAlarmConfig) {
    if let Some(task) = partial.task {
        if let Some(name) = task.name {
            cfg.task.name = name;
        }
        if let Some(data_directory) = task.data_directory {
            cfg.task.data_directory = data_directory;
        }
        if let Some(prompt) = task.prompt {
            cfg.task.prompt = prompt;
        }
        if let Some(require_sequence) = task.require_sequence {
            cfg.task.require_sequence = require_sequence;
        }
        if task.sequence.is_some() {
            cfg.task.sequence = task.sequence;
        }
    }

    if let Some(audio) = partial.audio {
        if audio.resource.is_some() {
            cfg.audio.resource = audio.resource;
        }
        if audio.duration_seconds.is_some() {
            cfg.audio.duration_seconds = audio.duration_seconds;
        }
        if let Some(player) = audio.player {
            cfg.audio.player = player;
        }
        if let Some(player_args) = audio.player_args {
            cfg.audio.player_args = player_args;
        }
    }

    if let Some(logging) = partial.logging {
        if logging.run_log.is_some() {
            cfg.logging.run_log = logging.run_log;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AlarmConfig, overrides: &CliOverrides) {
    if let Some(dir) = &overrides.data_directory {
        cfg.task.data_directory = dir.clone();
    }
    if let Some(name) = &overrides.task_name {
        cfg.task.name = name.clone();
    }
    if overrides.no_audio {
        cfg.audio.resource = None;
    }
}

fn absolutize_paths(cfg: &mut AlarmConfig, base: &Path) {
    cfg.task.data_directory = absolutize_path(base, &cfg.task.data_directory);
    if let Some(resource) = &cfg.audio.resource {
        cfg.audio.resource = Some(absolutize_path(base, resource));
    }
    if let Some(run_log) = &cfg.logging.run_log {
        cfg.logging.run_log = Some(absolutize_path(base, run_log));
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

/// Checks the option invariants. Writability of the data directory is checked when the raw
/// data writer opens, since only an actual open proves it.
pub fn validate_config(cfg: &AlarmConfig) -> Result<(), AlarmError> {
    if cfg.task.name.trim().is_empty() {
        return Err(AlarmError::Configuration(
            "task.name must not be empty".to_string(),
        ));
    }

    if cfg.task.require_sequence && cfg.required_sequence().is_empty() {
        return Err(AlarmError::Configuration(
            "task.sequence must be non-empty when task.require_sequence is true".to_string(),
        ));
    }

    if cfg.task.require_sequence
        && cfg.required_sequence().iter().any(|symbol| symbol.is_whitespace())
    {
        return Err(AlarmError::Configuration(
            "task.sequence must not contain whitespace: it cannot be typed as a symbol"
                .to_string(),
        ));
    }

    if let Some(seconds) = cfg.audio.duration_seconds {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(AlarmError::Configuration(format!(
                "audio.duration_seconds must be a positive number, got {seconds}"
            )));
        }
    }

    if cfg.task.data_directory.is_file() {
        return Err(AlarmError::Configuration(format!(
            "data directory {} is a file",
            cfg.task.data_directory.display()
        )));
    }

    if cfg.audio.resource.is_some() && cfg.audio.player.trim().is_empty() {
        return Err(AlarmError::Configuration(
            "audio.player must be set when audio.resource is configured".to_string(),
        ));
    }

    Ok(())
}

pub fn slug(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
