pub mod audio;
pub mod config;
pub mod controller;
pub mod error_log;
pub mod errors;
pub mod fsm;
pub mod host;
pub mod logging;
pub mod raw_data;
pub mod recovery;
pub mod response;
pub mod runtime;
pub mod types;

use audio::CommandAudioBackend;
use clap::{error::ErrorKind, CommandFactory, Parser};
use config::{load_config, CliOverrides};
use controller::{RecoveryOutcome, TaskController, TaskEnvironment};
use errors::AlarmError;
use host::{NullObserver, TabularSummary, TerminalPresenter};
use logging::{append_run_log, clear_run_logger, init_run_logger, structured_fallback_line};
use runtime::ProductionRuntime;
use serde_json::json;
use std::io::BufRead;
use std::sync::Arc;
use types::{event_channel, EventSender, Outcome, TaskEvent};

pub const EXIT_COMPLETED: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_ABORTED: i32 = 2;

#[derive(Debug, Clone, Parser)]
#[command(name = "alarm")]
#[command(about = "Run one alarm-and-response session with crash-safe raw data")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    #[arg(long)]
    pub data_dir: Option<std::path::PathBuf>,
    #[arg(long)]
    pub task_name: Option<String>,
    #[arg(long, default_value_t = false)]
    pub no_audio: bool,
}

pub fn run() -> Result<i32, AlarmError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| AlarmError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    let stdin = std::io::BufReader::new(std::io::stdin());
    run_with_runtime(&args, &cwd, &runtime, Box::new(stdin))
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    runtime: &ProductionRuntime,
    input: Box<dyn BufRead + Send>,
) -> Result<i32, AlarmError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(AlarmError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        data_directory: cli.data_dir.clone(),
        task_name: cli.task_name.clone(),
        no_audio: cli.no_audio,
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    if let Some(run_log) = &cfg.logging.run_log {
        init_run_logger(run_log);
    }
    append_run_log(
        "info",
        "alarm.run.start",
        json!({
            "task": cfg.task.name,
            "data_directory": cfg.task.data_directory.display().to_string(),
            "audio": cfg.audio.resource.is_some(),
        }),
    );

    let audio = CommandAudioBackend::new(
        Arc::clone(&runtime.process_runner),
        &cfg.audio.player,
        &cfg.audio.player_args,
    );
    let env = TaskEnvironment {
        clock: Arc::clone(&runtime.clock),
        timer: Arc::clone(&runtime.timer),
        audio: Arc::new(audio),
        presenter: Arc::new(TerminalPresenter::new(Arc::clone(&runtime.terminal))),
        observer: Arc::new(NullObserver),
    };
    let (tx, mut rx) = event_channel();
    let mut controller =
        TaskController::new(cfg, env, tx.clone()).with_summary(Box::new(TabularSummary));

    if let Err(err) = controller.setup() {
        let _ = controller.tear_down();
        report(&controller, runtime)?;
        return Err(err);
    }

    let collect = if controller.should_recover() {
        !matches!(
            controller.recover()?,
            RecoveryOutcome::Finalized { .. }
        )
    } else {
        controller.begin()?;
        true
    };

    if collect {
        spawn_input_reader(input, tx);
        if let Err(err) = controller.run_until_resolved(&mut rx) {
            let _ = controller.tear_down();
            report(&controller, runtime)?;
            return Err(err);
        }
    }

    let torn_down = controller.tear_down();
    report(&controller, runtime)?;
    torn_down?;

    let code = match controller.outcome() {
        Some(Outcome::Completed | Outcome::Recovered) => EXIT_COMPLETED,
        Some(Outcome::Aborted) => EXIT_ABORTED,
        None => EXIT_FATAL,
    };
    append_run_log(
        "info",
        "alarm.run.finished",
        json!({
            "task": controller.task_name(),
            "outcome": controller.outcome(),
            "exit_code": code,
        }),
    );
    clear_run_logger();
    Ok(code)
}

/// Maps one line of host input onto controller events: an empty line is the button press,
/// anything else is typed symbol by symbol.
pub fn events_for_line(line: &str) -> Vec<TaskEvent> {
    if line.trim().is_empty() {
        return vec![TaskEvent::Action];
    }
    line.chars()
        .filter(|c| !c.is_whitespace())
        .map(TaskEvent::Symbol)
        .collect()
}

fn spawn_input_reader(input: Box<dyn BufRead + Send>, events: EventSender) {
    std::thread::spawn(move || {
        for line in input.lines() {
            let Ok(line) = line else {
                break;
            };
            for event in events_for_line(&line) {
                if events.send(event).is_err() {
                    return;
                }
            }
        }
        let _ = events.send(TaskEvent::Cancelled("input closed".to_string()));
    });
}

fn report(controller: &TaskController, runtime: &ProductionRuntime) -> Result<(), AlarmError> {
    let terminal = runtime.terminal.as_ref();
    for entry in controller.error_log_handle().entries() {
        terminal.write_line(&format!("error: {}", entry.render()))?;
    }
    let Some(summary) = controller.summary() else {
        return Ok(());
    };
    if terminal.stdin_is_tty() {
        terminal.write_line(&summary)
    } else {
        terminal.write_line(&structured_fallback_line(
            controller.task_name(),
            controller.state().as_str(),
            &summary,
        ))
    }
}

pub fn render_help() -> String {
    let mut cmd = Cli::command();
    let mut buffer = Vec::new();
    cmd.write_long_help(&mut buffer).expect("write help to vec");
    String::from_utf8(buffer).expect("utf8")
}
