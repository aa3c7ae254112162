//! `yt-dlp` subprocess extractor.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;

use super::{DurationExtractor, FetchedDuration};
use crate::errors::FetchError;
use crate::protocol::RemotePlatform;

const SOURCE_LABEL: &str = "yt-dlp";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const BILIBILI_SOCKET_TIMEOUT_SECS: u64 = 6;
const BILIBILI_FORMAT: &str = "best[height<=720]/best[height<=480]/best";
const BILIBILI_FORMAT_SORT: &str = "res:720,fps,codec:h264";

pub struct YtDlpExtractor {
    program: String,
    cookies_file: Option<PathBuf>,
}

impl YtDlpExtractor {
    pub fn new(program: impl Into<String>, cookies_file: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies_file,
        }
    }

    fn build_args(&self, url: &str, platform: RemotePlatform, timeout: Duration) -> Vec<String> {
        let mut args: Vec<String> = [
            "--dump-single-json",
            "--skip-download",
            "--no-playlist",
            "--no-warnings",
            "--quiet",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();

        match platform {
            RemotePlatform::YouTube => {
                args.push("--socket-timeout".to_string());
                args.push(timeout.as_secs().max(1).to_string());
            }
            RemotePlatform::Bilibili => {
                let socket_timeout = timeout.as_secs().clamp(1, BILIBILI_SOCKET_TIMEOUT_SECS);
                args.extend([
                    "--socket-timeout".to_string(),
                    socket_timeout.to_string(),
                    "--retries".to_string(),
                    "1".to_string(),
                    "--fragment-retries".to_string(),
                    "1".to_string(),
                    "-f".to_string(),
                    BILIBILI_FORMAT.to_string(),
                    "-S".to_string(),
                    BILIBILI_FORMAT_SORT.to_string(),
                ]);
                if let Some(cookies) = self.cookies_file.as_ref() {
                    args.push("--cookies".to_string());
                    args.push(cookies.to_string_lossy().to_string());
                }
            }
        }

        args.push("--".to_string());
        args.push(url.to_string());
        args
    }
}

impl DurationExtractor for YtDlpExtractor {
    fn name(&self) -> &'static str {
        SOURCE_LABEL
    }

    fn supports(&self, _platform: RemotePlatform) -> bool {
        true
    }

    fn extract(
        &self,
        url: &str,
        platform: RemotePlatform,
        timeout: Duration,
    ) -> Result<FetchedDuration, FetchError> {
        let args = self.build_args(url, platform, timeout);
        debug!("YtDlp: {} {}", self.program, args.join(" "));
        let output = run_with_timeout(&self.program, &args, timeout)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = FetchError::from_extractor_message(&stderr);
            debug!("YtDlp: {} failed for {}: {}", platform.label(), url, err);
            return Err(err);
        }
        let seconds = parse_duration_json(&output.stdout)?;
        Ok(FetchedDuration::new(seconds, SOURCE_LABEL))
    }
}

/// Reads `duration` from yt-dlp's JSON dump.
fn parse_duration_json(stdout: &[u8]) -> Result<f64, FetchError> {
    let info: Value = serde_json::from_slice(stdout)
        .map_err(|err| FetchError::Failed(format!("Invalid yt-dlp output: {}", err)))?;
    match info.get("duration").and_then(Value::as_f64) {
        Some(seconds) if seconds > 0.0 => Ok(seconds),
        _ => Err(FetchError::NoDuration),
    }
}

/// Runs `program`, killing it once `timeout` elapses.
pub(crate) fn run_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<Output, FetchError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                FetchError::ToolUnavailable(program.to_string())
            } else {
                FetchError::Failed(format!("Failed to start {}: {}", program, err))
            }
        })?;

    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                kill_child(&mut child, program);
                return Err(FetchError::Timeout(format!(
                    "{} did not finish within {}s",
                    program,
                    timeout.as_secs()
                )));
            }
            Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
            Err(err) => {
                kill_child(&mut child, program);
                return Err(FetchError::Failed(format!(
                    "Failed to wait for {}: {}",
                    program, err
                )));
            }
        }
    };

    Ok(Output {
        status,
        stdout: stdout_reader.join().unwrap_or_default(),
        stderr: stderr_reader.join().unwrap_or_default(),
    })
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn kill_child(child: &mut Child, program: &str) {
    if let Err(err) = child.kill() {
        warn!("YtDlp: Failed to kill {}: {}", program, err);
    }
    let _ = child.wait();
}
