//! The Output Watcher: parses the builder tool's `TIMESTAMP,TARGET,TYPE,DATA`
//! machine-readable protocol off its stdout, forwards everything else
//! (including all of stderr) to a human-readable output stream, and
//! implements the two-stage (polite, then forceful) cancellation protocol.

use std::collections::BTreeMap;
use std::future::Future;

use colored::{Color, Colorize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{instrument, trace, warn};

use crate::error::CoreError;

/// Somewhere forwarded build output lines can go: the CLI's stdout, a log
/// file, or (via [`Tee`]) both at once.
pub trait LineSink: Send {
    fn write_line(&mut self, line: &str) -> impl Future<Output = ()> + Send;
}

/// Forwards every line to two sinks, e.g. the terminal and a per-build log file.
pub struct Tee<A, B> {
    pub first: A,
    pub second: B,
}

impl<A: LineSink, B: LineSink> LineSink for Tee<A, B> {
    async fn write_line(&mut self, line: &str) {
        self.first.write_line(line).await;
        self.second.write_line(line).await;
    }
}

/// A sink backed by an open file, used for the per-build log.
pub struct FileSink(pub tokio::fs::File);

impl LineSink for FileSink {
    async fn write_line(&mut self, line: &str) {
        if let Err(err) = self.0.write_all(format!("{line}\n").as_bytes()).await {
            warn!(?err, "failed to write build log line");
        }
    }
}

/// A sink backed by the process's own stdout.
#[derive(Default)]
pub struct StdoutSink;

impl LineSink for StdoutSink {
    async fn write_line(&mut self, line: &str) {
        println!("{line}");
    }
}

const PACKER_COMMA_ESCAPE: &str = "%!(PACKER_COMMA)";

fn unescape(value: &str) -> String {
    value.replace(PACKER_COMMA_ESCAPE, ",")
}

/// One line of the machine-readable protocol, once split and classified.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Ui { message: String },
    Error(String),
    ArtifactField { index: usize, key: String, values: Vec<String> },
    ArtifactEnd { index: usize },
    Other { kind: String, data: String },
    Unparsed(String),
}

fn parse_line(line: &str) -> Line {
    let parts: Vec<&str> = line.splitn(4, ',').collect();
    let [_timestamp, _target, kind, data] = parts[..] else {
        return Line::Unparsed(line.to_string());
    };

    match kind {
        "ui" => {
            // DATA is `SUBTYPE,MESSAGE`; the subtype is dropped before display.
            let message = data.splitn(2, ',').last().unwrap_or(data);
            Line::Ui { message: unescape(message) }
        }
        "error" => Line::Error(unescape(data)),
        "artifact" => {
            // The whole DATA field is unescaped once, then split unconditionally
            // on `,`: `index,key,val1,val2,...` — a line can carry more than one
            // value for its key.
            let unescaped = unescape(data);
            let mut fields = unescaped.split(',');
            let index: usize = fields.next().unwrap_or_default().parse().unwrap_or_default();
            let key = fields.next().unwrap_or_default().to_string();
            let values: Vec<String> = fields.map(str::to_string).collect();
            if key == "end" {
                Line::ArtifactEnd { index }
            } else {
                Line::ArtifactField { index, key, values }
            }
        }
        other => Line::Other {
            kind: other.to_string(),
            data: data.to_string(),
        },
    }
}

/// An artifact as assembled from its `artifact` protocol lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawArtifact {
    pub id: Option<String>,
    pub region: Option<String>,
    pub fields: BTreeMap<String, Vec<String>>,
}

/// The two stages of cancellation: a polite signal first, then a forceful one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CancelStage {
    #[default]
    None,
    Graceful,
    Forceful,
}

/// The outcome of watching a builder-tool subprocess to completion.
pub struct WatchOutcome {
    pub artifacts: Vec<RawArtifact>,
}

const PALETTE: &[Color] = &[
    Color::Red,
    Color::Green,
    Color::Yellow,
    Color::Cyan,
    Color::Blue,
    Color::Magenta,
];

fn image_color(name: &str) -> Color {
    let hash = name.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()]
}

/// Forward one human-readable line to `sink`, prefixed with the image name
/// (colorized when `colorize` is set, matching a stable per-image color).
async fn forward_line(sink: &mut impl LineSink, image_name: &str, colorize: bool, message: &str) {
    let prefix = if colorize {
        format!("{}: ", image_name.color(image_color(image_name)))
    } else {
        format!("{image_name}: ")
    };
    sink.write_line(&format!("{prefix}{message}")).await;
}

/// Watch a spawned builder-tool child process to completion, parsing its
/// stdout as the machine-readable protocol and forwarding stderr (and any
/// non-machine-readable stdout lines) to `human_out`.
#[instrument(skip(child, human_out, cancel_rx))]
pub async fn watch(
    mut child: Child,
    image_name: &str,
    colorize: bool,
    mut human_out: impl LineSink,
    mut cancel_rx: watch::Receiver<CancelStage>,
) -> Result<WatchOutcome, CoreError> {
    let stdout = child.stdout.take().expect("child spawned with piped stdout");
    let stderr = child.stderr.take().expect("child spawned with piped stderr");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut artifacts: Vec<RawArtifact> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut canceled_stage = CancelStage::None;

    loop {
        tokio::select! {
            biased;

            changed = cancel_rx.changed(), if canceled_stage != CancelStage::Forceful => {
                if changed.is_err() {
                    continue;
                }
                let stage = *cancel_rx.borrow_and_update();
                match stage {
                    CancelStage::Graceful if canceled_stage == CancelStage::None => {
                        canceled_stage = CancelStage::Graceful;
                        signal_graceful(&child);
                        errors.push("Canceled by signal".to_string());
                    }
                    CancelStage::Forceful => {
                        canceled_stage = CancelStage::Forceful;
                        let _ = child.start_kill();
                    }
                    _ => {}
                }
            }

            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_stdout_line(&line, image_name, colorize, &mut human_out, &mut artifacts, &mut errors).await,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(?err, "error reading builder tool stdout");
                        break;
                    }
                }
            }

            line = stderr_lines.next_line() => {
                match line {
                    Ok(Some(line)) => forward_line(&mut human_out, image_name, colorize, &line).await,
                    Ok(None) => {}
                    Err(err) => warn!(?err, "error reading builder tool stderr"),
                }
            }
        }
    }

    let status = child.wait().await.map_err(|err| {
        CoreError::Configuration {
            message: format!("wait for builder tool process: {err}"),
        }
    })?;

    if canceled_stage != CancelStage::None {
        return Err(CoreError::Canceled);
    }

    match status.code() {
        Some(0) => Ok(WatchOutcome {
            artifacts: finalize_artifacts(artifacts),
        }),
        code => Err(CoreError::BuilderTool {
            exit_code: code.unwrap_or(-1),
            errors,
        }),
    }
}

#[cfg(unix)]
fn signal_graceful(child: &Child) {
    if let Some(pid) = child.id() {
        // Safety: `pid` is the live child's own pid as reported by tokio, and
        // sending SIGINT to a process we own cannot violate memory safety.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
}

#[cfg(not(unix))]
fn signal_graceful(child: &Child) {
    let _ = child;
}

async fn handle_stdout_line(
    line: &str,
    image_name: &str,
    colorize: bool,
    human_out: &mut impl LineSink,
    artifacts: &mut Vec<RawArtifact>,
    errors: &mut Vec<String>,
) {
    match parse_line(line) {
        Line::Ui { message } => forward_line(human_out, image_name, colorize, &message).await,
        Line::Error(message) => {
            trace!(%message, "builder tool reported error");
            errors.push(message);
        }
        Line::ArtifactField { index, key, mut values } => {
            if artifacts.len() <= index {
                artifacts.resize_with(index + 1, RawArtifact::default);
            }
            let artifact = &mut artifacts[index];
            if key == "id" {
                if let Some(value) = values.into_iter().next() {
                    if let Some((region, id)) = value.split_once(':') {
                        artifact.region = Some(region.to_string());
                        artifact.id = Some(id.to_string());
                    } else {
                        artifact.id = Some(value);
                    }
                }
            } else {
                artifact.fields.entry(key).or_default().append(&mut values);
            }
        }
        Line::ArtifactEnd { .. } => {}
        Line::Other { .. } => forward_line(human_out, image_name, colorize, line).await,
        Line::Unparsed(raw) => forward_line(human_out, image_name, colorize, &raw).await,
    }
}

fn finalize_artifacts(artifacts: Vec<RawArtifact>) -> Vec<RawArtifact> {
    artifacts
}
