//! Transcoder process supervision
//!
//! One `ffmpeg` invocation per running session. The process is owned by a
//! supervisor task which pumps stdout (media) and stderr (diagnostics) and
//! then reaps the child, so `MuxerEvent::Exited` is always the last event of
//! a generation.
//!
//! ```text
//! MuxerLauncher::launch()
//!     |
//!     +-- supervisor task
//!           +-- stdout  -> MuxerEvent::Data(Bytes)           (pass-through)
//!           +-- stderr  -> tracing error!/debug! per \r or \n record
//!           |           -> MuxerEvent::Dimensions (first WxH before "Output #")
//!           +-- wait()  -> MuxerEvent::Exited { code, signal }
//! ```

use bytes::{Bytes, BytesMut};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::CameraConfig;
use crate::error::{AppError, Result};

/// Bytes requested per stdout read
const READ_CHUNK: usize = 64 * 1024;

/// Longest stderr record kept in memory; longer ones are split
const MAX_RECORD: usize = 4096;

/// Fixed output selection: MPEG-TS container carrying MPEG-1 video
pub const OUTPUT_FORMAT_ARGS: [&str; 4] = ["-f", "mpegts", "-codec:v", "mpeg1video"];

/// Write output to stdout
pub const STDOUT_MARKER: &str = "-";

/// Fully resolved transcoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxerCommand {
    pub camera: String,
    pub binary: String,
    pub args: Vec<String>,
}

impl MuxerCommand {
    pub fn for_camera(camera: &CameraConfig, binary: &str) -> Self {
        Self {
            camera: camera.name.clone(),
            binary: binary.to_string(),
            args: build_args(&camera.pre_args, &camera.source, &camera.extra_flags()),
        }
    }

    /// Command line for logs
    pub fn command_line(&self) -> String {
        let mut line = self.binary.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// `[pre_args.., source.., -f mpegts -codec:v mpeg1video, flags.., -]`
///
/// Each extra flag is followed by its value unless the value is empty.
pub fn build_args(
    pre_args: &[String],
    source: &[String],
    extra_flags: &[(String, String)],
) -> Vec<String> {
    let mut args = Vec::with_capacity(pre_args.len() + source.len() + extra_flags.len() * 2 + 5);
    args.extend(pre_args.iter().cloned());
    args.extend(source.iter().cloned());
    args.extend(OUTPUT_FORMAT_ARGS.iter().map(|s| s.to_string()));
    for (flag, value) in extra_flags {
        args.push(flag.clone());
        if !value.is_empty() {
            args.push(value.clone());
        }
    }
    args.push(STDOUT_MARKER.to_string());
    args
}

/// Termination status of a transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Exit code 1 is how ffmpeg reports a failed input or encoder
    pub fn is_abnormal(&self) -> bool {
        self.code == Some(1)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Something the transcoder produced
#[derive(Debug, Clone, PartialEq)]
pub enum MuxerEvent {
    /// Raw container bytes, exactly as read from stdout
    Data(Bytes),
    /// Frame size parsed from diagnostics
    Dimensions { width: u16, height: u16 },
    /// Process terminated; last event of its generation
    Exited(ExitInfo),
}

/// Muxer event tagged with the launch it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct MuxerMessage {
    pub generation: u64,
    pub event: MuxerEvent,
}

/// How to end a running transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM, lets ffmpeg flush and exit
    Terminate,
    /// SIGKILL
    Kill,
}

/// Coordinator-side handle of a launched transcoder
///
/// Stopping only requests termination; the exit is reported later as
/// `MuxerEvent::Exited`.
#[derive(Debug)]
pub struct MuxerHandle {
    generation: u64,
    pid: Option<u32>,
    control: mpsc::UnboundedSender<StopSignal>,
}

impl MuxerHandle {
    pub fn new(
        generation: u64,
        pid: Option<u32>,
        control: mpsc::UnboundedSender<StopSignal>,
    ) -> Self {
        Self {
            generation,
            pid,
            control,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request graceful termination and return immediately
    pub fn stop(&self) {
        if self.control.send(StopSignal::Terminate).is_err() {
            debug!("Muxer generation {} already gone", self.generation);
        }
    }

    /// Force-kill without waiting
    pub fn kill(&self) {
        let _ = self.control.send(StopSignal::Kill);
    }
}

/// Seam between the session coordinator and process spawning
pub trait MuxerLauncher: Send + Sync {
    /// Launch the transcoder. Spawn failures are reported synchronously;
    /// everything afterwards arrives on `events` tagged with `generation`.
    fn launch(
        &self,
        command: &MuxerCommand,
        generation: u64,
        events: mpsc::Sender<MuxerMessage>,
    ) -> Result<MuxerHandle>;
}

/// Production launcher backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct FfmpegLauncher;

impl MuxerLauncher for FfmpegLauncher {
    fn launch(
        &self,
        command: &MuxerCommand,
        generation: u64,
        events: mpsc::Sender<MuxerMessage>,
    ) -> Result<MuxerHandle> {
        debug!(camera = %command.camera, "Stream command: {}", command.command_line());

        let mut child = Command::new(&command.binary)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Spawn {
                camera: command.camera.clone(),
                binary: command.binary.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        debug!(camera = %command.camera, pid = ?pid, "Streaming started");

        let camera = command.camera.clone();
        tokio::spawn(async move {
            let exit = supervise(&camera, child, pid, stdout, stderr, generation, &events, control_rx).await;
            log_exit(&camera, &exit);
            let _ = events
                .send(MuxerMessage {
                    generation,
                    event: MuxerEvent::Exited(exit),
                })
                .await;
        });

        Ok(MuxerHandle::new(generation, pid, control_tx))
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    camera: &str,
    mut child: tokio::process::Child,
    pid: Option<u32>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    generation: u64,
    events: &mpsc::Sender<MuxerMessage>,
    mut control_rx: mpsc::UnboundedReceiver<StopSignal>,
) -> ExitInfo {
    let pumps = async {
        tokio::join!(
            pump_stdout(stdout, generation, events),
            pump_stderr(camera, stderr, generation, events),
        )
    };
    tokio::pin!(pumps);

    let mut pumps_done = false;
    let mut control_open = true;

    let status = loop {
        tokio::select! {
            _ = &mut pumps, if !pumps_done => {
                pumps_done = true;
            }
            signal = control_rx.recv(), if control_open => {
                match signal {
                    Some(StopSignal::Terminate) => send_signal(camera, pid, Signal::SIGTERM),
                    Some(StopSignal::Kill) => send_signal(camera, pid, Signal::SIGKILL),
                    None => {
                        // Handle dropped without a stop request
                        control_open = false;
                        send_signal(camera, pid, Signal::SIGKILL);
                    }
                }
            }
            status = child.wait(), if pumps_done => break status,
        }
    };

    match status {
        Ok(status) => ExitInfo {
            code: status.code(),
            signal: status.signal(),
        },
        Err(e) => {
            warn!(camera = %camera, "Failed to reap muxer: {}", e);
            ExitInfo::default()
        }
    }
}

fn send_signal(camera: &str, pid: Option<u32>, sig: Signal) {
    let Some(pid) = pid else {
        return;
    };
    debug!(camera = %camera, pid, "Sending {:?} to muxer", sig);
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
        debug!(camera = %camera, pid, "Failed to signal muxer: {}", e);
    }
}

fn log_exit(camera: &str, exit: &ExitInfo) {
    if exit.is_abnormal() {
        error!(camera = %camera, "Stream exited with error! ({})", exit);
    } else {
        debug!(camera = %camera, "Stream exit (expected, {})", exit);
    }
}

async fn pump_stdout(
    stdout: Option<ChildStdout>,
    generation: u64,
    events: &mpsc::Sender<MuxerMessage>,
) {
    let Some(mut stdout) = stdout else {
        return;
    };
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);
        match stdout.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = buf.split().freeze();
                let msg = MuxerMessage {
                    generation,
                    event: MuxerEvent::Data(chunk),
                };
                if events.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading muxer stdout: {}", e);
                break;
            }
        }
    }
}

async fn pump_stderr<R: AsyncRead + Unpin>(
    camera: &str,
    stderr: Option<R>,
    generation: u64,
    events: &mpsc::Sender<MuxerMessage>,
) {
    let Some(stderr) = stderr else {
        return;
    };
    let mut reader = BufReader::new(stderr);
    let mut record = Vec::with_capacity(256);
    let mut probe = DimensionProbe::new();
    let mut events_open = true;

    // Drain until EOF; closing the pipe early would SIGPIPE ffmpeg
    loop {
        match next_record(&mut reader, &mut record).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!(camera = %camera, "Error reading muxer stderr: {}", e);
                break;
            }
        }
        if record.is_empty() {
            continue;
        }

        let line = String::from_utf8_lossy(&record);
        match classify_line(&line) {
            LineSeverity::Error => error!(camera = %camera, "{}", line),
            LineSeverity::Debug => debug!(camera = %camera, "{}", line),
        }

        if !events_open {
            continue;
        }
        if let Some((width, height)) = probe.observe(&line) {
            let msg = MuxerMessage {
                generation,
                event: MuxerEvent::Dimensions { width, height },
            };
            events_open = events.send(msg).await.is_ok();
        }
    }
}

/// Read one diagnostic record into `record`
///
/// Records end at `\r` or `\n` (progress reports use a bare `\r`) and are
/// cut at [`MAX_RECORD`] bytes. Returns `false` at EOF with nothing read.
async fn next_record<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    record: &mut Vec<u8>,
) -> std::io::Result<bool> {
    record.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(!record.is_empty());
        }

        let room = MAX_RECORD - record.len();
        let window = &available[..available.len().min(room)];
        match window.iter().position(|&b| b == b'\n' || b == b'\r') {
            Some(end) => {
                record.extend_from_slice(&window[..end]);
                reader.consume(end + 1);
                return Ok(true);
            }
            None => {
                let taken = window.len();
                record.extend_from_slice(window);
                reader.consume(taken);
                if record.len() >= MAX_RECORD {
                    return Ok(true);
                }
            }
        }
    }
}

/// Log severity of one diagnostic line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSeverity {
    Error,
    Debug,
}

pub fn classify_line(line: &str) -> LineSeverity {
    if ["[panic]", "[fatal]", "[error]"]
        .iter()
        .any(|marker| line.contains(marker))
    {
        LineSeverity::Error
    } else {
        LineSeverity::Debug
    }
}

/// Best-effort frame size detection from ffmpeg's stream summary
///
/// Only lines before the `Output #` section are considered and only the
/// first match is reported.
#[derive(Debug, Default)]
pub struct DimensionProbe {
    output_seen: bool,
    found: bool,
}

impl DimensionProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, line: &str) -> Option<(u16, u16)> {
        if self.found || self.output_seen {
            return None;
        }
        if line.contains("Output #") {
            self.output_seen = true;
            return None;
        }
        let dims = find_dimensions(line)?;
        self.found = true;
        Some(dims)
    }
}

/// First `WIDTHxHEIGHT` token with both sides non-zero and within u16
pub fn find_dimensions(line: &str) -> Option<(u16, u16)> {
    let bytes = line.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if b != b'x' {
            continue;
        }
        let start = bytes[..i]
            .iter()
            .rposition(|c| !c.is_ascii_digit())
            .map_or(0, |p| p + 1);
        let end = bytes[i + 1..]
            .iter()
            .position(|c| !c.is_ascii_digit())
            .map_or(bytes.len(), |p| i + 1 + p);
        if start == i || end == i + 1 {
            continue;
        }

        // Digit runs are ASCII so slicing on these offsets is safe
        let width = line[start..i].parse::<u16>().ok();
        let height = line[i + 1..end].parse::<u16>().ok();
        if let (Some(w), Some(h)) = (width, height) {
            if w > 0 && h > 0 {
                return Some((w, h));
            }
        }
    }
    None
}
