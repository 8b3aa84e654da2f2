use std::{
    os::unix::process::CommandExt as _,
    path::{Path, PathBuf},
    process::Stdio,
};

use thiserror::Error;
use tokio::process::{Child, Command};

/// Where the transcoder reads its input from.
pub enum Input {
    Url(String),
    /// Read from standard input; paired with a producer process whose
    /// stdout is piped into the transcoder's stdin.
    Stdin,
}

/// A single transcoder invocation, fully parameterized. One of these is
/// built per quality variant.
pub struct TranscodeRequest {
    pub input: Input,
    pub output_dir: PathBuf,
    pub width: u32,
    pub height: u32,
    pub playlist_name: String,
    pub segment_duration_secs: u32,
    pub preset: u32,
    pub crf: u32,
    pub video_bitrate: Option<String>,
    pub audio_disabled: bool,
    pub audio_bitrate: String,
    pub extra_args: Vec<String>,
    pub max_duration_secs: u32,
    /// Fragmented-mp4 segments (canonical) vs legacy MPEG-TS.
    pub fmp4: bool,
}

impl TranscodeRequest {
    pub fn new(input: Input, output_dir: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            input,
            output_dir: output_dir.into(),
            width,
            height,
            playlist_name: "index.m3u8".to_string(),
            segment_duration_secs: 4,
            preset: 8,
            crf: 35,
            video_bitrate: None,
            audio_disabled: false,
            audio_bitrate: "48k".to_string(),
            extra_args: Vec::new(),
            max_duration_secs: 3600,
            fmp4: true,
        }
    }

    fn segment_extension(&self) -> &'static str {
        if self.fmp4 {
            "m4s"
        } else {
            "ts"
        }
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(&self.playlist_name)
    }

    /// Builds the ffmpeg argument vector in the order described in the
    /// component design: input, scaling, codec, HLS muxer, output.
    fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];

        match &self.input {
            Input::Url(url) => {
                args.push("-i".into());
                args.push(url.clone());
            }
            Input::Stdin => {
                args.push("-i".into());
                args.push("pipe:0".into());
            }
        }

        args.push("-t".into());
        args.push(self.max_duration_secs.to_string());

        args.push("-vf".into());
        args.push(format!("scale={}:{}:flags=lanczos", self.width, self.height));

        args.push("-c:v".into());
        args.push("libsvtav1".into());
        args.push("-preset".into());
        args.push(self.preset.to_string());
        args.push("-crf".into());
        args.push(self.crf.to_string());
        args.push("-pix_fmt".into());
        args.push("yuv420p".into());
        args.push("-sc_threshold".into());
        args.push("0".into());
        args.push("-force_key_frames".into());
        args.push(format!("expr:gte(t,n_forced*{})", self.segment_duration_secs));

        if let Some(bitrate) = &self.video_bitrate {
            args.push("-b:v".into());
            args.push(bitrate.clone());
        }

        if self.audio_disabled {
            args.push("-an".into());
        } else {
            args.push("-c:a".into());
            args.push("aac".into());
            args.push("-b:a".into());
            args.push(self.audio_bitrate.clone());
        }

        args.push("-f".into());
        args.push("hls".into());
        args.push("-hls_time".into());
        args.push(self.segment_duration_secs.to_string());
        args.push("-hls_list_size".into());
        args.push("0".into());

        if self.fmp4 {
            args.push("-hls_segment_type".into());
            args.push("fmp4".into());
            args.push("-hls_fmp4_init_filename".into());
            args.push("init.mp4".into());
            args.push("-hls_flags".into());
            args.push("independent_segments".into());
        }

        args.push("-hls_segment_filename".into());
        args.push(format!(
            "{}/segment_%05d.{}",
            self.output_dir.display(),
            self.segment_extension()
        ));

        args.extend(self.extra_args.iter().cloned());

        args.push(self.playlist_path().to_string_lossy().into_owned());

        args
    }
}

/// Output of a completed (successful or failed) transcoder invocation.
pub struct TranscodeOutcome {
    pub output_dir: PathBuf,
    pub playlist_path: PathBuf,
    pub stderr_tail: String,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TranscodeError(pub String);

/// Wraps the transcoder binary (an ffmpeg-compatible tool).
pub struct TranscoderAdapter {
    binary: String,
}

impl TranscoderAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Spawns the transcoder in its own process group so the registry can
    /// later signal the whole group, returning the live child. The caller
    /// owns the child and is responsible for waiting on it.
    pub fn spawn(&self, req: &TranscodeRequest) -> std::io::Result<Child> {
        let stdin_mode = match req.input {
            Input::Stdin => Stdio::piped(),
            Input::Url(_) => Stdio::null(),
        };

        let mut command = Command::new(&self.binary);
        command
            .args(req.build_args())
            .stdin(stdin_mode)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        detach_into_own_process_group(&mut command);

        command.spawn()
    }

    /// Spawns and waits for a non-piped invocation to completion, returning
    /// its outcome or a classified error built from trimmed stderr.
    pub async fn run(&self, req: TranscodeRequest) -> Result<TranscodeOutcome, TranscodeError> {
        let child = self.spawn(&req).map_err(|e| TranscodeError(e.to_string()))?;
        Self::wait(child, &req).await
    }

    /// Waits a previously spawned child to completion. Exposed separately
    /// from `run` so callers that need the pid between spawn and exit (to
    /// register it with the process registry) can interleave the two.
    pub async fn wait(child: Child, req: &TranscodeRequest) -> Result<TranscodeOutcome, TranscodeError> {
        await_child(child, req).await
    }

    /// Runs a producer process piping its stdout into this transcoder's
    /// stdin, used when the extractor streams bytes rather than exposing a
    /// directly fetchable URL.
    pub async fn run_piped(
        &self,
        producer_bin: &str,
        producer_args: &[String],
        req: TranscodeRequest,
    ) -> Result<TranscodeOutcome, TranscodeError> {
        let mut producer_command = Command::new(producer_bin);
        producer_command
            .args(producer_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        detach_into_own_process_group(&mut producer_command);

        let mut producer = producer_command
            .spawn()
            .map_err(|e| TranscodeError(format!("producer failed to start: {e}")))?;

        let producer_stdout = producer
            .stdout
            .take()
            .ok_or_else(|| TranscodeError("producer stdout not captured".to_string()))?;

        let mut command = Command::new(&self.binary);
        command
            .args(req.build_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        detach_into_own_process_group(&mut command);

        let mut transcoder = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = producer.start_kill();
                return Err(TranscodeError(format!("transcoder failed to start: {e}")));
            }
        };

        let mut transcoder_stdin = transcoder
            .stdin
            .take()
            .ok_or_else(|| TranscodeError("transcoder stdin not captured".to_string()))?;

        let copy_task = tokio::spawn(async move {
            let mut reader = producer_stdout;
            tokio::io::copy(&mut reader, &mut transcoder_stdin).await
        });

        let producer_output = producer
            .wait_with_output()
            .await
            .map_err(|e| TranscodeError(format!("producer wait failed: {e}")))?;
        let _ = copy_task.await;

        if !producer_output.status.success() {
            let _ = transcoder.start_kill();
            let stderr = trimmed_stderr(&producer_output.stderr);
            return Err(TranscodeError(format!("producer failed: {stderr}")));
        }

        await_child(transcoder, &req).await
    }
}

/// Puts a child in its own session/process group before exec, so the
/// registry can later signal the whole group (codecs spawn helper
/// processes that must die together).
fn detach_into_own_process_group(command: &mut Command) {
    // SAFETY: pre_exec runs in the forked child before exec; setsid() only
    // affects that child's own process group membership.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

async fn await_child(child: Child, req: &TranscodeRequest) -> Result<TranscodeOutcome, TranscodeError> {
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| TranscodeError(e.to_string()))?;

    let stderr = trimmed_stderr(&output.stderr);

    if !output.status.success() {
        let message = if stderr.is_empty() {
            format!("transcoder exited with status {}", output.status)
        } else {
            stderr
        };
        return Err(TranscodeError(message));
    }

    Ok(TranscodeOutcome {
        output_dir: req.output_dir.clone(),
        playlist_path: req.playlist_path(),
        stderr_tail: stderr,
    })
}

fn trimmed_stderr(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr).trim().to_string()
}

/// A quality tier's fixed encoding parameters.
#[derive(Debug, Clone, Copy)]
pub struct VariantConfig {
    pub tier: &'static str,
    pub width: u32,
    pub height: u32,
    pub video_bitrate: &'static str,
}

pub const DEFAULT_VARIANTS: [VariantConfig; 3] = [
    VariantConfig { tier: "64x64", width: 64, height: 64, video_bitrate: "50k" },
    VariantConfig { tier: "128x128", width: 128, height: 128, video_bitrate: "100k" },
    VariantConfig { tier: "256x256", width: 256, height: 256, video_bitrate: "200k" },
];

pub fn request_for_variant(variant: VariantConfig, source_url: &str, stream_root: &Path) -> TranscodeRequest {
    let output_dir = stream_root.join(variant.tier);
    let mut req = TranscodeRequest::new(Input::Url(source_url.to_string()), output_dir, variant.width, variant.height);
    req.video_bitrate = Some(variant.video_bitrate.to_string());
    req.audio_bitrate = "32k".to_string();
    req
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmp4_args_include_init_filename_and_m4s_segments() {
        let req = TranscodeRequest::new(Input::Url("http://example.com/x".into()), "/tmp/out", 128, 128);
        let args = req.build_args();
        assert!(args.iter().any(|a| a == "fmp4"));
        assert!(args.iter().any(|a| a == "init.mp4"));
        assert!(args.iter().any(|a| a.ends_with("segment_%05d.m4s")));
        assert!(args.iter().any(|a| a == "scale=128:128:flags=lanczos"));
    }

    #[test]
    fn legacy_mode_uses_ts_segments_and_no_fmp4_flags() {
        let mut req = TranscodeRequest::new(Input::Url("http://example.com/x".into()), "/tmp/out", 64, 64);
        req.fmp4 = false;
        let args = req.build_args();
        assert!(!args.iter().any(|a| a == "fmp4"));
        assert!(args.iter().any(|a| a.ends_with("segment_%05d.ts")));
    }

    #[test]
    fn audio_disabled_sets_an_flag_only() {
        let mut req = TranscodeRequest::new(Input::Url("u".into()), "/tmp/out", 64, 64);
        req.audio_disabled = true;
        let args = req.build_args();
        assert!(args.iter().any(|a| a == "-an"));
        assert!(!args.iter().any(|a| a == "aac"));
    }

    #[test]
    fn default_variants_have_expected_bitrates() {
        assert_eq!(DEFAULT_VARIANTS[0].video_bitrate, "50k");
        assert_eq!(DEFAULT_VARIANTS[1].video_bitrate, "100k");
        assert_eq!(DEFAULT_VARIANTS[2].video_bitrate, "200k");
    }
}
