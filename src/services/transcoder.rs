//! Video → audio transcoding.
//!
//! The worker pool only orchestrates streams; codec work happens behind the
//! [`Transcoder`] trait. [`FfmpegTranscoder`] is the production
//! implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, future, pin_mut, stream::BoxStream};
use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    task::JoinHandle,
};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Byte stream flowing into or out of a transcoder.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Longest stderr excerpt kept from a failed ffmpeg run.
const STDERR_EXCERPT: usize = 2048;

#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Reading the source stream failed before conversion started.
    #[error("failed to read source stream: {0}")]
    Input(#[source] io::Error),
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("transcoder exited with {status}: {stderr}")]
    Exited { status: ExitStatus, stderr: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Turn a video byte stream into an audio byte stream.
    ///
    /// Failures discovered after output has started are reported as a final
    /// `Err` item on the returned stream.
    async fn transcode(&self, input: ByteStream) -> Result<ByteStream, TranscodeError>;

    /// MIME type of the produced audio.
    fn output_content_type(&self) -> &'static str {
        "audio/mpeg"
    }
}

/// Runs `ffmpeg` to extract an MP3 audio track.
///
/// The source is spooled to a temporary file first (container formats like
/// MP4 need a seekable input), then ffmpeg's stdout is streamed back.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    scratch_dir: Option<PathBuf>,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            scratch_dir: None,
        }
    }

    /// Spool inputs under `dir` instead of the system temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    async fn spool(&self, input: ByteStream) -> Result<tempfile::NamedTempFile, TranscodeError> {
        let spool = match &self.scratch_dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None => tempfile::NamedTempFile::new()?,
        };
        let mut file = File::from_std(spool.reopen()?);

        pin_mut!(input);
        let mut spooled: u64 = 0;
        while let Some(block) = input.next().await {
            let block = block.map_err(TranscodeError::Input)?;
            spooled += block.len() as u64;
            file.write_all(&block).await?;
        }
        file.flush().await?;
        debug!(bytes = spooled, path = %spool.path().display(), "spooled transcoder input");
        Ok(spool)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: ByteStream) -> Result<ByteStream, TranscodeError> {
        let spool = self.spool(input).await?;

        let mut child = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(spool.path())
            .args(["-vn", "-f", "mp3", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                program: self.ffmpeg_path.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "ffmpeg stdout not captured"))?;

        // Drain stderr concurrently so a chatty ffmpeg cannot block on a full pipe.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        let exit = futures::stream::once(wait_for_exit(child, stderr_task, spool))
            .filter_map(future::ready);

        Ok(ReaderStream::new(stdout).chain(exit).boxed())
    }
}

/// Resolve to a trailing stream item: nothing on success, an error wrapping
/// [`TranscodeError::Exited`] otherwise. The spool must outlive the process
/// reading it, so it is dropped only here.
async fn wait_for_exit(
    mut child: Child,
    stderr_task: Option<JoinHandle<String>>,
    spool: tempfile::NamedTempFile,
) -> Option<io::Result<Bytes>> {
    let status = match child.wait().await {
        Ok(status) => status,
        Err(err) => return Some(Err(err)),
    };
    drop(spool);
    if status.success() {
        return None;
    }

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    let stderr = stderr.trim().chars().take(STDERR_EXCERPT).collect();
    Some(Err(io::Error::new(
        io::ErrorKind::Other,
        TranscodeError::Exited { status, stderr },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{TryStreamExt, stream};

    fn input(blocks: &[&'static str]) -> ByteStream {
        stream::iter(
            blocks
                .iter()
                .map(|b| Ok::<_, io::Error>(Bytes::from_static(b.as_bytes())))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[tokio::test]
    async fn test_missing_binary_reports_spawn_error() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg-binary");
        match transcoder.transcode(input(&["video"])).await {
            Err(err) => assert!(matches!(err, TranscodeError::Spawn { .. })),
            Ok(_) => panic!("expected a spawn error"),
        }
    }

    #[tokio::test]
    async fn test_failing_source_reports_input_error() {
        let transcoder = FfmpegTranscoder::new("ffmpeg");
        let broken: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"head")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "source vanished")),
        ])
        .boxed();
        match transcoder.transcode(broken).await {
            Err(err) => assert!(matches!(err, TranscodeError::Input(_))),
            Ok(_) => panic!("expected an input error"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_surfaces_as_stream_error() {
        // `false` ignores its arguments and exits 1 without output.
        let transcoder = FfmpegTranscoder::new("false");
        let output = transcoder.transcode(input(&["video"])).await.unwrap();
        let err = output.try_collect::<Vec<Bytes>>().await.unwrap_err();
        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<TranscodeError>())
            .expect("exit error wrapped in io::Error");
        assert!(matches!(inner, TranscodeError::Exited { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_exit_ends_stream_cleanly() {
        let transcoder = FfmpegTranscoder::new("true");
        let output = transcoder.transcode(input(&["a", "b"])).await.unwrap();
        let blocks: Vec<Bytes> = output.try_collect().await.unwrap();
        assert!(blocks.is_empty());
    }
}
