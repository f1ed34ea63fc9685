// FFmpeg命令行采集后端
//
// 通过外部ffmpeg进程读取本地采集设备（v4l2）或网络流（rtsp/http），
// 统一转为MJPEG输出到stdout，按JPEG的SOI/EOI标记切分出单帧。
//
// ffmpeg进程由读取器独占：close() 主动结束进程，丢弃读取器时进程同样被杀死。

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use common::{CaptureError, ConnectionTarget, RawFrame, Result, SourceDescriptor};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::FrameReader;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// FFmpeg后端参数
#[derive(Debug, Clone)]
pub struct FfmpegOptions {
    /// ffmpeg可执行文件
    pub program: String,
    /// MJPEG质量（2-31，越小越好）
    pub jpeg_quality: u8,
    /// 单帧最大字节数，超过视为输出损坏
    pub max_frame_bytes: usize,
}

impl Default for FfmpegOptions {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            jpeg_quality: 5,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

/// 构建ffmpeg参数
fn build_args(descriptor: &SourceDescriptor, options: &FfmpegOptions) -> Vec<String> {
    let mut args: Vec<String> = vec!["-nostdin".into(), "-loglevel".into(), "error".into()];

    match &descriptor.target {
        ConnectionTarget::Device(index) => {
            args.extend(["-f".into(), "v4l2".into()]);
            if let (Some(width), Some(height)) = (descriptor.width, descriptor.height) {
                args.extend(["-video_size".into(), format!("{}x{}", width, height)]);
            }
            args.extend(["-i".into(), format!("/dev/video{}", index)]);
        }
        ConnectionTarget::Uri(uri) => {
            if uri.starts_with("rtsp://") {
                args.extend(["-rtsp_transport".into(), "tcp".into()]);
            }
            args.extend(["-i".into(), uri.clone()]);
            if let (Some(width), Some(height)) = (descriptor.width, descriptor.height) {
                args.extend(["-vf".into(), format!("scale={}:{}", width, height)]);
            }
        }
    }

    args.extend([
        "-an".into(),
        "-f".into(),
        "image2pipe".into(),
        "-c:v".into(),
        "mjpeg".into(),
        "-q:v".into(),
        options.jpeg_quality.to_string(),
        "-".into(),
    ]);
    args
}

/// 从缓冲区中切出一张完整的JPEG
///
/// SOI之前的数据会被丢弃；没有完整帧时返回 `None` 并保留未完成的数据。
fn extract_jpeg(buffer: &mut BytesMut) -> Option<Bytes> {
    let start = match find_marker(buffer, &JPEG_SOI, 0) {
        Some(start) => start,
        None => {
            // 保留最后一个字节，它可能是被截断的标记
            let keep_from = buffer.len().saturating_sub(1);
            let _ = buffer.split_to(keep_from);
            return None;
        }
    };
    if start > 0 {
        let _ = buffer.split_to(start);
    }

    let end = find_marker(buffer, &JPEG_EOI, JPEG_SOI.len())?;
    Some(buffer.split_to(end + JPEG_EOI.len()).freeze())
}

fn find_marker(haystack: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + marker.len() {
        return None;
    }
    haystack[from..]
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|offset| offset + from)
}

/// FFmpeg读取器
pub struct FfmpegReader {
    source_id: String,
    child: Child,
    stdout: ChildStdout,
    buffer: BytesMut,
    pending: Option<RawFrame>,
    width: Option<u32>,
    height: Option<u32>,
    max_frame_bytes: usize,
}

impl FfmpegReader {
    /// 启动ffmpeg进程并等待第一帧，确认视频源确实可用
    pub async fn open(descriptor: &SourceDescriptor, options: &FfmpegOptions) -> Result<Self> {
        let args = build_args(descriptor, options);
        let mut command = Command::new(&options.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Starting ffmpeg for {}: {:?}", descriptor.source_id, args);

        let mut child = command.spawn().map_err(|e| {
            CaptureError::OpenFailure(format!(
                "failed to start {} for {}: {}",
                options.program, descriptor.source_id, e
            ))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            CaptureError::OpenFailure("ffmpeg stdout not captured".to_string())
        })?;

        // 错误输出转到日志
        if let Some(stderr) = child.stderr.take() {
            let source_id = descriptor.source_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!("ffmpeg ({}): {}", source_id, line.trim());
                    }
                }
            });
        }

        let mut reader = Self {
            source_id: descriptor.source_id.clone(),
            child,
            stdout,
            buffer: BytesMut::with_capacity(256 * 1024),
            pending: None,
            width: descriptor.width,
            height: descriptor.height,
            max_frame_bytes: options.max_frame_bytes,
        };

        match reader.next_jpeg().await {
            Ok(frame) => {
                info!("ffmpeg source {} delivered its first frame", reader.source_id);
                reader.pending = Some(frame);
                Ok(reader)
            }
            Err(e) => {
                let _ = reader.close().await;
                Err(CaptureError::OpenFailure(format!(
                    "{} produced no frame: {}",
                    descriptor.source_id, e
                )))
            }
        }
    }

    async fn next_jpeg(&mut self) -> Result<RawFrame> {
        loop {
            if let Some(jpeg) = extract_jpeg(&mut self.buffer) {
                let mut frame = RawFrame::new(jpeg);
                frame.width = self.width;
                frame.height = self.height;
                return Ok(frame);
            }

            if self.buffer.len() > self.max_frame_bytes {
                self.buffer.clear();
                return Err(CaptureError::ReadFailure(format!(
                    "frame exceeded {} bytes without an end marker",
                    self.max_frame_bytes
                )));
            }

            let read = self.stdout.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(CaptureError::ReadFailure(
                    "ffmpeg output ended".to_string(),
                ));
            }
        }
    }
}

#[async_trait]
impl FrameReader for FfmpegReader {
    async fn read_frame(&mut self) -> Result<RawFrame> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.next_jpeg().await
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Stopping ffmpeg for {}", self.source_id);
        // 进程可能已经退出
        let _ = self.child.start_kill();
        self.child.wait().await?;
        Ok(())
    }
}
