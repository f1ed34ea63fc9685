// 检测结果缓存 - AnalysisCache实现
//
// 检测协作方每个推理周期读取一次最新帧。同一视频源、同一检测器的结果在
// 帧序号未变化或仍在有效期内时直接复用；并发请求在每个键自己的异步锁上排队，
// 拿到锁后再检查一次缓存，避免重复计算。不同键之间互不等待。

use async_trait::async_trait;
use common::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{CachedFrame, FrameCache};

/// 检测框标注
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub label: String,
    pub confidence: f32,
    /// [x, y, width, height]
    pub bbox: [u32; 4],
}

/// 检测器输出
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisOutput {
    pub annotations: Vec<Annotation>,
    pub attributes: BTreeMap<String, String>,
}

/// 缓存的检测结果
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub source_id: String,
    pub analyzer: String,
    /// 结果对应的帧序号
    pub sequence: u64,
    pub output: AnalysisOutput,
    #[serde(skip)]
    pub computed_at: Instant,
}

/// 检测器
#[async_trait]
pub trait FrameAnalyzer: Send + Sync {
    /// 检测器名称，作为缓存键的一部分
    fn name(&self) -> &str;

    async fn analyze(&self, frame: &CachedFrame) -> Result<AnalysisOutput>;
}

type ResultSlot = Arc<Mutex<Option<Arc<AnalysisResult>>>>;

/// 检测结果缓存
#[derive(Clone)]
pub struct AnalysisCache {
    frames: FrameCache,
    ttl: Duration,
    results: Arc<DashMap<(String, String), ResultSlot>>,
}

impl AnalysisCache {
    pub fn new(frames: FrameCache, ttl: Duration) -> Self {
        Self {
            frames,
            ttl,
            results: Arc::new(DashMap::new()),
        }
    }

    /// 对视频源的最新帧运行检测
    ///
    /// # 返回
    ///
    /// - `Ok(None)`: 视频源当前没有帧
    /// - `Ok(Some(result))`: 检测结果（可能是复用的）
    /// - `Err(error)`: 检测器失败，失败结果不会被缓存
    pub async fn analyze_latest(
        &self,
        source_id: &str,
        analyzer: &dyn FrameAnalyzer,
    ) -> Result<Option<Arc<AnalysisResult>>> {
        let frame = match self.frames.latest(source_id) {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let key = (source_id.to_string(), analyzer.name().to_string());
        let slot = self.results.entry(key).or_default().value().clone();

        let mut cached = slot.lock().await;
        if let Some(result) = cached.as_ref() {
            if self.is_fresh(result, &frame) {
                return Ok(Some(result.clone()));
            }
        }

        debug!(
            "Running {} on {} sequence {}",
            analyzer.name(),
            source_id,
            frame.sequence
        );
        let output = analyzer.analyze(&frame).await?;
        let result = Arc::new(AnalysisResult {
            source_id: source_id.to_string(),
            analyzer: analyzer.name().to_string(),
            sequence: frame.sequence,
            output,
            computed_at: Instant::now(),
        });
        *cached = Some(result.clone());
        Ok(Some(result))
    }

    /// 丢弃视频源的全部检测结果，返回丢弃的条目数
    ///
    /// 正在进行的检测不受影响，结果不再写回缓存。
    pub fn forget(&self, source_id: &str) -> usize {
        let before = self.results.len();
        self.results.retain(|(source, _), _| source != source_id);
        before.saturating_sub(self.results.len())
    }

    /// 缓存中的检测结果条目数
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    fn is_fresh(&self, result: &AnalysisResult, frame: &CachedFrame) -> bool {
        result.sequence == frame.sequence || result.computed_at.elapsed() <= self.ttl
    }
}

/// 帧统计检测器
///
/// 计算平均亮度和数据大小，不依赖任何模型，用于联调检测链路。
#[derive(Debug, Default)]
pub struct FrameStatsAnalyzer;

#[async_trait]
impl FrameAnalyzer for FrameStatsAnalyzer {
    fn name(&self) -> &str {
        "frame-stats"
    }

    async fn analyze(&self, frame: &CachedFrame) -> Result<AnalysisOutput> {
        let bytes = frame.pixel_buffer.len();
        let mean = if bytes == 0 {
            0.0
        } else {
            frame.pixel_buffer.iter().map(|b| *b as u64).sum::<u64>() as f64 / bytes as f64
        };

        let mut attributes = BTreeMap::new();
        attributes.insert("bytes".to_string(), bytes.to_string());
        attributes.insert("mean_intensity".to_string(), format!("{:.1}", mean));
        if let (Some(width), Some(height)) = (frame.width, frame.height) {
            attributes.insert("resolution".to_string(), format!("{}x{}", width, height));
        }

        Ok(AnalysisOutput {
            annotations: Vec::new(),
            attributes,
        })
    }
}
