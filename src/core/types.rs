use crate::core::error::{PlayerError, Result};
use serde::{Deserialize, Serialize};

/// 每秒微秒数（管线内部所有时间戳都是微秒）
pub const USECS_PER_S: i64 = 1_000_000;
pub const USECS_PER_MS: i64 = 1_000;

/// 单个维度允许的最大像素数
pub const MAX_VIDEO_DIMENSION: u32 = 16384;

pub fn usecs_to_secs(usecs: i64) -> f64 {
    usecs as f64 / USECS_PER_S as f64
}

/// 秒 → 微秒，非有限值或溢出返回 None
pub fn secs_to_usecs(secs: f64) -> Option<i64> {
    if !secs.is_finite() {
        return None;
    }
    let usecs = (secs * USECS_PER_S as f64).round();
    if usecs.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(usecs as i64)
}

/// 音频帧数 → 微秒
pub fn frames_to_usecs(frames: u64, rate: u32) -> Option<i64> {
    if rate == 0 {
        return None;
    }
    let usecs = frames as u128 * USECS_PER_S as u128 / rate as u128;
    i64::try_from(usecs).ok()
}

/// 微秒 → 音频帧数（负数返回 0）
pub fn usecs_to_frames(usecs: i64, rate: u32) -> u64 {
    if usecs <= 0 {
        return 0;
    }
    (usecs as u128 * rate as u128 / USECS_PER_S as u128) as u64
}

/// 尝试分配缓冲，失败时返回 OutOfMemory 而不是中止进程
pub fn alloc_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| PlayerError::OutOfMemory(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// 画面有效区域（帧内坐标）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PictureRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PictureRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn full(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// 右边界，溢出返回 None
    pub fn right(&self) -> Option<u32> {
        self.x.checked_add(self.width)
    }

    pub fn bottom(&self) -> Option<u32> {
        self.y.checked_add(self.height)
    }
}

/// 按像素宽高比缩放显示尺寸
pub fn scale_display_by_aspect_ratio(display: Size, aspect_ratio: f64) -> Size {
    if aspect_ratio > 1.0 {
        Size::new((display.width as f64 * aspect_ratio).round() as u32, display.height)
    } else if aspect_ratio < 1.0 && aspect_ratio > 0.0 {
        Size::new(display.width, (display.height as f64 / aspect_ratio).round() as u32)
    } else {
        display
    }
}

/// 检查帧尺寸、画面区域和显示尺寸是否在合理范围内
pub fn validate_video_region(frame: Size, picture: PictureRect, display: Size) -> bool {
    let max = MAX_VIDEO_DIMENSION;
    let max_area = max as u64 * max as u64;

    let frame_ok = frame.width <= max
        && frame.height <= max
        && frame.area() <= max_area
        && frame.area() != 0;

    let picture_ok = match (picture.right(), picture.bottom()) {
        (Some(right), Some(bottom)) => {
            picture.width <= max
                && picture.x < max
                && right < max
                && picture.height <= max
                && picture.y < max
                && bottom < max
                && (picture.width as u64 * picture.height as u64) <= max_area
                && picture.width as u64 * picture.height as u64 != 0
        }
        _ => false,
    };

    let display_ok = display.width <= max
        && display.height <= max
        && display.area() <= max_area
        && display.area() != 0;

    frame_ok && picture_ok && display_ok
}

/// 媒体信息
///
/// ReadMetadata 成功后创建且不再修改；状态机只在 Monitor 内读取其副本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub container: String,          // 读取器名称
    pub has_audio: bool,
    pub has_video: bool,
    pub frame: Size,                // 解码帧尺寸
    pub picture: PictureRect,       // 帧内有效区域
    pub display: Size,              // 按像素宽高比缩放后的显示尺寸
    pub pixel_aspect_ratio: f64,
    pub frame_rate: Option<f64>,
    pub audio_rate: u32,
    pub audio_channels: u32,
    pub duration_us: Option<i64>,   // 总时长（微秒），未知为 None
}

impl Default for MediaInfo {
    fn default() -> Self {
        Self {
            container: String::new(),
            has_audio: false,
            has_video: false,
            frame: Size::default(),
            picture: PictureRect::default(),
            display: Size::default(),
            pixel_aspect_ratio: 1.0,
            frame_rate: None,
            audio_rate: 0,
            audio_channels: 0,
            duration_us: None,
        }
    }
}

impl MediaInfo {
    pub fn duration_secs(&self) -> Option<f64> {
        self.duration_us.map(usecs_to_secs)
    }
}

/// 单个平面在缓冲中的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub offset: usize,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

impl Plane {
    fn byte_len(&self) -> Option<usize> {
        (self.stride as usize).checked_mul(self.height as usize)
    }
}

/// 拥有所有权的 YCbCr 平面缓冲（Y / Cb / Cr）
#[derive(Debug, Clone, PartialEq)]
pub struct VideoBuffer {
    data: Vec<u8>,
    planes: [Plane; 3],
}

impl VideoBuffer {
    /// 按 4:2:0 紧密排列构建
    pub fn new_i420(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let chroma_width = width.div_ceil(2);
        let chroma_height = height.div_ceil(2);
        let luma_len = width as usize * height as usize;
        let chroma_len = chroma_width as usize * chroma_height as usize;

        let planes = [
            Plane { offset: 0, width, height, stride: width },
            Plane { offset: luma_len, width: chroma_width, height: chroma_height, stride: chroma_width },
            Plane { offset: luma_len + chroma_len, width: chroma_width, height: chroma_height, stride: chroma_width },
        ];
        Self::from_planes(data, planes)
    }

    /// 自定义平面布局，检查每个平面都落在缓冲内
    pub fn from_planes(data: Vec<u8>, planes: [Plane; 3]) -> Result<Self> {
        for (i, plane) in planes.iter().enumerate() {
            let end = plane
                .byte_len()
                .and_then(|len| len.checked_add(plane.offset))
                .ok_or_else(|| PlayerError::DecodeError(format!("平面 {} 尺寸溢出", i)))?;
            if end > data.len() || plane.stride < plane.width {
                return Err(PlayerError::DecodeError(format!(
                    "平面 {} 超出缓冲范围 ({} > {})",
                    i,
                    end,
                    data.len()
                )));
            }
        }
        Ok(Self { data, planes })
    }

    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }

    pub fn plane_data(&self, index: usize) -> Option<&[u8]> {
        let plane = self.planes.get(index)?;
        let len = plane.byte_len()?;
        self.data.get(plane.offset..plane.offset + len)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// 解码后的视频帧
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedVideoFrame {
    pub start: i64,         // 显示开始时间（微秒）
    pub end: i64,           // 显示结束时间（微秒）
    pub timecode: i64,      // 帧序号，未知为 -1
    pub keyframe: bool,
    pub offset: u64,        // 该帧数据在资源中的结束偏移
    pub picture: PictureRect,
    pub buffer: VideoBuffer,
}

/// 解码后的音频块（交错 f32 PCM）
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudioChunk {
    pub start: i64,         // 开始时间（微秒）
    pub duration: i64,      // 持续时间（微秒）
    pub offset: u64,
    pub frames: u32,
    pub channels: u32,
    pub rate: u32,
    pub samples: Vec<f32>,
}

impl DecodedAudioChunk {
    pub fn end(&self) -> i64 {
        self.start + self.duration
    }
}

/// 解码器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderState {
    DecodingMetadata,
    Decoding,
    Seeking,
    Buffering,
    Completed,
    Shutdown,
    Error,
}

impl DecoderState {
    /// SHUTDOWN / ERROR 之后不再有任何转换
    pub fn is_terminal(self) -> bool {
        matches!(self, DecoderState::Shutdown | DecoderState::Error)
    }
}

/// 控制面请求的播放意图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    Paused,
    Playing,
}

/// 下一帧是否可用（供上层决定 readyState）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextFrameStatus {
    Available,
    Unavailable,
    UnavailableBuffering,
    UnavailableSeeking,
}

/// 帧统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameStatistics {
    pub parsed: u64,
    pub decoded: u64,
    pub presented: u64,
    pub dropped: u64,
}

/// 资源中的字节区间 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        self.start <= start && end <= self.end
    }
}

/// 时间区间 [start, end)（秒）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

/// 有序、不重叠的时间区间集合
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeRanges {
    ranges: Vec<TimeRange>,
}

impl TimeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, start: f64, end: f64) {
        if end > start {
            self.ranges.push(TimeRange { start, end });
        }
    }

    /// 排序并合并重叠或相邻的区间
    pub fn normalize(&mut self) {
        self.ranges.sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut merged: Vec<TimeRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    pub fn contains(&self, time: f64) -> bool {
        self.ranges.iter().any(|r| r.start <= time && time < r.end)
    }

    /// 包含 time 的区间的结束时间
    pub fn end_of_range_containing(&self, time: f64) -> Option<f64> {
        self.ranges
            .iter()
            .find(|r| r.start <= time && time <= r.end)
            .map(|r| r.end)
    }
}
