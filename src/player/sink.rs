use crate::core::{log_ctx, DecodedAudioChunk, DecodedVideoFrame, PlayerError, Result};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// 视频输出：状态机在帧到期时调用
pub trait VideoRenderer: Send {
    /// present_at 是该帧应当显示的时刻
    fn render(&mut self, frame: &DecodedVideoFrame, present_at: Instant);

    /// Seek 或关闭时清空画面
    fn clear(&mut self) {}
}

/// 音频输出设备
pub trait AudioSink: Send {
    fn start(&mut self, channels: u32, rate: u32) -> Result<()>;

    fn write(&mut self, chunk: &DecodedAudioChunk) -> Result<()>;

    /// 写入 frames 个静音帧（补齐时间戳空洞）
    fn write_silence(&mut self, frames: u64) -> Result<()>;

    fn pause(&mut self);

    fn resume(&mut self);

    /// 丢弃尚未播放的数据，已播放帧数清零
    fn flush(&mut self);

    fn set_volume(&mut self, volume: f64);

    /// 自 start / flush 以来实际播放的帧数（音频时钟）
    fn played_frames(&self) -> u64;

    /// 自 start / flush 以来写入的帧数
    fn written_frames(&self) -> u64;

    fn is_drained(&self) -> bool {
        self.played_frames() >= self.written_frames()
    }
}

/// 丢弃所有帧
#[derive(Debug, Default)]
pub struct NullRenderer;

impl VideoRenderer for NullRenderer {
    fn render(&mut self, _frame: &DecodedVideoFrame, _present_at: Instant) {}
}

/// 一次呈现的记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedFrame {
    pub start: i64,
    pub end: i64,
    pub timecode: i64,
    pub keyframe: bool,
    /// 亮度平面第一个字节
    pub luma: u8,
}

/// 记录呈现过的帧，可以克隆一份留在外面查看
#[derive(Debug, Clone, Default)]
pub struct FrameLog {
    frames: Arc<Mutex<Vec<RenderedFrame>>>,
}

impl FrameLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RenderedFrame> {
        self.frames.lock().clone()
    }

    pub fn last(&self) -> Option<RenderedFrame> {
        self.frames.lock().last().copied()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

impl VideoRenderer for FrameLog {
    fn render(&mut self, frame: &DecodedVideoFrame, _present_at: Instant) {
        let luma = frame.buffer.plane_data(0).and_then(|p| p.first().copied()).unwrap_or(0);
        self.frames.lock().push(RenderedFrame {
            start: frame.start,
            end: frame.end,
            timecode: frame.timecode,
            keyframe: frame.keyframe,
            luma,
        });
    }
}

#[derive(Debug, Default)]
struct SinkClock {
    rate: u32,
    channels: u32,
    written: u64,
    /// 最近一次暂停 / 重新计时前已播放的帧数
    played_before: u64,
    resumed_at: Option<Instant>,
    playing: bool,
}

impl SinkClock {
    fn played(&self) -> u64 {
        let elapsed = match self.resumed_at {
            Some(at) => (at.elapsed().as_secs_f64() * self.rate as f64) as u64,
            None => 0,
        };
        (self.played_before + elapsed).min(self.written)
    }

    /// 欠载后重新计时，避免新写入的数据被当成已经播放
    fn rebase(&mut self) {
        self.played_before = self.played();
        self.resumed_at = if self.playing { Some(Instant::now()) } else { None };
    }
}

/// 按墙上时间消费样本的虚拟设备
///
/// 已播放帧数 = min(已写入, 播放时长 × 采样率)
#[derive(Debug, Default)]
pub struct ClockedAudioSink {
    clock: SinkClock,
    volume: f64,
    silence_frames: u64,
    started: bool,
}

impl ClockedAudioSink {
    pub fn new() -> Self {
        Self { volume: 1.0, ..Self::default() }
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// 累计写入的静音帧数
    pub fn silence_frames(&self) -> u64 {
        self.silence_frames
    }

    fn append(&mut self, frames: u64) -> Result<()> {
        if !self.started {
            return Err(PlayerError::Other("音频输出尚未启动".into()));
        }
        if self.clock.played() >= self.clock.written {
            self.clock.rebase();
        }
        self.clock.written += frames;
        Ok(())
    }
}

impl AudioSink for ClockedAudioSink {
    fn start(&mut self, channels: u32, rate: u32) -> Result<()> {
        if channels == 0 || rate == 0 {
            return Err(PlayerError::UnsupportedFormat(format!(
                "音频输出不支持 {} Hz, {} 声道",
                rate, channels
            )));
        }
        info!("{} 🔊 音频输出启动: {} Hz, {} 声道", log_ctx(), rate, channels);
        self.clock = SinkClock { rate, channels, ..SinkClock::default() };
        self.started = true;
        Ok(())
    }

    fn write(&mut self, chunk: &DecodedAudioChunk) -> Result<()> {
        if chunk.channels != self.clock.channels {
            debug!(
                "{} 音频块声道数 {} 与输出 {} 不一致",
                log_ctx(),
                chunk.channels,
                self.clock.channels
            );
        }
        self.append(chunk.frames as u64)
    }

    fn write_silence(&mut self, frames: u64) -> Result<()> {
        self.silence_frames += frames;
        self.append(frames)
    }

    fn pause(&mut self) {
        if self.clock.playing {
            self.clock.played_before = self.clock.played();
            self.clock.resumed_at = None;
            self.clock.playing = false;
        }
    }

    fn resume(&mut self) {
        if !self.clock.playing {
            self.clock.playing = true;
            self.clock.resumed_at = Some(Instant::now());
        }
    }

    fn flush(&mut self) {
        self.clock.written = 0;
        self.clock.played_before = 0;
        self.clock.resumed_at = if self.clock.playing { Some(Instant::now()) } else { None };
    }

    fn set_volume(&mut self, volume: f64) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn played_frames(&self) -> u64 {
        self.clock.played()
    }

    fn written_frames(&self) -> u64 {
        self.clock.written
    }
}

/// 立即“播放”完写入的数据
///
/// 只用于没有音频轨道的媒体：有音频时已播放帧数等于已写入帧数，
/// 音频时钟会直接跳到已写入数据的末尾，视频帧会被成批丢弃。
/// 需要按真实速度消费音频时用 ClockedAudioSink
#[derive(Debug, Default)]
pub struct NullAudioSink {
    written: u64,
}

impl AudioSink for NullAudioSink {
    fn start(&mut self, _channels: u32, _rate: u32) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, chunk: &DecodedAudioChunk) -> Result<()> {
        self.written += chunk.frames as u64;
        Ok(())
    }

    fn write_silence(&mut self, frames: u64) -> Result<()> {
        self.written += frames;
        Ok(())
    }

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    fn flush(&mut self) {
        self.written = 0;
    }

    fn set_volume(&mut self, _volume: f64) {}

    fn played_frames(&self) -> u64 {
        self.written
    }

    fn written_frames(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn chunk(frames: u32) -> DecodedAudioChunk {
        DecodedAudioChunk {
            start: 0,
            duration: 0,
            offset: 0,
            frames,
            channels: 1,
            rate: 1000,
            samples: vec![0.0; frames as usize],
        }
    }

    #[test]
    fn test_write_before_start_fails() {
        let mut sink = ClockedAudioSink::new();
        assert!(sink.write(&chunk(10)).is_err());
        assert!(sink.start(0, 1000).is_err());
    }

    #[test]
    fn test_paused_sink_does_not_play() {
        let mut sink = ClockedAudioSink::new();
        sink.start(1, 1000).unwrap();
        sink.write(&chunk(100)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sink.played_frames(), 0);
        assert!(!sink.is_drained());
    }

    #[test]
    fn test_played_frames_capped_by_written() {
        let mut sink = ClockedAudioSink::new();
        sink.start(1, 1000).unwrap();
        sink.resume();
        sink.write(&chunk(10)).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(sink.played_frames(), 10);
        assert!(sink.is_drained());

        sink.write_silence(5).unwrap();
        assert_eq!(sink.silence_frames(), 5);
        assert!(sink.played_frames() <= 15);

        sink.flush();
        assert_eq!(sink.played_frames(), 0);
        assert_eq!(sink.written_frames(), 0);
    }

    #[test]
    fn test_null_sink_drains_immediately() {
        let mut sink = NullAudioSink::default();
        sink.start(1, 1000).unwrap();
        sink.write(&chunk(10)).unwrap();
        sink.write_silence(5).unwrap();
        assert_eq!(sink.played_frames(), 15);
        assert!(sink.is_drained());
        sink.flush();
        assert_eq!(sink.written_frames(), 0);
    }

    #[test]
    fn test_frame_log_records_renders() {
        use crate::core::{PictureRect, Size, VideoBuffer};
        let buffer = VideoBuffer::new_i420(2, 2, vec![42, 0, 0, 0, 128, 128]).unwrap();
        let frame = DecodedVideoFrame {
            start: 0,
            end: 40_000,
            timecode: 7,
            keyframe: true,
            offset: 0,
            picture: PictureRect::full(Size::new(2, 2)),
            buffer,
        };
        let log = FrameLog::new();
        let mut renderer = log.clone();
        renderer.render(&frame, Instant::now());
        assert_eq!(log.len(), 1);
        assert_eq!(log.last().map(|f| (f.timecode, f.luma)), Some((7, 42)));
    }
}
