use crate::core::{
    log_ctx, DecodedAudioChunk, DecodedVideoFrame, DecoderState, ErrorKind, FrameQueue,
    FrameStatistics, MediaInfo, Monitor, PipelineConfig, PlayState, PlayerError, PushError, Result,
    Timestamped, WaitCondition,
};
use crate::player::resource::{cached_bytes_ahead, Resource};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Instant;

/// 控制面收到的通知
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    MetadataLoaded(MediaInfo),
    DurationChanged(f64),
    Buffering(bool),
    SeekStarted(f64),
    SeekCompleted(f64),
    Completed,
    Error(ErrorKind),
}

/// Monitor 保护的全部共享状态
pub(crate) struct DecoderShared {
    pub state: DecoderState,
    pub play_state: PlayState,
    pub info: Option<MediaInfo>,
    pub video_queue: FrameQueue<DecodedVideoFrame>,
    pub audio_queue: FrameQueue<DecodedAudioChunk>,
    /// 尚未被解码线程取走的 Seek 目标（绝对媒体时间，微秒）
    pub seek_target: Option<i64>,
    /// Seek 前的播放位置，失败时回滚到这里
    pub seek_rollback: i64,
    pub start_time: i64,
    pub end_time: Option<i64>,
    /// 最近呈现的媒体时间
    pub current_time: i64,
    /// 已写入音频设备的数据结束时间
    pub audio_end_time: Option<i64>,
    /// 元数据加载或 Seek 完成后立即呈现一帧
    pub present_first_frame: bool,
    pub decode_start: Option<Instant>,
    pub quick_buffering: bool,
    pub buffering_start: Option<Instant>,
    /// 最近推入队列的数据在资源中的结束偏移
    pub decoded_offset: u64,
    pub stats: FrameStatistics,
    pub error: Option<ErrorKind>,
    pub volume: f64,
    events: Sender<PlayerEvent>,
}

impl DecoderShared {
    fn new(config: &PipelineConfig, events: Sender<PlayerEvent>) -> Self {
        Self {
            state: DecoderState::DecodingMetadata,
            play_state: PlayState::Paused,
            info: None,
            video_queue: FrameQueue::new(config.video_queue_capacity),
            audio_queue: FrameQueue::new(config.audio_queue_capacity),
            seek_target: None,
            seek_rollback: 0,
            start_time: 0,
            end_time: None,
            current_time: 0,
            audio_end_time: None,
            present_first_frame: false,
            decode_start: None,
            quick_buffering: false,
            buffering_start: None,
            decoded_offset: 0,
            stats: FrameStatistics::default(),
            error: None,
            volume: 1.0,
            events,
        }
    }

    pub fn emit(&self, event: PlayerEvent) {
        // 接收端可能已经被丢弃（独立使用读取器时），忽略发送失败
        let _ = self.events.send(event);
    }

    pub fn has_audio(&self) -> bool {
        self.info.as_ref().is_some_and(|i| i.has_audio)
    }

    pub fn has_video(&self) -> bool {
        self.info.as_ref().is_some_and(|i| i.has_video)
    }

    /// 已解码、尚未播放的音频时长（队列 + 已写入设备未播放部分）
    pub fn decoded_audio_us(&self) -> i64 {
        let written_ahead = self
            .audio_end_time
            .map(|end| (end - self.current_time).max(0))
            .unwrap_or(0);
        self.audio_queue.span() + written_ahead
    }

    /// 解码位置之后已缓存、尚未解码的数据是否不足 threshold_us
    ///
    /// 字节按平均码率折算成时间；长度或时长未知时只看是否还有缓存数据
    pub fn has_low_undecoded_data(&self, resource: &dyn Resource, threshold_us: i64) -> bool {
        if resource.is_data_cached_to_end(self.decoded_offset) {
            return false;
        }
        let ahead = cached_bytes_ahead(resource, self.decoded_offset);
        let duration = self.end_time.map(|end| end - self.start_time);
        match (resource.length(), duration) {
            (Some(length), Some(duration)) if length > 0 && duration > 0 => {
                let ahead_us = ahead as u128 * duration as u128 / length as u128;
                ahead_us < threshold_us.max(0) as u128
            }
            _ => ahead == 0,
        }
    }
}

/// 读取器（以及状态机）访问共享解码状态的句柄
#[derive(Clone)]
pub struct DecodeContext {
    monitor: Arc<Monitor<DecoderShared>>,
    config: Arc<PipelineConfig>,
}

impl DecodeContext {
    /// 创建共享状态，同时返回事件接收端
    pub fn new(config: PipelineConfig) -> (Self, Receiver<PlayerEvent>) {
        let (tx, rx) = unbounded();
        let shared = DecoderShared::new(&config, tx);
        let ctx = Self {
            monitor: Arc::new(Monitor::new(shared)),
            config: Arc::new(config),
        };
        (ctx, rx)
    }

    /// 不关心事件时使用（测试、单独驱动读取器）
    pub fn standalone(config: PipelineConfig) -> Self {
        Self::new(config).0
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub(crate) fn monitor(&self) -> &Monitor<DecoderShared> {
        &self.monitor
    }

    pub fn state(&self) -> DecoderState {
        self.monitor.lock().state
    }

    pub fn is_shutdown(&self) -> bool {
        self.monitor.lock().state.is_terminal()
    }

    /// 已关闭或有新的 Seek 请求待处理
    pub fn is_interrupted(&self) -> bool {
        let shared = self.monitor.lock();
        shared.state.is_terminal() || shared.seek_target.is_some()
    }

    /// 在 Monitor 内切换状态并唤醒所有等待者
    pub(crate) fn change_state(&self, shared: &mut DecoderShared, state: DecoderState) {
        if shared.state == state || shared.state.is_terminal() {
            return;
        }
        debug!("{} 🔀 状态切换: {:?} -> {:?}", log_ctx(), shared.state, state);
        shared.state = state;
        self.monitor.notify_all();
    }

    /// 致命错误：进入 ERROR 并通知
    pub fn fail(&self, err: &PlayerError) {
        let mut shared = self.monitor.lock();
        if shared.state.is_terminal() {
            return;
        }
        let kind = err.kind();
        error!("{} ❌ 解码器出错: {} ({:?})", log_ctx(), err, kind);
        shared.error = Some(kind);
        shared.state = DecoderState::Error;
        shared.emit(PlayerEvent::Error(kind));
        self.monitor.notify_all();
    }

    /// 进入 SHUTDOWN 并唤醒所有阻塞在 Monitor 上的线程
    pub fn shutdown(&self) {
        let mut shared = self.monitor.lock();
        if shared.state != DecoderState::Shutdown {
            info!("{} 🛑 解码器进入 SHUTDOWN", log_ctx());
            shared.state = DecoderState::Shutdown;
        }
        self.monitor.notify_all();
    }

    fn push_with<T: Timestamped>(
        &self,
        item: T,
        offset: u64,
        select: fn(&mut DecoderShared) -> &mut FrameQueue<T>,
        what: &str,
    ) -> Result<()> {
        let mut shared = self.monitor.lock();
        let mut item = item;
        loop {
            if shared.state.is_terminal() {
                return Err(PlayerError::Shutdown);
            }
            if shared.seek_target.is_some() {
                return Err(PlayerError::Interrupted);
            }
            match select(&mut *shared).push(item) {
                Ok(()) => {
                    shared.decoded_offset = offset;
                    self.monitor.notify(WaitCondition::QueueNotEmpty);
                    return Ok(());
                }
                Err(PushError::Full(back)) => {
                    item = back;
                    self.monitor.wait(&mut shared, WaitCondition::QueueNotFull);
                }
                Err(PushError::OutOfOrder(back)) => {
                    warn!(
                        "{} ⚠️ {} 时间戳倒退，丢弃 (start={}us)",
                        log_ctx(),
                        what,
                        back.start_time()
                    );
                    return Ok(());
                }
            }
        }
    }

    /// 推入视频帧；队列满时阻塞，直到有空位、关闭或新的 Seek 请求
    pub fn push_video(&self, frame: DecodedVideoFrame) -> Result<()> {
        let offset = frame.offset;
        self.push_with(frame, offset, |s| &mut s.video_queue, "视频帧")
    }

    /// 推入音频块，语义同 push_video
    pub fn push_audio(&self, chunk: DecodedAudioChunk) -> Result<()> {
        let offset = chunk.offset;
        self.push_with(chunk, offset, |s| &mut s.audio_queue, "音频块")
    }

    pub fn pop_video(&self) -> Option<DecodedVideoFrame> {
        let frame = self.monitor.lock().video_queue.pop_front();
        if frame.is_some() {
            self.monitor.notify(WaitCondition::QueueNotFull);
        }
        frame
    }

    pub fn pop_audio(&self) -> Option<DecodedAudioChunk> {
        let chunk = self.monitor.lock().audio_queue.pop_front();
        if chunk.is_some() {
            self.monitor.notify(WaitCondition::QueueNotFull);
        }
        chunk
    }

    pub fn peek_video_start(&self) -> Option<i64> {
        self.monitor.lock().video_queue.peek_front().map(|f| f.start)
    }

    pub fn video_len(&self) -> usize {
        self.monitor.lock().video_queue.len()
    }

    pub fn audio_len(&self) -> usize {
        self.monitor.lock().audio_queue.len()
    }

    /// 队列中已解码音频的时长
    pub fn queued_audio_us(&self) -> i64 {
        self.monitor.lock().audio_queue.span()
    }

    pub fn erase_video(&self) {
        self.monitor.lock().video_queue.erase();
        self.monitor.notify(WaitCondition::QueueNotFull);
    }

    pub fn erase_audio(&self) {
        self.monitor.lock().audio_queue.erase();
        self.monitor.notify(WaitCondition::QueueNotFull);
    }

    pub fn finish_video(&self) {
        self.monitor.lock().video_queue.finish();
        self.monitor.notify_all();
    }

    pub fn finish_audio(&self) {
        self.monitor.lock().audio_queue.finish();
        self.monitor.notify_all();
    }

    /// 累加解析 / 解码帧数
    pub fn note_frames(&self, parsed: u64, decoded: u64) {
        let mut shared = self.monitor.lock();
        shared.stats.parsed += parsed;
        shared.stats.decoded += decoded;
    }

    pub fn frame_statistics(&self) -> FrameStatistics {
        self.monitor.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PictureRect, Size, VideoBuffer};
    use std::thread;
    use std::time::Duration;

    fn frame(start: i64) -> DecodedVideoFrame {
        DecodedVideoFrame {
            start,
            end: start + 10,
            timecode: -1,
            keyframe: true,
            offset: 0,
            picture: PictureRect::full(Size::new(2, 2)),
            buffer: VideoBuffer::new_i420(2, 2, vec![0; 6]).unwrap(),
        }
    }

    fn small_config(capacity: usize) -> PipelineConfig {
        PipelineConfig {
            video_queue_capacity: capacity,
            ample_video_frames: capacity,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_push_blocks_until_pop() {
        let ctx = DecodeContext::standalone(small_config(5));
        let producer = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                for i in 0..6 {
                    ctx.push_video(frame(i * 10)).unwrap();
                }
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ctx.video_len(), 5);
        assert!(!producer.is_finished());

        assert_eq!(ctx.pop_video().map(|f| f.start), Some(0));
        producer.join().unwrap();
        assert_eq!(ctx.video_len(), 5);
    }

    #[test]
    fn test_shutdown_releases_blocked_push() {
        let ctx = DecodeContext::standalone(small_config(1));
        ctx.push_video(frame(0)).unwrap();
        let producer = {
            let ctx = ctx.clone();
            thread::spawn(move || ctx.push_video(frame(10)))
        };
        thread::sleep(Duration::from_millis(20));
        ctx.shutdown();
        assert!(matches!(producer.join().unwrap(), Err(PlayerError::Shutdown)));
    }

    #[test]
    fn test_pending_seek_interrupts_push() {
        let ctx = DecodeContext::standalone(small_config(1));
        ctx.push_video(frame(0)).unwrap();
        let producer = {
            let ctx = ctx.clone();
            thread::spawn(move || ctx.push_video(frame(10)))
        };
        thread::sleep(Duration::from_millis(20));
        {
            let mut shared = ctx.monitor().lock();
            shared.seek_target = Some(0);
            ctx.change_state(&mut shared, DecoderState::Seeking);
        }
        assert!(matches!(producer.join().unwrap(), Err(PlayerError::Interrupted)));
    }

    #[test]
    fn test_out_of_order_push_is_dropped() {
        let ctx = DecodeContext::standalone(PipelineConfig::default());
        ctx.push_video(frame(100)).unwrap();
        ctx.push_video(frame(50)).unwrap();
        assert_eq!(ctx.video_len(), 1);
    }

    #[test]
    fn test_fail_emits_error_once() {
        let (ctx, events) = DecodeContext::new(PipelineConfig::default());
        ctx.fail(&PlayerError::OutOfMemory(8));
        ctx.fail(&PlayerError::CorruptMetadata("again".into()));
        assert_eq!(ctx.state(), DecoderState::Error);
        assert_eq!(events.try_recv(), Ok(PlayerEvent::Error(ErrorKind::OutOfMemory)));
        assert!(events.try_recv().is_err());
    }
}
