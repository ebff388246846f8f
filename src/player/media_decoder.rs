use crate::core::{
    log_ctx, secs_to_usecs, usecs_to_secs, DecoderState, FrameStatistics, MediaInfo, NextFrameStatus,
    PipelineConfig, PlayState, PlayerError, Result, TimeRanges, WaitCondition,
};
use crate::player::context::{DecodeContext, PlayerEvent};
use crate::player::decode_thread::DecodeThread;
use crate::player::reader::{BufferedSource, Reader};
use crate::player::registry::DecoderRegistry;
use crate::player::resource::Resource;
use crate::player::sink::{AudioSink, VideoRenderer};
use crate::player::state_machine::StateMachineThread;
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use std::sync::Arc;

/// 播放控制面
///
/// 持有解码线程和状态机线程；所有调用都只是在 Monitor 内改状态并唤醒线程，
/// 不会阻塞在解码或 I/O 上（shutdown 除外，它要等线程退出）
pub struct MediaDecoder {
    ctx: DecodeContext,
    events: Receiver<PlayerEvent>,
    resource: Arc<dyn Resource>,
    buffered: Arc<dyn BufferedSource>,
    decode_thread: DecodeThread,
    state_machine: StateMachineThread,
    closed: bool,
}

impl MediaDecoder {
    /// 用已经选好的读取器启动播放管线，初始为暂停状态
    pub fn start(
        reader: Box<dyn Reader>,
        resource: Arc<dyn Resource>,
        renderer: Box<dyn VideoRenderer>,
        sink: Box<dyn AudioSink>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        info!("{} 🎬 启动播放管线: {}", log_ctx(), reader.description());

        // 读取器移交给解码线程前取出缓冲查询句柄
        let buffered = reader.buffered();
        let (ctx, events) = DecodeContext::new(config);

        let mut decode_thread = DecodeThread::start(reader, Arc::clone(&resource), ctx.clone())?;
        let state_machine = match StateMachineThread::start(
            ctx.clone(),
            Arc::clone(&resource),
            renderer,
            sink,
        ) {
            Ok(thread) => thread,
            Err(e) => {
                ctx.shutdown();
                resource.close();
                decode_thread.join();
                return Err(e);
            }
        };

        Ok(Self {
            ctx,
            events,
            resource,
            buffered,
            decode_thread,
            state_machine,
            closed: false,
        })
    }

    /// 通过注册表选择读取器后启动
    pub fn open(
        registry: &Arc<DecoderRegistry>,
        resource: Arc<dyn Resource>,
        mime: Option<&str>,
        renderer: Box<dyn VideoRenderer>,
        sink: Box<dyn AudioSink>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let reader = registry.create_reader(Arc::clone(&resource), mime)?;
        Self::start(reader, resource, renderer, sink, config)
    }

    /// 事件接收端
    pub fn events(&self) -> &Receiver<PlayerEvent> {
        &self.events
    }

    pub fn play(&self) {
        info!("{} ▶️ 播放", log_ctx());
        let monitor = self.ctx.monitor();
        let mut shared = monitor.lock();
        shared.play_state = PlayState::Playing;
        if shared.state == DecoderState::Buffering {
            debug!("{} 缓冲中调用 play，直接结束缓冲", log_ctx());
            self.ctx.change_state(&mut shared, DecoderState::Decoding);
        }
        monitor.notify_all();
    }

    pub fn pause(&self) {
        info!("{} ⏸️ 暂停", log_ctx());
        let monitor = self.ctx.monitor();
        let mut shared = monitor.lock();
        shared.play_state = PlayState::Paused;
        monitor.notify_all();
    }

    /// 跳转到 seconds（相对媒体开始时间），目标会被限制在 [0, duration]
    ///
    /// 只登记请求，真正的定位在解码线程完成，完成后发出 SeekCompleted
    pub fn seek(&self, seconds: f64) -> Result<()> {
        let offset = secs_to_usecs(seconds)
            .ok_or_else(|| PlayerError::SeekFailed(format!("无效的 Seek 时间: {}", seconds)))?;

        let monitor = self.ctx.monitor();
        let mut shared = monitor.lock();
        match shared.state {
            DecoderState::DecodingMetadata => {
                return Err(PlayerError::SeekFailed("元数据尚未加载".into()));
            }
            DecoderState::Shutdown | DecoderState::Error => {
                return Err(PlayerError::Shutdown);
            }
            _ => {}
        }

        let start = shared.start_time;
        let mut target = start.saturating_add(offset).max(start);
        if let Some(end) = shared.end_time {
            target = target.min(end);
        }
        info!("{} 🎯 Seek 到: {:.3}s ({}us)", log_ctx(), usecs_to_secs(target - start), target);

        // 连续 Seek 时保留第一次之前的位置用于回滚
        if shared.state != DecoderState::Seeking {
            shared.seek_rollback = shared.current_time;
        }
        shared.seek_target = Some(target);
        shared.video_queue.erase();
        shared.audio_queue.erase();
        self.ctx.change_state(&mut shared, DecoderState::Seeking);
        shared.emit(PlayerEvent::SeekStarted(usecs_to_secs(target - start)));
        monitor.notify_all();
        Ok(())
    }

    /// 关闭管线：进入 SHUTDOWN、关闭资源打断阻塞读取、等待两个线程退出
    ///
    /// 可以重复调用
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("{} ⏹️ 关闭播放管线", log_ctx());
        self.ctx.shutdown();
        self.resource.close();
        self.decode_thread.join();
        self.state_machine.join();

        let monitor = self.ctx.monitor();
        let mut shared = monitor.lock();
        shared.video_queue.erase();
        shared.audio_queue.erase();
        monitor.notify(WaitCondition::QueueNotFull);
        info!("{} ✅ 播放管线已关闭", log_ctx());
    }

    /// 音量，限制在 [0, 1]
    pub fn set_volume(&self, volume: f64) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        let monitor = self.ctx.monitor();
        let mut shared = monitor.lock();
        shared.volume = volume;
        monitor.notify_all();
    }

    pub fn volume(&self) -> f64 {
        self.ctx.monitor().lock().volume
    }

    pub fn state(&self) -> DecoderState {
        self.ctx.state()
    }

    pub fn play_state(&self) -> PlayState {
        self.ctx.monitor().lock().play_state
    }

    /// 当前播放位置（秒，相对开始时间）
    pub fn current_time(&self) -> f64 {
        let shared = self.ctx.monitor().lock();
        usecs_to_secs((shared.current_time - shared.start_time).max(0))
    }

    /// 总时长（秒），未知为 None
    pub fn duration(&self) -> Option<f64> {
        let shared = self.ctx.monitor().lock();
        shared.end_time.map(|end| usecs_to_secs((end - shared.start_time).max(0)))
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.ctx.monitor().lock().info.clone()
    }

    pub fn frame_statistics(&self) -> FrameStatistics {
        self.ctx.frame_statistics()
    }

    pub fn next_frame_status(&self) -> NextFrameStatus {
        let shared = self.ctx.monitor().lock();
        match shared.state {
            DecoderState::Seeking => NextFrameStatus::UnavailableSeeking,
            DecoderState::Buffering => NextFrameStatus::UnavailableBuffering,
            _ if !shared.video_queue.is_empty() => NextFrameStatus::Available,
            _ => NextFrameStatus::Unavailable,
        }
    }

    /// 已缓冲的时间区间（秒）
    pub fn buffered(&self) -> Result<TimeRanges> {
        let start_time = self.ctx.monitor().lock().start_time;
        self.buffered.get_buffered(start_time)
    }
}

impl Drop for MediaDecoder {
    fn drop(&mut self) {
        if !self.closed {
            warn!("{} ⚠️ MediaDecoder 未显式关闭，Drop 时关闭", log_ctx());
        }
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::resource::MemoryResource;
    use crate::player::samples::RawStreamWriter;
    use crate::player::sink::{FrameLog, NullAudioSink};
    use std::time::{Duration, Instant};

    fn open_raw(frames: u64) -> (MediaDecoder, FrameLog) {
        let registry = Arc::new(DecoderRegistry::with_builtin());
        let resource: Arc<dyn Resource> =
            Arc::new(MemoryResource::from_bytes(RawStreamWriter::new(16, 16, 30, 1).frames(frames).build()));
        let log = FrameLog::new();
        let decoder = MediaDecoder::open(
            &registry,
            resource,
            None,
            Box::new(log.clone()),
            Box::new(NullAudioSink::default()),
            PipelineConfig::default(),
        )
        .unwrap();
        (decoder, log)
    }

    fn wait_for_event<F: Fn(&PlayerEvent) -> bool>(decoder: &MediaDecoder, pred: F) -> Option<PlayerEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match decoder.events().recv_timeout(left) {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_metadata_and_queries() {
        let (mut decoder, log) = open_raw(10);
        let event = wait_for_event(&decoder, |e| matches!(e, PlayerEvent::MetadataLoaded(_)));
        assert!(event.is_some());
        let info = decoder.media_info().unwrap();
        assert!(info.has_video);
        assert!(!info.has_audio);
        let duration = decoder.duration().unwrap();
        assert!((duration - 10.0 / 30.0).abs() < 1.0 / 30.0);
        assert_eq!(decoder.play_state(), PlayState::Paused);
        assert_eq!(decoder.current_time(), 0.0);

        // 暂停时呈现首帧
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(log.entries().first().map(|f| f.timecode), Some(0));

        decoder.set_volume(3.0);
        assert_eq!(decoder.volume(), 1.0);
        decoder.shutdown();
        assert_eq!(decoder.state(), DecoderState::Shutdown);
        assert!(decoder.seek(0.1).is_err());
        decoder.shutdown();
    }

    #[test]
    fn test_seek_before_metadata_is_rejected() {
        let registry = Arc::new(DecoderRegistry::with_builtin());
        let resource = Arc::new(MemoryResource::streaming(None));
        resource.append(&RawStreamWriter::new(16, 16, 30, 1).build()[..4]);
        let reader = Box::new(crate::player::reader::RawReader::new(resource.clone()));
        let mut decoder = MediaDecoder::start(
            reader,
            resource,
            Box::new(FrameLog::new()),
            Box::new(NullAudioSink::default()),
            PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(decoder.state(), DecoderState::DecodingMetadata);
        assert!(matches!(decoder.seek(0.0), Err(PlayerError::SeekFailed(_))));
        assert_eq!(decoder.next_frame_status(), NextFrameStatus::Unavailable);
        // 读取阻塞在缺失的数据上，关闭仍然要及时返回
        let started = Instant::now();
        decoder.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(registry);
    }

    #[test]
    fn test_seek_emits_started_and_completed() {
        let (mut decoder, _log) = open_raw(10);
        wait_for_event(&decoder, |e| matches!(e, PlayerEvent::MetadataLoaded(_))).unwrap();
        decoder.seek(-1.0).unwrap();
        let started = wait_for_event(&decoder, |e| matches!(e, PlayerEvent::SeekStarted(_)));
        assert_eq!(started, Some(PlayerEvent::SeekStarted(0.0)));
        let completed = wait_for_event(&decoder, |e| matches!(e, PlayerEvent::SeekCompleted(_)));
        assert_eq!(completed, Some(PlayerEvent::SeekCompleted(0.0)));
        decoder.shutdown();
    }
}
