use crate::core::{log_ctx, usecs_to_secs, DecoderState, PlayerError, Result, WaitCondition};
use crate::player::context::{DecodeContext, PlayerEvent};
use crate::player::reader::Reader;
use crate::player::resource::Resource;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 解码线程管理器
///
/// 读取器被移动进线程，之后只有这个线程调用它
pub struct DecodeThread {
    handle: Option<JoinHandle<()>>,
}

impl DecodeThread {
    pub fn start(reader: Box<dyn Reader>, resource: Arc<dyn Resource>, ctx: DecodeContext) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("myy-decode".to_string())
            .spawn(move || DecodeLoop::new(reader, resource, ctx).run())?;
        Ok(Self { handle: Some(handle) })
    }

    /// 等待线程退出（调用前先让状态进入 SHUTDOWN）
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ 解码线程异常退出", log_ctx());
            }
        }
    }
}

/// 一轮解码要做的事
#[derive(Debug, Clone, Copy)]
struct DecodePlan {
    video: bool,
    audio: bool,
    threshold: i64,
    buffering: bool,
}

enum Action {
    Seek(i64),
    Decode(DecodePlan),
    Exit,
}

struct DecodeLoop {
    reader: Box<dyn Reader>,
    resource: Arc<dyn Resource>,
    ctx: DecodeContext,
    video_eof: bool,
    audio_eof: bool,
    /// 初始填充阶段（队列第一次达到充足水位之前）
    video_pump: bool,
    audio_pump: bool,
    keyframe_skip: bool,
    /// 视频解码慢时会被调高
    low_audio_us: i64,
    ample_audio_us: i64,
}

impl DecodeLoop {
    fn new(reader: Box<dyn Reader>, resource: Arc<dyn Resource>, ctx: DecodeContext) -> Self {
        let low_audio_us = ctx.config().low_audio_us();
        let ample_audio_us = ctx.config().ample_audio_us();
        Self {
            reader,
            resource,
            ctx,
            video_eof: false,
            audio_eof: false,
            video_pump: true,
            audio_pump: true,
            keyframe_skip: false,
            low_audio_us,
            ample_audio_us,
        }
    }

    fn run(mut self) {
        info!("{} 🎬 解码线程启动: {}", log_ctx(), self.reader.description());

        match self.load_metadata() {
            Ok(()) => self.decode_loop(),
            Err(PlayerError::Shutdown) | Err(PlayerError::ResourceClosed) => {
                debug!("{} 读取元数据时解码器被关闭", log_ctx());
            }
            Err(e) => self.ctx.fail(&e),
        }

        info!("{} 🛑 解码线程退出 (state={:?})", log_ctx(), self.ctx.state());
    }

    /// 读取元数据并预解码每条轨道的第一帧
    fn load_metadata(&mut self) -> Result<()> {
        let info = self.reader.read_metadata(&self.ctx)?;
        if !info.has_audio && !info.has_video {
            return Err(PlayerError::CorruptMetadata("没有音视频轨道".into()));
        }
        info!(
            "{} 📋 元数据: {} video={} audio={} 时长 {:?}s",
            log_ctx(),
            info.container,
            info.has_video,
            info.has_audio,
            info.duration_secs()
        );

        self.video_eof = !info.has_video;
        self.audio_eof = !info.has_audio;
        if self.video_eof {
            self.ctx.finish_video();
        }
        if self.audio_eof {
            self.ctx.finish_audio();
        }

        if info.has_video {
            let mut skip = false;
            if !self.reader.decode_video_frame(&self.ctx, &mut skip, 0) {
                self.mark_video_eof();
            }
        }
        if info.has_audio && !self.reader.decode_audio_data(&self.ctx) {
            self.mark_audio_eof();
        }

        let monitor = self.ctx.monitor();
        let mut shared = monitor.lock();
        if shared.state.is_terminal() {
            return Err(PlayerError::Shutdown);
        }

        let starts = [
            shared.video_queue.peek_front().map(|f| f.start),
            shared.audio_queue.peek_front().map(|c| c.start),
        ];
        let start_time = starts.iter().flatten().copied().min().unwrap_or(0);
        shared.start_time = start_time;
        shared.current_time = start_time;
        shared.end_time = info.duration_us.map(|d| start_time + d);
        shared.info = Some(info.clone());
        shared.present_first_frame = true;
        shared.decode_start = Some(Instant::now());
        self.ctx.change_state(&mut shared, DecoderState::Decoding);

        shared.emit(PlayerEvent::MetadataLoaded(info.clone()));
        if let Some(duration) = info.duration_secs() {
            shared.emit(PlayerEvent::DurationChanged(duration));
        }
        Ok(())
    }

    fn decode_loop(&mut self) {
        loop {
            match self.next_action() {
                Action::Exit => break,
                Action::Seek(target) => self.handle_seek(target),
                Action::Decode(plan) => self.decode_step(plan),
            }
        }
    }

    /// 在 Monitor 内决定下一步；无事可做时等待
    fn next_action(&mut self) -> Action {
        let ctx = self.ctx.clone();
        let config = ctx.config();
        let monitor = ctx.monitor();
        let mut shared = monitor.lock();

        loop {
            if shared.state.is_terminal() {
                return Action::Exit;
            }
            if let Some(target) = shared.seek_target.take() {
                return Action::Seek(target);
            }
            if shared.state == DecoderState::Seeking {
                monitor.wait_for(&mut shared, WaitCondition::StateChanged, config.idle_wait());
                continue;
            }

            let video_len = shared.video_queue.len();
            let audio_us = shared.audio_queue.span();
            if self.video_pump && video_len >= config.ample_video_frames {
                self.video_pump = false;
            }
            if self.audio_pump && audio_us >= self.ample_audio_us {
                self.audio_pump = false;
            }

            let want_video =
                !self.video_eof && video_len < config.ample_video_frames && !shared.video_queue.is_full();
            let want_audio = !self.audio_eof && audio_us < self.ample_audio_us && !shared.audio_queue.is_full();

            if want_video || want_audio {
                let low_audio = !self.audio_pump && !self.audio_eof && shared.decoded_audio_us() < self.low_audio_us;
                let low_video = !self.video_pump && !self.video_eof && video_len < config.low_video_frames;
                if shared.state == DecoderState::Decoding
                    && !self.keyframe_skip
                    && !self.video_eof
                    && (low_audio || low_video)
                    && !shared.has_low_undecoded_data(&*self.resource, config.low_data_threshold_us())
                {
                    info!(
                        "{} ⏭ 解码跟不上 (audio={}us, video={} 帧)，跳到下一个关键帧",
                        log_ctx(),
                        shared.decoded_audio_us(),
                        video_len
                    );
                    self.keyframe_skip = true;
                }
                return Action::Decode(DecodePlan {
                    video: want_video,
                    audio: want_audio,
                    threshold: shared.current_time,
                    buffering: shared.state == DecoderState::Buffering,
                });
            }

            let condition = if self.video_eof && self.audio_eof {
                WaitCondition::StateChanged
            } else {
                WaitCondition::QueueNotFull
            };
            monitor.wait_for(&mut shared, condition, config.idle_wait());
        }
    }

    fn decode_step(&mut self, plan: DecodePlan) {
        if plan.video {
            let started = Instant::now();
            let mut skip = self.keyframe_skip;
            let more = self.reader.decode_video_frame(&self.ctx, &mut skip, plan.threshold);
            self.keyframe_skip = skip;
            if more {
                self.note_video_decode_time(started.elapsed(), plan.buffering);
            } else if !self.ctx.is_interrupted() {
                self.mark_video_eof();
            }
        }

        if plan.audio && !self.reader.decode_audio_data(&self.ctx) && !self.ctx.is_interrupted() {
            self.mark_audio_eof();
        }
    }

    /// 视频解码耗时超过音频低水位时，调高音频水位
    fn note_video_decode_time(&mut self, elapsed: Duration, buffering: bool) {
        let elapsed_us = elapsed.as_micros().min(i64::MAX as u128) as i64;
        if buffering || elapsed_us <= self.low_audio_us {
            return;
        }
        let factor = self.ctx.config().threshold_factor as i64;
        let ceiling = self.ctx.config().ample_audio_us();
        self.low_audio_us = (factor * elapsed_us).min(ceiling);
        self.ample_audio_us = (factor * self.low_audio_us).max(self.ample_audio_us);
        info!(
            "{} 🐢 视频解码较慢 ({}us)，音频水位调整为 low={}us ample={}us",
            log_ctx(),
            elapsed_us,
            self.low_audio_us,
            self.ample_audio_us
        );
    }

    fn mark_video_eof(&mut self) {
        if !self.video_eof {
            info!("{} 📄 视频轨道结束", log_ctx());
        }
        self.video_eof = true;
        self.ctx.finish_video();
    }

    fn mark_audio_eof(&mut self) {
        if !self.audio_eof {
            info!("{} 📄 音频轨道结束", log_ctx());
        }
        self.audio_eof = true;
        self.ctx.finish_audio();
    }

    fn reset_tracks(&mut self) {
        self.video_eof = !self.reader.has_video();
        self.audio_eof = !self.reader.has_audio();
        self.video_pump = true;
        self.audio_pump = true;
        self.keyframe_skip = false;
        if self.video_eof {
            self.ctx.finish_video();
        }
        if self.audio_eof {
            self.ctx.finish_audio();
        }
    }

    fn handle_seek(&mut self, target: i64) {
        let (start_time, end_time, rollback) = {
            let shared = self.ctx.monitor().lock();
            (shared.start_time, shared.end_time, shared.seek_rollback)
        };
        info!("{} ⏩ 解码线程开始 Seek: {}us", log_ctx(), target);

        self.ctx.erase_video();
        self.ctx.erase_audio();
        self.reset_tracks();
        let end = end_time.unwrap_or(i64::MAX);
        let result = self.reader.seek(&self.ctx, target, start_time, end, rollback);

        let failure = match result {
            Ok(()) => {
                self.finish_seek(target, start_time);
                return;
            }
            Err(PlayerError::Interrupted) | Err(PlayerError::Shutdown) | Err(PlayerError::ResourceClosed) => {
                debug!("{} Seek 被新的请求或关闭打断", log_ctx());
                return;
            }
            Err(e) => e,
        };

        if end_time.is_some_and(|end| target >= end) {
            info!("{} ⏹ Seek 到末尾，播放完成", log_ctx());
            self.video_eof = true;
            self.audio_eof = true;
            self.ctx.erase_video();
            self.ctx.erase_audio();
            self.ctx.finish_video();
            self.ctx.finish_audio();
            let monitor = self.ctx.monitor();
            let mut shared = monitor.lock();
            if shared.seek_target.is_some() || shared.state.is_terminal() {
                return;
            }
            let end = end_time.unwrap_or(target);
            shared.current_time = end;
            shared.audio_end_time = None;
            self.ctx.change_state(&mut shared, DecoderState::Completed);
            shared.emit(PlayerEvent::SeekCompleted(usecs_to_secs(end - start_time)));
            shared.emit(PlayerEvent::Completed);
            return;
        }

        warn!("{} ⚠️ Seek 到 {}us 失败，回滚到 {}us: {}", log_ctx(), target, rollback, failure);
        self.ctx.erase_video();
        self.ctx.erase_audio();
        self.reset_tracks();
        match self.reader.seek(&self.ctx, rollback, start_time, end, rollback) {
            Ok(()) => {}
            Err(PlayerError::Interrupted) | Err(PlayerError::Shutdown) | Err(PlayerError::ResourceClosed) => return,
            Err(e) => {
                warn!("{} ⚠️ 回滚也失败了，视为播放结束: {}", log_ctx(), e);
                self.mark_video_eof();
                self.mark_audio_eof();
            }
        }
        self.finish_seek(rollback, start_time);
    }

    fn finish_seek(&mut self, position: i64, start_time: i64) {
        let monitor = self.ctx.monitor();
        let mut shared = monitor.lock();
        if shared.state.is_terminal() {
            return;
        }
        if shared.seek_target.is_some() {
            debug!("{} 已有新的 Seek 请求，跳过这次的完成通知", log_ctx());
            return;
        }
        // 读取器 Seek 时清空队列会连带清掉结束标记
        if self.video_eof {
            shared.video_queue.finish();
        }
        if self.audio_eof {
            shared.audio_queue.finish();
        }
        shared.current_time = position;
        shared.audio_end_time = None;
        shared.present_first_frame = true;
        shared.decode_start = Some(Instant::now());
        self.ctx.change_state(&mut shared, DecoderState::Decoding);
        info!("{} ✅ Seek 完成: {}us", log_ctx(), position);
        shared.emit(PlayerEvent::SeekCompleted(usecs_to_secs(position - start_time)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineConfig;
    use crate::core::MediaInfo;
    use crate::player::reader::{BufferedSource, RawReader};
    use crate::player::resource::MemoryResource;
    use crate::player::samples::RawStreamWriter;

    /// 定位到 fail_at 时失败，其余调用交给 RawReader
    struct FailingSeekReader {
        inner: RawReader,
        fail_at: i64,
    }

    impl Reader for FailingSeekReader {
        fn read_metadata(&mut self, ctx: &DecodeContext) -> Result<MediaInfo> {
            self.inner.read_metadata(ctx)
        }

        fn decode_audio_data(&mut self, ctx: &DecodeContext) -> bool {
            self.inner.decode_audio_data(ctx)
        }

        fn decode_video_frame(&mut self, ctx: &DecodeContext, keyframe_skip: &mut bool, time_threshold: i64) -> bool {
            self.inner.decode_video_frame(ctx, keyframe_skip, time_threshold)
        }

        fn seek(&mut self, ctx: &DecodeContext, target: i64, start_time: i64, end_time: i64, current_time: i64) -> Result<()> {
            if target == self.fail_at {
                return Err(PlayerError::SeekFailed("模拟失败".into()));
            }
            self.inner.seek(ctx, target, start_time, end_time, current_time)
        }

        fn buffered(&self) -> Arc<dyn BufferedSource> {
            self.inner.buffered()
        }

        fn has_audio(&self) -> bool {
            self.inner.has_audio()
        }

        fn has_video(&self) -> bool {
            self.inner.has_video()
        }

        fn description(&self) -> String {
            format!("failing:{}", self.inner.description())
        }
    }

    fn raw_resource(frames: u64) -> Arc<dyn Resource> {
        Arc::new(MemoryResource::from_bytes(RawStreamWriter::new(16, 16, 30, 1).frames(frames).build()))
    }

    fn start_raw(frames: u64) -> (DecodeContext, crossbeam_channel::Receiver<PlayerEvent>, DecodeThread) {
        let (ctx, events) = DecodeContext::new(PipelineConfig::default());
        let resource = raw_resource(frames);
        let reader = Box::new(RawReader::new(Arc::clone(&resource)));
        let thread = DecodeThread::start(reader, resource, ctx.clone()).unwrap();
        (ctx, events, thread)
    }

    #[test]
    fn test_metadata_then_decode_ahead() {
        let (ctx, events, mut thread) = start_raw(30);
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, PlayerEvent::MetadataLoaded(_)));
        assert_eq!(ctx.state(), DecoderState::Decoding);

        // 解码到充足水位后停下
        let deadline = Instant::now() + Duration::from_secs(5);
        while ctx.video_len() < ctx.config().ample_video_frames && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ctx.video_len(), ctx.config().ample_video_frames);

        ctx.shutdown();
        thread.join();
    }

    #[test]
    fn test_corrupt_metadata_enters_error() {
        let (ctx, events) = DecodeContext::new(PipelineConfig::default());
        let resource: Arc<dyn Resource> = Arc::new(MemoryResource::from_bytes(vec![1, 2, 3]));
        let reader = Box::new(RawReader::new(Arc::clone(&resource)));
        let mut thread = DecodeThread::start(reader, resource, ctx.clone()).unwrap();
        thread.join();
        assert_eq!(ctx.state(), DecoderState::Error);
        assert_eq!(
            events.try_recv().unwrap(),
            PlayerEvent::Error(crate::core::ErrorKind::CorruptMetadata)
        );
    }

    #[test]
    fn test_seek_past_end_completes() {
        let (ctx, events, mut thread) = start_raw(10);
        assert!(matches!(events.recv_timeout(Duration::from_secs(5)).unwrap(), PlayerEvent::MetadataLoaded(_)));
        {
            // 控制面会把目标夹到末尾，这里直接越界
            let monitor = ctx.monitor();
            let mut shared = monitor.lock();
            let end = shared.end_time.unwrap();
            shared.seek_target = Some(end + 1_000_000);
            ctx.change_state(&mut shared, DecoderState::Seeking);
        }
        let mut completed = None;
        while let Ok(event) = events.recv_timeout(Duration::from_secs(5)) {
            if let PlayerEvent::SeekCompleted(t) = event {
                completed = Some(t);
                break;
            }
        }
        assert!(completed.is_some_and(|t| t > 0.3));
        assert_eq!(events.recv_timeout(Duration::from_secs(1)).ok(), Some(PlayerEvent::Completed));
        assert_eq!(ctx.state(), DecoderState::Completed);
        ctx.shutdown();
        thread.join();
    }

    #[test]
    fn test_failed_seek_rolls_back_to_previous_position() {
        let (ctx, events) = DecodeContext::new(PipelineConfig::default());
        let resource = raw_resource(30);
        let reader = Box::new(FailingSeekReader {
            inner: RawReader::new(Arc::clone(&resource)),
            fail_at: 500_000,
        });
        let mut thread = DecodeThread::start(reader, resource, ctx.clone()).unwrap();
        assert!(matches!(events.recv_timeout(Duration::from_secs(5)).unwrap(), PlayerEvent::MetadataLoaded(_)));
        {
            let monitor = ctx.monitor();
            let mut shared = monitor.lock();
            shared.seek_rollback = 200_000;
            shared.seek_target = Some(500_000);
            ctx.change_state(&mut shared, DecoderState::Seeking);
        }

        let mut completed = None;
        while let Ok(event) = events.recv_timeout(Duration::from_secs(5)) {
            if let PlayerEvent::SeekCompleted(t) = event {
                completed = Some(t);
                break;
            }
        }
        assert!(completed.is_some_and(|t| (t - 0.2).abs() < 1e-9));
        assert_eq!(ctx.state(), DecoderState::Decoding);
        assert_eq!(ctx.monitor().lock().current_time, 200_000);

        let deadline = Instant::now() + Duration::from_secs(5);
        while ctx.video_len() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let first = ctx.pop_video().unwrap();
        assert!(first.start <= 200_000 && first.end >= 200_000);

        ctx.shutdown();
        thread.join();
    }

    #[test]
    fn test_starved_video_queue_enables_keyframe_skip() {
        let (ctx, _events) = DecodeContext::new(PipelineConfig::default());
        let resource = raw_resource(30);
        let reader = Box::new(RawReader::new(Arc::clone(&resource)));
        let mut decode = DecodeLoop::new(reader, resource, ctx.clone());
        decode.load_metadata().unwrap();
        assert!(ctx.pop_video().is_some());

        // 初始填充阶段队列空着也不跳帧
        assert!(matches!(decode.next_action(), Action::Decode(_)));
        assert!(!decode.keyframe_skip);

        decode.video_pump = false;
        match decode.next_action() {
            Action::Decode(plan) => assert!(plan.video),
            _ => panic!("应该继续解码"),
        }
        assert!(decode.keyframe_skip);
    }
}
