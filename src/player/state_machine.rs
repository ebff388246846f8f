use crate::core::{
    frames_to_usecs, log_ctx, usecs_to_frames, DecoderState, PlayState, PlaybackClock, Result, WaitCondition,
};
use crate::player::context::{DecodeContext, DecoderShared, PlayerEvent};
use crate::player::resource::Resource;
use crate::player::sink::{AudioSink, VideoRenderer};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 快速缓冲结束后这段时间内，数据不足会直接重新进入缓冲
const QUICK_BUFFER_EXIT_WINDOW: Duration = Duration::from_secs(15);
const MIN_WAIT: Duration = Duration::from_millis(1);

/// 状态机线程管理器
///
/// 渲染器、音频输出和播放时钟都归这个线程所有
pub struct StateMachineThread {
    handle: Option<JoinHandle<()>>,
}

impl StateMachineThread {
    pub fn start(
        ctx: DecodeContext,
        resource: Arc<dyn Resource>,
        renderer: Box<dyn VideoRenderer>,
        sink: Box<dyn AudioSink>,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("myy-state-machine".to_string())
            .spawn(move || StateMachine::new(ctx, resource, renderer, sink).run())?;
        Ok(Self { handle: Some(handle) })
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ 状态机线程异常退出", log_ctx());
            }
        }
    }
}

struct StateMachine {
    ctx: DecodeContext,
    resource: Arc<dyn Resource>,
    renderer: Box<dyn VideoRenderer>,
    sink: Box<dyn AudioSink>,
    clock: PlaybackClock,
    /// 时钟和音频输出是否在走
    playing: bool,
    sink_started: bool,
    sink_failed: bool,
    audio_rate: u32,
    /// 音频输出第 0 帧对应的媒体时间
    audio_start_time: Option<i64>,
    last_frame_end: Option<i64>,
    buffering_reported: bool,
    completed_reported: bool,
    volume: f64,
}

impl StateMachine {
    fn new(
        ctx: DecodeContext,
        resource: Arc<dyn Resource>,
        renderer: Box<dyn VideoRenderer>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        Self {
            ctx,
            resource,
            renderer,
            sink,
            clock: PlaybackClock::new(),
            playing: false,
            sink_started: false,
            sink_failed: false,
            audio_rate: 0,
            audio_start_time: None,
            last_frame_end: None,
            buffering_reported: false,
            completed_reported: false,
            volume: 1.0,
        }
    }

    fn run(mut self) {
        info!("{} ▶️ 状态机线程启动", log_ctx());
        let ctx = self.ctx.clone();
        let idle = ctx.config().idle_wait();
        let monitor = ctx.monitor();
        let mut shared = monitor.lock();

        loop {
            let state = shared.state;
            if state != DecoderState::Buffering && self.buffering_reported {
                self.buffering_reported = false;
                shared.emit(PlayerEvent::Buffering(false));
            }

            let wait = match state {
                DecoderState::Shutdown | DecoderState::Error => {
                    self.stop_playback();
                    self.renderer.clear();
                    break;
                }
                DecoderState::DecodingMetadata => {
                    monitor.wait_for(&mut shared, WaitCondition::StateChanged, idle);
                    continue;
                }
                DecoderState::Seeking => {
                    self.enter_seeking();
                    monitor.wait_for(&mut shared, WaitCondition::StateChanged, idle);
                    continue;
                }
                DecoderState::Decoding | DecoderState::Buffering | DecoderState::Completed => {
                    self.sync_volume(&shared);
                    if shared.present_first_frame {
                        self.present_first_frame(&mut shared);
                    }
                    match state {
                        DecoderState::Buffering => self.update_buffering(&mut shared),
                        DecoderState::Decoding => self.advance(&mut shared),
                        _ => {
                            self.stop_playback();
                            idle
                        }
                    }
                }
            };

            monitor.wait_for(&mut shared, WaitCondition::QueueNotEmpty, wait.clamp(MIN_WAIT, idle));
        }

        info!("{} 🛑 状态机线程退出", log_ctx());
    }

    fn sync_volume(&mut self, shared: &DecoderShared) {
        if (shared.volume - self.volume).abs() > f64::EPSILON {
            self.volume = shared.volume;
            self.sink.set_volume(self.volume);
        }
    }

    fn start_playback(&mut self) {
        if !self.playing {
            debug!("{} ▶️ 开始播放", log_ctx());
            self.clock.play();
            self.sink.resume();
            self.playing = true;
        }
    }

    fn stop_playback(&mut self) {
        if self.playing {
            debug!("{} ⏸ 停止播放", log_ctx());
            self.clock.pause();
            self.sink.pause();
            self.playing = false;
        }
    }

    fn enter_seeking(&mut self) {
        self.stop_playback();
        if self.audio_start_time.is_some() {
            self.sink.flush();
            self.audio_start_time = None;
        }
        self.last_frame_end = None;
        self.completed_reported = false;
    }

    /// 元数据加载或 Seek 完成后立即呈现第一帧
    fn present_first_frame(&mut self, shared: &mut DecoderShared) {
        shared.present_first_frame = false;
        self.completed_reported = false;
        let mut time = shared.current_time;
        if let Some(frame) = shared.video_queue.pop_front() {
            self.ctx.monitor().notify(WaitCondition::QueueNotFull);
            time = time.max(frame.start);
            self.renderer.render(&frame, Instant::now());
            shared.stats.presented += 1;
            self.last_frame_end = Some(frame.end);
            debug!("{} 🖼 呈现首帧: {}us", log_ctx(), frame.start);
        }
        shared.current_time = time;
        self.clock.set_time(time);
        if self.audio_start_time.is_some() {
            self.sink.flush();
            self.audio_start_time = None;
        }
    }

    fn has_audio_output(&self, shared: &DecoderShared) -> bool {
        shared.has_audio() && !self.sink_failed
    }

    fn ensure_sink_started(&mut self, shared: &DecoderShared) {
        if self.sink_started || self.sink_failed {
            return;
        }
        let (channels, rate) = match &shared.info {
            Some(info) => (info.audio_channels, info.audio_rate),
            None => return,
        };
        match self.sink.start(channels, rate) {
            Ok(()) => {
                self.sink_started = true;
                self.audio_rate = rate;
                self.sink.set_volume(self.volume);
                if self.playing {
                    self.sink.resume();
                }
            }
            Err(e) => {
                warn!("{} ⚠️ 音频输出启动失败，改用墙上时钟: {}", log_ctx(), e);
                self.sink_failed = true;
            }
        }
    }

    /// 当前呈现时间：有音频时以音频输出的已播放帧数为准
    fn media_time(&self, shared: &DecoderShared) -> i64 {
        if let Some(start) = self.audio_start_time {
            let audio_done = shared.audio_queue.at_end_of_stream() && self.sink.is_drained();
            if !audio_done {
                let played = frames_to_usecs(self.sink.played_frames(), self.audio_rate).unwrap_or(0);
                let time = start + played;
                self.clock.sync_to(time);
                return time;
            }
        }
        self.clock.now()
    }

    /// 把音频写到输出，最多领先时钟 ample_audio；时间戳空洞补静音
    fn push_audio(&mut self, shared: &mut DecoderShared, now: i64) {
        let ample = self.ctx.config().ample_audio_us();
        loop {
            let written_end = shared.audio_end_time.unwrap_or(now);
            if written_end - now >= ample {
                break;
            }
            let chunk = match shared.audio_queue.pop_front() {
                Some(chunk) => chunk,
                None => break,
            };
            self.ctx.monitor().notify(WaitCondition::QueueNotFull);

            let start = *self.audio_start_time.get_or_insert(shared.current_time);
            let written = frames_to_usecs(self.sink.written_frames(), self.audio_rate).unwrap_or(0);
            let expected = start + written;
            let missing = chunk.start - expected;
            if missing > 0 {
                let frames = usecs_to_frames(missing, self.audio_rate);
                debug!("{} 🔇 音频空洞 {}us，补 {} 帧静音", log_ctx(), missing, frames);
                if let Err(e) = self.sink.write_silence(frames) {
                    warn!("{} ⚠️ 写入静音失败: {}", log_ctx(), e);
                }
            }
            if let Err(e) = self.sink.write(&chunk) {
                warn!("{} ⚠️ 写入音频失败: {}", log_ctx(), e);
            }
            let written = frames_to_usecs(self.sink.written_frames(), self.audio_rate).unwrap_or(0);
            shared.audio_end_time = Some(start + written);
        }
    }

    /// 解码数据不足以继续播放
    fn has_low_decoded_data(&self, shared: &DecoderShared, audio_threshold: i64) -> bool {
        if shared.has_audio() && !shared.audio_queue.is_finished() {
            return shared.decoded_audio_us() < audio_threshold;
        }
        shared.has_video() && !shared.video_queue.is_finished() && shared.video_queue.is_empty()
    }

    fn just_exited_quick_buffering(&self, shared: &DecoderShared) -> bool {
        shared.quick_buffering && shared.decode_start.is_some_and(|t| t.elapsed() < QUICK_BUFFER_EXIT_WINDOW)
    }

    fn should_start_buffering(&self, shared: &DecoderShared) -> bool {
        let config = self.ctx.config();
        let both_finished = shared.video_queue.is_finished() && shared.audio_queue.is_finished();
        !both_finished
            && !self.resource.is_data_cached_to_end(shared.decoded_offset)
            && self.has_low_decoded_data(shared, config.low_audio_us() + config.exhausted_data_margin_us())
            && (self.just_exited_quick_buffering(shared)
                || shared.has_low_undecoded_data(&*self.resource, config.low_data_threshold_us()))
    }

    fn start_buffering(&mut self, shared: &mut DecoderShared) {
        let config = self.ctx.config();
        let decoding_for = shared.decode_start.map(|t| t.elapsed()).unwrap_or_default();
        shared.quick_buffering =
            !self.just_exited_quick_buffering(shared) && decoding_for < config.quick_buffer_threshold();
        shared.buffering_start = Some(Instant::now());
        self.stop_playback();
        info!(
            "{} ⏳ 数据不足，开始缓冲 (quick={}, audio={}us, video={} 帧)",
            log_ctx(),
            shared.quick_buffering,
            shared.decoded_audio_us(),
            shared.video_queue.len()
        );
        self.ctx.change_state(shared, DecoderState::Buffering);
        self.buffering_reported = true;
        shared.emit(PlayerEvent::Buffering(true));
    }

    fn update_buffering(&mut self, shared: &mut DecoderShared) -> Duration {
        let config = self.ctx.config();
        let idle = config.idle_wait();
        let elapsed = shared.buffering_start.map(|t| t.elapsed()).unwrap_or_default();
        let both_finished = shared.video_queue.is_finished() && shared.audio_queue.is_finished();
        let enough = if shared.quick_buffering {
            !self.has_low_decoded_data(shared, config.quick_buffering_low_data_us())
        } else {
            !shared.has_low_undecoded_data(&*self.resource, config.low_data_threshold_us())
        };

        let keep_waiting = elapsed < config.buffering_wait()
            && !enough
            && !both_finished
            && !self.resource.is_data_cached_to_end(shared.decoded_offset);
        if keep_waiting {
            return idle;
        }

        info!("{} ✅ 缓冲结束 ({:.2}s)", log_ctx(), elapsed.as_secs_f64());
        shared.buffering_start = None;
        shared.decode_start = Some(Instant::now());
        self.ctx.change_state(shared, DecoderState::Decoding);
        self.buffering_reported = false;
        shared.emit(PlayerEvent::Buffering(false));
        MIN_WAIT
    }

    fn update_play_state(&mut self, shared: &DecoderShared) {
        if shared.play_state == PlayState::Playing {
            self.start_playback();
        } else {
            self.stop_playback();
        }
    }

    /// DECODING 状态下推进播放，返回下次检查前的等待时间
    fn advance(&mut self, shared: &mut DecoderShared) -> Duration {
        let idle = self.ctx.config().idle_wait();
        self.update_play_state(shared);
        if !self.playing {
            return idle;
        }

        if self.has_audio_output(shared) {
            self.ensure_sink_started(shared);
        }
        let mut now = self.media_time(shared);
        if self.has_audio_output(shared) && self.sink_started {
            self.push_audio(shared, now);
            now = self.media_time(shared);
        }

        // 取出所有已到期的帧，只呈现最后一个
        let mut due = None;
        while shared.video_queue.peek_front().is_some_and(|f| f.start <= now) {
            if let Some(frame) = shared.video_queue.pop_front() {
                if let Some(late) = due.replace(frame) {
                    debug!("{} 🗑 丢弃迟到的帧: {}us", log_ctx(), late.start);
                    shared.stats.dropped += 1;
                }
            }
        }
        if due.is_some() {
            self.ctx.monitor().notify(WaitCondition::QueueNotFull);
        }

        if let Some(frame) = due {
            if self.should_start_buffering(shared) {
                if let Err(back) = shared.video_queue.push_front(frame) {
                    debug!("{} 退回帧失败: {}us", log_ctx(), back.into_inner().start);
                }
                self.start_buffering(shared);
                return idle;
            }
            self.renderer.render(&frame, self.clock.instant_for(frame.start));
            shared.stats.presented += 1;
            shared.current_time = frame.start;
            self.last_frame_end = Some(frame.end);
        } else {
            if !shared.has_video() {
                shared.current_time = now;
            }
            if self.should_start_buffering(shared) {
                self.start_buffering(shared);
                return idle;
            }
        }

        if self.playback_finished(shared, now) {
            self.complete(shared, now);
            return idle;
        }

        match shared.video_queue.peek_front() {
            Some(next) => Duration::from_micros((next.start - now).max(0) as u64),
            None => idle,
        }
    }

    fn playback_finished(&self, shared: &DecoderShared, now: i64) -> bool {
        let video_done = shared.video_queue.at_end_of_stream() && self.last_frame_end.map_or(true, |end| now >= end);
        let audio_done = shared.audio_queue.at_end_of_stream() && (!self.sink_started || self.sink.is_drained());
        video_done && audio_done
    }

    fn complete(&mut self, shared: &mut DecoderShared, now: i64) {
        self.stop_playback();
        let end = shared.end_time.unwrap_or(now);
        shared.current_time = shared.current_time.max(now.min(end));
        self.ctx.change_state(shared, DecoderState::Completed);
        if !self.completed_reported {
            self.completed_reported = true;
            info!("{} 🏁 播放完成: {}us", log_ctx(), shared.current_time);
            shared.emit(PlayerEvent::Completed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineConfig;
    use crate::player::decode_thread::DecodeThread;
    use crate::player::reader::RawReader;
    use crate::player::resource::MemoryResource;
    use crate::player::samples::RawStreamWriter;
    use crate::player::sink::{FrameLog, NullAudioSink};

    #[test]
    fn test_poster_frame_then_play_to_completion() {
        let (ctx, events) = DecodeContext::new(PipelineConfig::default());
        let resource: Arc<dyn Resource> =
            Arc::new(MemoryResource::from_bytes(RawStreamWriter::new(16, 16, 30, 1).frames(6).build()));
        let log = FrameLog::new();
        let mut decode =
            DecodeThread::start(Box::new(RawReader::new(Arc::clone(&resource))), Arc::clone(&resource), ctx.clone())
                .unwrap();
        let mut machine = StateMachineThread::start(
            ctx.clone(),
            resource,
            Box::new(log.clone()),
            Box::new(NullAudioSink::default()),
        )
        .unwrap();

        assert!(matches!(events.recv_timeout(Duration::from_secs(5)).unwrap(), PlayerEvent::MetadataLoaded(_)));
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(log.entries()[0].timecode, 0);

        {
            let monitor = ctx.monitor();
            let mut shared = monitor.lock();
            shared.play_state = PlayState::Playing;
            monitor.notify_all();
        }
        let mut completed = false;
        while let Ok(event) = events.recv_timeout(Duration::from_secs(5)) {
            if event == PlayerEvent::Completed {
                completed = true;
                break;
            }
        }
        assert!(completed);
        assert_eq!(ctx.state(), DecoderState::Completed);

        let starts: Vec<i64> = log.entries().iter().map(|f| f.start).collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
        let stats = ctx.frame_statistics();
        assert!(stats.presented >= 2);
        assert!(stats.presented + stats.dropped <= 6);

        ctx.shutdown();
        decode.join();
        machine.join();
    }
}
