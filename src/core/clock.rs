use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 播放时钟 - 没有音频时作为呈现时钟，有音频时被音频时钟校准
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base_time: i64,             // 基准媒体时间（微秒）
    base_instant: Instant,      // 基准时刻
    paused: bool,
    paused_at: i64,             // 暂停时的位置
    last_reported: i64,         // 已报告的最大时间，保证不回退
}

impl ClockInner {
    fn raw_now(&self) -> i64 {
        if self.paused {
            self.paused_at
        } else {
            self.base_time
                .saturating_add(self.base_instant.elapsed().as_micros().min(i64::MAX as u128) as i64)
        }
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base_time: 0,
                base_instant: Instant::now(),
                paused: true,
                paused_at: 0,
                last_reported: 0,
            })),
        }
    }

    /// 获取当前媒体时间（微秒），单调不减
    pub fn now(&self) -> i64 {
        let mut inner = self.inner.lock();
        let now = inner.raw_now().max(inner.last_reported);
        inner.last_reported = now;
        now
    }

    /// 设置播放位置（Seek 之后允许回退）
    pub fn set_time(&self, time: i64) {
        let mut inner = self.inner.lock();
        inner.base_time = time;
        inner.base_instant = Instant::now();
        inner.paused_at = time;
        inner.last_reported = time;
    }

    /// 用音频时钟校准，只向前调整
    pub fn sync_to(&self, time: i64) {
        let mut inner = self.inner.lock();
        if time < inner.last_reported {
            return;
        }
        inner.base_time = time;
        inner.base_instant = Instant::now();
        if inner.paused {
            inner.paused_at = time;
        }
        inner.last_reported = time;
    }

    /// 开始播放
    pub fn play(&self) {
        let mut inner = self.inner.lock();
        if inner.paused {
            inner.base_time = inner.paused_at;
            inner.base_instant = Instant::now();
            inner.paused = false;
        }
    }

    /// 暂停播放
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            let now = inner.raw_now().max(inner.last_reported);
            inner.paused_at = now;
            inner.last_reported = now;
            inner.paused = true;
        }
    }

    /// 是否暂停
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// 媒体时间 time 对应的墙钟时刻（已经过去的时间返回当前时刻）
    pub fn instant_for(&self, time: i64) -> Instant {
        let inner = self.inner.lock();
        let now = Instant::now();
        if inner.paused {
            return now;
        }
        let ahead = time - inner.raw_now();
        if ahead <= 0 {
            now
        } else {
            now + Duration::from_micros(ahead as u64)
        }
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}
