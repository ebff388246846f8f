// 读取器：按容器格式解复用 + 解码，只在解码线程中调用

pub mod buffered;
pub mod indexed;
pub mod raw;

pub use buffered::BufferedIndex;
pub use indexed::IndexedReader;
pub use raw::RawReader;

use crate::core::{log_ctx, MediaInfo, PlayerError, Result, TimeRanges};
use crate::player::context::DecodeContext;
use log::{debug, warn};
use std::sync::Arc;

/// 轨道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

/// 容器层压缩包（拥有数据）
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub track: TrackKind,
    pub track_id: u8,
    pub keyframe: bool,
    pub pts: i64,           // 微秒
    pub duration: i64,      // 微秒
    pub start_offset: u64,  // 包头在资源中的偏移
    pub end_offset: u64,    // 包结束偏移
    pub data: Vec<u8>,
}

/// 已缓冲时间区间查询，可在任意线程调用
pub trait BufferedSource: Send + Sync {
    /// 把已解析且已缓存的字节区间映射成相对 start_time 的时间区间（秒）
    fn get_buffered(&self, start_time: i64) -> Result<TimeRanges>;
}

/// 读取器（解复用 + 解码策略）接口
///
/// 读取器被移动进解码线程，之后只有该线程能调用这些方法
pub trait Reader: Send {
    /// 读取并校验头部，结果会被缓存
    fn read_metadata(&mut self, ctx: &DecodeContext) -> Result<MediaInfo>;

    /// 解码音频并推入音频队列；EOF 或错误返回 false
    fn decode_audio_data(&mut self, ctx: &DecodeContext) -> bool;

    /// 跳过早于 time_threshold 的帧（keyframe_skip 时还要跳到下一个关键帧），
    /// 推入一帧后返回 true；EOF 或错误返回 false
    fn decode_video_frame(&mut self, ctx: &DecodeContext, keyframe_skip: &mut bool, time_threshold: i64) -> bool;

    /// 定位到 target，保留的第一帧结束时间 >= target；失败时恢复之前的解码位置
    fn seek(&mut self, ctx: &DecodeContext, target: i64, start_time: i64, end_time: i64, current_time: i64) -> Result<()>;

    /// 已缓冲区间查询的句柄（在读取器移交给解码线程前取出）
    fn buffered(&self) -> Arc<dyn BufferedSource>;

    fn has_audio(&self) -> bool;

    fn has_video(&self) -> bool;

    /// 清空内部包队列和解码器状态
    fn reset_decode(&mut self) -> Result<()> {
        Ok(())
    }

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}

/// 停止点之前的元素如何处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// 也交给 emit
    Keep,
    /// 直接丢弃
    Discard,
}

/// 一次前向解码的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOutcome {
    /// next 产出的元素个数
    pub consumed: u64,
    /// 交给 emit 的元素个数
    pub emitted: u64,
    /// 是否遇到了满足 stop 的元素（否则是 EOF）
    pub reached_stop: bool,
}

/// 通用前向解码循环
///
/// 反复调用 next，直到某个元素满足 stop：该元素交给 emit 后返回。
/// 之前的元素按 retention 保留或丢弃。next 返回 None 表示 EOF。
pub fn decode_forward<T, N, S, E>(
    mut next: N,
    mut stop: S,
    retention: Retention,
    mut emit: E,
) -> Result<ForwardOutcome>
where
    N: FnMut() -> Result<Option<T>>,
    S: FnMut(&T) -> bool,
    E: FnMut(T) -> Result<()>,
{
    let mut outcome = ForwardOutcome::default();
    while let Some(item) = next()? {
        outcome.consumed += 1;
        if stop(&item) {
            emit(item)?;
            outcome.emitted += 1;
            outcome.reached_stop = true;
            break;
        }
        if retention == Retention::Keep {
            emit(item)?;
            outcome.emitted += 1;
        }
    }
    Ok(outcome)
}

/// 把前向解码结果折算成 DecodeAudioData / DecodeVideoFrame 的返回值
pub(crate) fn settle(ctx: &DecodeContext, what: &str, result: Result<ForwardOutcome>) -> bool {
    match result {
        Ok(outcome) => outcome.reached_stop || outcome.emitted > 0,
        // 即将 Seek，队列会被清空，不算结束
        Err(PlayerError::Interrupted) => true,
        Err(PlayerError::Shutdown) | Err(PlayerError::ResourceClosed) => {
            debug!("{} {} 因关闭而停止", log_ctx(), what);
            false
        }
        Err(err @ PlayerError::OutOfMemory(_)) => {
            ctx.fail(&err);
            false
        }
        Err(err) => {
            warn!("{} ⚠️ {} 失败，视为轨道结束: {}", log_ctx(), what, err);
            false
        }
    }
}

/// Seek 路径里的中断检查
pub(crate) fn check_interrupted(ctx: &DecodeContext) -> Result<()> {
    if ctx.is_interrupted() {
        Err(PlayerError::Interrupted)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(items: Vec<i64>, threshold: i64, retention: Retention) -> (ForwardOutcome, Vec<i64>) {
        let mut source = items.into_iter();
        let mut emitted = Vec::new();
        let outcome = decode_forward(
            || Ok(source.next()),
            |v: &i64| *v >= threshold,
            retention,
            |v| {
                emitted.push(v);
                Ok(())
            },
        )
        .unwrap();
        (outcome, emitted)
    }

    #[test]
    fn test_discard_until_threshold() {
        let (outcome, emitted) = run(vec![0, 10, 20, 30], 15, Retention::Discard);
        assert_eq!(emitted, vec![20]);
        assert_eq!(outcome, ForwardOutcome { consumed: 3, emitted: 1, reached_stop: true });
    }

    #[test]
    fn test_keep_until_threshold() {
        let (outcome, emitted) = run(vec![0, 10, 20, 30], 15, Retention::Keep);
        assert_eq!(emitted, vec![0, 10, 20]);
        assert!(outcome.reached_stop);
    }

    #[test]
    fn test_eof_before_stop() {
        let (outcome, emitted) = run(vec![0, 10], 100, Retention::Discard);
        assert!(emitted.is_empty());
        assert!(!outcome.reached_stop);
        assert_eq!(outcome.consumed, 2);
    }

    #[test]
    fn test_emit_error_propagates() {
        let mut source = vec![1, 2].into_iter();
        let result = decode_forward(
            || Ok(source.next()),
            |_: &i32| true,
            Retention::Discard,
            |_| Err(PlayerError::Interrupted),
        );
        assert!(matches!(result, Err(PlayerError::Interrupted)));
    }
}
