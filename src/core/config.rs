use crate::core::error::{PlayerError, Result};
use crate::core::types::USECS_PER_MS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 播放管线配置
///
/// 所有字段都有默认值，JSON 文件里只需写要覆盖的部分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 视频帧队列容量（满了之后解码线程阻塞）
    pub video_queue_capacity: usize,
    /// 音频块队列容量
    pub audio_queue_capacity: usize,
    /// 解码视频帧足够多时暂停解码
    pub ample_video_frames: usize,
    /// 低于这个帧数视为视频数据不足
    pub low_video_frames: usize,
    /// 已解码音频低于该值（毫秒）视为不足
    pub low_audio_ms: u64,
    /// 已解码音频超过该值（毫秒）暂停解码
    pub ample_audio_ms: u64,
    /// 单次 DecodeAudioData 至少解码多少毫秒
    pub audio_chunk_ms: u64,
    /// 慢解码时低水位增长倍数
    pub threshold_factor: u32,
    /// 未解码数据低于该值（毫秒）进入缓冲
    pub low_data_threshold_ms: u64,
    /// 判断解码数据耗尽时附加的余量（毫秒）
    pub exhausted_data_margin_ms: u64,
    /// 从开始解码起这段时间内进入缓冲视为快速缓冲
    pub quick_buffer_threshold_ms: u64,
    /// 快速缓冲退出所需的已解码数据（毫秒）
    pub quick_buffering_low_data_ms: u64,
    /// 缓冲最长等待时间（秒）
    pub buffering_wait_secs: u64,
    /// 状态机空闲时的最长等待（毫秒）
    pub idle_wait_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video_queue_capacity: 12,
            audio_queue_capacity: 128,
            ample_video_frames: 10,
            low_video_frames: 1,
            low_audio_ms: 300,
            ample_audio_ms: 1000,
            audio_chunk_ms: 40,
            threshold_factor: 2,
            low_data_threshold_ms: 5000,
            exhausted_data_margin_ms: 60,
            quick_buffer_threshold_ms: 2000,
            quick_buffering_low_data_ms: 1000,
            buffering_wait_secs: 30,
            idle_wait_ms: 40,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.video_queue_capacity == 0 || self.audio_queue_capacity == 0 {
            return Err(PlayerError::ConfigError("队列容量必须大于 0".into()));
        }
        if self.ample_video_frames == 0 || self.ample_video_frames > self.video_queue_capacity {
            return Err(PlayerError::ConfigError(format!(
                "ample_video_frames ({}) 必须在 1..={} 之间",
                self.ample_video_frames, self.video_queue_capacity
            )));
        }
        if self.low_video_frames >= self.ample_video_frames {
            return Err(PlayerError::ConfigError("low_video_frames 必须小于 ample_video_frames".into()));
        }
        if self.low_audio_ms >= self.ample_audio_ms {
            return Err(PlayerError::ConfigError("low_audio_ms 必须小于 ample_audio_ms".into()));
        }
        if self.low_data_threshold_ms <= self.ample_audio_ms {
            return Err(PlayerError::ConfigError(
                "low_data_threshold_ms 必须大于 ample_audio_ms".into(),
            ));
        }
        if self.threshold_factor == 0 {
            return Err(PlayerError::ConfigError("threshold_factor 必须大于 0".into()));
        }
        Ok(())
    }

    pub fn low_audio_us(&self) -> i64 {
        self.low_audio_ms as i64 * USECS_PER_MS
    }

    pub fn ample_audio_us(&self) -> i64 {
        self.ample_audio_ms as i64 * USECS_PER_MS
    }

    pub fn audio_chunk_us(&self) -> i64 {
        self.audio_chunk_ms as i64 * USECS_PER_MS
    }

    pub fn low_data_threshold_us(&self) -> i64 {
        self.low_data_threshold_ms as i64 * USECS_PER_MS
    }

    pub fn exhausted_data_margin_us(&self) -> i64 {
        self.exhausted_data_margin_ms as i64 * USECS_PER_MS
    }

    pub fn quick_buffering_low_data_us(&self) -> i64 {
        self.quick_buffering_low_data_ms as i64 * USECS_PER_MS
    }

    pub fn quick_buffer_threshold(&self) -> Duration {
        Duration::from_millis(self.quick_buffer_threshold_ms)
    }

    pub fn buffering_wait(&self) -> Duration {
        Duration::from_secs(self.buffering_wait_secs)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PipelineConfig::from_json_str(r#"{ "video_queue_capacity": 5, "ample_video_frames": 4 }"#)
            .unwrap();
        assert_eq!(config.video_queue_capacity, 5);
        assert_eq!(config.ample_video_frames, 4);
        assert_eq!(config.low_audio_ms, 300);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = PipelineConfig::from_json_str(r#"{ "video_queue_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, PlayerError::ConfigError(_)));
        let err = PipelineConfig::from_json_str(r#"{ "low_audio_ms": 2000 }"#).unwrap_err();
        assert!(matches!(err, PlayerError::ConfigError(_)));
        assert!(matches!(
            PipelineConfig::from_json_str("{ nope").unwrap_err(),
            PlayerError::JsonError(_)
        ));
    }
}
