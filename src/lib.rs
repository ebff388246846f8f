//! 多线程媒体播放管线
//!
//! 读取器在解码线程里把压缩数据解成帧，推入有界队列；
//! 状态机线程按时钟取帧交给渲染器和音频输出；
//! [`MediaDecoder`] 是对外的控制面。

pub mod core;
pub mod player;

pub use crate::core::{
    DecoderState, ErrorKind, FrameStatistics, MediaInfo, NextFrameStatus, PipelineConfig, PlayState, PlayerError,
    Result, TimeRange, TimeRanges,
};
pub use crate::player::{DecoderRegistry, MediaDecoder, PlayerEvent};
