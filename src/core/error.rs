use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("元数据损坏: {0}")]
    CorruptMetadata(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("Seek 失败: {0}")]
    SeekFailed(String),

    #[error("内存不足: 无法分配 {0} 字节")]
    OutOfMemory(usize),

    /// 资源已关闭（关闭时用于打断阻塞读取）
    #[error("资源已关闭")]
    ResourceClosed,

    /// 阻塞操作被新的 Seek 请求打断
    #[error("操作被 Seek 请求打断")]
    Interrupted,

    #[error("解码器已关闭")]
    Shutdown,

    #[error("不支持的媒体格式: {0}")]
    UnsupportedFormat(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("JSON 错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("其他错误: {0}")]
    Other(String),

    #[error("Anyhow 错误: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

/// 对外通知的错误分类（OnError 事件携带）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 头部校验失败，致命
    CorruptMetadata,
    /// 单帧解码失败，视为该轨道结束
    DecodeFailure,
    /// 读取失败，本层不重试
    IoFailure,
    /// Seek 失败，位置回滚
    SeekFailed,
    /// 帧缓冲分配失败，致命
    OutOfMemory,
}

impl ErrorKind {
    /// 是否会让解码器进入 ERROR 状态
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::CorruptMetadata | ErrorKind::OutOfMemory)
    }
}

impl PlayerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlayerError::CorruptMetadata(_) | PlayerError::UnsupportedFormat(_) => {
                ErrorKind::CorruptMetadata
            }
            PlayerError::IoError(_) | PlayerError::ResourceClosed => ErrorKind::IoFailure,
            PlayerError::SeekFailed(_) | PlayerError::Interrupted => ErrorKind::SeekFailed,
            PlayerError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            _ => ErrorKind::DecodeFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
