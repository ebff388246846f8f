// 核心数据结构和类型定义

pub mod types;
pub mod clock;
pub mod config;
pub mod error;
pub mod monitor;
pub mod queue;

pub use types::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use monitor::{Monitor, WaitCondition};
pub use queue::{FrameQueue, PushError, Timestamped};

use std::process;
use std::thread;

/// 日志前缀：进程号 + 线程号
pub fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}
