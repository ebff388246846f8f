// 播放管线模块

pub mod codec;
pub mod context;
pub mod decode_thread;     // 解码线程：读取器 → 帧队列
pub mod media_decoder;     // 控制面
pub mod reader;
pub mod registry;          // 读取器 / 编解码器注册表
pub mod resource;
pub mod samples;           // 生成测试 / 演示流
pub mod sink;
pub mod state_machine;     // 状态机线程：时钟、呈现、缓冲

pub use codec::{AudioCodec, AudioTrackInfo, FourCc, VideoCodec, VideoTrackInfo};
pub use context::{DecodeContext, PlayerEvent};
pub use media_decoder::MediaDecoder;
pub use reader::{BufferedSource, IndexedReader, RawReader, Reader};
pub use registry::{DecoderRegistry, ReaderPlugin};
pub use resource::{FileResource, MemoryResource, Resource};
pub use sink::{AudioSink, ClockedAudioSink, FrameLog, NullAudioSink, NullRenderer, RenderedFrame, VideoRenderer};
