use crate::core::{log_ctx, PlayerError, Result};
use crate::player::codec::{
    fourcc_to_string, AudioCodec, AudioTrackInfo, FourCc, PcmCodec, PlanarYuvCodec, VideoCodec,
    VideoTrackInfo, FOURCC_F32L, FOURCC_I420, FOURCC_S16L,
};
use crate::player::reader::{indexed, raw, IndexedReader, RawReader, Reader};
use crate::player::resource::{read_prefix, Resource};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;

/// 探测格式时读取的头部字节数
const SNIFF_LEN: usize = 16;

pub type VideoCodecFactory = Arc<dyn Fn(&VideoTrackInfo) -> Result<Box<dyn VideoCodec>> + Send + Sync>;
pub type AudioCodecFactory = Arc<dyn Fn(&AudioTrackInfo) -> Result<Box<dyn AudioCodec>> + Send + Sync>;

/// 一种容器格式的读取器插件
pub trait ReaderPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn mime_types(&self) -> &[&'static str];

    /// 根据资源开头的字节判断格式
    fn sniff(&self, prefix: &[u8]) -> bool;

    fn create(&self, resource: Arc<dyn Resource>, registry: &Arc<DecoderRegistry>) -> Box<dyn Reader>;
}

struct RawPlugin;

impl ReaderPlugin for RawPlugin {
    fn name(&self) -> &str {
        "raw"
    }

    fn mime_types(&self) -> &[&'static str] {
        &["video/x-raw-yuv"]
    }

    fn sniff(&self, prefix: &[u8]) -> bool {
        raw::sniff(prefix)
    }

    fn create(&self, resource: Arc<dyn Resource>, _registry: &Arc<DecoderRegistry>) -> Box<dyn Reader> {
        Box::new(RawReader::new(resource))
    }
}

struct IndexedPlugin;

impl ReaderPlugin for IndexedPlugin {
    fn name(&self) -> &str {
        "indexed"
    }

    fn mime_types(&self) -> &[&'static str] {
        &["video/x-indexed", "audio/x-indexed"]
    }

    fn sniff(&self, prefix: &[u8]) -> bool {
        indexed::sniff(prefix)
    }

    fn create(&self, resource: Arc<dyn Resource>, registry: &Arc<DecoderRegistry>) -> Box<dyn Reader> {
        Box::new(IndexedReader::new(resource, Arc::clone(registry)))
    }
}

/// 解码器注册表：MIME / 头部探测 → 读取器，FourCC → 编解码器
///
/// 作为显式对象传给需要它的地方，没有全局状态
pub struct DecoderRegistry {
    readers: Vec<Box<dyn ReaderPlugin>>,
    video_codecs: HashMap<FourCc, VideoCodecFactory>,
    audio_codecs: HashMap<FourCc, AudioCodecFactory>,
}

impl DecoderRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self {
            readers: Vec::new(),
            video_codecs: HashMap::new(),
            audio_codecs: HashMap::new(),
        }
    }

    /// 内置的读取器和直通编解码器
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_reader(Box::new(RawPlugin));
        registry.register_reader(Box::new(IndexedPlugin));
        registry.register_video_codec(
            FOURCC_I420,
            Arc::new(|track: &VideoTrackInfo| -> Result<Box<dyn VideoCodec>> {
                Ok(Box::new(PlanarYuvCodec::new(track)?))
            }),
        );
        for fourcc in [FOURCC_S16L, FOURCC_F32L] {
            registry.register_audio_codec(
                fourcc,
                Arc::new(|track: &AudioTrackInfo| -> Result<Box<dyn AudioCodec>> {
                    Ok(Box::new(PcmCodec::new(track)?))
                }),
            );
        }
        registry
    }

    pub fn register_reader(&mut self, plugin: Box<dyn ReaderPlugin>) {
        debug!("{} 🧩 注册读取器: {}", log_ctx(), plugin.name());
        self.readers.push(plugin);
    }

    pub fn register_video_codec(&mut self, fourcc: FourCc, factory: VideoCodecFactory) {
        self.video_codecs.insert(fourcc, factory);
    }

    pub fn register_audio_codec(&mut self, fourcc: FourCc, factory: AudioCodecFactory) {
        self.audio_codecs.insert(fourcc, factory);
    }

    /// 是否有读取器声明支持该 MIME 类型（忽略参数部分）
    pub fn supports_mime(&self, mime: &str) -> bool {
        self.plugin_for_mime(mime).is_some()
    }

    fn plugin_for_mime(&self, mime: &str) -> Option<&dyn ReaderPlugin> {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        self.readers
            .iter()
            .find(|p| p.mime_types().iter().any(|m| *m == essence))
            .map(|p| &**p)
    }

    pub fn create_video_codec(&self, track: &VideoTrackInfo) -> Result<Box<dyn VideoCodec>> {
        match self.video_codecs.get(&track.codec) {
            Some(factory) => factory(track),
            None => Err(PlayerError::UnsupportedFormat(format!(
                "没有 {} 视频解码器",
                fourcc_to_string(&track.codec)
            ))),
        }
    }

    pub fn create_audio_codec(&self, track: &AudioTrackInfo) -> Result<Box<dyn AudioCodec>> {
        match self.audio_codecs.get(&track.codec) {
            Some(factory) => factory(track),
            None => Err(PlayerError::UnsupportedFormat(format!(
                "没有 {} 音频解码器",
                fourcc_to_string(&track.codec)
            ))),
        }
    }

    /// 创建读取器：先按 MIME 匹配，未提供或不认识时按头部字节探测
    pub fn create_reader(self: &Arc<Self>, resource: Arc<dyn Resource>, mime: Option<&str>) -> Result<Box<dyn Reader>> {
        if let Some(plugin) = mime.and_then(|m| self.plugin_for_mime(m)) {
            info!("{} 📂 按 MIME 选择读取器: {}", log_ctx(), plugin.name());
            return Ok(plugin.create(resource, self));
        }

        let prefix = read_prefix(&*resource, SNIFF_LEN)?;
        match self.readers.iter().find(|p| p.sniff(&prefix)) {
            Some(plugin) => {
                info!("{} 📂 按头部探测选择读取器: {}", log_ctx(), plugin.name());
                Ok(plugin.create(resource, self))
            }
            None => Err(PlayerError::UnsupportedFormat(format!(
                "无法识别的媒体格式: {} (mime={:?})",
                resource.description(),
                mime
            ))),
        }
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
