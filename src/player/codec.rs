use crate::core::{alloc_buffer, PictureRect, PlayerError, Result, Size, VideoBuffer};
use crate::player::reader::Packet;
use log::{debug, info};

/// 编解码器 FourCC
pub type FourCc = [u8; 4];

/// 紧密排列的 I420 平面数据
pub const FOURCC_I420: FourCc = *b"I420";
/// 小端 16 位 PCM
pub const FOURCC_S16L: FourCc = *b"S16L";
/// 小端 32 位浮点 PCM
pub const FOURCC_F32L: FourCc = *b"F32L";

pub fn fourcc_to_string(fourcc: &FourCc) -> String {
    fourcc
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect()
}

/// 视频轨道参数（codec 工厂的输入）
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTrackInfo {
    pub track_id: u8,
    pub codec: FourCc,
    pub frame: Size,
    pub picture: PictureRect,
    pub pixel_aspect_ratio: f64,
}

/// 音频轨道参数
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrackInfo {
    pub track_id: u8,
    pub codec: FourCc,
    pub rate: u32,
    pub channels: u32,
    pub bits: u16,
}

/// 视频解码器接口（具体的编解码数学由外部实现）
pub trait VideoCodec: Send {
    /// 解码一个包；返回 None 表示需要更多数据才能输出帧
    fn decode(&mut self, packet: &Packet) -> Result<Option<VideoBuffer>>;

    /// Seek 后重置内部状态
    fn reset(&mut self) {}

    fn name(&self) -> String;
}

/// 音频解码器接口，输出交错 f32 样本
pub trait AudioCodec: Send {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<f32>>;

    fn reset(&mut self) {}

    fn name(&self) -> String;
}

/// I420 直通解码器：包内就是 Y / Cb / Cr 三个平面
pub struct PlanarYuvCodec {
    frame: Size,
    frame_len: usize,
}

impl PlanarYuvCodec {
    pub fn new(track: &VideoTrackInfo) -> Result<Self> {
        let frame = track.frame;
        let chroma = frame.width.div_ceil(2) as usize * frame.height.div_ceil(2) as usize;
        let frame_len = (frame.width as usize)
            .checked_mul(frame.height as usize)
            .and_then(|luma| luma.checked_add(chroma * 2))
            .ok_or_else(|| PlayerError::CorruptMetadata(format!("帧尺寸溢出: {:?}", frame)))?;
        info!("创建 I420 视频解码器: {}x{}", frame.width, frame.height);
        Ok(Self { frame, frame_len })
    }
}

impl VideoCodec for PlanarYuvCodec {
    fn decode(&mut self, packet: &Packet) -> Result<Option<VideoBuffer>> {
        if packet.data.len() != self.frame_len {
            return Err(PlayerError::DecodeError(format!(
                "I420 包长度 {} 与帧大小 {} 不符",
                packet.data.len(),
                self.frame_len
            )));
        }
        let mut data = alloc_buffer(self.frame_len)?;
        data.copy_from_slice(&packet.data);
        VideoBuffer::new_i420(self.frame.width, self.frame.height, data).map(Some)
    }

    fn name(&self) -> String {
        "i420".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PcmFormat {
    S16,
    F32,
}

/// PCM 直通解码器
pub struct PcmCodec {
    format: PcmFormat,
    channels: u32,
}

impl PcmCodec {
    pub fn new(track: &AudioTrackInfo) -> Result<Self> {
        let format = match &track.codec {
            c if *c == FOURCC_S16L => PcmFormat::S16,
            c if *c == FOURCC_F32L => PcmFormat::F32,
            other => {
                return Err(PlayerError::UnsupportedFormat(format!(
                    "PCM 解码器不支持 {}",
                    fourcc_to_string(other)
                )))
            }
        };
        if track.channels == 0 || track.rate == 0 {
            return Err(PlayerError::CorruptMetadata("音频声道数或采样率为 0".into()));
        }
        debug!("创建 PCM 解码器: {:?}, {} 声道, {} Hz", format, track.channels, track.rate);
        Ok(Self { format, channels: track.channels })
    }
}

impl AudioCodec for PcmCodec {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<f32>> {
        let sample_size = match self.format {
            PcmFormat::S16 => 2,
            PcmFormat::F32 => 4,
        };
        let frame_size = sample_size * self.channels as usize;
        if packet.data.len() % frame_size != 0 {
            return Err(PlayerError::DecodeError(format!(
                "PCM 包长度 {} 不是帧大小 {} 的整数倍",
                packet.data.len(),
                frame_size
            )));
        }

        let mut samples = Vec::new();
        samples
            .try_reserve_exact(packet.data.len() / sample_size)
            .map_err(|_| PlayerError::OutOfMemory(packet.data.len() * 2))?;

        match self.format {
            PcmFormat::S16 => samples.extend(
                packet
                    .data
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0),
            ),
            PcmFormat::F32 => samples.extend(
                packet
                    .data
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            ),
        }
        Ok(samples)
    }

    fn name(&self) -> String {
        match self.format {
            PcmFormat::S16 => "pcm_s16le".to_string(),
            PcmFormat::F32 => "pcm_f32le".to_string(),
        }
    }
}
