use crate::core::{
    alloc_buffer, log_ctx, scale_display_by_aspect_ratio, validate_video_region, DecodedVideoFrame,
    MediaInfo, PictureRect, Plane, PlayerError, Result, Size, VideoBuffer, USECS_PER_S,
};
use crate::player::context::DecodeContext;
use crate::player::reader::{
    check_interrupted, decode_forward, settle, BufferedIndex, BufferedSource, Reader, Retention,
};
use crate::player::resource::{read_fully, Resource};
use log::{debug, info, warn};
use std::io::SeekFrom;
use std::sync::Arc;

/// 原始 YUV 流头部长度
pub const RAW_HEADER_LEN: usize = 36;
/// 每帧前的包头长度
pub const RAW_PACKET_HEADER_LEN: usize = 4;
pub const RAW_CODEC_ID: [u8; 3] = *b"YUV";
pub const RAW_PACKET_ID: u8 = 0xFF;

const MAX_FRAME_RATE: f64 = 45.0;
const MAX_FRAME_DIMENSION: u32 = 2000;

/// 原始 YUV 流头部（小端）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawVideoHeader {
    pub packet_id: u8,
    pub codec_id: [u8; 3],
    pub major_version: u8,
    pub minor_version: u8,
    pub options: u16,
    pub alpha_channel_bpp: u8,
    pub lumi_channel_bpp: u8,
    pub chroma_channel_bpp: u8,
    pub colorspace: u8,
    pub frame_width: u32,
    pub frame_height: u32,
    pub aspect_numerator: u32,
    pub aspect_denominator: u32,
    pub framerate_numerator: u32,
    pub framerate_denominator: u32,
}

impl RawVideoHeader {
    /// 8 位亮度、4 位色度的 4:2:0 头部
    pub fn yuv420(width: u32, height: u32, framerate_numerator: u32, framerate_denominator: u32) -> Self {
        Self {
            packet_id: 0,
            codec_id: RAW_CODEC_ID,
            major_version: 0,
            minor_version: 1,
            options: 0,
            alpha_channel_bpp: 0,
            lumi_channel_bpp: 8,
            chroma_channel_bpp: 4,
            colorspace: 1,
            frame_width: width,
            frame_height: height,
            aspect_numerator: 1,
            aspect_denominator: 1,
            framerate_numerator,
            framerate_denominator,
        }
    }

    pub fn parse(bytes: &[u8; RAW_HEADER_LEN]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            packet_id: bytes[0],
            codec_id: [bytes[1], bytes[2], bytes[3]],
            major_version: bytes[4],
            minor_version: bytes[5],
            options: u16::from_le_bytes([bytes[6], bytes[7]]),
            alpha_channel_bpp: bytes[8],
            lumi_channel_bpp: bytes[9],
            chroma_channel_bpp: bytes[10],
            colorspace: bytes[11],
            frame_width: u32_at(12),
            frame_height: u32_at(16),
            aspect_numerator: u32_at(20),
            aspect_denominator: u32_at(24),
            framerate_numerator: u32_at(28),
            framerate_denominator: u32_at(32),
        }
    }

    pub fn to_bytes(&self) -> [u8; RAW_HEADER_LEN] {
        let mut bytes = [0u8; RAW_HEADER_LEN];
        bytes[0] = self.packet_id;
        bytes[1..4].copy_from_slice(&self.codec_id);
        bytes[4] = self.major_version;
        bytes[5] = self.minor_version;
        bytes[6..8].copy_from_slice(&self.options.to_le_bytes());
        bytes[8] = self.alpha_channel_bpp;
        bytes[9] = self.lumi_channel_bpp;
        bytes[10] = self.chroma_channel_bpp;
        bytes[11] = self.colorspace;
        let fields = [
            self.frame_width,
            self.frame_height,
            self.aspect_numerator,
            self.aspect_denominator,
            self.framerate_numerator,
            self.framerate_denominator,
        ];
        for (i, value) in fields.iter().enumerate() {
            let at = 12 + i * 4;
            bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// 每帧字节数（含包头）
    pub fn frame_size(&self) -> Option<u64> {
        let bpp = self.lumi_channel_bpp as u64 + self.chroma_channel_bpp as u64;
        (self.frame_width as u64)
            .checked_mul(self.frame_height as u64)?
            .checked_mul(bpp)
            .map(|bits| bits / 8 + RAW_PACKET_HEADER_LEN as u64)
    }
}

/// 头部是否像原始 YUV 流（用于格式探测）
pub fn sniff(prefix: &[u8]) -> bool {
    prefix.len() >= 6 && prefix[0] == 0 && prefix[1..4] == RAW_CODEC_ID && prefix[4] == 0 && prefix[5] == 1
}

fn corrupt(msg: impl Into<String>) -> PlayerError {
    PlayerError::CorruptMetadata(msg.into())
}

/// 原始 YUV 4:2:0 流读取器：固定帧长，每帧都是关键帧
pub struct RawReader {
    resource: Arc<dyn Resource>,
    index: Arc<BufferedIndex>,
    header: Option<RawVideoHeader>,
    info: Option<MediaInfo>,
    picture: PictureRect,
    frame_size: u64,
    current_frame: u64,
}

impl RawReader {
    pub fn new(resource: Arc<dyn Resource>) -> Self {
        let index = Arc::new(BufferedIndex::new(Arc::clone(&resource)));
        Self {
            resource,
            index,
            header: None,
            info: None,
            picture: PictureRect::default(),
            frame_size: 0,
            current_frame: 0,
        }
    }

    /// 第 n 帧的开始时间（精确有理数换算，不累积误差）
    fn frame_time(&self, n: u64) -> i64 {
        match &self.header {
            Some(h) => {
                let usecs = n as u128 * USECS_PER_S as u128 * h.framerate_denominator as u128
                    / h.framerate_numerator as u128;
                i64::try_from(usecs).unwrap_or(i64::MAX)
            }
            None => 0,
        }
    }

    fn parse_header(&mut self) -> Result<MediaInfo> {
        self.resource.seek(SeekFrom::Start(0))?;
        let mut bytes = [0u8; RAW_HEADER_LEN];
        if !read_fully(&*self.resource, &mut bytes)? {
            return Err(corrupt("原始流头部不完整"));
        }
        let header = RawVideoHeader::parse(&bytes);

        if header.packet_id != 0
            || header.codec_id != RAW_CODEC_ID
            || header.major_version != 0
            || header.minor_version != 1
        {
            return Err(corrupt(format!(
                "不是原始 YUV 流 (id={}, version={}.{})",
                header.packet_id, header.major_version, header.minor_version
            )));
        }

        // 先检查分母，后面的除法才安全
        if header.aspect_denominator == 0 || header.framerate_denominator == 0 {
            return Err(corrupt("宽高比或帧率分母为 0"));
        }

        let pixel_aspect_ratio = header.aspect_numerator as f64 / header.aspect_denominator as f64;
        let frame_rate = header.framerate_numerator as f64 / header.framerate_denominator as f64;

        if frame_rate <= 0.0 || frame_rate > MAX_FRAME_RATE {
            return Err(corrupt(format!("帧率超出范围: {:.3}", frame_rate)));
        }
        if pixel_aspect_ratio <= 0.0 {
            return Err(corrupt("像素宽高比为 0"));
        }
        if header.frame_width == 0
            || header.frame_height == 0
            || header.frame_width > MAX_FRAME_DIMENSION
            || header.frame_height > MAX_FRAME_DIMENSION
        {
            return Err(corrupt(format!(
                "帧尺寸超出范围: {}x{}",
                header.frame_width, header.frame_height
            )));
        }
        if header.lumi_channel_bpp != 8 || header.chroma_channel_bpp != 4 || header.colorspace != 1 {
            return Err(corrupt(format!(
                "只支持 8/4 bpp 的 4:2:0 (luma={}, chroma={}, colorspace={})",
                header.lumi_channel_bpp, header.chroma_channel_bpp, header.colorspace
            )));
        }

        let frame = Size::new(header.frame_width, header.frame_height);
        let picture = PictureRect::full(frame);
        let display = scale_display_by_aspect_ratio(frame, pixel_aspect_ratio);
        if !validate_video_region(frame, picture, display) {
            return Err(corrupt("画面区域无效"));
        }

        let frame_size = header.frame_size().ok_or_else(|| corrupt("帧大小溢出"))?;

        // 时长 = (总长度 - 头部) / 每帧字节数 / 帧率
        let duration_us = self.resource.length().and_then(|length| {
            let payload = length.saturating_sub(RAW_HEADER_LEN as u64) as u128;
            let usecs = USECS_PER_S as u128 * payload * header.framerate_denominator as u128
                / (frame_size as u128 * header.framerate_numerator as u128);
            i64::try_from(usecs).ok()
        });

        self.header = Some(header);
        self.picture = picture;
        self.frame_size = frame_size;
        self.current_frame = 0;

        Ok(MediaInfo {
            container: "raw".to_string(),
            has_audio: false,
            has_video: true,
            frame,
            picture,
            display,
            pixel_aspect_ratio,
            frame_rate: Some(frame_rate),
            audio_rate: 0,
            audio_channels: 0,
            duration_us,
        })
    }

    /// 读取下一帧（不做阈值过滤）
    fn next_frame(&mut self) -> Result<Option<DecodedVideoFrame>> {
        let (width, height) = match &self.header {
            Some(h) => (h.frame_width, h.frame_height),
            None => return Err(PlayerError::DecodeError("尚未读取元数据".into())),
        };

        let start_offset = self.resource.tell();
        let mut packet_header = [0u8; RAW_PACKET_HEADER_LEN];
        if !read_fully(&*self.resource, &mut packet_header)? {
            return Ok(None);
        }
        if packet_header[0] != RAW_PACKET_ID || packet_header[1..4] != RAW_CODEC_ID {
            return Err(PlayerError::DecodeError(format!(
                "偏移 {} 处的帧包头无效",
                start_offset
            )));
        }

        let payload_len = (self.frame_size - RAW_PACKET_HEADER_LEN as u64) as usize;
        let mut data = alloc_buffer(payload_len)?;
        if !read_fully(&*self.resource, &mut data)? {
            debug!("{} 📄 最后一帧数据不完整，按 EOF 处理", log_ctx());
            return Ok(None);
        }

        let n = self.current_frame;
        let start = self.frame_time(n);
        let end = self.frame_time(n + 1);
        let end_offset = start_offset + self.frame_size;
        self.index.record(start_offset, end_offset, start, end);
        self.current_frame += 1;

        let luma_len = width as usize * height as usize;
        let chroma_width = width / 2;
        let chroma_height = height / 2;
        let chroma_len = chroma_width as usize * chroma_height as usize;
        let planes = [
            Plane { offset: 0, width, height, stride: width },
            Plane { offset: luma_len, width: chroma_width, height: chroma_height, stride: chroma_width },
            Plane {
                offset: luma_len + chroma_len,
                width: chroma_width,
                height: chroma_height,
                stride: chroma_width,
            },
        ];
        let buffer = VideoBuffer::from_planes(data, planes)?;

        Ok(Some(DecodedVideoFrame {
            start,
            end,
            timecode: n as i64,
            keyframe: true,
            offset: end_offset,
            picture: self.picture,
            buffer,
        }))
    }

    fn seek_to(&mut self, ctx: &DecodeContext, target: i64) -> Result<()> {
        let header = self
            .header
            .ok_or_else(|| PlayerError::SeekFailed("尚未读取元数据".into()))?;

        // 帧号 = 目标时间 * 帧率
        let frame = target.max(0) as u128 * header.framerate_numerator as u128
            / (USECS_PER_S as u128 * header.framerate_denominator as u128);
        let offset = u64::try_from(frame)
            .ok()
            .and_then(|f| f.checked_mul(self.frame_size))
            .and_then(|o| o.checked_add(RAW_HEADER_LEN as u64))
            .ok_or_else(|| PlayerError::SeekFailed(format!("目标 {}us 的偏移溢出", target)))?;

        if let Some(length) = self.resource.length() {
            if offset >= length {
                return Err(PlayerError::SeekFailed(format!(
                    "目标偏移 {} 超出资源长度 {}",
                    offset, length
                )));
            }
        }

        debug!("{} ⏩ 原始流 Seek: {}us -> 帧 {} (偏移 {})", log_ctx(), target, frame, offset);
        self.resource.seek(SeekFrom::Start(offset))?;
        self.current_frame = frame as u64;
        ctx.erase_video();

        let outcome = decode_forward(
            || {
                check_interrupted(ctx)?;
                self.next_frame()
            },
            |f| f.end >= target,
            Retention::Discard,
            |f| ctx.push_video(f),
        )?;
        ctx.note_frames(outcome.consumed, outcome.consumed);

        if outcome.reached_stop {
            Ok(())
        } else {
            Err(PlayerError::SeekFailed(format!("目标 {}us 之后没有帧", target)))
        }
    }
}

impl Reader for RawReader {
    fn read_metadata(&mut self, _ctx: &DecodeContext) -> Result<MediaInfo> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }
        let info = self.parse_header()?;
        info!(
            "{} 🎞️ 原始 YUV 流: {}x{} @ {:.2}fps, 时长 {:?}us",
            log_ctx(),
            info.frame.width,
            info.frame.height,
            info.frame_rate.unwrap_or_default(),
            info.duration_us
        );
        self.info = Some(info.clone());
        Ok(info)
    }

    fn decode_audio_data(&mut self, _ctx: &DecodeContext) -> bool {
        false
    }

    fn decode_video_frame(&mut self, ctx: &DecodeContext, keyframe_skip: &mut bool, time_threshold: i64) -> bool {
        // 每帧都是关键帧
        *keyframe_skip = false;

        let result = decode_forward(
            || self.next_frame(),
            |f| f.start >= time_threshold,
            Retention::Discard,
            |f| ctx.push_video(f),
        );
        if let Ok(outcome) = &result {
            ctx.note_frames(outcome.consumed, outcome.consumed);
        }
        settle(ctx, "原始流视频解码", result)
    }

    fn seek(&mut self, ctx: &DecodeContext, target: i64, _start_time: i64, _end_time: i64, _current_time: i64) -> Result<()> {
        let saved_frame = self.current_frame;
        let saved_offset = self.resource.tell();

        let result = self.seek_to(ctx, target);
        if let Err(e) = &result {
            warn!("{} ⚠️ 原始流 Seek 失败，恢复到帧 {}: {}", log_ctx(), saved_frame, e);
            self.current_frame = saved_frame;
            if let Err(restore_err) = self.resource.seek(SeekFrom::Start(saved_offset)) {
                warn!("{} ⚠️ 恢复读取位置失败: {}", log_ctx(), restore_err);
            }
        }
        result.map_err(|e| match e {
            PlayerError::SeekFailed(_) | PlayerError::Interrupted | PlayerError::Shutdown | PlayerError::ResourceClosed => e,
            other => PlayerError::SeekFailed(other.to_string()),
        })
    }

    fn buffered(&self) -> Arc<dyn BufferedSource> {
        self.index.clone()
    }

    fn has_audio(&self) -> bool {
        false
    }

    fn has_video(&self) -> bool {
        self.info.is_some()
    }

    fn description(&self) -> String {
        format!("raw-yuv:{}", self.resource.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineConfig;
    use crate::player::resource::MemoryResource;
    use crate::player::samples::RawStreamWriter;

    fn reader_for(bytes: Vec<u8>) -> RawReader {
        RawReader::new(Arc::new(MemoryResource::from_bytes(bytes)))
    }

    fn ctx() -> DecodeContext {
        DecodeContext::standalone(PipelineConfig::default())
    }

    #[test]
    fn test_header_round_trip() {
        let header = RawVideoHeader::yuv420(64, 48, 30, 1);
        assert_eq!(RawVideoHeader::parse(&header.to_bytes()), header);
        assert_eq!(header.frame_size(), Some(64 * 48 * 12 / 8 + 4));
        assert!(sniff(&header.to_bytes()));
        assert!(!sniff(b"IPKT\x01"));
    }

    #[test]
    fn test_metadata_duration_estimate() {
        let ctx = ctx();
        let mut reader = reader_for(RawStreamWriter::new(64, 64, 30, 1).frames(10).build());
        let info = reader.read_metadata(&ctx).unwrap();
        assert!(info.has_video);
        assert!(!info.has_audio);
        assert_eq!(info.frame, Size::new(64, 64));
        let expected = 10.0 / 30.0;
        let frame_period = 1.0 / 30.0;
        assert!((info.duration_secs().unwrap() - expected).abs() <= frame_period);
        // 第二次调用直接返回缓存
        assert_eq!(reader.read_metadata(&ctx).unwrap(), info);
    }

    #[test]
    fn test_zero_denominators_are_corrupt() {
        let ctx = ctx();
        let mut header = RawVideoHeader::yuv420(64, 64, 30, 1);
        header.aspect_denominator = 0;
        let mut reader = reader_for(RawStreamWriter::with_header(header).frames(1).build());
        assert!(matches!(reader.read_metadata(&ctx), Err(PlayerError::CorruptMetadata(_))));

        let mut header = RawVideoHeader::yuv420(64, 64, 30, 1);
        header.framerate_denominator = 0;
        let mut reader = reader_for(RawStreamWriter::with_header(header).frames(1).build());
        assert!(matches!(reader.read_metadata(&ctx), Err(PlayerError::CorruptMetadata(_))));
    }

    #[test]
    fn test_sanity_bounds() {
        let ctx = ctx();
        for header in [
            RawVideoHeader::yuv420(64, 64, 60, 1),
            RawVideoHeader::yuv420(2001, 64, 30, 1),
            RawVideoHeader::yuv420(64, 64, 0, 1),
        ] {
            let mut reader = reader_for(RawStreamWriter::with_header(header).build());
            assert!(matches!(reader.read_metadata(&ctx), Err(PlayerError::CorruptMetadata(_))));
        }
        let mut reader = reader_for(vec![0, b'Y', b'U']);
        assert!(matches!(reader.read_metadata(&ctx), Err(PlayerError::CorruptMetadata(_))));
    }

    #[test]
    fn test_pixel_aspect_scales_display() {
        let ctx = ctx();
        let mut header = RawVideoHeader::yuv420(64, 64, 30, 1);
        header.aspect_numerator = 2;
        let mut reader = reader_for(RawStreamWriter::with_header(header).frames(1).build());
        let info = reader.read_metadata(&ctx).unwrap();
        assert_eq!(info.display, Size::new(128, 64));
        assert_eq!(info.frame, Size::new(64, 64));
    }

    #[test]
    fn test_decode_frames_in_order_until_eof() {
        let ctx = ctx();
        let mut reader = reader_for(RawStreamWriter::new(16, 16, 30, 1).frames(3).build());
        reader.read_metadata(&ctx).unwrap();
        let mut skip = false;
        for _ in 0..3 {
            assert!(reader.decode_video_frame(&ctx, &mut skip, 0));
        }
        assert!(!reader.decode_video_frame(&ctx, &mut skip, 0));
        let starts: Vec<i64> = std::iter::from_fn(|| ctx.pop_video()).map(|f| f.start).collect();
        assert_eq!(starts, vec![0, 33_333, 66_666]);
    }

    #[test]
    fn test_decode_skips_frames_below_threshold() {
        let ctx = ctx();
        let mut reader = reader_for(RawStreamWriter::new(16, 16, 30, 1).frames(10).build());
        reader.read_metadata(&ctx).unwrap();
        let mut skip = true;
        assert!(reader.decode_video_frame(&ctx, &mut skip, 100_000));
        assert!(!skip);
        let frame = ctx.pop_video().unwrap();
        assert_eq!(frame.timecode, 3);
        assert!(frame.keyframe);
        assert_eq!(frame.buffer.plane(1).unwrap().width, 8);
    }

    #[test]
    fn test_seek_lands_on_frame_covering_target() {
        let ctx = ctx();
        let mut reader = reader_for(RawStreamWriter::new(64, 64, 30, 1).frames(10).build());
        reader.read_metadata(&ctx).unwrap();
        reader.seek(&ctx, 150_000, 0, 333_333, 0).unwrap();
        assert_eq!(ctx.video_len(), 1);
        let frame = ctx.pop_video().unwrap();
        assert_eq!(frame.timecode, 4);
        assert!(frame.end >= 150_000);
        assert_eq!(frame.start, 133_333);
    }

    #[test]
    fn test_failed_seek_restores_position() {
        let ctx = ctx();
        let mut reader = reader_for(RawStreamWriter::new(16, 16, 30, 1).frames(4).build());
        reader.read_metadata(&ctx).unwrap();
        let mut skip = false;
        assert!(reader.decode_video_frame(&ctx, &mut skip, 0));
        assert!(matches!(reader.seek(&ctx, 10_000_000, 0, 133_333, 0), Err(PlayerError::SeekFailed(_))));
        assert!(reader.decode_video_frame(&ctx, &mut skip, 0));
        let frames: Vec<i64> = std::iter::from_fn(|| ctx.pop_video()).map(|f| f.timecode).collect();
        assert_eq!(frames, vec![0, 1]);
    }

    #[test]
    fn test_buffered_ranges_follow_decoding() {
        let ctx = ctx();
        let mut reader = reader_for(RawStreamWriter::new(64, 64, 30, 1).frames(10).build());
        let buffered = reader.buffered();
        reader.read_metadata(&ctx).unwrap();
        assert!(buffered.get_buffered(0).unwrap().is_empty());

        let mut skip = false;
        let mut decoded = 0;
        while reader.decode_video_frame(&ctx, &mut skip, 0) {
            decoded += 1;
            ctx.pop_video();
        }
        assert_eq!(decoded, 10);
        let ranges = buffered.get_buffered(0).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges.ranges()[0].start, 0.0);
        assert!((ranges.ranges()[0].end - 1.0 / 3.0).abs() < 1e-5);
        assert_eq!(buffered.get_buffered(0).unwrap(), ranges);
    }
}
