use crate::core::{
    alloc_buffer, frames_to_usecs, log_ctx, scale_display_by_aspect_ratio, validate_video_region,
    DecodedAudioChunk, DecodedVideoFrame, MediaInfo, PictureRect, PlayerError, Result, Size,
};
use crate::player::codec::{fourcc_to_string, AudioCodec, AudioTrackInfo, FourCc, VideoCodec, VideoTrackInfo};
use crate::player::context::DecodeContext;
use crate::player::reader::{
    check_interrupted, decode_forward, settle, BufferedIndex, BufferedSource, Packet, Reader,
    Retention, TrackKind,
};
use crate::player::registry::DecoderRegistry;
use crate::player::resource::{read_fully, Resource};
use log::{debug, info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::io::SeekFrom;
use std::sync::Arc;

pub const INDEXED_MAGIC: [u8; 4] = *b"IPKT";
pub const INDEXED_VERSION: u8 = 1;
/// magic + version + track_count + duration
pub const INDEXED_HEADER_LEN: usize = 14;
pub const TRACK_RECORD_LEN: usize = 28;
pub const PACKET_SYNC: [u8; 2] = [0xA5, 0x5A];
/// sync + track + flags + pts + duration + size
pub const PACKET_HEADER_LEN: usize = 20;
pub const FLAG_KEYFRAME: u8 = 0x01;

const TRACK_KIND_VIDEO: u8 = 0;
const TRACK_KIND_AUDIO: u8 = 1;
const MAX_PACKET_SIZE: u32 = 16 << 20;
const MAX_PACKET_DURATION_US: u32 = 10_000_000;
const RESYNC_WINDOW: usize = 64 * 1024;
const TAIL_SCAN_BYTES: u64 = 256 * 1024;
const SEEK_BACKOFF_STEP: u64 = 16 * 1024;
/// 估算落点至少要比目标早这么多，保证目标附近的包都在落点之后
const SEEK_PREROLL_US: i64 = 200_000;

/// 头部是否像分包容器（用于格式探测）
pub fn sniff(prefix: &[u8]) -> bool {
    prefix.len() >= 5 && prefix[..4] == INDEXED_MAGIC && prefix[4] == INDEXED_VERSION
}

/// 轨道描述记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackRecord {
    Video {
        track_id: u8,
        codec: FourCc,
        width: u32,
        height: u32,
        aspect_numerator: u16,
        aspect_denominator: u16,
        /// x, y, width, height；width 为 0 表示整帧
        picture: [u16; 4],
    },
    Audio {
        track_id: u8,
        codec: FourCc,
        rate: u32,
        channels: u16,
        bits: u16,
    },
}

impl TrackRecord {
    pub fn track_id(&self) -> u8 {
        match self {
            TrackRecord::Video { track_id, .. } | TrackRecord::Audio { track_id, .. } => *track_id,
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self {
            TrackRecord::Video { .. } => TrackKind::Video,
            TrackRecord::Audio { .. } => TrackKind::Audio,
        }
    }

    pub fn parse(bytes: &[u8; TRACK_RECORD_LEN]) -> Result<Self> {
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let track_id = bytes[1];
        let codec = [bytes[2], bytes[3], bytes[4], bytes[5]];
        match bytes[0] {
            TRACK_KIND_VIDEO => Ok(TrackRecord::Video {
                track_id,
                codec,
                width: u32_at(6),
                height: u32_at(10),
                aspect_numerator: u16_at(14),
                aspect_denominator: u16_at(16),
                picture: [u16_at(18), u16_at(20), u16_at(22), u16_at(24)],
            }),
            TRACK_KIND_AUDIO => Ok(TrackRecord::Audio {
                track_id,
                codec,
                rate: u32_at(6),
                channels: u16_at(10),
                bits: u16_at(12),
            }),
            other => Err(PlayerError::CorruptMetadata(format!("未知的轨道类型 {}", other))),
        }
    }

    pub fn to_bytes(&self) -> [u8; TRACK_RECORD_LEN] {
        let mut bytes = [0u8; TRACK_RECORD_LEN];
        match self {
            TrackRecord::Video {
                track_id,
                codec,
                width,
                height,
                aspect_numerator,
                aspect_denominator,
                picture,
            } => {
                bytes[0] = TRACK_KIND_VIDEO;
                bytes[1] = *track_id;
                bytes[2..6].copy_from_slice(codec);
                bytes[6..10].copy_from_slice(&width.to_le_bytes());
                bytes[10..14].copy_from_slice(&height.to_le_bytes());
                bytes[14..16].copy_from_slice(&aspect_numerator.to_le_bytes());
                bytes[16..18].copy_from_slice(&aspect_denominator.to_le_bytes());
                for (i, v) in picture.iter().enumerate() {
                    bytes[18 + i * 2..20 + i * 2].copy_from_slice(&v.to_le_bytes());
                }
            }
            TrackRecord::Audio { track_id, codec, rate, channels, bits } => {
                bytes[0] = TRACK_KIND_AUDIO;
                bytes[1] = *track_id;
                bytes[2..6].copy_from_slice(codec);
                bytes[6..10].copy_from_slice(&rate.to_le_bytes());
                bytes[10..12].copy_from_slice(&channels.to_le_bytes());
                bytes[12..14].copy_from_slice(&bits.to_le_bytes());
            }
        }
        bytes
    }
}

/// 包头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub track_id: u8,
    pub keyframe: bool,
    pub pts: i64,
    pub duration: u32,
    pub size: u32,
}

impl PacketHeader {
    /// 同步字不匹配返回 None
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PACKET_HEADER_LEN || bytes[..2] != PACKET_SYNC {
            return None;
        }
        let mut pts = [0u8; 8];
        pts.copy_from_slice(&bytes[4..12]);
        Some(Self {
            track_id: bytes[2],
            keyframe: bytes[3] & FLAG_KEYFRAME != 0,
            pts: i64::from_le_bytes(pts),
            duration: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            size: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut bytes = [0u8; PACKET_HEADER_LEN];
        bytes[..2].copy_from_slice(&PACKET_SYNC);
        bytes[2] = self.track_id;
        bytes[3] = if self.keyframe { FLAG_KEYFRAME } else { 0 };
        bytes[4..12].copy_from_slice(&self.pts.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.duration.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    fn packet_len(&self) -> u64 {
        PACKET_HEADER_LEN as u64 + self.size as u64
    }
}

struct VideoTrack {
    info: VideoTrackInfo,
    codec: Box<dyn VideoCodec>,
}

struct AudioTrack {
    info: AudioTrackInfo,
    codec: Box<dyn AudioCodec>,
}

/// 交错分包容器读取器
///
/// 读到另一条轨道的包时放进该轨道的包队列；Seek 优先使用已知的关键帧偏移，
/// 否则按码率估算偏移并在同步字上重新对齐
pub struct IndexedReader {
    resource: Arc<dyn Resource>,
    registry: Arc<DecoderRegistry>,
    index: Arc<BufferedIndex>,
    info: Option<MediaInfo>,
    /// 头部声明的全部轨道（包括被禁用的）
    declared_tracks: Vec<(u8, TrackKind)>,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    data_offset: u64,
    video_packets: VecDeque<Packet>,
    audio_packets: VecDeque<Packet>,
    /// 关键帧 pts → 包起始偏移
    keyframes: BTreeMap<i64, u64>,
    /// 已顺序解析到的最大 pts
    indexed_until: Option<i64>,
    pending_parsed: u64,
    pending_decoded: u64,
}

impl IndexedReader {
    pub fn new(resource: Arc<dyn Resource>, registry: Arc<DecoderRegistry>) -> Self {
        let index = Arc::new(BufferedIndex::new(Arc::clone(&resource)));
        Self {
            resource,
            registry,
            index,
            info: None,
            declared_tracks: Vec::new(),
            video: None,
            audio: None,
            data_offset: 0,
            video_packets: VecDeque::new(),
            audio_packets: VecDeque::new(),
            keyframes: BTreeMap::new(),
            indexed_until: None,
            pending_parsed: 0,
            pending_decoded: 0,
        }
    }

    fn declared_kind(&self, track_id: u8) -> Option<TrackKind> {
        self.declared_tracks
            .iter()
            .find(|(id, _)| *id == track_id)
            .map(|(_, kind)| *kind)
    }

    fn enabled_kind(&self, track_id: u8) -> Option<TrackKind> {
        if self.video.as_ref().is_some_and(|v| v.info.track_id == track_id) {
            Some(TrackKind::Video)
        } else if self.audio.as_ref().is_some_and(|a| a.info.track_id == track_id) {
            Some(TrackKind::Audio)
        } else {
            None
        }
    }

    fn is_plausible(&self, header: &PacketHeader) -> bool {
        self.declared_kind(header.track_id).is_some()
            && header.size <= MAX_PACKET_SIZE
            && header.duration <= MAX_PACKET_DURATION_US
            && header.pts >= 0
            && header.pts <= i64::MAX - MAX_PACKET_DURATION_US as i64
    }

    fn parse_header(&mut self) -> Result<MediaInfo> {
        self.resource.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; INDEXED_HEADER_LEN];
        if !read_fully(&*self.resource, &mut header)? {
            return Err(PlayerError::CorruptMetadata("容器头部不完整".into()));
        }
        if header[..4] != INDEXED_MAGIC {
            return Err(PlayerError::CorruptMetadata("容器 magic 不匹配".into()));
        }
        if header[4] != INDEXED_VERSION {
            return Err(PlayerError::CorruptMetadata(format!("不支持的容器版本 {}", header[4])));
        }
        let track_count = header[5] as usize;
        if !(1..=2).contains(&track_count) {
            return Err(PlayerError::CorruptMetadata(format!("轨道数量无效: {}", track_count)));
        }
        let mut duration = [0u8; 8];
        duration.copy_from_slice(&header[6..14]);
        let declared_duration = match i64::from_le_bytes(duration) {
            -1 => None,
            d if d < 0 => return Err(PlayerError::CorruptMetadata(format!("时长无效: {}", d))),
            d => Some(d),
        };

        let mut info = MediaInfo {
            container: "indexed".to_string(),
            ..MediaInfo::default()
        };

        for _ in 0..track_count {
            let mut record = [0u8; TRACK_RECORD_LEN];
            if !read_fully(&*self.resource, &mut record)? {
                return Err(PlayerError::CorruptMetadata("轨道记录不完整".into()));
            }
            let record = TrackRecord::parse(&record)?;
            if self.declared_kind(record.track_id()).is_some()
                || self.declared_tracks.iter().any(|(_, k)| *k == record.kind())
            {
                return Err(PlayerError::CorruptMetadata("重复的轨道".into()));
            }
            self.declared_tracks.push((record.track_id(), record.kind()));
            self.open_track(record, &mut info)?;
        }

        if self.video.is_none() && self.audio.is_none() {
            return Err(PlayerError::CorruptMetadata("没有可用的音视频轨道".into()));
        }

        self.data_offset = (INDEXED_HEADER_LEN + track_count * TRACK_RECORD_LEN) as u64;
        info.has_video = self.video.is_some();
        info.has_audio = self.audio.is_some();
        info.duration_us = match declared_duration {
            Some(d) => Some(d),
            None => self.find_end_time()?,
        };
        self.resource.seek(SeekFrom::Start(self.data_offset))?;
        Ok(info)
    }

    fn open_track(&mut self, record: TrackRecord, info: &mut MediaInfo) -> Result<()> {
        match record {
            TrackRecord::Video {
                track_id,
                codec,
                width,
                height,
                aspect_numerator,
                aspect_denominator,
                picture,
            } => {
                if aspect_denominator == 0 || aspect_numerator == 0 {
                    return Err(PlayerError::CorruptMetadata("视频轨道宽高比为 0".into()));
                }
                let frame = Size::new(width, height);
                let picture = if picture[2] == 0 || picture[3] == 0 {
                    PictureRect::full(frame)
                } else {
                    PictureRect::new(picture[0] as u32, picture[1] as u32, picture[2] as u32, picture[3] as u32)
                };
                let pixel_aspect_ratio = aspect_numerator as f64 / aspect_denominator as f64;
                let display =
                    scale_display_by_aspect_ratio(Size::new(picture.width, picture.height), pixel_aspect_ratio);
                if !validate_video_region(frame, picture, display) {
                    return Err(PlayerError::CorruptMetadata(format!(
                        "视频区域无效: frame={:?} picture={:?}",
                        frame, picture
                    )));
                }
                let track = VideoTrackInfo { track_id, codec, frame, picture, pixel_aspect_ratio };
                match self.registry.create_video_codec(&track) {
                    Ok(codec) => {
                        info!("{} 🎬 视频轨道 #{}: {} {}x{}", log_ctx(), track_id, codec.name(), width, height);
                        info.frame = frame;
                        info.picture = picture;
                        info.display = display;
                        info.pixel_aspect_ratio = pixel_aspect_ratio;
                        self.video = Some(VideoTrack { info: track, codec });
                    }
                    Err(PlayerError::UnsupportedFormat(msg)) => {
                        warn!("{} ⚠️ 禁用视频轨道 #{} ({}): {}", log_ctx(), track_id, fourcc_to_string(&codec), msg);
                    }
                    Err(e) => return Err(e),
                }
            }
            TrackRecord::Audio { track_id, codec, rate, channels, bits } => {
                if rate == 0 || channels == 0 {
                    return Err(PlayerError::CorruptMetadata("音频采样率或声道数为 0".into()));
                }
                let track = AudioTrackInfo { track_id, codec, rate, channels: channels as u32, bits };
                match self.registry.create_audio_codec(&track) {
                    Ok(codec) => {
                        info!("{} 🔊 音频轨道 #{}: {} {} Hz, {} 声道", log_ctx(), track_id, codec.name(), rate, channels);
                        info.audio_rate = rate;
                        info.audio_channels = channels as u32;
                        self.audio = Some(AudioTrack { info: track, codec });
                    }
                    Err(PlayerError::UnsupportedFormat(msg)) => {
                        warn!("{} ⚠️ 禁用音频轨道 #{} ({}): {}", log_ctx(), track_id, fourcc_to_string(&codec), msg);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// 读取 offset 处的包头；EOF 或同步字不匹配返回 None
    fn header_at(&self, offset: u64) -> Result<Option<PacketHeader>> {
        if self.resource.length().is_some_and(|len| offset + PACKET_HEADER_LEN as u64 > len) {
            return Ok(None);
        }
        self.resource.seek(SeekFrom::Start(offset))?;
        let mut bytes = [0u8; PACKET_HEADER_LEN];
        if !read_fully(&*self.resource, &mut bytes)? {
            return Ok(None);
        }
        Ok(PacketHeader::parse(&bytes))
    }

    /// next 位置是包边界（资源末尾或下一个同步字）
    fn is_packet_boundary(&self, next: u64) -> Result<bool> {
        match self.resource.length() {
            Some(len) if next == len => return Ok(true),
            Some(len) if next > len => return Ok(false),
            _ => {}
        }
        self.resource.seek(SeekFrom::Start(next))?;
        let mut sync = [0u8; 2];
        Ok(read_fully(&*self.resource, &mut sync)? && sync == PACKET_SYNC)
    }

    /// 从 from 开始向后寻找第一个可信的包头
    fn resync(&self, from: u64) -> Result<Option<(u64, PacketHeader)>> {
        let mut window_start = from.max(self.data_offset);
        let mut window = vec![0u8; RESYNC_WINDOW];
        loop {
            self.resource.seek(SeekFrom::Start(window_start))?;
            let mut filled = 0;
            while filled < window.len() {
                let n = self.resource.read(&mut window[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled < PACKET_HEADER_LEN {
                return Ok(None);
            }
            for i in 0..=filled - PACKET_HEADER_LEN {
                if window[i..i + 2] != PACKET_SYNC {
                    continue;
                }
                let header = match PacketHeader::parse(&window[i..i + PACKET_HEADER_LEN]) {
                    Some(h) if self.is_plausible(&h) => h,
                    _ => continue,
                };
                let offset = window_start + i as u64;
                if self.is_packet_boundary(offset + header.packet_len())? {
                    return Ok(Some((offset, header)));
                }
            }
            if filled < window.len() {
                return Ok(None);
            }
            window_start += (filled - PACKET_HEADER_LEN + 1) as u64;
        }
    }

    /// 扫描尾部的包得到结束时间，完成后回到数据起点
    fn find_end_time(&mut self) -> Result<Option<i64>> {
        let length = match self.resource.length() {
            Some(len) => len,
            None => return Ok(None),
        };
        let scan_from = length.saturating_sub(TAIL_SCAN_BYTES).max(self.data_offset);
        let mut end_time = None;
        if let Some((mut offset, _)) = self.resync(scan_from)? {
            while let Some(header) = self.header_at(offset)? {
                if !self.is_plausible(&header) {
                    break;
                }
                let end = header.pts + header.duration as i64;
                end_time = Some(end_time.map_or(end, |e: i64| e.max(end)));
                offset += header.packet_len();
            }
        }
        debug!("{} 🔎 尾部扫描得到结束时间: {:?}", log_ctx(), end_time);
        self.resource.seek(SeekFrom::Start(self.data_offset))?;
        Ok(end_time)
    }

    /// 顺序读取下一个属于已启用轨道的包
    fn read_next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let start_offset = self.resource.tell();
            let mut bytes = [0u8; PACKET_HEADER_LEN];
            if !read_fully(&*self.resource, &mut bytes)? {
                return Ok(None);
            }
            let header = PacketHeader::parse(&bytes).ok_or_else(|| {
                PlayerError::DecodeError(format!("偏移 {} 处失去同步", start_offset))
            })?;
            if !self.is_plausible(&header) {
                return Err(PlayerError::DecodeError(format!(
                    "偏移 {} 处的包头不可信: {:?}",
                    start_offset, header
                )));
            }
            let end_offset = start_offset + header.packet_len();
            let pts = header.pts;
            let duration = header.duration as i64;

            let kind = match self.enabled_kind(header.track_id) {
                Some(kind) => kind,
                None => {
                    // 被禁用的轨道：跳过负载
                    self.resource.seek(SeekFrom::Start(end_offset))?;
                    continue;
                }
            };

            let mut data = alloc_buffer(header.size as usize)?;
            if !read_fully(&*self.resource, &mut data)? {
                debug!("{} 📄 最后一个包不完整，按 EOF 处理", log_ctx());
                return Ok(None);
            }

            self.index.record(start_offset, end_offset, pts, pts + duration);
            let seek_point = match kind {
                TrackKind::Video => header.keyframe,
                TrackKind::Audio => self.video.is_none(),
            };
            if seek_point {
                self.keyframes.insert(pts, start_offset);
            }
            self.indexed_until = Some(self.indexed_until.map_or(pts, |t| t.max(pts)));

            return Ok(Some(Packet {
                track: kind,
                track_id: header.track_id,
                keyframe: header.keyframe,
                pts,
                duration,
                start_offset,
                end_offset,
                data,
            }));
        }
    }

    /// 取 kind 轨道的下一个包，顺带把另一条轨道的包放进它的队列
    fn next_packet(&mut self, kind: TrackKind) -> Result<Option<Packet>> {
        loop {
            let queued = match kind {
                TrackKind::Video => self.video_packets.pop_front(),
                TrackKind::Audio => self.audio_packets.pop_front(),
            };
            if queued.is_some() {
                return Ok(queued);
            }
            match self.read_next_packet()? {
                None => return Ok(None),
                Some(packet) if packet.track == kind => return Ok(Some(packet)),
                Some(packet) => match packet.track {
                    TrackKind::Video => self.video_packets.push_back(packet),
                    TrackKind::Audio => self.audio_packets.push_back(packet),
                },
            }
        }
    }

    fn next_video_frame(&mut self, keyframe_skip: &mut bool) -> Result<Option<DecodedVideoFrame>> {
        loop {
            let packet = match self.next_packet(TrackKind::Video)? {
                Some(packet) => packet,
                None => return Ok(None),
            };
            self.pending_parsed += 1;
            if *keyframe_skip {
                if !packet.keyframe {
                    continue;
                }
                *keyframe_skip = false;
            }

            let track = match self.video.as_mut() {
                Some(track) => track,
                None => return Ok(None),
            };
            match track.codec.decode(&packet) {
                Ok(Some(buffer)) => {
                    self.pending_decoded += 1;
                    return Ok(Some(DecodedVideoFrame {
                        start: packet.pts,
                        end: packet.pts + packet.duration,
                        timecode: -1,
                        keyframe: packet.keyframe,
                        offset: packet.end_offset,
                        picture: track.info.picture,
                        buffer,
                    }));
                }
                Ok(None) => continue,
                Err(e @ PlayerError::OutOfMemory(_)) => return Err(e),
                Err(e) => {
                    warn!("{} ⚠️ 跳过无法解码的视频包 (pts={}us): {}", log_ctx(), packet.pts, e);
                }
            }
        }
    }

    fn next_audio_chunk(&mut self) -> Result<Option<DecodedAudioChunk>> {
        loop {
            let packet = match self.next_packet(TrackKind::Audio)? {
                Some(packet) => packet,
                None => return Ok(None),
            };
            self.pending_parsed += 1;
            let track = match self.audio.as_mut() {
                Some(track) => track,
                None => return Ok(None),
            };
            match track.codec.decode(&packet) {
                Ok(samples) => {
                    let channels = track.info.channels;
                    let frames = (samples.len() / channels as usize) as u32;
                    let duration = frames_to_usecs(frames as u64, track.info.rate).unwrap_or(packet.duration);
                    self.pending_decoded += 1;
                    return Ok(Some(DecodedAudioChunk {
                        start: packet.pts,
                        duration,
                        offset: packet.end_offset,
                        frames,
                        channels,
                        rate: track.info.rate,
                        samples,
                    }));
                }
                Err(e @ PlayerError::OutOfMemory(_)) => return Err(e),
                Err(e) => {
                    warn!("{} ⚠️ 跳过无法解码的音频包 (pts={}us): {}", log_ctx(), packet.pts, e);
                }
            }
        }
    }

    fn flush_counts(&mut self, ctx: &DecodeContext) {
        if self.pending_parsed > 0 || self.pending_decoded > 0 {
            ctx.note_frames(self.pending_parsed, self.pending_decoded);
            self.pending_parsed = 0;
            self.pending_decoded = 0;
        }
    }

    /// 已索引区域覆盖目标时，返回目标之前最近的关键帧偏移
    fn known_seek_point(&self, target: i64) -> Option<u64> {
        let indexed_until = self.indexed_until?;
        if indexed_until < target {
            return None;
        }
        self.keyframes.range(..=target).next_back().map(|(_, offset)| *offset)
    }

    /// 按码率估算偏移，对齐到包边界，落点太晚时成倍向前回退
    fn estimate_seek_point(&self, target: i64, start_time: i64, end_time: i64) -> Result<u64> {
        let length = self
            .resource
            .length()
            .ok_or_else(|| PlayerError::SeekFailed("资源长度未知，无法估算偏移".into()))?;
        if end_time <= start_time || length <= self.data_offset {
            return Ok(self.data_offset);
        }
        let span = (length - self.data_offset) as u128;
        let relative = (target - start_time).clamp(0, end_time - start_time) as u128;
        let mut guess = self.data_offset + (span * relative / (end_time - start_time) as u128) as u64;
        let mut step = SEEK_BACKOFF_STEP;
        let latest_start = target - SEEK_PREROLL_US;

        loop {
            if let Some((offset, header)) = self.resync(guess)? {
                // 有视频时必须落在目标之前的关键帧上
                let landing = if self.video.is_some() {
                    self.keyframe_before(offset, target)?
                } else if header.pts <= latest_start {
                    Some(offset)
                } else {
                    None
                };
                if let Some(landing) = landing {
                    return Ok(landing);
                }
            }
            if guess <= self.data_offset {
                return Ok(self.data_offset);
            }
            guess = guess.saturating_sub(step).max(self.data_offset);
            step = step.saturating_mul(2);
        }
    }

    /// 从 offset 开始逐个读包头，返回 pts 不超过 target 的最后一个视频关键帧偏移
    fn keyframe_before(&self, mut offset: u64, target: i64) -> Result<Option<u64>> {
        let video_id = match self.video.as_ref() {
            Some(track) => track.info.track_id,
            None => return Ok(None),
        };
        let mut found = None;
        while let Some(header) = self.header_at(offset)? {
            if !self.is_plausible(&header) || header.pts > target {
                break;
            }
            if header.track_id == video_id && header.keyframe {
                found = Some(offset);
            }
            offset += header.packet_len();
        }
        Ok(found)
    }

    fn seek_to(&mut self, ctx: &DecodeContext, target: i64, start_time: i64, end_time: i64) -> Result<()> {
        if self.info.is_none() {
            return Err(PlayerError::SeekFailed("尚未读取元数据".into()));
        }

        let offset = match self.known_seek_point(target) {
            Some(offset) => {
                debug!("{} ⏩ 使用已知关键帧偏移 {} (目标 {}us)", log_ctx(), offset, target);
                offset
            }
            None => {
                let offset = self.estimate_seek_point(target, start_time, end_time)?;
                debug!("{} ⏩ 按码率估算偏移 {} (目标 {}us)", log_ctx(), offset, target);
                offset
            }
        };

        self.resource.seek(SeekFrom::Start(offset))?;
        self.reset_decode()?;
        ctx.erase_video();
        ctx.erase_audio();

        if self.video.is_some() {
            let mut keyframe_skip = true;
            let outcome = decode_forward(
                || {
                    check_interrupted(ctx)?;
                    self.next_video_frame(&mut keyframe_skip)
                },
                |f| f.end >= target,
                Retention::Discard,
                |f| ctx.push_video(f),
            )?;
            if !outcome.reached_stop {
                self.flush_counts(ctx);
                return Err(PlayerError::SeekFailed(format!("目标 {}us 之后没有视频帧", target)));
            }
        }

        if self.audio.is_some() {
            let outcome = decode_forward(
                || {
                    check_interrupted(ctx)?;
                    self.next_audio_chunk()
                },
                |c| c.end() >= target,
                Retention::Discard,
                |c| ctx.push_audio(c),
            )?;
            if !outcome.reached_stop && self.video.is_none() {
                self.flush_counts(ctx);
                return Err(PlayerError::SeekFailed(format!("目标 {}us 之后没有音频", target)));
            }
        }

        self.flush_counts(ctx);
        Ok(())
    }
}

impl Reader for IndexedReader {
    fn read_metadata(&mut self, _ctx: &DecodeContext) -> Result<MediaInfo> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }
        let info = self.parse_header()?;
        info!(
            "{} 📦 分包容器: video={} audio={} 时长 {:?}us",
            log_ctx(),
            info.has_video,
            info.has_audio,
            info.duration_us
        );
        self.info = Some(info.clone());
        Ok(info)
    }

    fn decode_audio_data(&mut self, ctx: &DecodeContext) -> bool {
        if self.audio.is_none() {
            return false;
        }
        let min_duration = ctx.config().audio_chunk_us();
        let mut accumulated = 0i64;
        let result = decode_forward(
            || self.next_audio_chunk(),
            |c| {
                accumulated += c.duration;
                accumulated >= min_duration
            },
            Retention::Keep,
            |c| ctx.push_audio(c),
        );
        self.flush_counts(ctx);
        settle(ctx, "音频解码", result)
    }

    fn decode_video_frame(&mut self, ctx: &DecodeContext, keyframe_skip: &mut bool, time_threshold: i64) -> bool {
        if self.video.is_none() {
            return false;
        }
        let result = decode_forward(
            || self.next_video_frame(keyframe_skip),
            |f| f.start >= time_threshold,
            Retention::Discard,
            |f| ctx.push_video(f),
        );
        self.flush_counts(ctx);
        settle(ctx, "视频解码", result)
    }

    fn seek(&mut self, ctx: &DecodeContext, target: i64, start_time: i64, end_time: i64, _current_time: i64) -> Result<()> {
        let saved_offset = self.resource.tell();
        let saved_video = std::mem::take(&mut self.video_packets);
        let saved_audio = std::mem::take(&mut self.audio_packets);

        match self.seek_to(ctx, target, start_time, end_time) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("{} ⚠️ Seek 失败，恢复到偏移 {}: {}", log_ctx(), saved_offset, e);
                self.video_packets = saved_video;
                self.audio_packets = saved_audio;
                if let Err(restore_err) = self.resource.seek(SeekFrom::Start(saved_offset)) {
                    warn!("{} ⚠️ 恢复读取位置失败: {}", log_ctx(), restore_err);
                }
                Err(match e {
                    PlayerError::SeekFailed(_) | PlayerError::Interrupted | PlayerError::Shutdown | PlayerError::ResourceClosed => e,
                    other => PlayerError::SeekFailed(other.to_string()),
                })
            }
        }
    }

    fn buffered(&self) -> Arc<dyn BufferedSource> {
        self.index.clone()
    }

    fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    fn has_video(&self) -> bool {
        self.video.is_some()
    }

    fn reset_decode(&mut self) -> Result<()> {
        self.video_packets.clear();
        self.audio_packets.clear();
        if let Some(track) = self.video.as_mut() {
            track.codec.reset();
        }
        if let Some(track) = self.audio.as_mut() {
            track.codec.reset();
        }
        Ok(())
    }

    fn description(&self) -> String {
        format!("indexed:{}", self.resource.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineConfig;
    use crate::player::resource::MemoryResource;
    use crate::player::samples::IndexedStreamWriter;

    fn reader_for(bytes: Vec<u8>) -> IndexedReader {
        IndexedReader::new(
            Arc::new(MemoryResource::from_bytes(bytes)),
            Arc::new(DecoderRegistry::with_builtin()),
        )
    }

    fn ctx() -> DecodeContext {
        DecodeContext::standalone(PipelineConfig::default())
    }

    fn drain_video(ctx: &DecodeContext) -> Vec<DecodedVideoFrame> {
        std::iter::from_fn(|| ctx.pop_video()).collect()
    }

    #[test]
    fn test_records_round_trip() {
        let video = TrackRecord::Video {
            track_id: 3,
            codec: *b"I420",
            width: 32,
            height: 16,
            aspect_numerator: 4,
            aspect_denominator: 3,
            picture: [0, 0, 32, 16],
        };
        assert_eq!(TrackRecord::parse(&video.to_bytes()).unwrap(), video);
        let header = PacketHeader { track_id: 1, keyframe: true, pts: 123, duration: 40_000, size: 9 };
        assert_eq!(PacketHeader::parse(&header.to_bytes()), Some(header));
        assert_eq!(PacketHeader::parse(&[0u8; PACKET_HEADER_LEN]), None);
    }

    #[test]
    fn test_metadata_with_both_tracks() {
        let ctx = ctx();
        let bytes = IndexedStreamWriter::new(16, 16, 25).audio(8000, 1).duration_secs(1.0).build();
        let mut reader = reader_for(bytes);
        let info = reader.read_metadata(&ctx).unwrap();
        assert!(info.has_video && info.has_audio);
        assert_eq!(info.audio_rate, 8000);
        assert_eq!(info.duration_us, Some(1_000_000));
        assert!(sniff(b"IPKT\x01\x02"));
    }

    #[test]
    fn test_unknown_duration_found_by_tail_scan() {
        let ctx = ctx();
        let bytes = IndexedStreamWriter::new(16, 16, 25)
            .duration_secs(0.4)
            .declare_unknown_duration()
            .build();
        let mut reader = reader_for(bytes);
        let info = reader.read_metadata(&ctx).unwrap();
        assert_eq!(info.duration_us, Some(400_000));
    }

    #[test]
    fn test_unsupported_codec_disables_track() {
        let ctx = ctx();
        let bytes = IndexedStreamWriter::new(16, 16, 25)
            .audio(8000, 1)
            .video_codec(*b"VP80")
            .duration_secs(0.2)
            .build();
        let mut reader = reader_for(bytes);
        let info = reader.read_metadata(&ctx).unwrap();
        assert!(!info.has_video);
        assert!(info.has_audio);
        assert!(reader.decode_audio_data(&ctx));
        assert!(ctx.audio_len() > 0);

        let only_video = IndexedStreamWriter::new(16, 16, 25).video_codec(*b"VP80").build();
        let mut reader = reader_for(only_video);
        assert!(matches!(reader.read_metadata(&ctx), Err(PlayerError::CorruptMetadata(_))));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let ctx = ctx();
        let mut bytes = IndexedStreamWriter::new(16, 16, 25).build();
        bytes[0] = b'X';
        let mut reader = reader_for(bytes);
        assert!(matches!(reader.read_metadata(&ctx), Err(PlayerError::CorruptMetadata(_))));
    }

    #[test]
    fn test_interleaved_packets_reach_their_queues() {
        let ctx = ctx();
        let bytes = IndexedStreamWriter::new(16, 16, 25).audio(8000, 2).duration_secs(0.4).build();
        let mut reader = reader_for(bytes);
        reader.read_metadata(&ctx).unwrap();

        let mut skip = false;
        let mut video_frames = 0;
        while reader.decode_video_frame(&ctx, &mut skip, 0) {
            video_frames += 1;
            drain_video(&ctx);
        }
        assert_eq!(video_frames, 10);
        // 视频读到底时音频包都进了音频包队列
        while reader.decode_audio_data(&ctx) {}
        let mut last_start = -1;
        let mut total = 0;
        while let Some(chunk) = ctx.pop_audio() {
            assert!(chunk.start > last_start);
            assert_eq!(chunk.channels, 2);
            last_start = chunk.start;
            total += chunk.duration;
        }
        assert_eq!(total, 400_000);
    }

    #[test]
    fn test_keyframe_skip_waits_for_keyframe() {
        let ctx = ctx();
        let bytes = IndexedStreamWriter::new(16, 16, 25).keyframe_interval(5).duration_secs(0.4).build();
        let mut reader = reader_for(bytes);
        reader.read_metadata(&ctx).unwrap();
        let mut skip = false;
        assert!(reader.decode_video_frame(&ctx, &mut skip, 0));
        let mut skip = true;
        assert!(reader.decode_video_frame(&ctx, &mut skip, 0));
        assert!(!skip);
        let frames = drain_video(&ctx);
        assert_eq!(frames.len(), 2);
        assert!(frames[1].keyframe);
        assert_eq!(frames[1].start, 200_000);
    }

    #[test]
    fn test_seek_without_index_uses_estimate() {
        let ctx = ctx();
        let bytes = IndexedStreamWriter::new(16, 16, 25).audio(8000, 1).duration_secs(2.0).build();
        let mut reader = reader_for(bytes);
        reader.read_metadata(&ctx).unwrap();
        reader.seek(&ctx, 1_230_000, 0, 2_000_000, 0).unwrap();
        let frames = drain_video(&ctx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].end >= 1_230_000);
        assert!(frames[0].start <= 1_230_000);
        let chunk = ctx.pop_audio().unwrap();
        assert!(chunk.end() >= 1_230_000);
    }

    #[test]
    fn test_estimated_seek_backs_off_to_keyframe() {
        let ctx = ctx();
        let bytes = IndexedStreamWriter::new(64, 64, 25).keyframe_interval(25).duration_secs(2.0).build();
        let mut reader = reader_for(bytes);
        reader.read_metadata(&ctx).unwrap();
        reader.seek(&ctx, 1_500_000, 0, 2_000_000, 0).unwrap();
        let frames = drain_video(&ctx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].start <= 1_500_000 && frames[0].end >= 1_500_000);
        // 解码经过的关键帧记进了索引
        assert_eq!(reader.keyframes.range(..=1_500_000).next_back().map(|(pts, _)| *pts), Some(1_000_000));
    }

    #[test]
    fn test_overflowing_pts_is_rejected() {
        let ctx = ctx();
        let mut bytes = IndexedStreamWriter::new(16, 16, 25)
            .duration_secs(0.4)
            .declare_unknown_duration()
            .build();
        let header = PacketHeader {
            track_id: 1,
            keyframe: true,
            pts: i64::MAX - 10,
            duration: 40_000,
            size: 4,
        };
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        let mut reader = reader_for(bytes);
        let info = reader.read_metadata(&ctx).unwrap();
        assert_eq!(info.duration_us, Some(400_000));

        // 坏包当作轨道结束，前面的帧照常解码
        let mut skip = false;
        let mut decoded = 0;
        while reader.decode_video_frame(&ctx, &mut skip, 0) {
            decoded += drain_video(&ctx).len();
        }
        decoded += drain_video(&ctx).len();
        assert_eq!(decoded, 10);
    }

    #[test]
    fn test_seek_uses_known_keyframes() {
        let ctx = ctx();
        let bytes = IndexedStreamWriter::new(16, 16, 25).keyframe_interval(5).duration_secs(1.0).build();
        let mut reader = reader_for(bytes);
        reader.read_metadata(&ctx).unwrap();
        let mut skip = false;
        while reader.decode_video_frame(&ctx, &mut skip, 0) {
            drain_video(&ctx);
        }
        assert_eq!(reader.known_seek_point(500_000), reader.keyframes.get(&400_000).copied());
        reader.seek(&ctx, 500_000, 0, 1_000_000, 0).unwrap();
        let frames = drain_video(&ctx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].start, 480_000);
    }

    #[test]
    fn test_seek_past_end_restores_position() {
        let ctx = ctx();
        let bytes = IndexedStreamWriter::new(16, 16, 25).duration_secs(0.4).build();
        let mut reader = reader_for(bytes);
        reader.read_metadata(&ctx).unwrap();
        let mut skip = false;
        assert!(reader.decode_video_frame(&ctx, &mut skip, 0));
        drain_video(&ctx);
        assert!(reader.seek(&ctx, 5_000_000, 0, 400_000, 0).is_err());
        assert!(reader.decode_video_frame(&ctx, &mut skip, 0));
        assert_eq!(drain_video(&ctx)[0].start, 40_000);
    }

    #[test]
    fn test_corrupt_packet_is_skipped() {
        let ctx = ctx();
        let bytes = IndexedStreamWriter::new(16, 16, 25).corrupt_video_packet(1).duration_secs(0.2).build();
        let mut reader = reader_for(bytes);
        reader.read_metadata(&ctx).unwrap();
        let mut skip = false;
        while reader.decode_video_frame(&ctx, &mut skip, 0) {}
        let starts: Vec<i64> = drain_video(&ctx).iter().map(|f| f.start).collect();
        assert_eq!(starts, vec![0, 80_000, 120_000, 160_000]);
    }
}
