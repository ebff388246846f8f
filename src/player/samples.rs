// 生成测试 / 演示用的媒体流字节

use crate::player::codec::{FourCc, FOURCC_I420, FOURCC_S16L};
use crate::player::reader::indexed::{
    PacketHeader, TrackRecord, INDEXED_MAGIC, INDEXED_VERSION,
};
use crate::player::reader::raw::{RawVideoHeader, RAW_CODEC_ID, RAW_PACKET_ID};

const VIDEO_TRACK_ID: u8 = 1;
const AUDIO_TRACK_ID: u8 = 2;
const AUDIO_PACKET_MS: u64 = 40;

/// 第 n 帧的亮度值，便于在测试里辨认帧
pub fn frame_luma(n: u64) -> u8 {
    (16 + (n * 3) % 220) as u8
}

/// 原始 YUV 流
pub struct RawStreamWriter {
    header: RawVideoHeader,
    frames: u64,
}

impl RawStreamWriter {
    pub fn new(width: u32, height: u32, framerate_numerator: u32, framerate_denominator: u32) -> Self {
        Self::with_header(RawVideoHeader::yuv420(width, height, framerate_numerator, framerate_denominator))
    }

    pub fn with_header(header: RawVideoHeader) -> Self {
        Self { header, frames: 0 }
    }

    pub fn frames(mut self, frames: u64) -> Self {
        self.frames = frames;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.header.to_bytes().to_vec();
        let luma_len = self.header.frame_width as usize * self.header.frame_height as usize;
        let chroma_len = (self.header.frame_width / 2) as usize * (self.header.frame_height / 2) as usize;
        for n in 0..self.frames {
            out.push(RAW_PACKET_ID);
            out.extend_from_slice(&RAW_CODEC_ID);
            out.extend(std::iter::repeat(frame_luma(n)).take(luma_len));
            out.extend(std::iter::repeat(128u8).take(chroma_len * 2));
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct AudioSpec {
    rate: u32,
    channels: u16,
}

/// 交错分包容器；视频 I420，音频 S16L，按 pts 交错写出
pub struct IndexedStreamWriter {
    width: u32,
    height: u32,
    fps: u32,
    video: bool,
    video_codec: FourCc,
    audio: Option<AudioSpec>,
    duration_secs: f64,
    declare_duration: bool,
    keyframe_interval: u64,
    corrupt_video_packet: Option<u64>,
}

struct PendingPacket {
    header: PacketHeader,
    payload: Vec<u8>,
}

impl IndexedStreamWriter {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            video: true,
            video_codec: FOURCC_I420,
            audio: None,
            duration_secs: 0.4,
            declare_duration: true,
            keyframe_interval: 1,
            corrupt_video_packet: None,
        }
    }

    /// 只有音频轨道
    pub fn audio_only(rate: u32, channels: u16) -> Self {
        let mut writer = Self::new(0, 0, 1).audio(rate, channels);
        writer.video = false;
        writer
    }

    pub fn audio(mut self, rate: u32, channels: u16) -> Self {
        self.audio = Some(AudioSpec { rate, channels });
        self
    }

    pub fn video_codec(mut self, codec: FourCc) -> Self {
        self.video_codec = codec;
        self
    }

    pub fn duration_secs(mut self, secs: f64) -> Self {
        self.duration_secs = secs.max(0.0);
        self
    }

    /// 头部写 -1，让读取器扫描尾部
    pub fn declare_unknown_duration(mut self) -> Self {
        self.declare_duration = false;
        self
    }

    pub fn keyframe_interval(mut self, interval: u64) -> Self {
        self.keyframe_interval = interval.max(1);
        self
    }

    /// 第 n 个视频包少写一个字节
    pub fn corrupt_video_packet(mut self, n: u64) -> Self {
        self.corrupt_video_packet = Some(n);
        self
    }

    fn duration_us(&self) -> i64 {
        (self.duration_secs * 1_000_000.0).round() as i64
    }

    fn tracks(&self) -> Vec<TrackRecord> {
        let mut tracks = Vec::new();
        if self.video {
            tracks.push(TrackRecord::Video {
                track_id: VIDEO_TRACK_ID,
                codec: self.video_codec,
                width: self.width,
                height: self.height,
                aspect_numerator: 1,
                aspect_denominator: 1,
                picture: [0, 0, 0, 0],
            });
        }
        if let Some(audio) = self.audio {
            tracks.push(TrackRecord::Audio {
                track_id: AUDIO_TRACK_ID,
                codec: FOURCC_S16L,
                rate: audio.rate,
                channels: audio.channels,
                bits: 16,
            });
        }
        tracks
    }

    fn video_packets(&self) -> Vec<PendingPacket> {
        if !self.video {
            return Vec::new();
        }
        let fps = self.fps as i64;
        let count = (self.duration_secs * self.fps as f64).round() as u64;
        let luma_len = self.width as usize * self.height as usize;
        let chroma_len = self.width.div_ceil(2) as usize * self.height.div_ceil(2) as usize;
        (0..count)
            .map(|n| {
                let pts = n as i64 * 1_000_000 / fps;
                let end = (n as i64 + 1) * 1_000_000 / fps;
                let mut payload = vec![frame_luma(n); luma_len];
                payload.extend(std::iter::repeat(128u8).take(chroma_len * 2));
                if self.corrupt_video_packet == Some(n) {
                    payload.pop();
                }
                PendingPacket {
                    header: PacketHeader {
                        track_id: VIDEO_TRACK_ID,
                        keyframe: n % self.keyframe_interval == 0,
                        pts,
                        duration: (end - pts) as u32,
                        size: payload.len() as u32,
                    },
                    payload,
                }
            })
            .collect()
    }

    fn audio_packets(&self) -> Vec<PendingPacket> {
        let audio = match self.audio {
            Some(audio) if audio.rate > 0 && audio.channels > 0 => audio,
            _ => return Vec::new(),
        };
        let rate = audio.rate as u64;
        let total_frames = (self.duration_secs * audio.rate as f64).round() as u64;
        let frames_per_packet = (rate * AUDIO_PACKET_MS / 1000).max(1);
        let mut packets = Vec::new();
        let mut written = 0u64;
        while written < total_frames {
            let frames = frames_per_packet.min(total_frames - written);
            let pts = (written * 1_000_000 / rate) as i64;
            let end = ((written + frames) * 1_000_000 / rate) as i64;
            let mut payload = Vec::with_capacity((frames * audio.channels as u64 * 2) as usize);
            for i in 0..frames {
                // 锯齿波
                let sample = (((written + i) % 100) as i16 - 50) * 200;
                for _ in 0..audio.channels {
                    payload.extend_from_slice(&sample.to_le_bytes());
                }
            }
            packets.push(PendingPacket {
                header: PacketHeader {
                    track_id: AUDIO_TRACK_ID,
                    keyframe: true,
                    pts,
                    duration: (end - pts) as u32,
                    size: payload.len() as u32,
                },
                payload,
            });
            written += frames;
        }
        packets
    }

    pub fn build(&self) -> Vec<u8> {
        let tracks = self.tracks();
        let mut out = Vec::new();
        out.extend_from_slice(&INDEXED_MAGIC);
        out.push(INDEXED_VERSION);
        out.push(tracks.len() as u8);
        let declared: i64 = if self.declare_duration { self.duration_us() } else { -1 };
        out.extend_from_slice(&declared.to_le_bytes());
        for track in &tracks {
            out.extend_from_slice(&track.to_bytes());
        }

        // 按 pts 归并，同一时间视频在前
        let mut video = self.video_packets().into_iter().peekable();
        let mut audio = self.audio_packets().into_iter().peekable();
        loop {
            let take_video = match (video.peek(), audio.peek()) {
                (Some(v), Some(a)) => v.header.pts <= a.header.pts,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let packet = if take_video { video.next() } else { audio.next() };
            if let Some(packet) = packet {
                out.extend_from_slice(&packet.header.to_bytes());
                out.extend_from_slice(&packet.payload);
            }
        }
        out
    }
}
