use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use myy_pipeline::core::PipelineConfig;
use myy_pipeline::player::samples::IndexedStreamWriter;
use myy_pipeline::player::{
    ClockedAudioSink, DecoderRegistry, FileResource, MediaDecoder, MemoryResource, NullRenderer, PlayerEvent,
    Resource,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// 最长等待一个事件的时间，超过就认为管线卡住
const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "myy_pipeline")]
#[command(about = "多线程媒体播放管线：读取、解码并按时钟播放一个媒体文件")]
#[command(version)]
struct Args {
    /// 要播放的文件（raw YUV 或 IPKT 分包容器）
    #[arg(required_unless_present = "demo", conflicts_with = "demo")]
    input: Option<PathBuf>,

    /// 播放生成的演示片段
    #[arg(long)]
    demo: bool,

    /// 开始播放前 Seek 到的位置（秒）
    #[arg(long, value_name = "SECONDS", allow_negative_numbers = true)]
    seek: Option<f64>,

    /// 管线配置文件（JSON，缺省字段使用默认值）
    #[arg(short, long, value_name = "FILE", env = "MYY_PIPELINE_CONFIG")]
    config: Option<PathBuf>,
}

fn open_resource(args: &Args) -> Result<Arc<dyn Resource>> {
    match &args.input {
        Some(path) if !args.demo => {
            let resource = FileResource::open(path)
                .with_context(|| format!("打开文件失败 {}", path.display()))?;
            Ok(Arc::new(resource))
        }
        _ => {
            info!("🎞 使用生成的演示片段");
            let bytes = IndexedStreamWriter::new(64, 64, 25).audio(8000, 1).duration_secs(2.0).build();
            Ok(Arc::new(MemoryResource::from_bytes(bytes).with_name("demo")))
        }
    }
}

fn next_event(decoder: &MediaDecoder) -> Result<PlayerEvent> {
    decoder
        .events()
        .recv_timeout(EVENT_TIMEOUT)
        .map_err(|e| anyhow::anyhow!("等待播放事件超时: {}", e))
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 MYY Pipeline 启动");

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("加载配置失败 {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let registry = Arc::new(DecoderRegistry::with_builtin());
    let resource = open_resource(&args)?;
    let mut decoder = MediaDecoder::open(
        &registry,
        resource,
        None,
        Box::new(NullRenderer),
        Box::new(ClockedAudioSink::new()),
        config,
    )?;

    // 等元数据
    loop {
        match next_event(&decoder)? {
            PlayerEvent::MetadataLoaded(info) => {
                println!("{}", serde_json::to_string_pretty(&info)?);
                break;
            }
            PlayerEvent::Error(kind) => {
                decoder.shutdown();
                return Err(anyhow::anyhow!("读取元数据失败: {:?}", kind));
            }
            _ => {}
        }
    }

    if let Some(secs) = args.seek {
        decoder.seek(secs)?;
    }
    decoder.play();

    loop {
        match next_event(&decoder)? {
            PlayerEvent::Completed => {
                info!("✅ 播放完成");
                break;
            }
            PlayerEvent::Error(kind) => {
                decoder.shutdown();
                return Err(anyhow::anyhow!("播放出错: {:?}", kind));
            }
            PlayerEvent::Buffering(true) => warn!("⏳ 缓冲中..."),
            PlayerEvent::SeekCompleted(t) => info!("🎯 Seek 完成: {:.3}s", t),
            PlayerEvent::DurationChanged(d) => info!("⏱ 总时长: {:.3}s", d),
            _ => {}
        }
    }

    let buffered = decoder.buffered()?;
    println!("buffered: {}", serde_json::to_string(&buffered)?);
    println!("stats: {}", serde_json::to_string(&decoder.frame_statistics())?);
    decoder.shutdown();
    Ok(())
}
