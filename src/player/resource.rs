use crate::core::{ByteRange, PlayerError, Result};
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// 可寻址的媒体字节流
///
/// read/seek 只在解码线程调用；length / cached_ranges / close 可在任意线程调用
pub trait Resource: Send + Sync {
    /// 读取数据，返回 0 表示 EOF；数据尚未到达时阻塞
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// 定位，返回新的偏移
    fn seek(&self, pos: SeekFrom) -> Result<u64>;

    /// 当前读取偏移
    fn tell(&self) -> u64;

    /// 资源总长度（未知为 None）
    fn length(&self) -> Option<u64>;

    /// 已缓存（可无阻塞读取）的字节区间
    fn cached_ranges(&self) -> Vec<ByteRange>;

    /// 从 offset 到末尾是否都已缓存
    fn is_data_cached_to_end(&self, offset: u64) -> bool;

    /// 关闭资源，阻塞中的读取返回 ResourceClosed
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}

/// 读满缓冲；数据不足（EOF）返回 false
pub fn read_fully(resource: &dyn Resource, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = resource.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// 读取开头最多 len 个字节用于格式探测，读完回到 0
pub fn read_prefix(resource: &dyn Resource, len: usize) -> Result<Vec<u8>> {
    resource.seek(SeekFrom::Start(0))?;
    let mut prefix = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = resource.read(&mut prefix[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    prefix.truncate(filled);
    resource.seek(SeekFrom::Start(0))?;
    Ok(prefix)
}

/// offset 所在的已缓存区间里 offset 之后的字节数
pub fn cached_bytes_ahead(resource: &dyn Resource, offset: u64) -> u64 {
    resource
        .cached_ranges()
        .iter()
        .find(|r| r.start <= offset && offset < r.end)
        .map(|r| r.end - offset)
        .unwrap_or(0)
}

fn resolve_seek(pos: SeekFrom, current: u64, length: Option<u64>) -> Result<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => {
            let length = length
                .ok_or_else(|| PlayerError::SeekFailed("资源长度未知，无法从末尾定位".into()))?;
            length.checked_add_signed(delta)
        }
    };
    let target = target.ok_or_else(|| PlayerError::SeekFailed(format!("无效的定位: {:?}", pos)))?;
    if let Some(length) = length {
        if target > length {
            return Err(PlayerError::SeekFailed(format!("定位 {} 超出资源长度 {}", target, length)));
        }
    }
    Ok(target)
}

struct MemoryInner {
    data: Vec<u8>,
    position: u64,
    complete: bool,
    closed: bool,
    expected_length: Option<u64>,
}

/// 内存资源，可以边下载边追加（模拟网络下载）
pub struct MemoryResource {
    inner: Mutex<MemoryInner>,
    data_arrived: Condvar,
    name: String,
}

impl MemoryResource {
    /// 数据已全部就绪
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                data,
                position: 0,
                complete: true,
                closed: false,
                expected_length: None,
            }),
            data_arrived: Condvar::new(),
            name: "memory".to_string(),
        }
    }

    /// 空资源，数据通过 append 陆续到达
    pub fn streaming(expected_length: Option<u64>) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                data: Vec::new(),
                position: 0,
                complete: false,
                closed: false,
                expected_length,
            }),
            data_arrived: Condvar::new(),
            name: "memory-stream".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 追加下载到的数据
    pub fn append(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        inner.data.extend_from_slice(bytes);
        if let Some(expected) = inner.expected_length {
            if inner.data.len() as u64 >= expected {
                inner.complete = true;
            }
        }
        self.data_arrived.notify_all();
    }

    /// 下载结束
    pub fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.complete = true;
        debug!("📥 内存资源下载完成: {} 字节", inner.data.len());
        self.data_arrived.notify_all();
    }

    pub fn available(&self) -> u64 {
        self.inner.lock().data.len() as u64
    }
}

impl Resource for MemoryResource {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(PlayerError::ResourceClosed);
            }
            let available = inner.data.len() as u64;
            if inner.position < available {
                let start = inner.position as usize;
                let n = buf.len().min(inner.data.len() - start);
                buf[..n].copy_from_slice(&inner.data[start..start + n]);
                inner.position += n as u64;
                return Ok(n);
            }
            if inner.complete {
                return Ok(0);
            }
            self.data_arrived.wait(&mut inner);
        }
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PlayerError::ResourceClosed);
        }
        let length = if inner.complete {
            Some(inner.data.len() as u64)
        } else {
            inner.expected_length
        };
        let target = resolve_seek(pos, inner.position, length)?;
        inner.position = target;
        Ok(target)
    }

    fn tell(&self) -> u64 {
        self.inner.lock().position
    }

    fn length(&self) -> Option<u64> {
        let inner = self.inner.lock();
        if inner.complete {
            Some(inner.data.len() as u64)
        } else {
            inner.expected_length
        }
    }

    fn cached_ranges(&self) -> Vec<ByteRange> {
        let inner = self.inner.lock();
        if inner.data.is_empty() {
            Vec::new()
        } else {
            vec![ByteRange::new(0, inner.data.len() as u64)]
        }
    }

    fn is_data_cached_to_end(&self, offset: u64) -> bool {
        let inner = self.inner.lock();
        inner.complete && offset <= inner.data.len() as u64
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.data_arrived.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}

struct FileInner {
    file: File,
    position: u64,
}

/// 本地文件资源（整个文件视为已缓存）
pub struct FileResource {
    inner: Mutex<FileInner>,
    length: u64,
    closed: AtomicBool,
    path: String,
}

impl FileResource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)?;
        let length = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(FileInner { file, position: 0 }),
            length,
            closed: AtomicBool::new(false),
            path: path_ref.to_string_lossy().to_string(),
        })
    }
}

impl Resource for FileResource {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlayerError::ResourceClosed);
        }
        let mut inner = self.inner.lock();
        let n = inner.file.read(buf)?;
        inner.position += n as u64;
        Ok(n)
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlayerError::ResourceClosed);
        }
        let mut inner = self.inner.lock();
        let target = resolve_seek(pos, inner.position, Some(self.length))?;
        inner.file.seek(SeekFrom::Start(target))?;
        inner.position = target;
        Ok(target)
    }

    fn tell(&self) -> u64 {
        self.inner.lock().position
    }

    fn length(&self) -> Option<u64> {
        Some(self.length)
    }

    fn cached_ranges(&self) -> Vec<ByteRange> {
        if self.length == 0 {
            Vec::new()
        } else {
            vec![ByteRange::new(0, self.length)]
        }
    }

    fn is_data_cached_to_end(&self, _offset: u64) -> bool {
        true
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn description(&self) -> String {
        self.path.clone()
    }
}
