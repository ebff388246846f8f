use crate::core::{usecs_to_secs, ByteRange, Result, TimeRanges};
use crate::player::reader::BufferedSource;
use crate::player::resource::Resource;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    start_offset: u64,
    end_offset: u64,
    start_time: i64,
    end_time: i64,
}

/// 偏移 → 时间映射
///
/// 解码线程每解析一个包就记录一次；GetBuffered 把其中完全落在
/// 已缓存字节区间内、且首尾相接的包合并成时间区间
pub struct BufferedIndex {
    entries: Mutex<Vec<IndexEntry>>,
    resource: Arc<dyn Resource>,
}

impl BufferedIndex {
    pub fn new(resource: Arc<dyn Resource>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            resource,
        }
    }

    /// 记录一个包；同一偏移重复解析（Seek 之后）只保留一份
    pub fn record(&self, start_offset: u64, end_offset: u64, start_time: i64, end_time: i64) {
        if end_offset <= start_offset {
            return;
        }
        let entry = IndexEntry { start_offset, end_offset, start_time, end_time };
        let mut entries = self.entries.lock();
        match entries.binary_search_by_key(&start_offset, |e| e.start_offset) {
            Ok(_) => {}
            Err(pos) => entries.insert(pos, entry),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// 按字节区间计算连续的时间区间（微秒）
    fn time_ranges(&self, cached: &[ByteRange]) -> Vec<(i64, i64)> {
        let entries = self.entries.lock();
        let mut ranges = Vec::new();
        // (起始时间, 结束时间, 最后一个包的结束偏移)
        let mut run: Option<(i64, i64, u64)> = None;

        for entry in entries.iter() {
            let is_cached = cached
                .iter()
                .any(|r| r.contains_range(entry.start_offset, entry.end_offset));
            if !is_cached {
                if let Some((start, end, _)) = run.take() {
                    ranges.push((start, end));
                }
                continue;
            }
            run = match run {
                Some((start, end, last_end)) if entry.start_offset <= last_end => Some((
                    start.min(entry.start_time),
                    end.max(entry.end_time),
                    last_end.max(entry.end_offset),
                )),
                Some((start, end, _)) => {
                    ranges.push((start, end));
                    Some((entry.start_time, entry.end_time, entry.end_offset))
                }
                None => Some((entry.start_time, entry.end_time, entry.end_offset)),
            };
        }
        if let Some((start, end, _)) = run {
            ranges.push((start, end));
        }
        ranges
    }
}

impl BufferedSource for BufferedIndex {
    fn get_buffered(&self, start_time: i64) -> Result<TimeRanges> {
        let cached = self.resource.cached_ranges();
        let mut result = TimeRanges::new();
        for (start, end) in self.time_ranges(&cached) {
            let start = (start - start_time).max(0);
            let end = end - start_time;
            result.add(usecs_to_secs(start), usecs_to_secs(end));
        }
        result.normalize();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::resource::MemoryResource;

    #[test]
    fn test_empty_index_has_no_ranges() {
        let resource = Arc::new(MemoryResource::from_bytes(vec![0; 100]));
        let index = BufferedIndex::new(resource);
        assert!(index.get_buffered(0).unwrap().is_empty());
    }

    #[test]
    fn test_contiguous_packets_merge() {
        let resource = Arc::new(MemoryResource::from_bytes(vec![0; 100]));
        let index = BufferedIndex::new(resource);
        index.record(10, 40, 0, 100_000);
        index.record(40, 70, 100_000, 200_000);
        index.record(40, 70, 100_000, 200_000);
        assert_eq!(index.len(), 2);
        let ranges = index.get_buffered(0).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges.ranges()[0].start, 0.0);
        assert!((ranges.ranges()[0].end - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_gap_in_index_splits_ranges() {
        let resource = Arc::new(MemoryResource::from_bytes(vec![0; 200]));
        let index = BufferedIndex::new(resource);
        index.record(0, 10, 0, 1_000_000);
        index.record(100, 110, 5_000_000, 6_000_000);
        let ranges = index.get_buffered(0).unwrap();
        assert_eq!(ranges.len(), 2);
        assert!((ranges.ranges()[1].start - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_uncached_packets_are_excluded() {
        let resource = Arc::new(MemoryResource::streaming(None));
        resource.append(&[0; 50]);
        let index = BufferedIndex::new(resource.clone());
        index.record(0, 30, 0, 1_000_000);
        index.record(30, 60, 1_000_000, 2_000_000);
        let ranges = index.get_buffered(0).unwrap();
        assert_eq!(ranges.len(), 1);
        assert!((ranges.ranges()[0].end - 1.0).abs() < 1e-9);
        // 不解码时重复查询结果不变
        assert_eq!(index.get_buffered(0).unwrap(), ranges);
    }

    #[test]
    fn test_ranges_relative_to_start_time() {
        let resource = Arc::new(MemoryResource::from_bytes(vec![0; 100]));
        let index = BufferedIndex::new(resource);
        index.record(0, 10, 2_000_000, 3_000_000);
        let ranges = index.get_buffered(2_000_000).unwrap();
        assert_eq!(ranges.ranges()[0].start, 0.0);
        assert!((ranges.ranges()[0].end - 1.0).abs() < 1e-9);
    }
}
