use crate::core::types::{DecodedAudioChunk, DecodedVideoFrame};
use std::collections::VecDeque;

/// 带时间戳的队列元素
pub trait Timestamped {
    fn start_time(&self) -> i64;
    fn end_time(&self) -> i64;
}

impl Timestamped for DecodedVideoFrame {
    fn start_time(&self) -> i64 {
        self.start
    }

    fn end_time(&self) -> i64 {
        self.end
    }
}

impl Timestamped for DecodedAudioChunk {
    fn start_time(&self) -> i64 {
        self.start
    }

    fn end_time(&self) -> i64 {
        self.end()
    }
}

/// push 被拒绝的原因，元素原样退回
#[derive(Debug)]
pub enum PushError<T> {
    /// 队列已满
    Full(T),
    /// 开始时间早于队尾
    OutOfOrder(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::OutOfOrder(item) => item,
        }
    }
}

/// 有界、按开始时间排序的帧队列
///
/// 自身不加锁，所有访问都在 Monitor 内进行；阻塞式的 push 见 DecodeContext
#[derive(Debug)]
pub struct FrameQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    finished: bool,
}

impl<T: Timestamped> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            finished: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// 追加到队尾；满或时间倒退时拒绝
    pub fn push(&mut self, item: T) -> Result<(), PushError<T>> {
        if self.is_full() {
            return Err(PushError::Full(item));
        }
        if let Some(last) = self.items.back() {
            if item.start_time() < last.start_time() {
                return Err(PushError::OutOfOrder(item));
            }
        }
        self.items.push_back(item);
        Ok(())
    }

    /// 放回队首（进入缓冲时退回刚取出的帧），不受容量限制
    pub fn push_front(&mut self, item: T) -> Result<(), PushError<T>> {
        if let Some(first) = self.items.front() {
            if item.start_time() > first.start_time() {
                return Err(PushError::OutOfOrder(item));
            }
        }
        self.items.push_front(item);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn peek_front(&self) -> Option<&T> {
        self.items.front()
    }

    /// 清空队列并重置结束标记
    pub fn erase(&mut self) {
        self.items.clear();
        self.finished = false;
    }

    /// 标记生产者不会再推入数据
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 已结束且已取空
    pub fn at_end_of_stream(&self) -> bool {
        self.finished && self.items.is_empty()
    }

    /// 队尾开始时间 - 队首开始时间（微秒）
    pub fn duration(&self) -> i64 {
        match (self.items.front(), self.items.back()) {
            (Some(first), Some(last)) => last.start_time() - first.start_time(),
            _ => 0,
        }
    }

    /// 队首到队尾结束时间的跨度（微秒）
    pub fn span(&self) -> i64 {
        match (self.items.front(), self.items.back()) {
            (Some(first), Some(last)) => last.end_time() - first.start_time(),
            _ => 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Item(i64);

    impl Timestamped for Item {
        fn start_time(&self) -> i64 {
            self.0
        }

        fn end_time(&self) -> i64 {
            self.0 + 10
        }
    }

    #[test]
    fn test_push_rejects_when_full() {
        let mut queue = FrameQueue::new(2);
        queue.push(Item(0)).unwrap();
        queue.push(Item(10)).unwrap();
        assert!(queue.is_full());
        match queue.push(Item(20)) {
            Err(PushError::Full(item)) => assert_eq!(item, Item(20)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.pop_front(), Some(Item(0)));
        assert!(queue.push(Item(20)).is_ok());
    }

    #[test]
    fn test_push_rejects_out_of_order() {
        let mut queue = FrameQueue::new(4);
        queue.push(Item(10)).unwrap();
        queue.push(Item(10)).unwrap();
        assert!(matches!(queue.push(Item(5)), Err(PushError::OutOfOrder(_))));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_duration_and_span() {
        let mut queue = FrameQueue::new(4);
        assert_eq!(queue.duration(), 0);
        queue.push(Item(0)).unwrap();
        queue.push(Item(30)).unwrap();
        assert_eq!(queue.duration(), 30);
        assert_eq!(queue.span(), 40);
    }

    #[test]
    fn test_finish_and_erase() {
        let mut queue = FrameQueue::new(4);
        queue.push(Item(0)).unwrap();
        queue.finish();
        assert!(queue.is_finished());
        assert!(!queue.at_end_of_stream());
        queue.pop_front();
        assert!(queue.at_end_of_stream());
        queue.erase();
        assert!(!queue.is_finished());
    }

    #[test]
    fn test_push_front_returns_frame() {
        let mut queue = FrameQueue::new(1);
        queue.push(Item(10)).unwrap();
        let item = queue.pop_front().unwrap();
        queue.push(Item(20)).unwrap();
        queue.push_front(item).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek_front(), Some(&Item(10)));
        assert!(matches!(queue.push_front(Item(30)), Err(PushError::OutOfOrder(_))));
    }
}
