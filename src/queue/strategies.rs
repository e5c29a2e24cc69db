//! # 队列后端实现
//!
//! 可选的内部结构：优先级堆、先进先出、按提供商轮流。构造时选定一次，
//! 工作协程只通过统一接口取条目。

use super::types::{QueuedRequest, QueueStrategy};
use crate::types::RequestPriority;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::time::Instant;

/// 队列后端接口
pub trait QueueBackend: Send {
    /// 入队
    fn push(&mut self, item: QueuedRequest);

    /// 取下一个待处理条目（按策略定义的顺序）
    fn pop(&mut self) -> Option<QueuedRequest>;

    /// 按ID移除仍在排队的条目
    fn remove(&mut self, id: &str) -> Option<QueuedRequest>;

    /// 取出所有已超时的条目
    fn take_expired(&mut self, now: Instant) -> Vec<QueuedRequest>;

    /// 排队条目数
    fn len(&self) -> usize;

    /// 是否为空
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空并返回所有条目
    fn drain_all(&mut self) -> Vec<QueuedRequest>;
}

/// 创建队列后端
#[must_use]
pub fn create_backend(strategy: QueueStrategy) -> Box<dyn QueueBackend> {
    match strategy {
        QueueStrategy::Priority => Box::new(PriorityBackend::new()),
        QueueStrategy::Fifo => Box::new(FifoBackend::new()),
        QueueStrategy::ProviderRoundRobin => Box::new(ProviderRoundRobinBackend::new()),
    }
}

/// 优先级键：高优先级在前，同级低序号（更早提交）在前
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    priority: Reverse<RequestPriority>,
    seq: u64,
}

impl PriorityKey {
    const fn of(item: &QueuedRequest) -> Self {
        Self {
            priority: Reverse(item.priority),
            seq: item.seq,
        }
    }
}

/// 优先级堆后端
pub struct PriorityBackend {
    entries: BTreeMap<PriorityKey, QueuedRequest>,
    index: HashMap<String, PriorityKey>,
}

impl PriorityBackend {
    /// 创建优先级后端
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
        }
    }
}

impl Default for PriorityBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueBackend for PriorityBackend {
    fn push(&mut self, item: QueuedRequest) {
        let key = PriorityKey::of(&item);
        self.index.insert(item.id.clone(), key);
        self.entries.insert(key, item);
    }

    fn pop(&mut self) -> Option<QueuedRequest> {
        let (_, item) = self.entries.pop_first()?;
        self.index.remove(&item.id);
        Some(item)
    }

    fn remove(&mut self, id: &str) -> Option<QueuedRequest> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    fn take_expired(&mut self, now: Instant) -> Vec<QueuedRequest> {
        let expired_keys: Vec<PriorityKey> = self
            .entries
            .iter()
            .filter(|(_, item)| item.is_expired(now))
            .map(|(key, _)| *key)
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|key| {
                let item = self.entries.remove(&key)?;
                self.index.remove(&item.id);
                Some(item)
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn drain_all(&mut self) -> Vec<QueuedRequest> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

/// 先进先出后端
pub struct FifoBackend {
    entries: VecDeque<QueuedRequest>,
}

impl FifoBackend {
    /// 创建FIFO后端
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl Default for FifoBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueBackend for FifoBackend {
    fn push(&mut self, item: QueuedRequest) {
        self.entries.push_back(item);
    }

    fn pop(&mut self) -> Option<QueuedRequest> {
        self.entries.pop_front()
    }

    fn remove(&mut self, id: &str) -> Option<QueuedRequest> {
        let position = self.entries.iter().position(|item| item.id == id)?;
        self.entries.remove(position)
    }

    fn take_expired(&mut self, now: Instant) -> Vec<QueuedRequest> {
        let mut expired = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.entries.len());
        for item in self.entries.drain(..) {
            if item.is_expired(now) {
                expired.push(item);
            } else {
                remaining.push_back(item);
            }
        }
        self.entries = remaining;
        expired
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn drain_all(&mut self) -> Vec<QueuedRequest> {
        self.entries.drain(..).collect()
    }
}

/// 按提供商轮流的后端
///
/// 每个提供商一条 FIFO 子队列，轮流从各队列头部取条目，
/// 避免单一提供商的积压饿死其它提供商。
pub struct ProviderRoundRobinBackend {
    queues: HashMap<String, VecDeque<QueuedRequest>>,
    rotation: VecDeque<String>,
}

impl ProviderRoundRobinBackend {
    /// 创建轮流后端
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            rotation: VecDeque::new(),
        }
    }
}

impl Default for ProviderRoundRobinBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueBackend for ProviderRoundRobinBackend {
    fn push(&mut self, item: QueuedRequest) {
        let provider = item.request.provider.as_str().to_string();
        if !self.queues.contains_key(&provider) {
            self.rotation.push_back(provider.clone());
        }
        self.queues.entry(provider).or_default().push_back(item);
    }

    fn pop(&mut self) -> Option<QueuedRequest> {
        for _ in 0..self.rotation.len() {
            let provider = self.rotation.pop_front()?;
            let item = self.queues.get_mut(&provider).and_then(VecDeque::pop_front);
            self.rotation.push_back(provider);
            if item.is_some() {
                return item;
            }
        }
        None
    }

    fn remove(&mut self, id: &str) -> Option<QueuedRequest> {
        for queue in self.queues.values_mut() {
            if let Some(position) = queue.iter().position(|item| item.id == id) {
                return queue.remove(position);
            }
        }
        None
    }

    fn take_expired(&mut self, now: Instant) -> Vec<QueuedRequest> {
        let mut expired = Vec::new();
        for queue in self.queues.values_mut() {
            let mut remaining = VecDeque::with_capacity(queue.len());
            for item in queue.drain(..) {
                if item.is_expired(now) {
                    expired.push(item);
                } else {
                    remaining.push_back(item);
                }
            }
            *queue = remaining;
        }
        expired
    }

    fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn drain_all(&mut self) -> Vec<QueuedRequest> {
        let mut all = Vec::new();
        for queue in self.queues.values_mut() {
            all.extend(queue.drain(..));
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GatewayRequest, HttpMethod};
    use std::time::Duration;

    fn item(provider: &str, priority: RequestPriority, seq: u64) -> QueuedRequest {
        let request = GatewayRequest::new(provider.into(), HttpMethod::Get, "/x");
        QueuedRequest {
            id: format!("{provider}-{seq}"),
            request,
            priority,
            submitted_at: Instant::now(),
            timeout: Duration::from_secs(30),
            retry_count: 0,
            max_retries: 0,
            seq,
            result_tx: None,
        }
    }

    #[tokio::test]
    async fn test_priority_backend_orders_by_priority_then_submission() {
        let mut backend = PriorityBackend::new();
        backend.push(item("a", RequestPriority::Low, 1));
        backend.push(item("a", RequestPriority::Urgent, 2));
        backend.push(item("a", RequestPriority::Normal, 3));
        backend.push(item("a", RequestPriority::Urgent, 4));

        assert_eq!(backend.pop().unwrap().id, "a-2");
        assert_eq!(backend.pop().unwrap().id, "a-4");
        assert_eq!(backend.pop().unwrap().id, "a-3");
        assert_eq!(backend.pop().unwrap().id, "a-1");
        assert!(backend.pop().is_none());
    }

    #[tokio::test]
    async fn test_priority_backend_remove_by_id() {
        let mut backend = PriorityBackend::new();
        backend.push(item("a", RequestPriority::Normal, 1));
        backend.push(item("a", RequestPriority::Normal, 2));

        assert!(backend.remove("a-1").is_some());
        assert!(backend.remove("a-1").is_none());
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.pop().unwrap().id, "a-2");
    }

    #[tokio::test]
    async fn test_fifo_backend_preserves_submission_order() {
        let mut backend = FifoBackend::new();
        backend.push(item("a", RequestPriority::Urgent, 1));
        backend.push(item("a", RequestPriority::Low, 2));

        // FIFO 忽略优先级
        assert_eq!(backend.pop().unwrap().id, "a-1");
        assert_eq!(backend.pop().unwrap().id, "a-2");
    }

    #[tokio::test]
    async fn test_round_robin_backend_alternates_providers() {
        let mut backend = ProviderRoundRobinBackend::new();
        backend.push(item("a", RequestPriority::Normal, 1));
        backend.push(item("a", RequestPriority::Normal, 2));
        backend.push(item("b", RequestPriority::Normal, 3));

        let first = backend.pop().unwrap();
        let second = backend.pop().unwrap();
        assert_ne!(
            first.request.provider, second.request.provider,
            "consecutive pops should alternate providers"
        );
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_expired_across_backends() {
        for strategy in [
            QueueStrategy::Priority,
            QueueStrategy::Fifo,
            QueueStrategy::ProviderRoundRobin,
        ] {
            let mut backend = create_backend(strategy);
            let mut short = item("a", RequestPriority::Normal, 1);
            short.timeout = Duration::from_secs(1);
            backend.push(short);
            backend.push(item("a", RequestPriority::Normal, 2));

            tokio::time::advance(Duration::from_secs(2)).await;
            let expired = backend.take_expired(Instant::now());
            assert_eq!(expired.len(), 1, "strategy {}", strategy.as_str());
            assert_eq!(backend.len(), 1);
        }
    }
}
