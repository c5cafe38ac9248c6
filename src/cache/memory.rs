//! 内存层（L1）/ Memory tier
//!
//! 按指纹分片的内存缓存。分片数是 2 的幂，每个分片独立加锁，任何路径上
//! 同时只持有一个分片锁。淘汰策略为命中次数 × 近因权重的混合。

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// L1 条目
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub data: Vec<u8>,
    pub created: Instant,
    pub ttl: Duration,
    pub last_access: Instant,
    pub hits: u64,
    pub is_final: bool,
    /// 磁盘写入失败后保留在内存中的标记
    pub uncommitted: bool,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.created.elapsed() > self.ttl
    }

    /// 淘汰权重：命中越多、访问越近，越不容易被淘汰
    fn retain_score(&self) -> f64 {
        (self.hits + 1) as f64 / (1.0 + self.last_access.elapsed().as_secs_f64())
    }
}

/// 分片内存缓存
pub struct ShardedMemoryCache {
    shards: Vec<Mutex<HashMap<String, MemoryEntry>>>,
    shard_mask: usize,
    capacity_per_shard: usize,
}

impl ShardedMemoryCache {
    /// shard_count 必须是 2 的幂
    pub fn new(shard_count: usize, max_entries: usize) -> Self {
        assert!(shard_count.is_power_of_two(), "分片数必须是 2 的幂");
        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            shard_mask: shard_count - 1,
            capacity_per_shard: (max_entries / shard_count).max(1),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, MemoryEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }

    /// 读取；过期条目惰性删除
    pub fn get(&self, key: &str) -> Option<(Vec<u8>, bool)> {
        let mut shard = self.shard(key).lock();
        match shard.get_mut(key) {
            Some(entry) if entry.expired() => {
                shard.remove(key);
                None
            }
            Some(entry) => {
                entry.hits += 1;
                entry.last_access = Instant::now();
                Some((entry.data.clone(), entry.is_final))
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, data: Vec<u8>, ttl: Duration, is_final: bool) {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();
        shard.insert(
            key.to_string(),
            MemoryEntry {
                data,
                created: now,
                ttl,
                last_access: now,
                hits: 0,
                is_final,
                uncommitted: false,
            },
        );

        if shard.len() > self.capacity_per_shard {
            // 先清过期的，再按权重淘汰
            shard.retain(|_, e| !e.expired());
            while shard.len() > self.capacity_per_shard {
                let victim = shard
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .min_by(|(_, a), (_, b)| {
                        a.retain_score()
                            .partial_cmp(&b.retain_score())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(k) => {
                        shard.remove(&k);
                    }
                    None => break,
                }
            }
        }
    }

    /// 磁盘提交失败时标记，等待下一次写入重试或仅内存模式
    pub fn mark_uncommitted(&self, key: &str) {
        if let Some(entry) = self.shard(key).lock().get_mut(key) {
            entry.uncommitted = true;
        }
    }

    pub fn remove(&self, key: &str) {
        self.shard(key).lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let cache = ShardedMemoryCache::new(16, 100);
        cache.set("k1", b"hello".to_vec(), Duration::from_secs(60), true);
        let (data, is_final) = cache.get("k1").unwrap();
        assert_eq!(data, b"hello");
        assert!(is_final);
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_ttl_lazy_expiry() {
        let cache = ShardedMemoryCache::new(2, 100);
        cache.set("k1", b"x".to_vec(), Duration::from_millis(0), false);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k1").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_eviction_prefers_cold_entries() {
        // 单分片便于断言
        let cache = ShardedMemoryCache::new(1, 2);
        cache.set("hot", b"a".to_vec(), Duration::from_secs(60), true);
        cache.set("cold", b"b".to_vec(), Duration::from_secs(60), true);
        // 热条目多次命中
        for _ in 0..5 {
            cache.get("hot");
        }
        cache.set("new", b"c".to_vec(), Duration::from_secs(60), true);
        assert!(cache.get("hot").is_some(), "高命中条目不应被淘汰");
        assert!(cache.get("cold").is_none(), "低权重条目应先被淘汰");
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn test_overwrite_same_key() {
        let cache = ShardedMemoryCache::new(4, 10);
        cache.set("k", b"v1".to_vec(), Duration::from_secs(60), false);
        cache.set("k", b"v2".to_vec(), Duration::from_secs(60), true);
        let (data, is_final) = cache.get("k").unwrap();
        assert_eq!(data, b"v2");
        assert!(is_final);
    }
}
