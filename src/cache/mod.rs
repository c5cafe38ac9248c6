//! 两级缓存 / Two-level cache
//!
//! L1 为分片内存缓存，L2 为磁盘文件。读路径 L1 → L2（命中回填 L1）；
//! 写路径走延迟批量写入器，优雅停机与强制刷新走同步的 set_both_levels。
//! 连续三次落盘失败后进入仅内存模式。

pub mod disk;
pub mod fingerprint;
pub mod memory;
pub mod writer;

pub use writer::DelayedBatchWriter;

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{CacheConfig, CACHE_SHARD_COUNT};
use disk::DiskCache;
use memory::ShardedMemoryCache;

/// 连续落盘失败多少次后切换仅内存模式
const DISK_FAILURE_TRIP: u32 = 3;

/// 两级缓存
pub struct TwoLevelCache {
    memory: ShardedMemoryCache,
    disk: Option<DiskCache>,
    consecutive_disk_failures: AtomicU32,
    memory_only: AtomicBool,
}

impl TwoLevelCache {
    pub async fn new(cfg: &CacheConfig) -> Result<Arc<Self>> {
        let disk = if cfg.enabled {
            Some(DiskCache::new(&cfg.path).await?)
        } else {
            None
        };

        Ok(Arc::new(Self {
            memory: ShardedMemoryCache::new(CACHE_SHARD_COUNT, cfg.max_entries),
            disk,
            consecutive_disk_failures: AtomicU32::new(0),
            memory_only: AtomicBool::new(false),
        }))
    }

    /// 读取：L1 未命中时尝试 L2，命中则按剩余 TTL 回填 L1
    pub async fn get(&self, key: &str) -> Option<(Vec<u8>, bool)> {
        if let Some(hit) = self.memory.get(key) {
            return Some(hit);
        }
        let disk = self.disk.as_ref()?;
        let (data, remaining, is_final) = disk.load(key).await?;
        self.memory.set(key, data.clone(), remaining, is_final);
        Some((data, is_final))
    }

    /// 只写 L1（L2 由批量写入器跟进）
    pub fn set_memory(&self, key: &str, data: Vec<u8>, ttl: Duration, is_final: bool) {
        self.memory.set(key, data, ttl, is_final);
    }

    /// 同步写两级（强制刷新与优雅停机路径）
    pub async fn set_both_levels(&self, key: &str, data: &[u8], ttl: Duration, is_final: bool) {
        self.memory.set(key, data.to_vec(), ttl, is_final);
        self.commit_disk(key, data, ttl, is_final).await;
    }

    /// 落盘，带失败计数；批量写入器与同步写共用此路径
    pub async fn commit_disk(&self, key: &str, data: &[u8], ttl: Duration, is_final: bool) {
        if self.memory_only.load(Ordering::Relaxed) {
            self.memory.mark_uncommitted(key);
            return;
        }
        let Some(disk) = self.disk.as_ref() else {
            return;
        };

        match disk.store(key, data, ttl, is_final).await {
            Ok(()) => {
                self.consecutive_disk_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                self.memory.mark_uncommitted(key);
                let failures = self.consecutive_disk_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("缓存落盘失败 ({}/{}) {}: {}", failures, DISK_FAILURE_TRIP, key, e);
                if failures >= DISK_FAILURE_TRIP && !self.memory_only.swap(true, Ordering::Relaxed)
                {
                    error!("连续 {} 次落盘失败，缓存进入仅内存模式", failures);
                }
            }
        }
    }

    /// 每小时清理一次过期的 L2 条目
    pub fn spawn_sweeper(self: &Arc<Self>) {
        if self.disk.is_none() {
            return;
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            // 第一次 tick 立即返回，跳过
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Some(disk) = cache.disk.as_ref() {
                    match disk.sweep_expired().await {
                        Ok(0) => {}
                        Ok(n) => info!("清理过期磁盘缓存 {} 条", n),
                        Err(e) => warn!("磁盘缓存清理失败: {}", e),
                    }
                }
            }
        });
    }

    pub fn is_memory_only(&self) -> bool {
        self.memory_only.load(Ordering::Relaxed)
    }

    pub fn memory_entries(&self) -> usize {
        self.memory.len()
    }

    pub fn disk(&self) -> Option<&DiskCache> {
        self.disk.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache_with_dir(path: &str) -> Arc<TwoLevelCache> {
        let cfg = CacheConfig {
            enabled: true,
            path: path.to_string(),
            ttl_hours: 1,
            max_entries: 100,
        };
        TwoLevelCache::new(&cfg).await.unwrap()
    }

    #[tokio::test]
    async fn test_rehydrate_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();

        // 第一个实例写两级
        let cache = cache_with_dir(&path).await;
        cache
            .set_both_levels("fp1", b"blob", Duration::from_secs(60), true)
            .await;

        // 新实例模拟重启：L1 为空，读取应命中 L2 并回填
        let restarted = cache_with_dir(&path).await;
        assert_eq!(restarted.memory_entries(), 0);
        let (data, is_final) = restarted.get("fp1").await.unwrap();
        assert_eq!(data, b"blob");
        assert!(is_final);
        assert_eq!(restarted.memory_entries(), 1);
    }

    #[tokio::test]
    async fn test_memory_only_after_repeated_disk_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        let cache = cache_with_dir(&path).await;

        // 删掉缓存目录让落盘必然失败
        drop(dir);
        for i in 0..3 {
            cache
                .commit_disk(&format!("k{}", i), b"x", Duration::from_secs(60), false)
                .await;
        }
        assert!(cache.is_memory_only());
    }

    #[tokio::test]
    async fn test_disabled_disk_still_serves_memory() {
        let cfg = CacheConfig {
            enabled: false,
            path: String::new(),
            ttl_hours: 1,
            max_entries: 100,
        };
        let cache = TwoLevelCache::new(&cfg).await.unwrap();
        cache
            .set_both_levels("k", b"v", Duration::from_secs(60), true)
            .await;
        assert!(cache.get("k").await.is_some());
        assert!(cache.disk().is_none());
    }
}
