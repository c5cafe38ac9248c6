//! 磁盘层（L2）/ Disk tier
//!
//! 每个指纹一个数据文件加一个 JSON 元数据旁文件。数据文件内容对外不透明；
//! 元数据记录 created_unix_ms / ttl_ms / size / crc32 / is_final，读取时校验。
//! 只有写入 L2 的条目能在进程重启后存活。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// 旁文件元数据
#[derive(Debug, Serialize, Deserialize)]
struct DiskMeta {
    created_unix_ms: i64,
    ttl_ms: u64,
    size: u64,
    crc32: u32,
    #[serde(default)]
    is_final: bool,
}

impl DiskMeta {
    fn expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.created_unix_ms) > self.ttl_ms as i64
    }

    fn remaining_ttl(&self, now_ms: i64) -> Duration {
        let remaining = self.created_unix_ms + self.ttl_ms as i64 - now_ms;
        Duration::from_millis(remaining.max(0) as u64)
    }
}

/// 磁盘缓存
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("创建缓存目录失败: {:?}", dir))?;
        Ok(Self { dir })
    }

    /// 指纹可能带有插件前缀（含冒号），统一转成安全文件名
    fn safe_name(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.cache", Self::safe_name(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", Self::safe_name(key)))
    }

    /// 读取条目；过期或校验失败都按未命中处理并清掉残留文件
    pub async fn load(&self, key: &str) -> Option<(Vec<u8>, Duration, bool)> {
        let meta_raw = tokio::fs::read(self.meta_path(key)).await.ok()?;
        let meta: DiskMeta = match serde_json::from_slice(&meta_raw) {
            Ok(m) => m,
            Err(e) => {
                warn!("缓存元数据损坏 {}: {}", key, e);
                self.remove(key).await;
                return None;
            }
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        if meta.expired(now_ms) {
            debug!("磁盘缓存过期: {}", key);
            self.remove(key).await;
            return None;
        }

        let data = match tokio::fs::read(self.data_path(key)).await {
            Ok(d) => d,
            Err(e) => {
                warn!("读取缓存数据失败 {}: {}", key, e);
                self.remove(key).await;
                return None;
            }
        };

        if data.len() as u64 != meta.size || crc32(&data) != meta.crc32 {
            warn!("缓存校验失败，丢弃: {}", key);
            self.remove(key).await;
            return None;
        }

        Some((data, meta.remaining_ttl(now_ms), meta.is_final))
    }

    /// 写入条目：先数据后元数据，元数据存在即认为数据完整
    pub async fn store(&self, key: &str, data: &[u8], ttl: Duration, is_final: bool) -> Result<()> {
        let meta = DiskMeta {
            created_unix_ms: chrono::Utc::now().timestamp_millis(),
            ttl_ms: ttl.as_millis() as u64,
            size: data.len() as u64,
            crc32: crc32(data),
            is_final,
        };

        tokio::fs::write(self.data_path(key), data)
            .await
            .with_context(|| format!("写入缓存数据失败: {}", key))?;
        tokio::fs::write(self.meta_path(key), serde_json::to_vec(&meta)?)
            .await
            .with_context(|| format!("写入缓存元数据失败: {}", key))?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.meta_path(key)).await;
        let _ = tokio::fs::remove_file(self.data_path(key)).await;
    }

    /// 清理过期条目，返回删除数量
    pub async fn sweep_expired(&self) -> Result<usize> {
        let mut removed = 0;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let Some(stem) = name.strip_suffix(".meta.json") else {
                continue;
            };

            let expired = match tokio::fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice::<DiskMeta>(&raw) {
                    Ok(meta) => meta.expired(now_ms),
                    // 解析不了的旁文件一并清掉
                    Err(_) => true,
                },
                Err(_) => continue,
            };

            if expired {
                let _ = tokio::fs::remove_file(&path).await;
                let _ = tokio::fs::remove_file(self.dir.join(format!("{}.cache", stem))).await;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// CRC32（IEEE，逐位实现，用于旁文件校验）
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}
