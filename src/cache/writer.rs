//! 延迟批量写入器 / Delayed batch writer
//!
//! 把同一指纹在短时间内的多次写合并成一次落盘：200ms 窗口内同键只保留
//! 最新数据，final 写立即落盘，停机时同步排空队列。入队永不阻塞。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::TwoLevelCache;
use crate::config::BATCH_WRITE_WINDOW;

/// 凑满即提前刷盘的批量上限
const MAX_BATCH_KEYS: usize = 64;
const MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

enum Command {
    Write {
        key: String,
        data: Vec<u8>,
        ttl: Duration,
        is_final: bool,
    },
    Drain(oneshot::Sender<()>),
}

struct Pending {
    data: Vec<u8>,
    ttl: Duration,
    is_final: bool,
}

/// 批量写入器句柄
pub struct DelayedBatchWriter {
    tx: mpsc::UnboundedSender<Command>,
}

impl DelayedBatchWriter {
    pub fn new(cache: Arc<TwoLevelCache>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(cache, rx));
        Arc::new(Self { tx })
    }

    /// 非阻塞入队；同一键后写取代先写，is_final 触发该键立即落盘
    pub fn enqueue(&self, key: &str, data: Vec<u8>, ttl: Duration, is_final: bool) {
        let _ = self.tx.send(Command::Write {
            key: key.to_string(),
            data,
            ttl,
            is_final,
        });
    }

    /// 排空挂起的写入（优雅停机时调用，阻塞到全部落盘）
    pub async fn drain(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Drain(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run_writer(cache: Arc<TwoLevelCache>, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut pending: HashMap<String, Pending> = HashMap::new();
    let mut pending_bytes = 0usize;
    let mut window = tokio::time::interval(BATCH_WRITE_WINDOW);
    window.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Write { key, data, ttl, is_final }) => {
                    if let Some(old) = pending.get(&key) {
                        // 同键早写被取代，不会落盘
                        pending_bytes -= old.data.len();
                        debug!("批量写覆盖: {}", key);
                    }
                    pending_bytes += data.len();
                    pending.insert(key.clone(), Pending { data, ttl, is_final });

                    if is_final {
                        if let Some(p) = pending.remove(&key) {
                            pending_bytes -= p.data.len();
                            cache.commit_disk(&key, &p.data, p.ttl, p.is_final).await;
                        }
                    } else if pending.len() >= MAX_BATCH_KEYS || pending_bytes >= MAX_BATCH_BYTES {
                        flush_all(&cache, &mut pending, &mut pending_bytes).await;
                    }
                }
                Some(Command::Drain(ack)) => {
                    let count = pending.len();
                    flush_all(&cache, &mut pending, &mut pending_bytes).await;
                    if count > 0 {
                        info!("批量写入器排空 {} 条", count);
                    }
                    let _ = ack.send(());
                }
                None => {
                    flush_all(&cache, &mut pending, &mut pending_bytes).await;
                    break;
                }
            },
            _ = window.tick() => {
                if !pending.is_empty() {
                    flush_all(&cache, &mut pending, &mut pending_bytes).await;
                }
            }
        }
    }
}

async fn flush_all(
    cache: &TwoLevelCache,
    pending: &mut HashMap<String, Pending>,
    pending_bytes: &mut usize,
) {
    for (key, p) in pending.drain() {
        cache.commit_disk(&key, &p.data, p.ttl, p.is_final).await;
    }
    *pending_bytes = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    async fn test_cache(dir: &std::path::Path) -> Arc<TwoLevelCache> {
        let cfg = CacheConfig {
            enabled: true,
            path: dir.to_string_lossy().to_string(),
            ttl_hours: 1,
            max_entries: 100,
        };
        TwoLevelCache::new(&cfg).await.unwrap()
    }

    #[tokio::test]
    async fn test_last_write_wins_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path()).await;
        let writer = DelayedBatchWriter::new(cache.clone());

        writer.enqueue("k", b"v1".to_vec(), Duration::from_secs(60), false);
        writer.enqueue("k", b"v2".to_vec(), Duration::from_secs(60), false);
        tokio::time::sleep(BATCH_WRITE_WINDOW + Duration::from_millis(100)).await;

        let (data, _, _) = cache.disk().unwrap().load("k").await.unwrap();
        assert_eq!(data, b"v2");
    }

    #[tokio::test]
    async fn test_final_flushes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path()).await;
        let writer = DelayedBatchWriter::new(cache.clone());

        writer.enqueue("k", b"done".to_vec(), Duration::from_secs(60), true);
        // 远小于批量窗口
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (data, _, is_final) = cache.disk().unwrap().load("k").await.unwrap();
        assert_eq!(data, b"done");
        assert!(is_final);
    }

    #[tokio::test]
    async fn test_drain_flushes_pending() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path()).await;
        let writer = DelayedBatchWriter::new(cache.clone());

        writer.enqueue("a", b"1".to_vec(), Duration::from_secs(60), false);
        writer.enqueue("b", b"2".to_vec(), Duration::from_secs(60), false);
        writer.drain().await;

        assert!(cache.disk().unwrap().load("a").await.is_some());
        assert!(cache.disk().unwrap().load("b").await.is_some());
    }
}
