//! 异步插件基座 / Base async plugin
//!
//! 所有站点插件共享的机制：响应预算内先答、后台继续补全。具体插件只提供
//! 一个"对一个关键词做实际抓取"的回调（SearchFetcher）。
//!
//! 单个指纹的任务状态机：Idle → Running → (Final | Partial)；
//! Partial → RefreshScheduled → Running → …。观察到 Final 或超过最大
//! 存活时间后终止。

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{filter_recognized_ext, ExtKeySpec, PluginSearchResult, SearchPlugin};
use crate::config::{self, PLUGIN_CACHE_TTL, PLUGIN_STALE_THRESHOLD, TASK_MAX_LIFETIME};
use crate::models::{ExtMap, SearchResult};

/// 写透主缓存的注入函数：(键, 数据, TTL, 是否最终)
pub type MainCacheUpdater = Arc<dyn Fn(String, Vec<u8>, Duration, bool) + Send + Sync>;

/// 插件缓存与主缓存构造顺序相反，用单次注入解环
static MAIN_CACHE_UPDATER: OnceCell<MainCacheUpdater> = OnceCell::new();

/// 启动时注入一次主缓存更新函数
pub fn set_main_cache_updater(updater: MainCacheUpdater) {
    if MAIN_CACHE_UPDATER.set(updater).is_err() {
        warn!("主缓存更新函数重复注入，保留首次注入的版本");
    }
}

/// 频道抓取器共用同一条写透路径
pub(crate) fn main_cache_updater() -> Option<&'static MainCacheUpdater> {
    MAIN_CACHE_UPDATER.get()
}

/// 具体插件提供的抓取回调
#[async_trait]
pub trait SearchFetcher: Send + Sync {
    async fn fetch(&self, keyword: &str, ext: &ExtMap) -> Result<Vec<SearchResult>>;
}

/// 双重检查缓存里的一次抓取成果
struct CacheBurst {
    results: Vec<SearchResult>,
    fetched_at: Instant,
    is_final: bool,
}

impl CacheBurst {
    fn expired(&self) -> bool {
        self.fetched_at.elapsed() > PLUGIN_CACHE_TTL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskPhase {
    Running,
    Partial,
    RefreshScheduled,
    Final,
}

struct FingerprintState {
    phase: TaskPhase,
    born: Instant,
}

struct BackgroundTask {
    fingerprint: String,
    keyword: String,
    ext: ExtMap,
}

struct PluginInner {
    name: String,
    priority: i32,
    ext_keys: &'static [ExtKeySpec],
    fetcher: Arc<dyn SearchFetcher>,
    /// 双重检查缓存：指纹 → 最近一次抓取
    cache: Mutex<HashMap<String, CacheBurst>>,
    /// 指纹任务状态机
    states: Mutex<HashMap<String, FingerprintState>>,
    /// 在途指纹，同指纹同时只允许一个抓取
    in_flight: Mutex<HashSet<String>>,
    /// 后台刷新队列（有界；同指纹旧任务先被顶掉）
    queue: Mutex<VecDeque<BackgroundTask>>,
    queue_notify: Notify,
    failure_count: AtomicU64,
    /// 内联抓取预算
    budget: Duration,
    max_tasks: usize,
    /// 写透主缓存时的 TTL
    write_through_ttl: Duration,
}

/// 包着共享机制的插件；具体站点只注入 SearchFetcher
pub struct AsyncPlugin {
    inner: Arc<PluginInner>,
}

impl AsyncPlugin {
    /// 按全局配置构造（需在 tokio 运行时内，会启动后台工人）
    pub fn new(
        name: &str,
        priority: i32,
        ext_keys: &'static [ExtKeySpec],
        fetcher: Arc<dyn SearchFetcher>,
    ) -> Self {
        let cfg = config::config();
        Self::with_budget(
            name,
            priority,
            ext_keys,
            fetcher,
            cfg.plugin_budget(),
            cfg.plugin.max_background_workers,
            cfg.plugin.max_background_tasks,
            cfg.final_ttl(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_budget(
        name: &str,
        priority: i32,
        ext_keys: &'static [ExtKeySpec],
        fetcher: Arc<dyn SearchFetcher>,
        budget: Duration,
        workers: usize,
        max_tasks: usize,
        write_through_ttl: Duration,
    ) -> Self {
        let inner = Arc::new(PluginInner {
            name: name.to_string(),
            priority,
            ext_keys,
            fetcher,
            cache: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            failure_count: AtomicU64::new(0),
            budget,
            max_tasks,
            write_through_ttl,
        });
        for _ in 0..workers.max(1) {
            tokio::spawn(worker_loop(inner.clone()));
        }
        Self { inner }
    }

    /// 累计抓取失败次数（只记数，不熔断）
    pub fn failure_count(&self) -> u64 {
        self.inner.failure_count.load(Ordering::Relaxed)
    }
}

async fn worker_loop(inner: Arc<PluginInner>) {
    loop {
        let task = loop {
            let notified = inner.queue_notify.notified();
            if let Some(task) = inner.queue.lock().pop_front() {
                break task;
            }
            notified.await;
        };
        inner.run_background(task).await;
    }
}

impl PluginInner {
    /// 插件内部指纹：插件名 + 关键词 + 排序后的 ext
    fn fingerprint(&self, keyword: &str, ext: &ExtMap) -> String {
        let mut pairs: Vec<String> = ext.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.sort_unstable();
        format!(
            "{:x}",
            md5::compute(format!("{}|{}|{}", self.name, keyword.trim(), pairs.join(",")))
        )
    }

    fn dedicated_cache_key(&self, fingerprint: &str) -> String {
        format!("plugin:{}:{}", self.name, fingerprint)
    }

    fn try_begin_flight(&self, fingerprint: &str) -> bool {
        self.in_flight.lock().insert(fingerprint.to_string())
    }

    fn end_flight(&self, fingerprint: &str) {
        self.in_flight.lock().remove(fingerprint);
    }

    fn set_phase(&self, fingerprint: &str, phase: TaskPhase) {
        let mut states = self.states.lock();
        states.retain(|_, s| s.born.elapsed() < TASK_MAX_LIFETIME * 2);
        states
            .entry(fingerprint.to_string())
            .and_modify(|s| s.phase = phase)
            .or_insert(FingerprintState {
                phase,
                born: Instant::now(),
            });
    }

    /// Final 或超过最大存活时间即终止，不再调度刷新
    fn is_terminal(&self, fingerprint: &str) -> bool {
        match self.states.lock().get(fingerprint) {
            Some(s) => s.phase == TaskPhase::Final || s.born.elapsed() > TASK_MAX_LIFETIME,
            None => false,
        }
    }

    fn record_failure(&self, err: &anyhow::Error) {
        let n = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("插件 {} 抓取失败（累计 {} 次）: {}", self.name, n, err);
    }

    /// 合并入缓存、推进状态机、写透主缓存；返回合并后的结果集
    fn commit_results(
        &self,
        fingerprint: &str,
        results: Vec<SearchResult>,
        is_final: bool,
    ) -> Vec<SearchResult> {
        let merged = {
            let mut cache = self.cache.lock();
            let old = cache
                .remove(fingerprint)
                .map(|b| b.results)
                .unwrap_or_default();
            let merged = merge_result_sets(old, results);
            cache.insert(
                fingerprint.to_string(),
                CacheBurst {
                    results: merged.clone(),
                    fetched_at: Instant::now(),
                    is_final,
                },
            );
            merged
        };

        self.set_phase(
            fingerprint,
            if is_final { TaskPhase::Final } else { TaskPhase::Partial },
        );
        self.end_flight(fingerprint);

        if let Some(updater) = main_cache_updater() {
            match serde_json::to_vec(&merged) {
                Ok(bytes) => updater(
                    self.dedicated_cache_key(fingerprint),
                    bytes,
                    self.write_through_ttl,
                    is_final,
                ),
                Err(e) => warn!("插件 {} 结果序列化失败: {}", self.name, e),
            }
        }

        merged
    }

    fn enqueue_refresh(&self, fingerprint: &str, keyword: &str, ext: &ExtMap) {
        if self.is_terminal(fingerprint) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            // 溢出策略：同指纹的旧任务先丢弃
            queue.retain(|t| t.fingerprint != fingerprint);
            if queue.len() >= self.max_tasks {
                warn!("插件 {} 后台队列已满，放弃刷新: {}", self.name, fingerprint);
                return;
            }
            queue.push_back(BackgroundTask {
                fingerprint: fingerprint.to_string(),
                keyword: keyword.to_string(),
                ext: ext.clone(),
            });
        }
        self.set_phase(fingerprint, TaskPhase::RefreshScheduled);
        self.queue_notify.notify_one();
    }

    async fn run_background(&self, task: BackgroundTask) {
        if self.is_terminal(&task.fingerprint) {
            return;
        }
        if !self.try_begin_flight(&task.fingerprint) {
            // 已有同指纹抓取在途
            return;
        }
        self.set_phase(&task.fingerprint, TaskPhase::Running);

        match self.fetcher.fetch(&task.keyword, &task.ext).await {
            Ok(results) => {
                debug!(
                    "插件 {} 后台刷新完成: {} 条 ({})",
                    self.name,
                    results.len(),
                    task.fingerprint
                );
                self.commit_results(&task.fingerprint, results, true);
            }
            Err(e) => {
                self.end_flight(&task.fingerprint);
                self.record_failure(&e);
            }
        }
    }
}

#[async_trait]
impl SearchPlugin for AsyncPlugin {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn priority(&self) -> i32 {
        self.inner.priority
    }

    fn recognized_ext_keys(&self) -> &'static [ExtKeySpec] {
        self.inner.ext_keys
    }

    async fn search(&self, keyword: &str, ext: &ExtMap) -> Result<Vec<SearchResult>> {
        Ok(self.search_with_result(keyword, ext).await?.results)
    }

    async fn search_with_result(&self, keyword: &str, ext: &ExtMap) -> Result<PluginSearchResult> {
        let inner = &self.inner;
        let ext = filter_recognized_ext(&inner.name, inner.ext_keys, ext);
        let fingerprint = inner.fingerprint(keyword, &ext);
        let cache_key = inner.dedicated_cache_key(&fingerprint);

        // 双重检查缓存
        let cached = {
            let cache = inner.cache.lock();
            cache.get(&fingerprint).map(|b| {
                (
                    b.results.clone(),
                    b.is_final,
                    b.fetched_at.elapsed(),
                    b.expired(),
                )
            })
        };
        if let Some((results, is_final, age, expired)) = cached {
            if is_final && !expired {
                return Ok(PluginSearchResult {
                    results,
                    is_final: true,
                    cache_key: Some(cache_key),
                });
            }
            // 过期条目（含过期的 final）重新走状态机
            if expired {
                inner.states.lock().remove(&fingerprint);
            }
            // 旧数据直接返回；过了陈旧阈值才调度后台刷新
            if age > PLUGIN_STALE_THRESHOLD {
                inner.enqueue_refresh(&fingerprint, keyword, &ext);
            }
            return Ok(PluginSearchResult {
                results,
                is_final: false,
                cache_key: Some(cache_key),
            });
        }

        // 未命中：同指纹只允许一个抓取在途，后到者立即拿空的部分结果
        if !inner.try_begin_flight(&fingerprint) {
            return Ok(PluginSearchResult {
                results: Vec::new(),
                is_final: false,
                cache_key: Some(cache_key),
            });
        }
        inner.set_phase(&fingerprint, TaskPhase::Running);

        let mut handle = tokio::spawn({
            let fetcher = inner.fetcher.clone();
            let keyword = keyword.to_string();
            let ext = ext.clone();
            async move { fetcher.fetch(&keyword, &ext).await }
        });

        match tokio::time::timeout(inner.budget, &mut handle).await {
            Ok(Ok(Ok(results))) => {
                let merged = inner.commit_results(&fingerprint, results, true);
                Ok(PluginSearchResult {
                    results: merged,
                    is_final: true,
                    cache_key: Some(cache_key),
                })
            }
            Ok(Ok(Err(e))) => {
                inner.end_flight(&fingerprint);
                inner.record_failure(&e);
                Err(e)
            }
            Ok(Err(join_err)) => {
                inner.end_flight(&fingerprint);
                Err(anyhow!("插件 {} 抓取任务异常退出: {}", inner.name, join_err))
            }
            Err(_) => {
                // 预算耗尽：返回部分结果，同一次抓取在后台继续跑完
                inner.set_phase(&fingerprint, TaskPhase::Partial);
                let watcher = inner.clone();
                let fp = fingerprint.clone();
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(results)) => {
                            watcher.commit_results(&fp, results, true);
                        }
                        Ok(Err(e)) => {
                            watcher.end_flight(&fp);
                            watcher.record_failure(&e);
                        }
                        Err(e) => {
                            watcher.end_flight(&fp);
                            warn!("插件 {} 后台续跑异常退出: {}", watcher.name, e);
                        }
                    }
                });
                Ok(PluginSearchResult {
                    results: Vec::new(),
                    is_final: false,
                    cache_key: Some(cache_key),
                })
            }
        }
    }

    fn invalidate_cache(&self, keyword: &str, ext: &ExtMap) {
        let ext = filter_recognized_ext(&self.inner.name, self.inner.ext_keys, ext);
        let fingerprint = self.inner.fingerprint(keyword, &ext);
        self.inner.cache.lock().remove(&fingerprint);
        self.inner.states.lock().remove(&fingerprint);
    }

    fn pending_background_tasks(&self) -> usize {
        self.inner.queue.lock().len() + self.inner.in_flight.lock().len()
    }
}

/// 合并两次抓取的结果集：按 unique_id 并集；同 id 冲突时新时间胜出，
/// 再比字段丰富度，最后比 priority（小者胜）
pub fn merge_result_sets(old: Vec<SearchResult>, new: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut by_id: HashMap<String, SearchResult> = HashMap::with_capacity(old.len() + new.len());
    for result in old.into_iter().chain(new) {
        match by_id.remove(&result.unique_id) {
            Some(existing) => {
                let winner = pick_richer(existing, result);
                by_id.insert(winner.unique_id.clone(), winner);
            }
            None => {
                by_id.insert(result.unique_id.clone(), result);
            }
        }
    }
    by_id.into_values().collect()
}

fn pick_richer(a: SearchResult, b: SearchResult) -> SearchResult {
    if a.datetime != b.datetime {
        return if a.datetime > b.datetime { a } else { b };
    }
    let (fa, fb) = (field_count(&a), field_count(&b));
    if fa != fb {
        return if fa > fb { a } else { b };
    }
    if a.priority <= b.priority {
        a
    } else {
        b
    }
}

fn field_count(r: &SearchResult) -> usize {
    let mut n = 0;
    if !r.title.is_empty() {
        n += 1;
    }
    if !r.content.is_empty() {
        n += 1;
    }
    n += r.links.len();
    n += r.tags.len();
    if r.image.is_some() {
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloudType, Link};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicI32, AtomicU32};

    fn result(id: &str, title: &str) -> SearchResult {
        SearchResult {
            unique_id: id.to_string(),
            channel: "mock".to_string(),
            title: title.to_string(),
            content: String::new(),
            datetime: Utc::now(),
            links: vec![Link {
                url: format!("https://pan.quark.cn/s/{}", id),
                link_type: CloudType::Quark,
                password: None,
            }],
            tags: vec![],
            image: None,
            priority: 3,
        }
    }

    struct MockFetcher {
        delay: Duration,
        results: Vec<SearchResult>,
        calls: AtomicU32,
        concurrent: AtomicI32,
        max_concurrent: AtomicI32,
    }

    impl MockFetcher {
        fn new(delay: Duration, results: Vec<SearchResult>) -> Arc<Self> {
            Arc::new(Self {
                delay,
                results,
                calls: AtomicU32::new(0),
                concurrent: AtomicI32::new(0),
                max_concurrent: AtomicI32::new(0),
            })
        }
    }

    #[async_trait]
    impl SearchFetcher for MockFetcher {
        async fn fetch(&self, _keyword: &str, _ext: &ExtMap) -> Result<Vec<SearchResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(self.results.clone())
        }
    }

    fn test_plugin(fetcher: Arc<MockFetcher>, budget: Duration) -> AsyncPlugin {
        AsyncPlugin::with_budget(
            "mock",
            3,
            &[],
            fetcher,
            budget,
            2,
            10,
            Duration::from_secs(3600),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fast_fetch_is_final_and_cached() {
        let fetcher = MockFetcher::new(Duration::from_millis(10), vec![result("a", "甲")]);
        let plugin = test_plugin(fetcher.clone(), Duration::from_millis(500));

        let first = plugin.search_with_result("kw", &ExtMap::new()).await.unwrap();
        assert!(first.is_final);
        assert_eq!(first.results.len(), 1);

        // 第二次命中双重检查缓存，不再抓取
        let second = plugin.search_with_result("kw", &ExtMap::new()).await.unwrap();
        assert!(second.is_final);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_fetch_partial_then_final() {
        let fetcher = MockFetcher::new(Duration::from_millis(200), vec![result("a", "甲")]);
        let plugin = test_plugin(fetcher.clone(), Duration::from_millis(50));

        let first = plugin.search_with_result("kw", &ExtMap::new()).await.unwrap();
        assert!(!first.is_final, "预算耗尽应返回部分结果");
        assert!(first.results.is_empty());
        assert!(first.cache_key.is_some());

        // 同一次抓取在后台跑完，不应触发第二次抓取
        tokio::time::sleep(Duration::from_millis(400)).await;
        let second = plugin.search_with_result("kw", &ExtMap::new()).await.unwrap();
        assert!(second.is_final);
        assert_eq!(second.results.len(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_in_flight() {
        let fetcher = MockFetcher::new(Duration::from_millis(200), vec![result("a", "甲")]);
        let plugin = Arc::new(test_plugin(fetcher.clone(), Duration::from_millis(50)));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let p = plugin.clone();
            handles.push(tokio::spawn(async move {
                p.search_with_result("kw", &ExtMap::new()).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(fetcher.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalidate_cache_forces_refetch() {
        let fetcher = MockFetcher::new(Duration::from_millis(10), vec![result("a", "甲")]);
        let plugin = test_plugin(fetcher.clone(), Duration::from_millis(500));

        plugin.search_with_result("kw", &ExtMap::new()).await.unwrap();
        plugin.invalidate_cache("kw", &ExtMap::new());
        plugin.search_with_result("kw", &ExtMap::new()).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_merge_newer_wins() {
        let mut old = result("x", "旧标题");
        old.datetime = Utc::now() - ChronoDuration::hours(1);
        let new = result("x", "新标题");

        let merged = merge_result_sets(vec![old], vec![new]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].title, "新标题");
    }

    #[test]
    fn test_merge_richer_wins_on_equal_time() {
        let t = Utc::now();
        let mut poor = result("x", "标题");
        poor.datetime = t;
        let mut rich = result("x", "标题");
        rich.datetime = t;
        rich.content = "有摘要".to_string();
        rich.tags = vec!["4k".to_string()];

        let merged = merge_result_sets(vec![poor], vec![rich.clone()]);
        assert_eq!(merged[0].content, "有摘要");

        // 交换顺序结果一致（可交换性）
        let mut poor2 = result("x", "标题");
        poor2.datetime = t;
        let merged2 = merge_result_sets(vec![rich], vec![poor2]);
        assert_eq!(merged2[0].content, "有摘要");
    }

    #[test]
    fn test_merge_lower_priority_wins_last() {
        let t = Utc::now();
        let mut a = result("x", "标题");
        a.datetime = t;
        a.priority = 1;
        let mut b = result("x", "标题");
        b.datetime = t;
        b.priority = 5;

        let merged = merge_result_sets(vec![b], vec![a]);
        assert_eq!(merged[0].priority, 1);
    }

    #[test]
    fn test_merge_is_union() {
        let merged = merge_result_sets(
            vec![result("a", "甲"), result("b", "乙")],
            vec![result("b", "乙"), result("c", "丙")],
        );
        assert_eq!(merged.len(), 3);
    }
}
