//! TG 频道抓取 / TG channel scraper
//!
//! 走 t.me 的网页版搜索（/s/<频道>?q=<词>），解析消息流里的文本、时间与
//! 配图，再从文本里抽网盘链接。没有链接的消息直接丢弃。
//!
//! 频道和插件享有同样的语义：双重检查缓存、同指纹在途去重、预算耗尽先答
//! 部分结果，同一次抓取在后台跑完并写透主缓存，晚到的结果留给后续请求。

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::{self, CHANNEL_CACHE_TTL};
use crate::models::SearchResult;
use crate::plugin::core::main_cache_updater;
use crate::util::{self, http};

/// 频道结果的来源优先级（高于所有插件）
const CHANNEL_PRIORITY: i32 = 0;

static HASHTAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"#([\p{L}\p{N}_]+)").unwrap());
static BACKGROUND_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"background-image:url\('([^']+)'\)").unwrap());

/// 一次频道搜索的返回
#[derive(Debug)]
pub struct ChannelSearchResult {
    pub results: Vec<SearchResult>,
    /// false 表示这次抓取还在后台跑，结果会经缓存补全
    pub is_final: bool,
}

#[async_trait]
trait ChannelFetcher: Send + Sync {
    async fn fetch(&self, channel: &str, keyword: &str) -> Result<Vec<SearchResult>>;
}

struct HttpChannelFetcher;

#[async_trait]
impl ChannelFetcher for HttpChannelFetcher {
    async fn fetch(&self, channel: &str, keyword: &str) -> Result<Vec<SearchResult>> {
        let url = format!(
            "https://t.me/s/{}?q={}",
            channel,
            urlencoding::encode(keyword)
        );

        let body = http::client()
            .get(&url)
            .send()
            .await
            .with_context(|| format!("频道 {} 请求失败", channel))?
            .error_for_status()
            .with_context(|| format!("频道 {} 返回错误状态", channel))?
            .text()
            .await
            .with_context(|| format!("频道 {} 响应读取失败", channel))?;

        // Html 非 Send，解析收敛在同步函数里完成
        Ok(parse_channel_page(&body, channel))
    }
}

struct CachedFetch {
    results: Vec<SearchResult>,
    fetched_at: Instant,
}

impl CachedFetch {
    fn expired(&self) -> bool {
        self.fetched_at.elapsed() > CHANNEL_CACHE_TTL
    }
}

struct SearcherInner {
    fetcher: Arc<dyn ChannelFetcher>,
    /// 双重检查缓存：(频道, 关键词) 指纹 → 最近一次抓取
    cache: Mutex<HashMap<String, CachedFetch>>,
    /// 在途指纹，同频道同关键词同时只允许一个抓取
    in_flight: Mutex<HashSet<String>>,
    /// 单次抓取预算
    budget: Duration,
    /// 写透主缓存时的 TTL
    write_through_ttl: Duration,
}

/// 频道抓取器（克隆成本一个 Arc），进程级单例见 [`searcher`]
#[derive(Clone)]
pub struct ChannelSearcher {
    inner: Arc<SearcherInner>,
}

static CHANNEL_SEARCHER: Lazy<ChannelSearcher> = Lazy::new(|| {
    let cfg = config::config();
    ChannelSearcher::with_budget(
        Arc::new(HttpChannelFetcher),
        cfg.http_timeout(),
        cfg.final_ttl(),
    )
});

/// 进程级频道抓取器
pub fn searcher() -> &'static ChannelSearcher {
    &CHANNEL_SEARCHER
}

impl ChannelSearcher {
    fn with_budget(
        fetcher: Arc<dyn ChannelFetcher>,
        budget: Duration,
        write_through_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SearcherInner {
                fetcher,
                cache: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                budget,
                write_through_ttl,
            }),
        }
    }

    /// 在一个频道里搜索关键词
    pub async fn search(&self, channel: &str, keyword: &str) -> Result<ChannelSearchResult> {
        let inner = &self.inner;
        let fingerprint = SearcherInner::fingerprint(channel, keyword);

        // 频道抓取一次即完整，TTL 内命中就是 final
        let cached = {
            let cache = inner.cache.lock();
            cache.get(&fingerprint).and_then(|c| {
                if c.expired() {
                    None
                } else {
                    Some(c.results.clone())
                }
            })
        };
        if let Some(results) = cached {
            return Ok(ChannelSearchResult {
                results,
                is_final: true,
            });
        }

        // 同指纹只允许一个抓取在途，后到者先拿空的部分结果
        if !inner.try_begin_flight(&fingerprint) {
            return Ok(ChannelSearchResult {
                results: Vec::new(),
                is_final: false,
            });
        }

        let mut handle = tokio::spawn({
            let fetcher = inner.fetcher.clone();
            let channel = channel.to_string();
            let keyword = keyword.to_string();
            async move { fetcher.fetch(&channel, &keyword).await }
        });

        match tokio::time::timeout(inner.budget, &mut handle).await {
            Ok(Ok(Ok(results))) => {
                inner.commit_results(channel, &fingerprint, results.clone());
                Ok(ChannelSearchResult {
                    results,
                    is_final: true,
                })
            }
            Ok(Ok(Err(e))) => {
                inner.end_flight(&fingerprint);
                Err(e)
            }
            Ok(Err(join_err)) => {
                inner.end_flight(&fingerprint);
                Err(anyhow!("频道 {} 抓取任务异常退出: {}", channel, join_err))
            }
            Err(_) => {
                // 预算耗尽：返回部分结果，同一次抓取在后台跑完并写入缓存
                let watcher = inner.clone();
                let channel = channel.to_string();
                let fp = fingerprint.clone();
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(results)) => {
                            watcher.commit_results(&channel, &fp, results);
                        }
                        Ok(Err(e)) => {
                            watcher.end_flight(&fp);
                            warn!("频道 {} 抓取失败: {}", channel, e);
                        }
                        Err(e) => {
                            watcher.end_flight(&fp);
                            warn!("频道 {} 后台续跑异常退出: {}", channel, e);
                        }
                    }
                });
                Ok(ChannelSearchResult {
                    results: Vec::new(),
                    is_final: false,
                })
            }
        }
    }

    /// 强制刷新时让该频道该关键词的缓存失效
    pub fn invalidate(&self, channel: &str, keyword: &str) {
        let fingerprint = SearcherInner::fingerprint(channel, keyword);
        self.inner.cache.lock().remove(&fingerprint);
    }
}

impl SearcherInner {
    fn fingerprint(channel: &str, keyword: &str) -> String {
        format!(
            "{:x}",
            md5::compute(format!("tg|{}|{}", channel, keyword.trim()))
        )
    }

    fn dedicated_cache_key(channel: &str, fingerprint: &str) -> String {
        format!("tg:{}:{}", channel, fingerprint)
    }

    fn try_begin_flight(&self, fingerprint: &str) -> bool {
        self.in_flight.lock().insert(fingerprint.to_string())
    }

    fn end_flight(&self, fingerprint: &str) {
        self.in_flight.lock().remove(fingerprint);
    }

    /// 入缓存并写透主缓存（与插件同一条注入的写透路径）
    fn commit_results(&self, channel: &str, fingerprint: &str, results: Vec<SearchResult>) {
        self.cache.lock().insert(
            fingerprint.to_string(),
            CachedFetch {
                results: results.clone(),
                fetched_at: Instant::now(),
            },
        );
        self.end_flight(fingerprint);

        if let Some(updater) = main_cache_updater() {
            match serde_json::to_vec(&results) {
                Ok(bytes) => updater(
                    Self::dedicated_cache_key(channel, fingerprint),
                    bytes,
                    self.write_through_ttl,
                    true,
                ),
                Err(e) => warn!("频道 {} 结果序列化失败: {}", channel, e),
            }
        }
    }
}

fn parse_channel_page(body: &str, channel: &str) -> Vec<SearchResult> {
    let document = Html::parse_document(body);
    let message_sel = Selector::parse("div.tgme_widget_message").unwrap();
    let text_sel = Selector::parse("div.tgme_widget_message_text").unwrap();
    let time_sel = Selector::parse("time").unwrap();
    let photo_sel = Selector::parse("a.tgme_widget_message_photo_wrap").unwrap();

    let mut results = Vec::new();
    let mut seen_ids = HashSet::new();

    for message in document.select(&message_sel) {
        // data-post 形如 "频道名/12345"
        let Some(message_id) = message
            .value()
            .attr("data-post")
            .and_then(|p| p.rsplit('/').next())
        else {
            continue;
        };
        if !seen_ids.insert(message_id.to_string()) {
            continue;
        }

        let text = message
            .select(&text_sel)
            .next()
            .map(|el| el.text().collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        let links = util::extract_links(&text);
        if links.is_empty() {
            continue;
        }

        let datetime = message
            .select(&time_sel)
            .next()
            .and_then(|el| el.value().attr("datetime"))
            .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let image = message
            .select(&photo_sel)
            .next()
            .and_then(|el| el.value().attr("style"))
            .and_then(|style| BACKGROUND_URL.captures(style))
            .map(|caps| caps[1].to_string());

        let tags: Vec<String> = HASHTAG
            .captures_iter(&text)
            .map(|caps| caps[1].to_string())
            .collect();

        let title = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
            .chars()
            .take(80)
            .collect::<String>();

        results.push(SearchResult {
            unique_id: format!("{}-{}", channel, message_id),
            channel: channel.to_string(),
            title,
            content: text.split_whitespace().collect::<Vec<_>>().join(" "),
            datetime,
            links,
            tags,
            image,
            priority: CHANNEL_PRIORITY,
        });
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CloudType;
    use chrono::Utc;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

    #[test]
    fn test_parse_channel_page() {
        let body = r#"
        <html><body>
          <div class="tgme_widget_message" data-post="tgsearchers2/1001">
            <div class="tgme_widget_message_text">《流浪地球2》#科幻
              https://pan.baidu.com/s/1AbCdE?pwd=6x2p</div>
            <time datetime="2024-05-01T08:30:00+00:00"></time>
            <a class="tgme_widget_message_photo_wrap"
               style="width:100px;background-image:url('https://cdn.example.org/p.jpg')"></a>
          </div>
          <div class="tgme_widget_message" data-post="tgsearchers2/1002">
            <div class="tgme_widget_message_text">没有链接的广告消息</div>
          </div>
        </body></html>"#;

        let results = parse_channel_page(body, "tgsearchers2");
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.unique_id, "tgsearchers2-1001");
        assert_eq!(r.links[0].link_type, CloudType::Baidu);
        assert_eq!(r.links[0].password.as_deref(), Some("6x2p"));
        assert_eq!(r.tags, vec!["科幻"]);
        assert_eq!(r.image.as_deref(), Some("https://cdn.example.org/p.jpg"));
        assert_eq!(r.priority, 0);
        assert_eq!(r.datetime.to_rfc3339(), "2024-05-01T08:30:00+00:00");
    }

    #[test]
    fn test_duplicate_messages_deduped() {
        let body = r#"
          <div class="tgme_widget_message" data-post="ch/7">
            <div class="tgme_widget_message_text">https://pan.quark.cn/s/abc</div>
          </div>
          <div class="tgme_widget_message" data-post="ch/7">
            <div class="tgme_widget_message_text">https://pan.quark.cn/s/abc</div>
          </div>"#;
        assert_eq!(parse_channel_page(body, "ch").len(), 1);
    }

    fn result(id: &str) -> SearchResult {
        SearchResult {
            unique_id: format!("ch-{}", id),
            channel: "ch".to_string(),
            title: "测试".to_string(),
            content: String::new(),
            datetime: Utc::now(),
            links: vec![crate::models::Link {
                url: format!("https://pan.quark.cn/s/{}", id),
                link_type: CloudType::Quark,
                password: None,
            }],
            tags: vec![],
            image: None,
            priority: CHANNEL_PRIORITY,
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
    impl ChannelFetcher for MockFetcher {
        async fn fetch(&self, _channel: &str, _keyword: &str) -> Result<Vec<SearchResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(self.results.clone())
        }
    }

    fn test_searcher(fetcher: Arc<MockFetcher>, budget: Duration) -> ChannelSearcher {
        ChannelSearcher::with_budget(fetcher, budget, Duration::from_secs(3600))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_budget_overrun_cached_for_later() {
        let fetcher = MockFetcher::new(Duration::from_millis(200), vec![result("a")]);
        let searcher = test_searcher(fetcher.clone(), Duration::from_millis(50));

        let first = searcher.search("ch", "kw").await.unwrap();
        assert!(!first.is_final, "预算耗尽应返回部分结果");
        assert!(first.results.is_empty());

        // 同一次抓取在后台跑完并入缓存，不触发第二次抓取
        tokio::time::sleep(Duration::from_millis(400)).await;
        let second = searcher.search("ch", "kw").await.unwrap();
        assert!(second.is_final);
        assert_eq!(second.results.len(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_in_flight_per_channel() {
        let fetcher = MockFetcher::new(Duration::from_millis(200), vec![result("a")]);
        let searcher = test_searcher(fetcher.clone(), Duration::from_millis(50));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let s = searcher.clone();
            handles.push(tokio::spawn(async move {
                s.search("ch", "kw").await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(fetcher.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalidate_forces_refetch() {
        let fetcher = MockFetcher::new(Duration::from_millis(10), vec![result("a")]);
        let searcher = test_searcher(fetcher.clone(), Duration::from_millis(500));

        searcher.search("ch", "kw").await.unwrap();
        searcher.invalidate("ch", "kw");
        searcher.search("ch", "kw").await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_different_channels_not_shared() {
        let fetcher = MockFetcher::new(Duration::from_millis(10), vec![result("a")]);
        let searcher = test_searcher(fetcher.clone(), Duration::from_millis(500));

        searcher.search("ch1", "kw").await.unwrap();
        searcher.search("ch2", "kw").await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
