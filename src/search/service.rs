//! 搜索编排 / Search orchestrator
//!
//! 指纹 → 缓存 → 对频道与插件扇出 → 全局截止时间内收集 → 合并 → 缓存写入。
//! 截止时间到了就带着已完成的来源返回并标记 partial；没等到的任务不取消，
//! 跑完后由各自的缓存吸收价值。partial 的缓存命中会触发一次后台补全。

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use super::merger;
use crate::cache::{fingerprint, DelayedBatchWriter, TwoLevelCache};
use crate::config::{self, PARTIAL_CACHE_TTL};
use crate::models::{
    CloudType, ExtMap, ResultType, SearchRequest, SearchResponse, SearchResult, SourceType,
};
use crate::plugin::{PluginManager, SearchPlugin};
use crate::tg;
use crate::util;

/// 后台补全允许的宽松截止时间
const BACKGROUND_REFRESH_DEADLINE: Duration = Duration::from_secs(30);

/// 规范化后的搜索参数
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub keyword: String,
    pub channels: Vec<String>,
    pub concurrency: usize,
    pub force_refresh: bool,
    pub result_type: ResultType,
    pub source_type: SourceType,
    pub plugins: Vec<String>,
    pub cloud_types: Vec<CloudType>,
    pub ext: ExtMap,
}

impl SearchParams {
    /// 应用默认值与互斥规则；非法输入在这里挡下（对应 HTTP 400）
    pub fn from_request(req: SearchRequest) -> Result<Self> {
        let keyword = req.keyword.trim().to_string();
        if keyword.is_empty() {
            bail!("关键词不能为空");
        }

        let result_type = ResultType::parse(&req.result_type)
            .ok_or_else(|| anyhow!("无效的结果类型: {}", req.result_type))?;
        let source_type = SourceType::parse(&req.source_type)
            .ok_or_else(|| anyhow!("无效的来源类型: {}", req.source_type))?;

        let mut channels: Vec<String> = req
            .channels
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if channels.is_empty() {
            channels = config::config().search.default_channels.clone();
        }
        let mut plugins: Vec<String> = req
            .plugins
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        // 互斥：src=tg 忽略 plugins，src=plugin 忽略 channels
        match source_type {
            SourceType::Tg => plugins.clear(),
            SourceType::Plugin => channels.clear(),
            SourceType::All => {}
        }

        let mut cloud_types = Vec::new();
        for raw in &req.cloud_types {
            match CloudType::parse(raw) {
                Some(t) => cloud_types.push(t),
                None => debug!("未知的网盘类型 {}，忽略", raw),
            }
        }

        Ok(Self {
            keyword,
            channels,
            concurrency: req.concurrency,
            force_refresh: req.force_refresh,
            result_type,
            source_type,
            plugins,
            cloud_types,
            ext: req.ext,
        })
    }
}

struct SourceOutcome {
    source: String,
    results: Vec<SearchResult>,
    is_final: bool,
    error: Option<String>,
}

/// 搜索服务（克隆成本一个 Arc）
#[derive(Clone)]
pub struct SearchService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    plugin_manager: Arc<PluginManager>,
    cache: Arc<TwoLevelCache>,
    writer: Arc<DelayedBatchWriter>,
    /// 正在后台补全的指纹，避免同指纹重复补全
    refreshing: Mutex<HashSet<String>>,
    response_deadline: Duration,
}

impl SearchService {
    pub fn new(
        plugin_manager: Arc<PluginManager>,
        cache: Arc<TwoLevelCache>,
        writer: Arc<DelayedBatchWriter>,
    ) -> Self {
        Self::with_deadline(
            plugin_manager,
            cache,
            writer,
            config::config().response_deadline(),
        )
    }

    pub fn with_deadline(
        plugin_manager: Arc<PluginManager>,
        cache: Arc<TwoLevelCache>,
        writer: Arc<DelayedBatchWriter>,
        response_deadline: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                plugin_manager,
                cache,
                writer,
                refreshing: Mutex::new(HashSet::new()),
                response_deadline,
            }),
        }
    }

    pub fn plugin_manager(&self) -> &PluginManager {
        &self.inner.plugin_manager
    }

    /// 搜索入口
    pub async fn search(&self, params: SearchParams) -> Result<SearchResponse> {
        let fp = self.fingerprint(&params);

        if !params.force_refresh {
            if let Some((blob, _)) = self.inner.cache.get(&fp).await {
                match serde_json::from_slice::<SearchResponse>(&blob) {
                    Ok(resp) if resp.is_final => {
                        debug!("缓存命中(final): {}", fp);
                        return Ok(resp);
                    }
                    Ok(resp) => {
                        // partial 命中：立即返回旧数据，后台补全
                        debug!("缓存命中(partial): {}", fp);
                        self.spawn_background_refresh(params, fp);
                        return Ok(resp);
                    }
                    Err(e) => {
                        warn!("缓存载荷损坏，按未命中处理 {}: {}", fp, e);
                    }
                }
            }
        }

        let resp = self.execute(&params, self.inner.response_deadline).await?;
        self.store_response(&fp, &resp, params.force_refresh).await;
        Ok(resp)
    }

    fn fingerprint(&self, params: &SearchParams) -> String {
        let cloud_types: Vec<String> =
            params.cloud_types.iter().map(|t| t.to_string()).collect();
        fingerprint::compute(
            &params.keyword,
            params.source_type,
            params.result_type,
            &params.channels,
            &params.plugins,
            &cloud_types,
            &params.ext,
        )
    }

    /// 扇出执行一次搜索；deadline 是本次收集窗口的上限
    async fn execute(&self, params: &SearchParams, deadline: Duration) -> Result<SearchResponse> {
        let cfg = config::config();

        let channels: Vec<String> = if params.source_type != SourceType::Plugin {
            params.channels.clone()
        } else {
            Vec::new()
        };
        let plugins: Vec<Arc<dyn SearchPlugin>> = if params.source_type != SourceType::Tg {
            self.inner.plugin_manager.select(&params.plugins)
        } else {
            Vec::new()
        };

        let total = channels.len() + plugins.len();
        if total == 0 {
            return Ok(empty_response(params.result_type));
        }

        let parsed_keyword = util::parse_keyword(&params.keyword);
        let query = parsed_keyword.query();

        if params.force_refresh {
            for channel in &channels {
                tg::searcher().invalidate(channel, &query);
            }
            for plugin in &plugins {
                plugin.invalidate_cache(&query, &params.ext);
            }
        }

        let concurrency = if params.concurrency > 0 {
            params.concurrency
        } else {
            total
        };
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (tx, mut rx) = mpsc::unbounded_channel::<SourceOutcome>();

        for channel in channels {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let query = query.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                // 频道抓取器自带单次预算；超预算时拿到部分结果，
                // 抓取在后台跑完并写透主缓存
                let outcome = match tg::searcher().search(&channel, &query).await {
                    Ok(result) => SourceOutcome {
                        source: channel,
                        results: result.results,
                        is_final: result.is_final,
                        error: None,
                    },
                    Err(e) => SourceOutcome {
                        source: channel,
                        results: Vec::new(),
                        is_final: true,
                        error: Some(e.to_string()),
                    },
                };
                let _ = tx.send(outcome);
            });
        }

        for plugin in plugins {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let query = query.clone();
            let ext = params.ext.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = match plugin.search_with_result(&query, &ext).await {
                    Ok(result) => SourceOutcome {
                        source: plugin.name().to_string(),
                        results: result.results,
                        is_final: result.is_final,
                        error: None,
                    },
                    Err(e) => SourceOutcome {
                        source: plugin.name().to_string(),
                        results: Vec::new(),
                        is_final: true,
                        error: Some(e.to_string()),
                    },
                };
                let _ = tx.send(outcome);
            });
        }
        drop(tx);

        // 在全局截止时间内收集；没到齐就带着已有的返回
        let deadline_at = tokio::time::Instant::now() + deadline;
        let mut raw: Vec<SearchResult> = Vec::new();
        let mut completed = 0usize;
        let mut errors = 0usize;
        let mut all_final = true;

        while completed < total {
            match tokio::time::timeout_at(deadline_at, rx.recv()).await {
                Ok(Some(outcome)) => {
                    completed += 1;
                    match outcome.error {
                        Some(err) => {
                            errors += 1;
                            debug!("来源 {} 失败: {}", outcome.source, err);
                        }
                        None => {
                            if !outcome.is_final {
                                all_final = false;
                            }
                            raw.extend(outcome.results);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("全局截止时间已到，{}/{} 个来源完成", completed, total);
                    break;
                }
            }
        }

        if completed == total && errors == total {
            bail!("所有搜索来源均失败 ({} 个)", errors);
        }
        if completed < total {
            all_final = false;
        }

        let merged = merger::merge_results(
            raw,
            &parsed_keyword,
            &params.cloud_types,
            &cfg.search.cloud_type_order,
        );

        let resp = match params.result_type {
            ResultType::Results => SearchResponse {
                total: merged.flat.len(),
                is_final: all_final,
                results: Some(merged.flat),
                merged_by_type: None,
            },
            ResultType::MergedByType => SearchResponse {
                total: merged.grouped.0.iter().map(|(_, items)| items.len()).sum(),
                is_final: all_final,
                results: None,
                merged_by_type: Some(merged.grouped),
            },
        };
        Ok(resp)
    }

    /// 写缓存：partial 用短 TTL，final 用长 TTL；强制刷新同步写两级
    async fn store_response(&self, fp: &str, resp: &SearchResponse, sync_write: bool) {
        let bytes = match serde_json::to_vec(resp) {
            Ok(b) => b,
            Err(e) => {
                warn!("响应序列化失败，跳过缓存: {}", e);
                return;
            }
        };
        let ttl = if resp.is_final {
            config::config().final_ttl()
        } else {
            PARTIAL_CACHE_TTL
        };

        if sync_write {
            self.inner
                .cache
                .set_both_levels(fp, &bytes, ttl, resp.is_final)
                .await;
        } else {
            self.inner
                .cache
                .set_memory(fp, bytes.clone(), ttl, resp.is_final);
            self.inner.writer.enqueue(fp, bytes, ttl, resp.is_final);
        }
    }

    /// partial 命中后的后台补全；同指纹同时只有一个补全在跑
    fn spawn_background_refresh(&self, params: SearchParams, fp: String) {
        if !self.inner.refreshing.lock().insert(fp.clone()) {
            return;
        }
        let service = self.clone();
        tokio::spawn(async move {
            debug!("后台补全开始: {}", fp);
            match service.execute(&params, BACKGROUND_REFRESH_DEADLINE).await {
                Ok(resp) => service.store_response(&fp, &resp, false).await,
                Err(e) => debug!("后台补全失败 {}: {}", fp, e),
            }
            service.inner.refreshing.lock().remove(&fp);
        });
    }
}

fn empty_response(result_type: ResultType) -> SearchResponse {
    match result_type {
        ResultType::Results => SearchResponse {
            total: 0,
            is_final: true,
            results: Some(Vec::new()),
            merged_by_type: None,
        },
        ResultType::MergedByType => SearchResponse {
            total: 0,
            is_final: true,
            results: None,
            merged_by_type: Some(Default::default()),
        },
    }
}
