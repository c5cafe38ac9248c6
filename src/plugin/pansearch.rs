//! pansearch 插件
//!
//! 站点提供 JSON 搜索接口，内容字段是带 HTML 高亮的富文本，链接和提取码
//! 都埋在正文里。支持 ext.pan 指定网盘类型过滤（透传给站点）。

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use super::core::{AsyncPlugin, SearchFetcher};
use super::{ExtKeySpec, ExtValueKind};
use crate::models::{ExtMap, SearchResult};
use crate::util::{self, http};

const API_URL: &str = "https://www.pansearch.me/api/search";
const PLUGIN_NAME: &str = "pansearch";
const PRIORITY: i32 = 1;

const EXT_KEYS: &[ExtKeySpec] = &[ExtKeySpec {
    name: "pan",
    kind: ExtValueKind::Text,
}];

#[derive(Debug, Deserialize)]
struct ApiResponse {
    data: Option<ApiData>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(default)]
    data: Vec<ApiItem>,
}

#[derive(Debug, Deserialize)]
struct ApiItem {
    id: i64,
    /// 富文本正文，含链接与提取码
    content: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    time: String,
}

struct PanSearchFetcher;

#[async_trait]
impl SearchFetcher for PanSearchFetcher {
    async fn fetch(&self, keyword: &str, ext: &ExtMap) -> Result<Vec<SearchResult>> {
        let mut query: Vec<(&str, String)> = vec![("keyword", keyword.to_string())];
        if let Some(pan) = ext.get("pan").and_then(|v| v.as_str()) {
            query.push(("pan", pan.to_string()));
        }

        let resp: ApiResponse = http::client()
            .get(API_URL)
            .query(&query)
            .send()
            .await
            .context("pansearch 请求失败")?
            .error_for_status()
            .context("pansearch 返回错误状态")?
            .json()
            .await
            .context("pansearch 响应解析失败")?;

        let items = resp.data.map(|d| d.data).unwrap_or_default();
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            let links = util::extract_links(&item.content);
            if links.is_empty() {
                continue;
            }
            let text = util::strip_html_tags(&item.content);
            let title = text.chars().take(80).collect::<String>();
            let datetime = DateTime::parse_from_rfc3339(&item.time)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            results.push(SearchResult {
                unique_id: format!("{}-{}", PLUGIN_NAME, item.id),
                channel: PLUGIN_NAME.to_string(),
                title,
                content: text,
                datetime,
                links,
                tags: Vec::new(),
                image: item.image,
                priority: PRIORITY,
            });
        }

        Ok(results)
    }
}

pub fn new_plugin() -> AsyncPlugin {
    AsyncPlugin::new(PLUGIN_NAME, PRIORITY, EXT_KEYS, Arc::new(PanSearchFetcher))
}
