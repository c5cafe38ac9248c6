//! hunhepan 插件
//!
//! POST JSON 接口，返回结构化的网盘条目（链接、提取码、分享时间分字段）。

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::core::{AsyncPlugin, SearchFetcher};
use super::{ExtKeySpec, ExtValueKind};
use crate::models::{ExtMap, Link, SearchResult};
use crate::util::{self, http};

const API_URL: &str = "https://hunhepan.com/open/search/disk";
const PLUGIN_NAME: &str = "hunhepan";
const PRIORITY: i32 = 2;
const DEFAULT_PAGE_SIZE: u64 = 30;

const EXT_KEYS: &[ExtKeySpec] = &[ExtKeySpec {
    name: "size",
    kind: ExtValueKind::Int,
}];

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i32,
    #[serde(default)]
    msg: String,
    data: Option<ApiData>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(default)]
    list: Vec<DiskItem>,
}

#[derive(Debug, Deserialize)]
struct DiskItem {
    disk_id: String,
    /// 带 <em> 高亮的资源名
    disk_name: String,
    link: String,
    #[serde(default)]
    disk_pass: String,
    #[serde(default)]
    shared_time: String,
}

struct HunhepanFetcher;

#[async_trait]
impl SearchFetcher for HunhepanFetcher {
    async fn fetch(&self, keyword: &str, ext: &ExtMap) -> Result<Vec<SearchResult>> {
        let size = ext
            .get("size")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let resp: ApiResponse = http::client()
            .post(API_URL)
            .json(&json!({ "q": keyword, "page": 1, "size": size }))
            .send()
            .await
            .context("hunhepan 请求失败")?
            .error_for_status()
            .context("hunhepan 返回错误状态")?
            .json()
            .await
            .context("hunhepan 响应解析失败")?;

        if resp.code != 200 {
            anyhow::bail!("hunhepan 接口返回错误: {} {}", resp.code, resp.msg);
        }

        let items = resp.data.map(|d| d.list).unwrap_or_default();
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            let url = util::normalize_url(&item.link);
            if url.is_empty() {
                continue;
            }
            let password = if item.disk_pass.is_empty() {
                None
            } else {
                Some(item.disk_pass.clone())
            };
            let link = Link {
                link_type: util::detect_cloud_type(&url),
                url,
                password,
            };

            let datetime = NaiveDateTime::parse_from_str(&item.shared_time, "%Y-%m-%d %H:%M:%S")
                .map(|dt| dt.and_utc())
                .unwrap_or_else(|_| Utc::now());

            results.push(SearchResult {
                unique_id: format!("{}-{}", PLUGIN_NAME, item.disk_id),
                channel: PLUGIN_NAME.to_string(),
                title: util::strip_html_tags(&item.disk_name),
                content: String::new(),
                datetime,
                links: vec![link],
                tags: Vec::new(),
                image: None,
                priority: PRIORITY,
            });
        }

        Ok(results)
    }
}

pub fn new_plugin() -> AsyncPlugin {
    AsyncPlugin::new(PLUGIN_NAME, PRIORITY, EXT_KEYS, Arc::new(HunhepanFetcher))
}
