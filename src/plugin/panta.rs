//! panta 插件
//!
//! 论坛型站点，没有 JSON 接口，直接抓搜索结果页解析 HTML。
//! 链接藏在每个主题的摘要文本里。

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::Arc;

use super::core::{AsyncPlugin, SearchFetcher};
use crate::models::{ExtMap, SearchResult};
use crate::util::{self, http};

const BASE_URL: &str = "https://www.91panta.cn/search";
const PLUGIN_NAME: &str = "panta";
const PRIORITY: i32 = 3;

static TOPIC_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"topicId=(\d+)").unwrap());

struct PantaFetcher;

#[async_trait]
impl SearchFetcher for PantaFetcher {
    async fn fetch(&self, keyword: &str, _ext: &ExtMap) -> Result<Vec<SearchResult>> {
        let body = http::client()
            .get(BASE_URL)
            .query(&[("keyword", keyword)])
            .send()
            .await
            .context("panta 请求失败")?
            .error_for_status()
            .context("panta 返回错误状态")?
            .text()
            .await
            .context("panta 响应读取失败")?;

        // Html 非 Send，解析收敛在同步函数里完成
        Ok(parse_search_page(&body))
    }
}

fn parse_search_page(body: &str) -> Vec<SearchResult> {
    let document = Html::parse_document(body);
    let topic_sel = Selector::parse("div.topicItem").unwrap();
    let title_sel = Selector::parse("h2.title a").unwrap();
    let summary_sel = Selector::parse("div.summary").unwrap();
    let time_sel = Selector::parse("span.postTime").unwrap();

    let mut results = Vec::new();

    for topic in document.select(&topic_sel) {
        let Some(title_el) = topic.select(&title_sel).next() else {
            continue;
        };
        let title = title_el.text().collect::<String>().trim().to_string();
        let href = title_el.value().attr("href").unwrap_or_default();
        let Some(topic_id) = TOPIC_ID.captures(href).map(|c| c[1].to_string()) else {
            continue;
        };

        let summary = topic
            .select(&summary_sel)
            .next()
            .map(|el| el.text().collect::<String>())
            .unwrap_or_default();
        let links = util::extract_links(&summary);
        if links.is_empty() {
            continue;
        }

        let datetime = topic
            .select(&time_sel)
            .next()
            .map(|el| el.text().collect::<String>())
            .and_then(|raw| {
                NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S")
                    .map(|dt| dt.and_utc())
                    .ok()
            })
            .unwrap_or_else(Utc::now);

        results.push(SearchResult {
            unique_id: format!("{}-{}", PLUGIN_NAME, topic_id),
            channel: PLUGIN_NAME.to_string(),
            title,
            content: summary.split_whitespace().collect::<Vec<_>>().join(" "),
            datetime,
            links,
            tags: Vec::new(),
            image: None,
            priority: PRIORITY,
        });
    }

    results
}

pub fn new_plugin() -> AsyncPlugin {
    AsyncPlugin::new(PLUGIN_NAME, PRIORITY, &[], Arc::new(PantaFetcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CloudType;

    #[test]
    fn test_parse_search_page() {
        let body = r#"
        <html><body>
          <div class="topicItem">
            <h2 class="title"><a href="thread?topicId=4321">三体 4K 蓝光</a></h2>
            <div class="summary">链接 https://pan.quark.cn/s/a1b2c3 提取码: qw12</div>
            <span class="postTime">2024-03-01 12:00:00</span>
          </div>
          <div class="topicItem">
            <h2 class="title"><a href="thread?topicId=4322">没有链接的主题</a></h2>
            <div class="summary">只有文字</div>
          </div>
        </body></html>"#;

        let results = parse_search_page(body);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].unique_id, "panta-4321");
        assert_eq!(results[0].title, "三体 4K 蓝光");
        assert_eq!(results[0].links[0].link_type, CloudType::Quark);
        assert_eq!(results[0].links[0].password.as_deref(), Some("qw12"));
    }
}
