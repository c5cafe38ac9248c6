//! HTTP handler 实现
//!
//! GET 从 URL 参数组装请求（逗号分隔列表、ext 为 JSON 字符串），
//! POST 直接收 JSON。两者都映射到同一个 SearchRequest。

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config;
use crate::models::{ApiResponse, ExtMap, SearchRequest, SearchResponse};
use crate::search::SearchParams;
use crate::state::AppState;

pub async fn index() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>网盘搜索</title></head>
<body>
  <h1>网盘资源搜索 API</h1>
  <p>接口: <code>GET/POST /api/search</code></p>
  <p>示例: <code>/api/search?kw=关键词</code></p>
</body>
</html>"#,
    )
}

pub async fn search_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let req = match request_from_query(&params) {
        Ok(req) => req,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, 400, &msg),
    };
    do_search(state, req).await
}

pub async fn search_post(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Response {
    do_search(state, req).await
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cfg = config::config();
    let plugins_enabled = cfg.plugin.enabled;
    let channels = &cfg.search.default_channels;

    let mut body = json!({
        "status": "ok",
        "build_time": env!("YAOSOU_BUILD_TIME"),
        "plugins_enabled": plugins_enabled,
        "channels": channels,
        "channels_count": channels.len(),
    });
    // 插件信息只在插件启用时返回
    if plugins_enabled {
        let names = state.plugin_manager.names();
        let orphaned: usize = state
            .plugin_manager
            .plugins()
            .iter()
            .map(|p| p.pending_background_tasks())
            .sum();
        body["plugin_count"] = json!(names.len());
        body["plugins"] = json!(names);
        body["orphaned_tasks"] = json!(orphaned);
    }
    Json(body)
}

async fn do_search(state: Arc<AppState>, req: SearchRequest) -> Response {
    let params = match SearchParams::from_request(req) {
        Ok(params) => params,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, 400, &e.to_string()),
    };

    match state.search_service.search(params).await {
        Ok(resp) => (StatusCode::OK, Json(ApiResponse::success(resp))).into_response(),
        Err(e) => {
            tracing::error!("搜索失败: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                500,
                &format!("搜索失败: {}", e),
            )
        }
    }
}

fn error_response(status: StatusCode, code: i32, message: &str) -> Response {
    (
        status,
        Json(ApiResponse::<SearchResponse>::error(code, message)),
    )
        .into_response()
}

/// GET 参数 → SearchRequest（kw/keyword 两个参数名都认）
fn request_from_query(params: &HashMap<String, String>) -> Result<SearchRequest, String> {
    let keyword = params
        .get("kw")
        .or_else(|| params.get("keyword"))
        .cloned()
        .unwrap_or_default();

    let ext = match params.get("ext") {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str::<ExtMap>(raw)
            .map_err(|e| format!("无效的ext参数格式: {}", e))?,
        _ => ExtMap::new(),
    };

    Ok(SearchRequest {
        keyword,
        channels: split_csv(params.get("channels")),
        concurrency: params
            .get("conc")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
        force_refresh: params.get("refresh").map(|v| v.trim() == "true").unwrap_or(false),
        result_type: params.get("res").cloned().unwrap_or_default(),
        source_type: params.get("src").cloned().unwrap_or_default(),
        plugins: split_csv(params.get("plugins")),
        cloud_types: split_csv(params.get("cloud_types")),
        ext,
    })
}

fn split_csv(raw: Option<&String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_request_from_query_full() {
        let params = query(&[
            ("kw", "三体"),
            ("channels", "ch1, ch2 ,,"),
            ("conc", "4"),
            ("refresh", "true"),
            ("res", "results"),
            ("src", "plugin"),
            ("plugins", "pansearch,panta"),
            ("cloud_types", "baidu,quark"),
            ("ext", r#"{"pan":"baidu"}"#),
        ]);
        let req = request_from_query(&params).unwrap();
        assert_eq!(req.keyword, "三体");
        assert_eq!(req.channels, vec!["ch1", "ch2"]);
        assert_eq!(req.concurrency, 4);
        assert!(req.force_refresh);
        assert_eq!(req.result_type, "results");
        assert_eq!(req.source_type, "plugin");
        assert_eq!(req.plugins.len(), 2);
        assert_eq!(req.cloud_types.len(), 2);
        assert_eq!(req.ext.get("pan").and_then(|v| v.as_str()), Some("baidu"));
    }

    #[test]
    fn test_keyword_alias() {
        let req = request_from_query(&query(&[("keyword", "球状闪电")])).unwrap();
        assert_eq!(req.keyword, "球状闪电");
        // kw 优先
        let req = request_from_query(&query(&[("kw", "a"), ("keyword", "b")])).unwrap();
        assert_eq!(req.keyword, "a");
    }

    #[test]
    fn test_empty_ext_object() {
        let req = request_from_query(&query(&[("kw", "x"), ("ext", "{}")])).unwrap();
        assert!(req.ext.is_empty());
    }

    #[test]
    fn test_invalid_ext_rejected() {
        let err = request_from_query(&query(&[("kw", "x"), ("ext", "not-json")])).unwrap_err();
        assert!(err.contains("无效的ext参数格式"));
    }
}
