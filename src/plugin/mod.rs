//! 插件契约与注册表 / Plugin contract and registry
//!
//! 所有站点抓取器实现统一的 SearchPlugin 接口并在启动时注册到全局表，
//! 服务启动后注册表只读。PluginManager 按允许名单构造过滤视图。

pub mod core;
pub mod hunhepan;
pub mod pansearch;
pub mod panta;

pub use self::core::{set_main_cache_updater, AsyncPlugin, MainCacheUpdater, SearchFetcher};

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::{ExtMap, SearchResult};

/// 插件一次搜索的返回
#[derive(Debug, Clone)]
pub struct PluginSearchResult {
    pub results: Vec<SearchResult>,
    /// true 表示没有未完成的后台工作，结果已完整
    pub is_final: bool,
    /// 后台补全写入主缓存时使用的专属键
    pub cache_key: Option<String>,
}

/// ext 参数值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtValueKind {
    Bool,
    Int,
    Text,
}

impl ExtValueKind {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            ExtValueKind::Bool => value.is_boolean(),
            ExtValueKind::Int => value.is_i64() || value.is_u64(),
            ExtValueKind::Text => value.is_string(),
        }
    }
}

/// 插件声明认领的 ext 键
#[derive(Debug, Clone, Copy)]
pub struct ExtKeySpec {
    pub name: &'static str,
    pub kind: ExtValueKind,
}

/// 过滤出插件声明过且类型相符的 ext 键；未声明的键忽略并记 debug 日志
pub fn filter_recognized_ext(plugin: &str, specs: &[ExtKeySpec], ext: &ExtMap) -> ExtMap {
    let mut recognized = ExtMap::new();
    for (key, value) in ext {
        match specs.iter().find(|s| s.name == key) {
            Some(spec) if spec.kind.matches(value) => {
                recognized.insert(key.clone(), value.clone());
            }
            Some(spec) => {
                debug!("插件 {} 的 ext 键 {} 类型不符（期望 {:?}），忽略", plugin, key, spec.kind);
            }
            None => {
                debug!("插件 {} 不认识 ext 键 {}，忽略", plugin, key);
            }
        }
    }
    recognized
}

/// 搜索插件统一接口
#[async_trait]
pub trait SearchPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// 来源优先级，数值越小结果加权越高
    fn priority(&self) -> i32;

    /// 插件认领的 ext 键
    fn recognized_ext_keys(&self) -> &'static [ExtKeySpec] {
        &[]
    }

    async fn search(&self, keyword: &str, ext: &ExtMap) -> Result<Vec<SearchResult>>;

    /// 带 final/partial 语义的搜索
    async fn search_with_result(&self, keyword: &str, ext: &ExtMap) -> Result<PluginSearchResult>;

    /// 强制刷新时让内部缓存失效（默认无内部缓存，无事可做）
    fn invalidate_cache(&self, _keyword: &str, _ext: &ExtMap) {}

    /// 后台未完结的任务数（排队 + 在途），供运维观察压力
    fn pending_background_tasks(&self) -> usize {
        0
    }
}

/// 全局注册表：启动期写入，之后只读
static GLOBAL_REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn SearchPlugin>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// 注册一个插件（重名覆盖并告警）
pub fn register_global_plugin(plugin: Arc<dyn SearchPlugin>) {
    let name = plugin.name().to_string();
    let mut registry = GLOBAL_REGISTRY.write();
    if registry.insert(name.clone(), plugin).is_some() {
        tracing::warn!("插件重复注册，后者覆盖前者: {}", name);
    }
}

/// 注册所有内置插件（服务启动时调用一次，需在 tokio 运行时内）
pub fn register_builtin_plugins() {
    register_global_plugin(Arc::new(pansearch::new_plugin()));
    register_global_plugin(Arc::new(hunhepan::new_plugin()));
    register_global_plugin(Arc::new(panta::new_plugin()));
}

/// 按允许名单过滤后的插件视图
pub struct PluginManager {
    plugins: Vec<Arc<dyn SearchPlugin>>,
}

impl PluginManager {
    /// 从全局注册表构造；enabled 为空表示全部启用
    pub fn from_registry(enabled: &[String]) -> Self {
        let registry = GLOBAL_REGISTRY.read();
        let mut plugins: Vec<Arc<dyn SearchPlugin>> = registry
            .values()
            .filter(|p| enabled.is_empty() || enabled.iter().any(|n| n == p.name()))
            .cloned()
            .collect();
        plugins.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        info!("已启用 {} 个搜索插件", plugins.len());
        Self { plugins }
    }

    /// 空的管理器（插件系统被禁用时）
    pub fn disabled() -> Self {
        Self { plugins: Vec::new() }
    }

    /// 直接由给定插件构造（绕过全局注册表）
    pub fn with_plugins(mut plugins: Vec<Arc<dyn SearchPlugin>>) -> Self {
        plugins.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        Self { plugins }
    }

    pub fn plugins(&self) -> &[Arc<dyn SearchPlugin>] {
        &self.plugins
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// 选取请求指定的子集；names 为空返回全部
    pub fn select(&self, names: &[String]) -> Vec<Arc<dyn SearchPlugin>> {
        if names.is_empty() {
            return self.plugins.to_vec();
        }
        self.plugins
            .iter()
            .filter(|p| names.iter().any(|n| n == p.name()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_recognized_ext() {
        const SPECS: &[ExtKeySpec] = &[
            ExtKeySpec { name: "pan", kind: ExtValueKind::Text },
            ExtKeySpec { name: "page", kind: ExtValueKind::Int },
        ];
        let mut ext = ExtMap::new();
        ext.insert("pan".into(), serde_json::json!("baidu"));
        ext.insert("page".into(), serde_json::json!("not-an-int"));
        ext.insert("unknown".into(), serde_json::json!(true));

        let filtered = filter_recognized_ext("test", SPECS, &ext);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("pan"));
    }
}
