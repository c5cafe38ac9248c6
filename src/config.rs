//! 应用配置模块 / Application configuration
//!
//! 配置全部来自环境变量，进程启动时解析一次；请求路径上只读快照。
//! Loaded once from environment variables at startup.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::CloudType;

/// 全局配置实例 / Global configuration instance
static CONFIG: OnceCell<AppConfig> = OnceCell::new();

/// L1 缓存分片数（必须是 2 的幂）
pub const CACHE_SHARD_COUNT: usize = 16;
/// 延迟批量写窗口
pub const BATCH_WRITE_WINDOW: Duration = Duration::from_millis(200);
/// 非 final 缓存条目的短 TTL
pub const PARTIAL_CACHE_TTL: Duration = Duration::from_secs(300);
/// 插件内部缓存触发后台刷新的陈旧阈值
pub const PLUGIN_STALE_THRESHOLD: Duration = Duration::from_secs(30);
/// 插件内部缓存短 TTL
pub const PLUGIN_CACHE_TTL: Duration = Duration::from_secs(300);
/// 频道抓取结果的短 TTL（双重检查缓存）
pub const CHANNEL_CACHE_TTL: Duration = Duration::from_secs(300);
/// 单个指纹后台任务的最大存活时间
pub const TASK_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);
/// 扁平结果上限
pub const MAX_FLAT_RESULTS: usize = 200;

/// 应用配置 / Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub search: SearchConfig,
    pub plugin: PluginConfig,
    pub cache: CacheConfig,
    pub http: HttpConfig,
}

/// 服务器配置 / Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 搜索配置 / Search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// 默认查询的 TG 频道
    pub default_channels: Vec<String>,
    /// 全局响应截止时间（秒）
    pub response_timeout_secs: u64,
    /// merged_by_type 输出的网盘类型键序
    pub cloud_type_order: Vec<CloudType>,
}

/// 插件系统配置 / Plugin system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub enabled: bool,
    /// 允许启用的插件名单，空表示全部
    pub enabled_plugins: Vec<String>,
    /// 单次插件内联抓取预算（秒）
    pub timeout_secs: u64,
    pub max_background_workers: usize,
    pub max_background_tasks: usize,
}

/// 缓存配置 / Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 是否启用磁盘层（L2）
    pub enabled: bool,
    pub path: String,
    /// final 条目的长 TTL（小时）
    pub ttl_hours: u64,
    /// L1 容量上限（条目数，按分片均分）
    pub max_entries: usize,
}

/// 出站 HTTP 配置 / Outbound HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_channels: vec!["tgsearchers2".to_string()],
            response_timeout_secs: 8,
            cloud_type_order: CloudType::preference_order().to_vec(),
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enabled_plugins: Vec::new(),
            timeout_secs: 4,
            max_background_workers: 20,
            max_background_tasks: 100,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "./cache".to_string(),
            ttl_hours: 1,
            max_entries: 10000,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            search: SearchConfig::default(),
            plugin: PluginConfig::default(),
            cache: CacheConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从环境变量加载 / Load from environment variables
    pub fn from_env() -> Self {
        let defaults = AppConfig::default();

        let default_channels = match env_list("CHANNELS") {
            Some(list) if !list.is_empty() => list,
            _ => defaults.search.default_channels,
        };

        Self {
            server: ServerConfig {
                host: defaults.server.host,
                port: env_parse("PORT", defaults.server.port),
            },
            search: SearchConfig {
                default_channels,
                response_timeout_secs: env_parse(
                    "ASYNC_RESPONSE_TIMEOUT",
                    defaults.search.response_timeout_secs,
                ),
                cloud_type_order: defaults.search.cloud_type_order,
            },
            plugin: PluginConfig {
                enabled: env_bool("ASYNC_PLUGIN_ENABLED", defaults.plugin.enabled),
                enabled_plugins: env_list("ENABLED_PLUGINS").unwrap_or_default(),
                timeout_secs: env_parse("PLUGIN_TIMEOUT", defaults.plugin.timeout_secs),
                max_background_workers: env_parse(
                    "ASYNC_MAX_BACKGROUND_WORKERS",
                    defaults.plugin.max_background_workers,
                ),
                max_background_tasks: env_parse(
                    "ASYNC_MAX_BACKGROUND_TASKS",
                    defaults.plugin.max_background_tasks,
                ),
            },
            cache: CacheConfig {
                enabled: env_bool("CACHE_ENABLED", defaults.cache.enabled),
                path: std::env::var("CACHE_PATH").unwrap_or(defaults.cache.path),
                ttl_hours: env_parse("ASYNC_CACHE_TTL_HOURS", defaults.cache.ttl_hours),
                max_entries: env_parse("CACHE_MAX_ENTRIES", defaults.cache.max_entries),
            },
            http: HttpConfig {
                timeout_secs: env_parse("HTTP_TIMEOUT", defaults.http.timeout_secs),
                user_agent: defaults.http.user_agent,
            },
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// final 条目的长 TTL
    pub fn final_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_hours * 3600)
    }

    /// 全局响应截止时间
    pub fn response_deadline(&self) -> Duration {
        Duration::from_secs(self.search.response_timeout_secs)
    }

    /// 插件内联抓取预算
    pub fn plugin_budget(&self) -> Duration {
        Duration::from_secs(self.plugin.timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// 逗号分隔的环境变量；未设置返回 None，便于区分"未配置"与"配置为空"
fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    Some(
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

/// 初始化全局配置（进程启动时调用一次）
pub fn init_config() -> &'static AppConfig {
    CONFIG.get_or_init(AppConfig::from_env)
}

/// 获取全局配置 / Get global configuration
pub fn config() -> &'static AppConfig {
    CONFIG.get_or_init(AppConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8888);
        assert_eq!(cfg.search.response_timeout_secs, 8);
        assert_eq!(cfg.plugin.timeout_secs, 4);
        assert_eq!(cfg.plugin.max_background_workers, 20);
        assert_eq!(cfg.plugin.max_background_tasks, 100);
        assert_eq!(cfg.final_ttl(), Duration::from_secs(3600));
        assert!(cfg.search.default_channels.contains(&"tgsearchers2".to_string()));
    }

    #[test]
    fn test_cloud_type_order_covers_all() {
        let cfg = AppConfig::default();
        assert_eq!(
            cfg.search.cloud_type_order.len(),
            CloudType::preference_order().len()
        );
    }
}
