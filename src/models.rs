//! 搜索请求/结果数据模型
//!
//! Core data model: requests, raw results, recognized cloud link types,
//! merged output / 搜索请求、原始结果、网盘链接类型与合并输出

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// 插件扩展参数（自由键值对，各插件只认领声明过的键）
pub type ExtMap = HashMap<String, serde_json::Value>;

/// Recognized cloud storage families / 识别的网盘类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudType {
    Baidu,
    Aliyun,
    Quark,
    Tianyi,
    Uc,
    Mobile,
    #[serde(rename = "115")]
    Pan115,
    Pikpak,
    Xunlei,
    #[serde(rename = "123")]
    Pan123,
    Magnet,
    Ed2k,
    Others,
}

impl CloudType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudType::Baidu => "baidu",
            CloudType::Aliyun => "aliyun",
            CloudType::Quark => "quark",
            CloudType::Tianyi => "tianyi",
            CloudType::Uc => "uc",
            CloudType::Mobile => "mobile",
            CloudType::Pan115 => "115",
            CloudType::Pikpak => "pikpak",
            CloudType::Xunlei => "xunlei",
            CloudType::Pan123 => "123",
            CloudType::Magnet => "magnet",
            CloudType::Ed2k => "ed2k",
            CloudType::Others => "others",
        }
    }

    pub fn parse(s: &str) -> Option<CloudType> {
        let t = match s.trim().to_ascii_lowercase().as_str() {
            "baidu" => CloudType::Baidu,
            "aliyun" => CloudType::Aliyun,
            "quark" => CloudType::Quark,
            "tianyi" => CloudType::Tianyi,
            "uc" => CloudType::Uc,
            "mobile" => CloudType::Mobile,
            "115" => CloudType::Pan115,
            "pikpak" => CloudType::Pikpak,
            "xunlei" => CloudType::Xunlei,
            "123" => CloudType::Pan123,
            "magnet" => CloudType::Magnet,
            "ed2k" => CloudType::Ed2k,
            "others" => CloudType::Others,
            _ => return None,
        };
        Some(t)
    }

    /// 默认展示顺序（受欢迎程度降序，可被配置覆盖）
    pub fn preference_order() -> &'static [CloudType] {
        &[
            CloudType::Baidu,
            CloudType::Aliyun,
            CloudType::Quark,
            CloudType::Tianyi,
            CloudType::Uc,
            CloudType::Mobile,
            CloudType::Pan115,
            CloudType::Pikpak,
            CloudType::Xunlei,
            CloudType::Pan123,
            CloudType::Magnet,
            CloudType::Ed2k,
            CloudType::Others,
        ]
    }

    /// magnet/ed2k 没有"同一资源同一分享链接"的语义，跨记录去重时跳过
    pub fn is_magnet_family(&self) -> bool {
        matches!(self, CloudType::Magnet | CloudType::Ed2k)
    }
}

impl fmt::Display for CloudType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 网盘链接
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    #[serde(rename = "type")]
    pub link_type: CloudType,
    /// 提取码 / 访问密码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// 单条原始搜索结果（来自某个频道或插件）
///
/// 不变量：links 为空的记录不会进入合并管线
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// 来源内唯一 id（如 "tgsearchers2-12345" 或 "pansearch-887"）
    pub unique_id: String,
    /// 来源名（频道 id 或插件名）
    pub channel: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub datetime: DateTime<Utc>,
    pub links: Vec<Link>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// 来源优先级，数值越小排名加权越高
    #[serde(default)]
    pub priority: i32,
}

/// 搜索请求（GET 参数与 POST JSON 均映射到此结构）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    #[serde(alias = "kw")]
    pub keyword: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default, alias = "conc")]
    pub concurrency: usize,
    #[serde(default, alias = "refresh")]
    pub force_refresh: bool,
    #[serde(default, alias = "res")]
    pub result_type: String,
    #[serde(default, alias = "src")]
    pub source_type: String,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub cloud_types: Vec<String>,
    #[serde(default)]
    pub ext: ExtMap,
}

/// 结果形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    MergedByType,
    Results,
}

impl ResultType {
    /// "merge" 是历史别名，等同 merged_by_type
    pub fn parse(s: &str) -> Option<ResultType> {
        match s.trim() {
            "" | "merge" | "merged_by_type" => Some(ResultType::MergedByType),
            "results" => Some(ResultType::Results),
            _ => None,
        }
    }
}

/// 数据来源类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    All,
    Tg,
    Plugin,
}

impl SourceType {
    pub fn parse(s: &str) -> Option<SourceType> {
        match s.trim() {
            "" | "all" => Some(SourceType::All),
            "tg" => Some(SourceType::Tg),
            "plugin" => Some(SourceType::Plugin),
            _ => None,
        }
    }
}

/// 合并后的单条链接
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedLink {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// 同一资源在一个网盘类型下的合并条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedItem {
    pub title: String,
    pub links: Vec<MergedLink>,
    /// 贡献过链接的来源（频道/插件名）
    pub sources: Vec<String>,
    /// 该组内最新的发布时间
    pub datetime: DateTime<Utc>,
    pub score: f64,
}

/// cloud_type -> 有序条目列表
///
/// JSON 对象的键序遵循配置的网盘类型展示顺序，HashMap 会丢掉这个顺序，
/// 因此序列化手写
#[derive(Debug, Clone, Default)]
pub struct MergedByType(pub Vec<(CloudType, Vec<MergedItem>)>);

impl Serialize for MergedByType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (cloud_type, items) in &self.0 {
            map.serialize_entry(cloud_type, items)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MergedByType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MapVisitor;

        impl<'de> Visitor<'de> for MapVisitor {
            type Value = MergedByType;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of cloud type to merged items")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<CloudType, Vec<MergedItem>>()? {
                    entries.push((key, value));
                }
                Ok(MergedByType(entries))
            }
        }

        deserializer.deserialize_map(MapVisitor)
    }
}

/// 搜索响应（同时也是请求级缓存的载荷）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total: usize,
    /// false 表示仍有来源在后台补全，重复请求会拿到更全的结果
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<SearchResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_by_type: Option<MergedByType>,
}

/// 统一 API 响应包装：成功 {code:0, data}，失败 {code, message}
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}
