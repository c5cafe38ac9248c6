//! 网盘链接识别与规范化 / Cloud link recognition and normalization
//!
//! 每个网盘家族一条正则，按展示优先级顺序声明。URL 规范化用于跨来源去重：
//! 协议与主机小写、去掉跟踪查询参数、去掉路径尾部斜杠；分享码部分保留原样
//! （大小写敏感）。

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{CloudType, Link};

/// 各网盘家族的链接正则，声明顺序即 CloudType::preference_order
static LINK_PATTERNS: Lazy<Vec<(CloudType, Regex)>> = Lazy::new(|| {
    vec![
        (
            CloudType::Baidu,
            Regex::new(r"https?://pan\.baidu\.com/s/[0-9a-zA-Z_\-]+(?:\?pwd=[0-9a-zA-Z]+)?").unwrap(),
        ),
        (
            CloudType::Aliyun,
            Regex::new(r"https?://(?:www\.)?(?:aliyundrive\.com|alipan\.com)/s/[0-9a-zA-Z]+").unwrap(),
        ),
        (
            CloudType::Quark,
            Regex::new(r"https?://pan\.quark\.cn/s/[0-9a-zA-Z]+").unwrap(),
        ),
        (
            CloudType::Tianyi,
            Regex::new(r"https?://cloud\.189\.cn/(?:t/[0-9a-zA-Z]+|web/share\?code=[0-9a-zA-Z]+)").unwrap(),
        ),
        (
            CloudType::Uc,
            Regex::new(r"https?://(?:drive|fast)\.uc\.cn/s/[0-9a-z]+(?:\?public=\d)?").unwrap(),
        ),
        (
            CloudType::Mobile,
            Regex::new(r#"https?://(?:caiyun|yun)\.139\.com/[^\s"'<>]+"#).unwrap(),
        ),
        (
            CloudType::Pan115,
            Regex::new(r"https?://(?:115\.com|115cdn\.com|anxia\.com)/s/[0-9a-z]+(?:\?password=[0-9a-zA-Z]+)?").unwrap(),
        ),
        (
            CloudType::Pikpak,
            Regex::new(r"https?://mypikpak\.com/s/[0-9a-zA-Z]+").unwrap(),
        ),
        (
            CloudType::Xunlei,
            Regex::new(r"https?://pan\.xunlei\.com/s/[0-9a-zA-Z_\-]+(?:\?pwd=[0-9a-zA-Z]+)?").unwrap(),
        ),
        (
            CloudType::Pan123,
            Regex::new(r"https?://(?:www\.)?(?:123pan\.com|123684\.com|123865\.com|123912\.com)/s/[0-9a-zA-Z\-]+").unwrap(),
        ),
        (
            CloudType::Magnet,
            Regex::new(r#"magnet:\?xt=urn:btih:[0-9a-zA-Z]{32,40}[^\s"'<>]*"#).unwrap(),
        ),
        (
            CloudType::Ed2k,
            Regex::new(r"ed2k://\|file\|[^|]+\|\d+\|[0-9a-fA-F]{32}\|/?").unwrap(),
        ),
    ]
});

/// 正文中的提取码："提取码: abcd"、"密码：1234"、"pwd:xy12" 等
static PASSWORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:提取码|访问码|密码|pwd|password)[:：\s]*([0-9a-zA-Z]{4,8})").unwrap()
});

/// URL 查询参数里的提取码：?pwd=abcd / ?password=abcd
static URL_PASSWORD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?&](?:pwd|password)=([0-9a-zA-Z]+)").unwrap());

/// 去重前剔除的跟踪参数
const TRACKING_PARAMS: &[&str] = &[
    "from", "ref", "refer", "spm", "src", "scene", "share_from", "share_source", "traceid",
];

fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name)
}

/// 判断 URL 属于哪个网盘家族
pub fn detect_cloud_type(url: &str) -> CloudType {
    for (cloud_type, pattern) in LINK_PATTERNS.iter() {
        if pattern.is_match(url) {
            return *cloud_type;
        }
    }
    CloudType::Others
}

/// 从一段文本中抽取所有可识别的网盘链接
///
/// 同一家族内按规范化形式（不区分大小写）去重；正文里的提取码
/// 会挂到没有自带 pwd 参数的链接上。
pub fn extract_links(text: &str) -> Vec<Link> {
    let text_password = extract_password(text, "");
    let mut links = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (cloud_type, pattern) in LINK_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            let url = normalize_url(m.as_str());
            let key = format!("{}|{}", cloud_type, url.to_ascii_lowercase());
            if !seen.insert(key) {
                continue;
            }
            let password = extract_password("", m.as_str()).or_else(|| {
                if cloud_type.is_magnet_family() {
                    None
                } else {
                    text_password.clone()
                }
            });
            links.push(Link {
                url,
                link_type: *cloud_type,
                password,
            });
        }
    }

    links
}

/// 提取访问密码：优先 URL 参数，其次正文标注
pub fn extract_password(text: &str, url: &str) -> Option<String> {
    if !url.is_empty() {
        if let Some(caps) = URL_PASSWORD_PATTERN.captures(url) {
            return Some(caps[1].to_string());
        }
    }
    if !text.is_empty() {
        if let Some(caps) = PASSWORD_PATTERN.captures(text) {
            return Some(caps[1].to_string());
        }
    }
    None
}

/// 规范化 URL：协议/主机小写，剔除跟踪参数，去掉路径尾斜杠
///
/// magnet/ed2k 没有主机概念，原样返回。
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("magnet:") || url.starts_with("ed2k:") {
        return url.to_string();
    }

    let (scheme, rest) = match url.split_once("://") {
        Some(pair) => pair,
        None => return url.to_string(),
    };

    let (host, path_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };

    let (path, query) = match path_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_query, None),
    };

    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };

    let mut normalized = format!(
        "{}://{}{}",
        scheme.to_ascii_lowercase(),
        host.to_ascii_lowercase(),
        path
    );

    if let Some(query) = query {
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| {
                let name = pair.split('=').next().unwrap_or("");
                !name.is_empty() && !is_tracking_param(&name.to_ascii_lowercase())
            })
            .collect();
        if !kept.is_empty() {
            normalized.push('?');
            normalized.push_str(&kept.join("&"));
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_cloud_type() {
        assert_eq!(
            detect_cloud_type("https://pan.baidu.com/s/1abcDEF?pwd=1234"),
            CloudType::Baidu
        );
        assert_eq!(
            detect_cloud_type("https://www.alipan.com/s/xY9zK"),
            CloudType::Aliyun
        );
        assert_eq!(
            detect_cloud_type("https://pan.quark.cn/s/0a1b2c3d"),
            CloudType::Quark
        );
        assert_eq!(
            detect_cloud_type("magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567"),
            CloudType::Magnet
        );
        assert_eq!(detect_cloud_type("https://example.com/x"), CloudType::Others);
    }

    #[test]
    fn test_extract_links_with_text_password() {
        let text = "《流浪地球2》4K 链接: https://pan.baidu.com/s/1a2B3c4D 提取码: 8hx2";
        let links = extract_links(text);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link_type, CloudType::Baidu);
        assert_eq!(links[0].password.as_deref(), Some("8hx2"));
    }

    #[test]
    fn test_extract_links_url_password_wins() {
        let text = "https://pan.xunlei.com/s/VNg_x1?pwd=abcd 密码: zzzz";
        let links = extract_links(text);
        assert_eq!(links[0].password.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_extract_links_dedup_case_insensitive() {
        let text = "https://pan.quark.cn/s/abc123 https://pan.quark.cn/s/ABC123";
        let links = extract_links(text);
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("HTTPS://Pan.Baidu.Com/s/1AbC/?utm_source=tg&pwd=1234"),
            "https://pan.baidu.com/s/1AbC?pwd=1234"
        );
        assert_eq!(
            normalize_url("https://pan.quark.cn/s/abc?from=share&spm=x.y"),
            "https://pan.quark.cn/s/abc"
        );
        // 分享码大小写保留
        assert_eq!(
            normalize_url("https://mypikpak.com/s/AbCdEf"),
            "https://mypikpak.com/s/AbCdEf"
        );
    }

    #[test]
    fn test_extract_multiple_families() {
        let text = "夸克 https://pan.quark.cn/s/q1w2e3 阿里 https://www.aliyundrive.com/s/r4t5y6";
        let links = extract_links(text);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].link_type, CloudType::Aliyun);
        assert_eq!(links[1].link_type, CloudType::Quark);
    }
}
