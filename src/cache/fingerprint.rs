//! 请求指纹 / Request fingerprint
//!
//! 同一语义的请求必须落到同一个缓存键上：频道、插件、网盘类型的顺序
//! 不参与指纹（排序后拼接），force_refresh 与并发数也不参与。

use crate::models::{ExtMap, ResultType, SourceType};

/// 计算请求指纹（md5 十六进制）
pub fn compute(
    keyword: &str,
    source_type: SourceType,
    result_type: ResultType,
    channels: &[String],
    plugins: &[String],
    cloud_types: &[String],
    ext: &ExtMap,
) -> String {
    let mut channels: Vec<&str> = channels.iter().map(|s| s.as_str()).collect();
    channels.sort_unstable();
    let mut plugins: Vec<&str> = plugins.iter().map(|s| s.as_str()).collect();
    plugins.sort_unstable();
    let mut cloud_types: Vec<String> = cloud_types
        .iter()
        .map(|s| s.trim().to_ascii_lowercase())
        .collect();
    cloud_types.sort_unstable();

    let mut ext_pairs: Vec<String> = ext.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    ext_pairs.sort_unstable();

    let src = match source_type {
        SourceType::All => "all",
        SourceType::Tg => "tg",
        SourceType::Plugin => "plugin",
    };
    let res = match result_type {
        ResultType::MergedByType => "merged_by_type",
        ResultType::Results => "results",
    };

    let canonical = format!(
        "kw={}|src={}|res={}|ch={}|pl={}|ct={}|ext={}",
        keyword.trim(),
        src,
        res,
        channels.join(","),
        plugins.join(","),
        cloud_types.join(","),
        ext_pairs.join(","),
    );

    format!("{:x}", md5::compute(canonical.as_bytes()))
}
