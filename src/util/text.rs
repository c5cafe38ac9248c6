//! 文本清理小工具

use once_cell::sync::Lazy;
use regex::Regex;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

/// 去掉 HTML 标签并折叠空白（站点接口返回的标题常带 <em> 高亮）
pub fn strip_html_tags(text: &str) -> String {
    let stripped = HTML_TAG.replace_all(text, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_html_tags() {
        assert_eq!(strip_html_tags("<em>三体</em> 全集"), "三体 全集");
        assert_eq!(strip_html_tags("纯文本"), "纯文本");
        assert_eq!(strip_html_tags("a<br/>b  c"), "ab c");
    }
}
