//! 关键词处理 / Keyword processing
//!
//! 把用户输入拆成主词、必含词（+前缀）和排除词（-前缀）。

/// 解析后的关键词
#[derive(Debug, Clone, Default)]
pub struct ParsedKeyword {
    /// 主要匹配词（小写）
    pub primary: Vec<String>,
    /// 必须出现的词（小写），缺少任何一个的结果会被丢弃
    pub required: Vec<String>,
    /// 排除词（小写），命中即丢弃
    pub excluded: Vec<String>,
}

impl ParsedKeyword {
    /// 发给上游来源的干净查询串（不含 +/- 前缀与排除词）
    pub fn query(&self) -> String {
        let mut terms: Vec<&str> = Vec::new();
        terms.extend(self.primary.iter().map(|s| s.as_str()));
        terms.extend(self.required.iter().map(|s| s.as_str()));
        terms.join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.required.is_empty()
    }
}

/// 规范化并拆分关键词
///
/// 空白折叠后按空格切词："+词" 记为必含，"-词" 记为排除，其余为主词。
/// 单独的 "+"/"-" 视为普通输入忽略。
pub fn parse_keyword(input: &str) -> ParsedKeyword {
    let mut parsed = ParsedKeyword::default();

    for token in input.split_whitespace() {
        if let Some(rest) = token.strip_prefix('+') {
            if !rest.is_empty() {
                parsed.required.push(rest.to_lowercase());
                continue;
            }
        } else if let Some(rest) = token.strip_prefix('-') {
            if !rest.is_empty() {
                parsed.excluded.push(rest.to_lowercase());
                continue;
            }
        } else {
            parsed.primary.push(token.to_lowercase());
            continue;
        }
        // 裸 "+" 或 "-"
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let kw = parse_keyword("三体 电视剧");
        assert_eq!(kw.primary, vec!["三体", "电视剧"]);
        assert!(kw.required.is_empty());
        assert!(kw.excluded.is_empty());
        assert_eq!(kw.query(), "三体 电视剧");
    }

    #[test]
    fn test_parse_prefixes() {
        let kw = parse_keyword("盗梦空间 +1080p -枪版");
        assert_eq!(kw.primary, vec!["盗梦空间"]);
        assert_eq!(kw.required, vec!["1080p"]);
        assert_eq!(kw.excluded, vec!["枪版"]);
        assert_eq!(kw.query(), "盗梦空间 1080p");
    }

    #[test]
    fn test_parse_collapses_whitespace() {
        let kw = parse_keyword("  Foo   BAR  ");
        assert_eq!(kw.primary, vec!["foo", "bar"]);
    }

    #[test]
    fn test_bare_sign_ignored() {
        let kw = parse_keyword("a + - b");
        assert_eq!(kw.primary, vec!["a", "b"]);
        assert!(kw.required.is_empty());
        assert!(kw.excluded.is_empty());
    }
}
