//! 合并 / 去重 / 打分 / Merger, deduper, ranker
//!
//! 两轮去重：记录内按网盘类型去掉重复 URL；记录间共享任一非 magnet URL
//! 或（规范化标题相同且网盘类型有交集）即并为一个 MergedItem。
//! 打分是加权和：标题命中、时间衰减（半衰期 30 天）、来源优先级、
//! 网盘类型多样性、有无提取码。

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::config::MAX_FLAT_RESULTS;
use crate::models::{CloudType, MergedByType, MergedItem, MergedLink, SearchResult};
use crate::util::{link as linkutil, ParsedKeyword};

/// 合并产物：扁平列表与按网盘类型分组两种形态
pub struct MergeOutput {
    pub flat: Vec<SearchResult>,
    pub grouped: MergedByType,
}

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}]+").unwrap());

fn normalize_title(title: &str) -> String {
    NON_ALNUM.replace_all(&title.to_lowercase(), "").to_string()
}

struct Scored {
    result: SearchResult,
    score: f64,
}

/// 合并异构来源的原始结果
pub fn merge_results(
    raw: Vec<SearchResult>,
    keyword: &ParsedKeyword,
    cloud_filter: &[CloudType],
    type_order: &[CloudType],
) -> MergeOutput {
    // 第一轮：过滤、记录内去重、打分
    let mut kept: Vec<Scored> = Vec::with_capacity(raw.len());
    for mut result in raw {
        if result.links.is_empty() {
            continue;
        }
        dedup_intra_links(&mut result);
        if !cloud_filter.is_empty() {
            result.links.retain(|l| cloud_filter.contains(&l.link_type));
        }
        if result.links.is_empty() {
            continue;
        }
        let Some(score) = score_result(&result, keyword) else {
            continue;
        };
        kept.push(Scored { result, score });
    }

    let grouped = build_groups(&kept, type_order);
    let flat = build_flat(kept);

    MergeOutput { flat, grouped }
}

/// 记录内去重：URL 规范化后同类型不区分大小写唯一
fn dedup_intra_links(result: &mut SearchResult) {
    let mut seen = HashSet::new();
    result.links.retain_mut(|link| {
        link.url = linkutil::normalize_url(&link.url);
        seen.insert(format!("{}|{}", link.link_type, link.url.to_ascii_lowercase()))
    });
}

/// 打分；required 缺失或命中 excluded 返回 None（记录被丢弃）
fn score_result(result: &SearchResult, keyword: &ParsedKeyword) -> Option<f64> {
    let title = result.title.to_lowercase();
    let content = result.content.to_lowercase();

    for term in &keyword.excluded {
        if title.contains(term.as_str()) || content.contains(term.as_str()) {
            return None;
        }
    }
    for term in &keyword.required {
        if !title.contains(term.as_str()) && !content.contains(term.as_str()) {
            return None;
        }
    }

    let mut score = 0.0;
    for term in &keyword.primary {
        if title.contains(term.as_str()) {
            score += 2.0;
        } else if content.contains(term.as_str()) {
            score += 0.5;
        }
    }
    for term in &keyword.required {
        if title.contains(term.as_str()) {
            score += 1.0;
        }
    }

    // 发布时间衰减
    let age_days = (Utc::now() - result.datetime).num_seconds().max(0) as f64 / 86400.0;
    score += 3.0 * 0.5f64.powf(age_days / 30.0);

    // 来源优先级，数值小者得分高
    score += 0.5 * f64::from((10 - result.priority).clamp(0, 10));

    let distinct_types: HashSet<CloudType> = result.links.iter().map(|l| l.link_type).collect();
    score += 0.3 * distinct_types.len() as f64;

    if result.links.iter().any(|l| l.password.is_some()) {
        score += 0.2;
    }

    Some(score)
}

/// 扁平输出：按 unique_id 去重（保留分高者），降序排列，截断
fn build_flat(kept: Vec<Scored>) -> Vec<SearchResult> {
    let mut best: HashMap<String, Scored> = HashMap::with_capacity(kept.len());
    for scored in kept {
        match best.get(&scored.result.unique_id) {
            Some(existing) if existing.score >= scored.score => {}
            _ => {
                best.insert(scored.result.unique_id.clone(), scored);
            }
        }
    }

    let mut flat: Vec<Scored> = best.into_values().collect();
    flat.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.result.datetime.cmp(&a.result.datetime))
            .then_with(|| a.result.unique_id.cmp(&b.result.unique_id))
    });
    flat.truncate(MAX_FLAT_RESULTS);
    flat.into_iter().map(|s| s.result).collect()
}

/// 记录间聚类（并查集）后按网盘类型分组
fn build_groups(kept: &[Scored], type_order: &[CloudType]) -> MergedByType {
    let n = kept.len();
    let mut parents: Vec<usize> = (0..n).collect();

    fn find(parents: &mut Vec<usize>, mut i: usize) -> usize {
        while parents[i] != i {
            parents[i] = parents[parents[i]];
            i = parents[i];
        }
        i
    }
    fn union(parents: &mut Vec<usize>, a: usize, b: usize) {
        let (ra, rb) = (find(parents, a), find(parents, b));
        if ra != rb {
            parents[ra] = rb;
        }
    }

    let mut url_owner: HashMap<String, usize> = HashMap::new();
    let mut title_owner: HashMap<(String, CloudType), usize> = HashMap::new();

    for (i, scored) in kept.iter().enumerate() {
        for link in &scored.result.links {
            if link.link_type.is_magnet_family() {
                continue;
            }
            let key = link.url.to_ascii_lowercase();
            match url_owner.get(&key) {
                Some(&owner) => union(&mut parents, i, owner),
                None => {
                    url_owner.insert(key, i);
                }
            }
        }

        let title_key = normalize_title(&scored.result.title);
        if title_key.is_empty() {
            continue;
        }
        let types: BTreeSet<CloudType> = scored.result.links.iter().map(|l| l.link_type).collect();
        for cloud_type in types {
            let key = (title_key.clone(), cloud_type);
            match title_owner.get(&key) {
                Some(&owner) => union(&mut parents, i, owner),
                None => {
                    title_owner.insert(key, i);
                }
            }
        }
    }

    let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        let root = find(&mut parents, i);
        clusters.entry(root).or_default().push(i);
    }

    let mut groups: HashMap<CloudType, Vec<MergedItem>> = HashMap::new();
    for members in clusters.values() {
        // 代表标题取分数最高的成员
        let best = members
            .iter()
            .copied()
            .max_by(|&a, &b| {
                kept[a]
                    .score
                    .partial_cmp(&kept[b].score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| kept[a].result.datetime.cmp(&kept[b].result.datetime))
            })
            .expect("cluster 非空");
        let title = kept[best].result.title.clone();

        let newest: DateTime<Utc> = members
            .iter()
            .map(|&i| kept[i].result.datetime)
            .max()
            .expect("cluster 非空");
        let base_score = members
            .iter()
            .map(|&i| kept[i].score)
            .fold(f64::MIN, f64::max);
        let sources: BTreeSet<String> = members
            .iter()
            .map(|&i| kept[i].result.channel.clone())
            .collect();
        // 多来源相互印证加一点分
        let score = base_score + 0.25 * (sources.len().saturating_sub(1)) as f64;

        let mut links_by_type: HashMap<CloudType, Vec<MergedLink>> = HashMap::new();
        let mut seen_urls: HashSet<String> = HashSet::new();
        for &i in members {
            for link in &kept[i].result.links {
                let key = format!("{}|{}", link.link_type, link.url.to_ascii_lowercase());
                if !seen_urls.insert(key) {
                    continue;
                }
                links_by_type.entry(link.link_type).or_default().push(MergedLink {
                    url: link.url.clone(),
                    password: link.password.clone(),
                });
            }
        }

        for (cloud_type, links) in links_by_type {
            groups.entry(cloud_type).or_default().push(MergedItem {
                title: title.clone(),
                links,
                sources: sources.iter().cloned().collect(),
                datetime: newest,
                score,
            });
        }
    }

    let mut ordered = Vec::new();
    for cloud_type in type_order {
        if let Some(mut items) = groups.remove(cloud_type) {
            items.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.datetime.cmp(&a.datetime))
            });
            ordered.push((*cloud_type, items));
        }
    }
    // 偏好表未覆盖的类型兜底
    let mut leftovers: Vec<(CloudType, Vec<MergedItem>)> = groups.into_iter().collect();
    leftovers.sort_by_key(|(t, _)| *t);
    ordered.extend(leftovers);

    MergedByType(ordered)
}
