use std::collections::HashMap;

use serde::Serialize;

use crate::phone::normalize_for_comparison;

/// 重複判定の対象となる連絡先
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub id: String,
    pub phone: String,
    pub tags: Vec<String>,
}

/// 1グループ分の統合計画。`keep` にタグを集約し、`remove` を削除する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergePlan {
    pub key: String,
    pub keep: String,
    pub remove: Vec<String>,
    pub tags: Vec<String>,
}

/// 正規化キーが同じ連絡先をまとめる。
///
/// 入力順で最初に現れたもの（呼び出し側で作成日時の古い順に並べる）を残す。
/// タグは出現順の和集合。重複のないグループは計画に含めない。
pub fn plan_merges(candidates: &[MergeCandidate]) -> Vec<MergePlan> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&MergeCandidate>> = HashMap::new();
    for candidate in candidates {
        let key = normalize_for_comparison(&candidate.phone);
        let group = groups.entry(key.clone()).or_default();
        if group.is_empty() {
            order.push(key);
        }
        group.push(candidate);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let group = groups.remove(&key)?;
            if group.len() < 2 {
                return None;
            }
            let mut tags: Vec<String> = Vec::new();
            for tag in group.iter().flat_map(|c| c.tags.iter()) {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
            Some(MergePlan {
                keep: group[0].id.clone(),
                remove: group[1..].iter().map(|c| c.id.clone()).collect(),
                tags,
                key,
            })
        })
        .collect()
}
