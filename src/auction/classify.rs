// src/auction/classify.rs

use crate::config::settings::ClassifierConfig;

/// 纯函数分类器：按配置里的关键词表把 query_text 映射到分类池。
/// 大小写不敏感的子串匹配；一个池也没命中时落到 default_pools。
/// 输出顺序由配置的 BTreeMap 决定，保证可复现。
pub struct Classifier {
    keyword_pools: Vec<(String, Vec<String>)>,
    default_pools: Vec<String>,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let keyword_pools = config
            .keyword_pools
            .iter()
            .map(|(pool, keywords)| {
                (
                    pool.clone(),
                    keywords.iter().map(|k| k.to_lowercase()).collect(),
                )
            })
            .collect();
        Self {
            keyword_pools,
            default_pools: config.default_pools.clone(),
        }
    }

    pub fn classify(&self, query_text: &str) -> Vec<String> {
        let lowered = query_text.to_lowercase();
        let matched: Vec<String> = self
            .keyword_pools
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k.as_str())))
            .map(|(pool, _)| pool.clone())
            .collect();
        if matched.is_empty() {
            self.default_pools.clone()
        } else {
            matched
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn classifier() -> Classifier {
        let mut keyword_pools = BTreeMap::new();
        keyword_pools.insert(
            "retail".to_string(),
            vec!["shoes".to_string(), "sneakers".to_string()],
        );
        keyword_pools.insert(
            "travel".to_string(),
            vec!["flight".to_string(), "hotel".to_string()],
        );
        Classifier::new(&ClassifierConfig {
            keyword_pools,
            default_pools: vec!["default".to_string()],
        })
    }

    #[test]
    fn keywords_map_to_pools() {
        assert_eq!(classifier().classify("best running SHOES"), vec!["retail"]);
        assert_eq!(
            classifier().classify("cheap flight and shoes"),
            vec!["retail", "travel"]
        );
    }

    #[test]
    fn unmatched_query_falls_back_to_defaults() {
        assert_eq!(classifier().classify("weather tomorrow"), vec!["default"]);
    }
}
