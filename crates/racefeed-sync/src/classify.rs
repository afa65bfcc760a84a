//! Discipline and distance classification over free text, driven by ordered rule tables.

use std::collections::BTreeSet;

use racefeed_core::{ClassificationResult, EventType};

/// Which text a keyword rule scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextScope {
    TitleDescription,
    /// Title, description and the source's distance list.
    WithDistances,
}

#[derive(Debug, Clone, Copy)]
pub struct TypeRule {
    pub event_type: EventType,
    pub scope: TextScope,
    pub keywords: &'static [&'static str],
}

/// Evaluated top to bottom; the first matching rule decides the type.
pub const TYPE_RULES: &[TypeRule] = &[
    TypeRule {
        event_type: EventType::Triathlon,
        scope: TextScope::TitleDescription,
        keywords: &["triathlon", "ironman", "70.3", "swim.bike.run", "swim bike run"],
    },
    TypeRule {
        event_type: EventType::Ultra,
        scope: TextScope::WithDistances,
        keywords: &["ultra", "50k", "50m", "100k", "100m", "50 mile", "100 mile"],
    },
    TypeRule {
        event_type: EventType::Trail,
        scope: TextScope::TitleDescription,
        keywords: &["trail", "mountain", "hills", "wilderness", "forest", "park", "ridge"],
    },
    TypeRule {
        event_type: EventType::Track,
        scope: TextScope::TitleDescription,
        keywords: &["track", "stadium", "oval"],
    },
];

#[derive(Debug, Clone, Copy)]
pub struct DistancePattern {
    pub tag: &'static str,
    pub patterns: &'static [&'static str],
}

pub const DISTANCE_PATTERNS: &[DistancePattern] = &[
    DistancePattern {
        tag: "marathon",
        patterns: &["marathon", "26.2", "26.2m", "26.2 miles"],
    },
    DistancePattern {
        tag: "half",
        patterns: &["half marathon", "half-marathon", "13.1", "13.1m", "13.1 miles"],
    },
    DistancePattern {
        tag: "10k",
        patterns: &["10k", "10 k", "10 km", "10km", "6.2 miles"],
    },
    DistancePattern {
        tag: "5k",
        patterns: &["5k", "5 k", "5 km", "5km", "3.1 miles"],
    },
    DistancePattern {
        tag: "ultra",
        patterns: &["50k", "50m", "100k", "100m", "50 mile", "100 mile"],
    },
];

const TRIATHLON_HINT: &str = "triathlon";

#[derive(Debug, Clone, Copy)]
pub struct TextClassifier {
    type_rules: &'static [TypeRule],
    distance_patterns: &'static [DistancePattern],
}

impl Default for TextClassifier {
    fn default() -> Self {
        Self {
            type_rules: TYPE_RULES,
            distance_patterns: DISTANCE_PATTERNS,
        }
    }
}

impl TextClassifier {
    pub fn new(
        type_rules: &'static [TypeRule],
        distance_patterns: &'static [DistancePattern],
    ) -> Self {
        Self {
            type_rules,
            distance_patterns,
        }
    }

    pub fn classify(
        &self,
        title: &str,
        description: &str,
        raw_distances: &[String],
        type_hint: Option<&str>,
    ) -> ClassificationResult {
        let text = format!("{title} {description}").to_lowercase();
        ClassificationResult {
            event_type: self.event_type(&text, raw_distances, type_hint),
            distance_tags: self.distance_tags(&text, raw_distances),
        }
    }

    fn event_type(&self, text: &str, raw_distances: &[String], type_hint: Option<&str>) -> EventType {
        if type_hint.is_some_and(|hint| hint.trim().eq_ignore_ascii_case(TRIATHLON_HINT)) {
            return EventType::Triathlon;
        }

        let with_distances = format!("{text} {}", raw_distances.join(" ").to_lowercase());
        self.type_rules
            .iter()
            .find(|rule| {
                let haystack = match rule.scope {
                    TextScope::TitleDescription => text,
                    TextScope::WithDistances => with_distances.as_str(),
                };
                rule.keywords.iter().any(|kw| haystack.contains(kw))
            })
            .map(|rule| rule.event_type)
            .unwrap_or(EventType::Road)
    }

    fn distance_tags(&self, text: &str, raw_distances: &[String]) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = raw_distances
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        for pattern in self.distance_patterns {
            if pattern.patterns.iter().any(|p| text.contains(p)) {
                tags.insert(pattern.tag.to_string());
            }
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(title: &str, distances: &[&str], hint: Option<&str>) -> ClassificationResult {
        let distances: Vec<String> = distances.iter().map(|d| d.to_string()).collect();
        TextClassifier::default().classify(title, "", &distances, hint)
    }

    #[test]
    fn ultra_takes_precedence_over_trail() {
        assert_eq!(
            classify("Ultra Trail of the Redwoods", &[], None).event_type,
            EventType::Ultra
        );
    }

    #[test]
    fn triathlon_hint_wins_over_text() {
        let result = classify("Ultra Trail Aquabike", &[], Some(" Triathlon "));
        assert_eq!(result.event_type, EventType::Triathlon);
        assert_eq!(
            classify("Ultra Trail Aquabike", &[], Some("running_race")).event_type,
            EventType::Ultra
        );
    }

    #[test]
    fn triathlon_keywords_precede_ultra() {
        assert_eq!(
            classify("Ironman 70.3 Santa Rosa", &["100k bike"], None).event_type,
            EventType::Triathlon
        );
    }

    #[test]
    fn ultra_considers_distance_list_but_trail_does_not() {
        assert_eq!(classify("Lake Sonoma", &["50M"], None).event_type, EventType::Ultra);
        assert_eq!(classify("City Run", &["Trail 10k"], None).event_type, EventType::Road);
    }

    #[test]
    fn track_and_road_fallbacks() {
        assert_eq!(classify("Stadium Mile", &[], None).event_type, EventType::Track);
        assert_eq!(classify("Lake Chabot 10K", &[], None).event_type, EventType::Road);
    }

    #[test]
    fn distance_tags_union_raw_and_patterns() {
        let result = classify("SF Half Marathon & 5K", &[" 13.1 mi ", "", "5K"], None);
        let tags: Vec<_> = result.distance_tags.into_iter().collect();
        assert_eq!(tags, vec!["13.1 mi", "5K", "5k", "half", "marathon"]);
    }

    #[test]
    fn lake_chabot_distance_tags_collapse() {
        let result = classify("Lake Chabot 10K", &["10k"], None);
        assert_eq!(result.distance_tags, BTreeSet::from(["10k".to_string()]));
    }

    #[test]
    fn rule_tables_are_evaluated_in_order() {
        let types: Vec<_> = TYPE_RULES.iter().map(|r| r.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::Triathlon, EventType::Ultra, EventType::Trail, EventType::Track]
        );
    }
}
