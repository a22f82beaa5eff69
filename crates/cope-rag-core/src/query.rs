//! Query intent classification and semantic expansion.

use crate::models::Intent;

const LESSON_DESIGN_KEYWORDS: &[&str] = &["plan", "séance", "lesson", "co-design", "activité", "drill"];
const EVALUATION_KEYWORDS: &[&str] = &["évaluer", "rubrique", "grille", "critère", "assessment"];
const REFLECTION_KEYWORDS: &[&str] = &["pourquoi", "justifie", "réflex", "métacognition", "retour"];

/// Modes that always ask for a reflective answer.
const REFLECTIVE_MODES: &[&str] = &["evaluation_reflexive", "justification"];

/// Maximum number of expansion queries.
pub const MAX_EXPANSIONS: usize = 4;

/// Classify what kind of help a query asks for.
///
/// Never returns [`Intent::Unknown`]; that variant exists for callers that
/// skip classification.
pub fn classify_intent(query: &str, mode: Option<&str>) -> Intent {
    if mode.is_some_and(|m| REFLECTIVE_MODES.contains(&m)) {
        return Intent::Reflection;
    }
    let q = query.to_lowercase();
    let has_any = |keywords: &[&str]| keywords.iter().any(|k| q.contains(k));
    if has_any(LESSON_DESIGN_KEYWORDS) {
        Intent::LessonDesign
    } else if has_any(EVALUATION_KEYWORDS) {
        Intent::Evaluation
    } else if has_any(REFLECTION_KEYWORDS) {
        Intent::Reflection
    } else {
        Intent::Explanation
    }
}

/// Domain and intent-specific rewrites of `query`, deduplicated, in order.
pub fn expand_query(query: &str, intent: Intent) -> Vec<String> {
    let q = query.trim();
    if q.is_empty() {
        return Vec::new();
    }

    let suffixes: &[&str] = match intent {
        Intent::LessonDesign => &[
            "objectifs apprentissage consignes différenciation",
            "plan de leçon progression",
        ],
        Intent::Evaluation => &["critères observables rubriques évaluation", "feedback formatif"],
        Intent::Reflection => &[
            "justification choix pédagogiques",
            "métacognition pratique réflexive",
        ],
        Intent::Explanation => &["concepts théoriques", "exemples application terrain"],
        Intent::Unknown => &[],
    };

    let mut out: Vec<String> = Vec::with_capacity(MAX_EXPANSIONS);
    let candidates = ["pédagogie EPS", "didactique éducation physique"]
        .iter()
        .chain(suffixes.iter())
        .map(|s| format!("{} {}", q, s));
    for candidate in candidates {
        if out.len() >= MAX_EXPANSIONS {
            break;
        }
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}
