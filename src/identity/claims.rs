// Course -> instructor lookup inside decoded token claims
// Rules are data: (claim field, extractor) pairs tried in order, so new claim shapes are additive

use log::debug;
use serde_json::Value;

use crate::models::json_id;

/// Pulls an instructor id for `course_id` out of one claim field's value.
pub type ClaimExtractor = fn(&Value, i64) -> Option<String>;

#[derive(Clone)]
pub struct ClaimRule {
    pub field: String,
    pub extract: ClaimExtractor,
}

impl ClaimRule {
    pub fn new(field: impl Into<String>, extract: ClaimExtractor) -> Self {
        Self {
            field: field.into(),
            extract,
        }
    }
}

impl std::fmt::Debug for ClaimRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimRule").field("field", &self.field).finish()
    }
}

/// Keys a course entry may use for its course id.
const COURSE_KEYS: [&str; 3] = ["courseId", "id", "course_id"];

/// Where an instructor id may hide inside a course entry, in priority order.
const INSTRUCTOR_PATHS: [&[&str]; 6] = [
    &["instructorId"],
    &["instructor_id"],
    &["teacherId"],
    &["teacher_id"],
    &["instructor", "id"],
    &["instructor", "userId"],
];

#[derive(Debug, Clone, Default)]
pub struct ClaimInspector {
    rules: Vec<ClaimRule>,
}

impl ClaimInspector {
    pub fn new(rules: Vec<ClaimRule>) -> Self {
        Self { rules }
    }

    /// One `course_mapping` rule per field name.
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Self {
        Self::new(
            fields
                .iter()
                .map(|f| ClaimRule::new(f.as_ref(), course_mapping))
                .collect(),
        )
    }

    pub fn with_rule(mut self, rule: ClaimRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[ClaimRule] {
        &self.rules
    }

    pub fn instructor_for_course(&self, claims: &Value, course_id: i64) -> Option<String> {
        for rule in &self.rules {
            let Some(value) = claims.get(&rule.field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            debug!("Found '{}' claim, looking for course {}", rule.field, course_id);
            if let Some(id) = (rule.extract)(value, course_id) {
                debug!("Instructor {} for course {} from '{}' claim", id, course_id, rule.field);
                return Some(id);
            }
        }
        None
    }
}

fn matches_course(value: &Value, course_id: i64) -> bool {
    match value {
        Value::Number(n) => {
            n.as_i64() == Some(course_id) || n.as_f64() == Some(course_id as f64)
        }
        Value::String(s) => s.trim().parse::<i64>().ok() == Some(course_id),
        _ => false,
    }
}

fn instructor_id(entry: &Value) -> Option<String> {
    INSTRUCTOR_PATHS.iter().find_map(|path| {
        let mut current = entry;
        for key in path.iter() {
            current = current.get(*key)?;
        }
        json_id(current)
    })
}

/// Default extractor. Handles a list of course entries, or a map keyed by
/// `<courseId>` / `course_<courseId>`.
pub fn course_mapping(value: &Value, course_id: i64) -> Option<String> {
    match value {
        Value::Array(entries) => entries
            .iter()
            .find(|entry| {
                COURSE_KEYS
                    .iter()
                    .any(|key| entry.get(*key).is_some_and(|v| matches_course(v, course_id)))
            })
            .and_then(instructor_id),
        Value::Object(map) => map
            .get(&course_id.to_string())
            .or_else(|| map.get(&format!("course_{}", course_id)))
            .and_then(instructor_id),
        _ => None,
    }
}
