//! Deterministic cache keys and the tags shared by readers and writers.

use serde::Serialize;
use serde_json::{json, Value};

/// Builds `operation:name:json|name:json` with parameters sorted by name.
///
/// `params` is normally a JSON object. `null` means "no parameters" and any
/// other value is keyed as a single parameter named `value`.
pub fn generate_key(operation: &str, params: &Value) -> String {
    let mut pairs: Vec<(&str, &Value)> = match params {
        Value::Object(map) => map.iter().map(|(name, value)| (name.as_str(), value)).collect(),
        Value::Null => Vec::new(),
        other => vec![("value", other)],
    };
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let joined = pairs
        .into_iter()
        .map(|(name, value)| format!("{name}:{value}"))
        .collect::<Vec<_>>()
        .join("|");

    format!("{operation}:{joined}")
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Key from an id-like first argument
pub fn by_first_arg<T: Serialize + ?Sized>(id: &T) -> String {
    generate_key("byFirstArg", &json!({ "id": to_json(id) }))
}

/// Key for paged search requests
pub fn by_search_params(query: &str, limit: Option<u32>, offset: Option<u32>) -> String {
    generate_key(
        "search",
        &json!({ "query": query, "limit": limit, "offset": offset }),
    )
}

/// Key scoped to one user and one operation
pub fn by_user_and_operation(user_id: &str, operation: &str, params: &[Value]) -> String {
    generate_key(
        "userOperation",
        &json!({ "userId": user_id, "operation": operation, "params": params }),
    )
}

/// Key for date-range reports
pub fn by_date_range<D: Serialize + ?Sized>(start: &D, end: &D, params: &[Value]) -> String {
    generate_key(
        "dateRange",
        &json!({ "startDate": to_json(start), "endDate": to_json(end), "params": params }),
    )
}

/// Tags for the entities cached by the word and quiz services.
pub mod tags {
    pub const WORDS: &str = "words";
    pub const QUIZ_QUESTIONS: &str = "quiz_questions";
    pub const USER_PROFILES: &str = "user_profiles";
    pub const LEADERBOARD: &str = "leaderboard";
    pub const KNOWLEDGE_ITEMS: &str = "knowledge_items";
    pub const COMMUNITY_SUBMISSIONS: &str = "community_submissions";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const DAILY_WORDS: &str = "daily_words";
    pub const QUIZ_RESULTS: &str = "quiz_results";
    pub const USER_PROGRESS: &str = "user_progress";
}
