//! Best-effort JSON recovery from LLM text.
//!
//! Models wrap JSON in markdown fences, prepend reasoning, or leak
//! think-tags. `parse_best_effort` tries the cheap paths first and only then
//! scans for a balanced object.

use serde_json::Value;

/// Extract a JSON value from raw LLM output. Returns `None` when nothing
/// parseable is found; callers apply their stage fallback in that case.
pub fn parse_best_effort(text: &str) -> Option<Value> {
    let raw = text.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return Some(v);
    }

    let cleaned = strip_thinking_tags(raw);

    if let Ok(v) = serde_json::from_str::<Value>(cleaned.trim()) {
        return Some(v);
    }

    if let Some(block) = extract_from_code_block(&cleaned) {
        if let Ok(v) = serde_json::from_str::<Value>(&block) {
            return Some(v);
        }
    }

    // Outermost braces or brackets, whichever starts first.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (cleaned.find(open), cleaned.rfind(close)) {
            if end > start {
                if let Ok(v) = serde_json::from_str::<Value>(&cleaned[start..=end]) {
                    return Some(v);
                }
            }
        }
    }

    if let Some(start) = cleaned.find('{') {
        if let Some(balanced) = extract_balanced(&cleaned[start..]) {
            if let Ok(v) = serde_json::from_str::<Value>(&balanced) {
                return Some(v);
            }
        }
    }

    None
}

fn strip_thinking_tags(text: &str) -> String {
    let mut result = text.to_string();
    for (open_tag, close_tag) in [("<thinking>", "</thinking>"), ("<think>", "</think>")] {
        while let Some(start) = result.find(open_tag) {
            if let Some(end) = result[start..].find(close_tag) {
                let end_pos = start + end + close_tag.len();
                result.replace_range(start..end_pos, "");
            } else {
                result.replace_range(start.., "");
            }
        }
    }
    result.trim().to_string()
}

fn extract_from_code_block(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        if let Some(end) = text[start + 7..].find("```") {
            return Some(text[start + 7..start + 7 + end].trim().to_string());
        }
    }
    if let Some(start) = text.find("```") {
        if let Some(end) = text[start + 3..].find("```") {
            let content = text[start + 3..start + 3 + end].trim();
            if content.starts_with('{') || content.starts_with('[') {
                return Some(content.to_string());
            }
        }
    }
    None
}

fn extract_balanced(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut depth = 0i32;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        let candidate: String = chars[s..=i].iter().collect();
                        if serde_json::from_str::<Value>(&candidate).is_ok() {
                            return Some(candidate);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Pull a clamped f64 out of a JSON object, tolerating strings and ints.
pub fn field_f64(value: &Value, key: &str) -> Option<f64> {
    let field = value.get(key)?;
    if let Some(n) = field.as_f64() {
        return Some(n);
    }
    field.as_str().and_then(|s| s.trim().parse::<f64>().ok())
}

pub fn field_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn field_bool(value: &Value, key: &str) -> Option<bool> {
    value.get(key).and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let v = parse_best_effort(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn parses_fenced_json() {
        let v = parse_best_effort("Sure!\n```json\n{\"a\": 2}\n```\nDone.").unwrap();
        assert_eq!(v["a"], 2);
    }

    #[test]
    fn parses_json_after_think_tags() {
        let v = parse_best_effort("<think>hmm {not json}</think>{\"a\": 3}").unwrap();
        assert_eq!(v["a"], 3);
    }

    #[test]
    fn parses_json_embedded_in_prose() {
        let v = parse_best_effort("Here is the result: {\"score\": 0.7} hope it helps").unwrap();
        assert_eq!(v["score"], 0.7);
    }

    #[test]
    fn braces_inside_strings_do_not_break_balancing() {
        let v = parse_best_effort("x{\"msg\": \"a } b\", \"ok\": true} trailing").unwrap();
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn rejects_unparseable_text() {
        assert!(parse_best_effort("no json here").is_none());
        assert!(parse_best_effort("").is_none());
    }

    #[test]
    fn field_helpers_tolerate_variants() {
        let v: Value = serde_json::from_str(r#"{"x": "0.5", "y": 2, "b": true}"#).unwrap();
        assert_eq!(field_f64(&v, "x"), Some(0.5));
        assert_eq!(field_f64(&v, "y"), Some(2.0));
        assert_eq!(field_bool(&v, "b"), Some(true));
        assert_eq!(field_str(&v, "missing"), None);
    }
}
