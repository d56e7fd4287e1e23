//! Record normalization: raw source rows into canonical, snake-keyed property maps.

use serde_json::Value as JsonValue;

use crate::{CanonicalRecord, PropValue, Props, RawRecord, RecordKind};

/// Job-ad fields stored as floats; anything unparseable is left out.
pub const JOB_AD_NUMERIC_FIELDS: [&str; 4] = ["salary_min", "salary_max", "latitude", "longitude"];

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Record(CanonicalRecord),
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingKey { kind: RecordKind, field: &'static str },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingKey { kind, field } => {
                write!(f, "{} record has no `{field}`", kind.as_str())
            }
        }
    }
}

/// Lower-case, underscore-delimited form of a column or JSON key.
///
/// camelCase boundaries become word breaks, and every run of non-alphanumeric characters
/// collapses into a single `_`.
pub fn snake_key(raw: &str) -> String {
    let chars: Vec<char> = raw.trim().chars().collect();
    let mut out = String::with_capacity(raw.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && i > 0 && !out.is_empty() && !out.ends_with('_') {
                let prev = chars[i - 1];
                let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
                if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower) {
                    out.push('_');
                }
            }
            out.extend(c.to_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

pub fn normalize(raw: &RawRecord, kind: RecordKind) -> Normalized {
    let mut props = Props::new();
    for (raw_key, value) in raw {
        let key = snake_key(raw_key);
        if key.is_empty() {
            continue;
        }
        let normalized = match kind {
            RecordKind::Registry => Some(PropValue::Str(registry_value(value))),
            RecordKind::JobAd => job_ad_value(&key, value),
        };
        match normalized {
            Some(v) => {
                props.insert(key, v);
            }
            None => {
                props.remove(&key);
            }
        }
    }

    let field = kind.key_field();
    let key = match kind {
        RecordKind::Registry => props.get(field).and_then(PropValue::as_str).map(str::to_string),
        RecordKind::JobAd => job_ad_id(raw),
    };
    match key.filter(|k| !k.is_empty()) {
        Some(key) => {
            props.insert(field.to_string(), PropValue::Str(key.clone()));
            Normalized::Record(CanonicalRecord { kind, key, props })
        }
        None => Normalized::Skip(SkipReason::MissingKey { kind, field }),
    }
}

fn registry_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn job_ad_value(key: &str, value: &JsonValue) -> Option<PropValue> {
    if JOB_AD_NUMERIC_FIELDS.contains(&key) {
        let number = match value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        return number.filter(|v| v.is_finite()).map(PropValue::Float);
    }

    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => text_or_none(s).map(PropValue::Str),
        JsonValue::Bool(b) => Some(PropValue::Bool(*b)),
        JsonValue::Number(n) => n
            .as_i64()
            .map(PropValue::Int)
            .or_else(|| n.as_f64().map(PropValue::Float)),
        JsonValue::Array(items) => {
            let list = items
                .iter()
                .filter_map(|item| match item {
                    JsonValue::String(s) => text_or_none(s),
                    JsonValue::Number(n) => Some(n.to_string()),
                    JsonValue::Object(obj) => object_label(obj),
                    _ => None,
                })
                .collect::<Vec<_>>();
            (!list.is_empty()).then_some(PropValue::List(list))
        }
        JsonValue::Object(obj) => object_label(obj).map(PropValue::Str),
    }
}

// Search API nests company/location/category as objects carrying a display label.
fn object_label(obj: &serde_json::Map<String, JsonValue>) -> Option<String> {
    ["display_name", "label"]
        .iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(JsonValue::as_str)
        .find_map(text_or_none)
}

fn job_ad_id(raw: &RawRecord) -> Option<String> {
    let value = raw.iter().find(|(k, _)| snake_key(k) == "id").map(|(_, v)| v)?;
    match value {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn snake_key_handles_headers_and_camel_case() {
        assert_eq!(snake_key("Organisation Name"), "organisation_name");
        assert_eq!(snake_key("Town/City"), "town_city");
        assert_eq!(snake_key(" Type & Rating "), "type_rating");
        assert_eq!(snake_key("salaryMin"), "salary_min");
        assert_eq!(snake_key("HTTPServer"), "http_server");
        assert_eq!(snake_key("__CLASS__"), "class");
        assert_eq!(snake_key("id"), "id");
        assert_eq!(snake_key("---"), "");
    }

    #[test]
    fn registry_row_is_trimmed_and_nulls_become_empty() {
        let row = raw(json!({
            "Organisation Name": "  Acme Ltd ",
            "Town/City": "London",
            "County": null,
            "Type & Rating": "Worker (A rating)",
        }));
        let Normalized::Record(rec) = normalize(&row, RecordKind::Registry) else {
            panic!("expected record");
        };
        assert_eq!(rec.key, "Acme Ltd");
        assert_eq!(rec.get_str("town_city"), Some("London"));
        assert_eq!(rec.get_str("county"), Some(""));
        assert_eq!(rec.non_blank("county"), None);
        assert_eq!(rec.get_str("type_rating"), Some("Worker (A rating)"));
    }

    #[test]
    fn registry_row_without_name_is_skipped() {
        let row = raw(json!({"organisation_name": "   ", "town_city": "Leeds"}));
        assert_eq!(
            normalize(&row, RecordKind::Registry),
            Normalized::Skip(SkipReason::MissingKey {
                kind: RecordKind::Registry,
                field: "organisation_name"
            })
        );
    }

    #[test]
    fn job_ad_flattens_nested_labels_and_parses_numbers() {
        let ad = raw(json!({
            "id": 4821,
            "title": " Data Engineer ",
            "company": {"display_name": "ACME LTD", "__CLASS__": "Adzuna::API::Response::Company"},
            "location": {"display_name": "London", "area": ["UK", "London"]},
            "salary_min": "42000",
            "salary_max": null,
            "latitude": 51.5,
            "longitude": "n/a",
            "description": "",
        }));
        let Normalized::Record(rec) = normalize(&ad, RecordKind::JobAd) else {
            panic!("expected record");
        };
        assert_eq!(rec.key, "4821");
        assert_eq!(rec.get_str("id"), Some("4821"));
        assert_eq!(rec.get_str("title"), Some("Data Engineer"));
        assert_eq!(rec.get_str("company"), Some("ACME LTD"));
        assert_eq!(rec.get_str("location"), Some("London"));
        assert_eq!(rec.props.get("salary_min"), Some(&PropValue::Float(42000.0)));
        assert_eq!(rec.props.get("latitude"), Some(&PropValue::Float(51.5)));
        assert!(!rec.props.contains_key("salary_max"));
        assert!(!rec.props.contains_key("longitude"));
        assert!(!rec.props.contains_key("description"));
    }

    #[test]
    fn job_ad_without_id_is_skipped() {
        let ad = raw(json!({"company": "Acme", "title": "Engineer"}));
        assert!(matches!(
            normalize(&ad, RecordKind::JobAd),
            Normalized::Skip(SkipReason::MissingKey { field: "id", .. })
        ));
    }
}
