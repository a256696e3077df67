//! `--param key=value` parsing

use serde_json::{Map, Value};

/// clap value parser for `key=value`
pub fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(format!("invalid parameter name '{}'", key));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Build the submission parameters object.
///
/// `a.b=1` nests as `{"a": {"b": 1}}`. Values that parse as JSON keep their
/// type; anything else is a string. Later pairs win.
pub fn params_to_json(pairs: &[(String, String)]) -> Value {
    let mut root = Map::new();
    for (key, raw) in pairs {
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        let path: Vec<&str> = key.split('.').collect();
        insert_path(&mut root, &path, value);
    }
    Value::Object(root)
}

fn insert_path(map: &mut Map<String, Value>, path: &[&str], value: Value) {
    match path {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [head, rest @ ..] => {
            let slot = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(child) = slot {
                insert_path(child, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("source=10.0.0.7").unwrap(),
            ("source".to_string(), "10.0.0.7".to_string())
        );
        assert_eq!(
            parse_param("query=a=b").unwrap(),
            ("query".to_string(), "a=b".to_string())
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
        assert!(parse_param("a..b=x").is_err());
    }

    #[test]
    fn test_params_nest_and_keep_types() {
        let pairs = vec![
            ("event.source".to_string(), "10.0.0.7".to_string()),
            ("event.attempts".to_string(), "40".to_string()),
            ("dry_run".to_string(), "true".to_string()),
        ];
        assert_eq!(
            params_to_json(&pairs),
            json!({
                "event": { "source": "10.0.0.7", "attempts": 40 },
                "dry_run": true
            })
        );
    }

    #[test]
    fn test_later_params_win() {
        let pairs = vec![
            ("a".to_string(), "1".to_string()),
            ("a.b".to_string(), "2".to_string()),
        ];
        assert_eq!(params_to_json(&pairs), json!({ "a": { "b": 2 } }));
    }
}
