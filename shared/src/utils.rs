use chrono::{DateTime, Utc};
use serde_json::Value;

// Time helpers
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Telemetry is always published as an array of entries.
pub fn telemetry_entries(telemetry: Value) -> Vec<Value> {
    match telemetry {
        Value::Array(entries) => entries,
        other => vec![other],
    }
}

/// Number of datapoints in one telemetry entry. `{"ts": .., "values": {..}}`
/// counts the keys of `values`, a plain object counts its own keys.
pub fn entry_datapoints(entry: &Value) -> usize {
    match entry {
        Value::Object(map) => match (map.get("ts"), map.get("values")) {
            (Some(_), Some(Value::Object(values))) => values.len(),
            _ => map.len(),
        },
        _ => 0,
    }
}

pub fn count_datapoints(entries: &[Value]) -> usize {
    entries.iter().map(entry_datapoints).sum()
}

/// Groups entries so that each serialized group stays within `max_payload_size`.
/// An entry that alone exceeds the limit is still sent on its own.
pub fn split_by_payload_size(entries: Vec<Value>, max_payload_size: Option<usize>) -> Vec<Vec<Value>> {
    let Some(limit) = max_payload_size else {
        return vec![entries];
    };

    let mut groups = Vec::new();
    let mut current: Vec<Value> = Vec::new();
    // "[" + "]"
    let mut current_size = 2;

    for entry in entries {
        let entry_size = entry.to_string().len();
        let separator = usize::from(!current.is_empty());

        if !current.is_empty() && current_size + separator + entry_size > limit {
            groups.push(std::mem::take(&mut current));
            current_size = 2;
        }

        current_size += usize::from(!current.is_empty()) + entry_size;
        current.push(entry);
    }

    if !current.is_empty() || groups.is_empty() {
        groups.push(current);
    }

    groups
}

/// Comma separated key list used by attribute requests.
pub fn join_keys<S: AsRef<str>>(keys: &[S]) -> String {
    keys.iter().map(|k| k.as_ref()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_telemetry_entries() {
        assert_eq!(telemetry_entries(json!({"temp": 22})), vec![json!({"temp": 22})]);
        assert_eq!(telemetry_entries(json!([{"a": 1}, {"b": 2}])).len(), 2);
    }

    #[test]
    fn test_datapoint_counting() {
        let entries = vec![
            json!({"temp": 22, "humidity": 40}),
            json!({"ts": 1_700_000_000_000i64, "values": {"temp": 23}}),
        ];
        assert_eq!(count_datapoints(&entries), 3);
    }

    #[test]
    fn test_split_by_payload_size() {
        let entries = vec![json!({"a": 1}), json!({"b": 2}), json!({"c": 3})];
        // each entry is 7 bytes: {"a":1}
        let groups = split_by_payload_size(entries.clone(), Some(17));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);

        assert_eq!(split_by_payload_size(entries, None).len(), 1);
    }

    #[test]
    fn test_oversized_entry_is_kept() {
        let groups = split_by_payload_size(vec![json!({"long_key": "long_value"})], Some(4));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 1);
    }

    #[test]
    fn test_join_keys() {
        assert_eq!(join_keys(&["a", "b"]), "a,b");
        assert_eq!(join_keys::<&str>(&[]), "");
    }
}
