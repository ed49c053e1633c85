use serde_json::Value;

/// Resolves a dotted path such as `owner.department` or `items.0.amount`.
///
/// A missing or blank path resolves to `value` itself. Numeric segments index
/// into arrays. Returns `None` when any segment is absent.
pub fn lookup_path<'a>(value: &'a Value, path: Option<&str>) -> Option<&'a Value> {
    let Some(path) = path.map(str::trim).filter(|path| !path.is_empty()) else {
        return Some(value);
    };

    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Reads the first present, non-null field among `keys`.
pub fn first_field<'a>(snapshot: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| snapshot.get(*key))
        .find(|value| !value.is_null())
}

/// String form used by substring and list-membership tests.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_owned(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
