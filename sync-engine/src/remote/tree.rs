//! Path addressing over a JSON tree with realtime-database semantics: writing
//! `null` deletes, and objects left empty disappear.

use serde_json::{Map, Value};

pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

pub fn join(base: &str, rel: &str) -> String {
    let mut segs = segments(base);
    segs.extend(segments(rel));
    segs.join("/")
}

/// True if a write at `written` can change the value observed at `watched`.
pub fn overlaps(written: &str, watched: &str) -> bool {
    let w = segments(written);
    let o = segments(watched);
    w.iter().zip(o.iter()).all(|(a, b)| a == b)
}

pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for seg in segments(path) {
        node = node.as_object()?.get(seg)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}

/// Replaces the value at `path`, creating intermediate objects.
pub fn set(root: &mut Value, path: &str, value: Value) {
    let segs = segments(path);
    set_segments(root, &segs, value);
}

fn set_segments(node: &mut Value, segs: &[&str], value: Value) {
    let Some((head, rest)) = segs.split_first() else {
        *node = prune(value);
        return;
    };

    if value.is_null() && !node.is_object() {
        return;
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };

    if rest.is_empty() {
        let value = prune(value);
        if value.is_null() {
            map.remove(*head);
        } else {
            map.insert((*head).to_string(), value);
        }
    } else {
        let child = map.entry((*head).to_string()).or_insert(Value::Null);
        set_segments(child, rest, value);
        if child.is_null() {
            map.remove(*head);
        }
    }

    if map.is_empty() {
        *node = Value::Null;
    }
}

/// Applies several writes relative to `base` as one change.
pub fn update(root: &mut Value, base: &str, updates: Map<String, Value>) {
    for (rel, value) in updates {
        set(root, &join(base, &rel), value);
    }
}

/// Drops nulls and empty objects recursively.
fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if pruned.is_empty() {
                Value::Null
            } else {
                Value::Object(pruned)
            }
        }
        other => other,
    }
}
