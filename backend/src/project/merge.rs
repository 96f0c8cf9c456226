//! Data-merge helpers for partial record updates.
//!
//! The merge contract: maps are merged in place, everything else is
//! replaced wholesale (arrays included).  A slash-delimited pointer
//! selects a part of the data tree, auto-creating intermediate maps on
//! the way down.

use serde_json::{Map, Value};

/// Merge `update` into `base`.  `depth` bounds the recursion: negative
/// means unbounded, 1 means top-level properties only.
pub fn merge_into(update: &Map<String, Value>, base: &mut Map<String, Value>, depth: i32) {
    if depth == 0 {
        return;
    }
    for (prop, val) in update {
        match base.get_mut(prop) {
            Some(Value::Object(sub)) => {
                if depth < 0 || depth > 1 {
                    if let Value::Object(upd) = val {
                        merge_into(upd, sub, depth - 1);
                    }
                    // a non-map update under a map property is ignored
                }
            }
            _ => {
                base.insert(prop.clone(), val.clone());
            }
        }
    }
}

/// Follow a slash-delimited pointer into a data tree.
pub fn extract_part<'a>(data: &'a Map<String, Value>, part: &str) -> Option<&'a Value> {
    let mut steps = part.split('/');
    let first = steps.next()?;
    let mut cur = data.get(first)?;
    for step in steps {
        cur = cur.get(step)?;
    }
    Some(cur)
}

/// What to do with the old value at the pointer target.
pub enum PartUpdate {
    /// Merge map-into-map, otherwise replace.
    Merge,
    /// Replace unconditionally.
    Replace,
}

/// Apply `newdata` at the slash-delimited pointer `part`, auto-creating
/// intermediate maps.  Returns the value previously at the target (if
/// any).  Fails when the pointer crosses a non-map value.
pub fn apply_at_part(
    data: &mut Map<String, Value>,
    part: &str,
    newdata: Value,
    mode: PartUpdate,
) -> Result<Option<Value>, ()> {
    let steps: Vec<&str> = part.split('/').collect();
    let mut cur = data;
    for (i, prop) in steps.iter().enumerate() {
        let last = i + 1 == steps.len();
        let exists_as_map = matches!(cur.get(*prop), Some(Value::Object(_)));
        let missing = matches!(cur.get(*prop), None | Some(Value::Null));

        if missing {
            if last {
                cur.insert(prop.to_string(), newdata);
                return Ok(None);
            }
            cur.insert(prop.to_string(), Value::Object(Map::new()));
        } else if last {
            let old = cur.get(*prop).cloned();
            let merge_maps = matches!(
                (&mode, cur.get(*prop), &newdata),
                (PartUpdate::Merge, Some(Value::Object(_)), Value::Object(_))
            );
            if merge_maps {
                if let (Some(Value::Object(sub)), Value::Object(upd)) =
                    (cur.get_mut(*prop), &newdata)
                {
                    merge_into(upd, sub, -1);
                }
            } else if let Some(slot) = cur.get_mut(*prop) {
                *slot = newdata;
            }
            return Ok(old);
        } else if !exists_as_map {
            return Err(());
        }

        cur = match cur.get_mut(*prop) {
            Some(Value::Object(sub)) => sub,
            _ => return Err(()),
        };
    }
    Ok(None)
}
