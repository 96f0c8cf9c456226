//! The restricted search grammar supported by `adv_select_records`.
//!
//! A filter is a JSON object of the form
//!
//! ```json
//! { "$and": [ {"name": "Alpha"},
//!             {"$or": [ {"status.state": "edit"},
//!                       {"status.state": "ready"} ]} ] }
//! ```
//!
//! Top-level conditions are ANDed; `$or` clauses nest one level of
//! alternatives.  Property keys are dotted paths into the record
//! document and match by equality.

use serde_json::Value;

const VALID_OPERATORS: [&str; 19] = [
    "$and", "$or", "$not", "$nor", "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin",
    "$exists", "$type", "$mod", "$regex", "$text", "$all", "$elemMatch",
];

/// Validate the structure of an advanced query before evaluating it.
#[cfg(not(feature = "legacy-compat"))]
pub fn check_query_structure(query: &Value) -> bool {
    let Some(obj) = query.as_object() else {
        return false;
    };
    for (key, val) in obj {
        if !VALID_OPERATORS.contains(&key.as_str()) {
            return false;
        }
        if !check_operand(val) {
            return false;
        }
    }
    true
}

/// The pre-cleanup structure check: only the first key of the query was
/// examined before the function returned.
#[cfg(feature = "legacy-compat")]
pub fn check_query_structure(query: &Value) -> bool {
    let Some(obj) = query.as_object() else {
        return false;
    };
    for (key, val) in obj {
        if !VALID_OPERATORS.contains(&key.as_str()) {
            return false;
        }
        if let Some(sub) = val.as_object() {
            if !check_query_structure(&Value::Object(sub.clone())) {
                return false;
            }
        }
        return true;
    }
    false
}

#[cfg(not(feature = "legacy-compat"))]
fn check_operand(val: &Value) -> bool {
    match val {
        Value::Array(clauses) => clauses.iter().all(check_clause),
        Value::Object(_) => check_query_structure(val),
        _ => true,
    }
}

// A clause inside $and/$or: property-equality pairs, or a nested $or.
#[cfg(not(feature = "legacy-compat"))]
fn check_clause(clause: &Value) -> bool {
    let Some(obj) = clause.as_object() else {
        return false;
    };
    obj.iter().all(|(key, val)| {
        if key.starts_with('$') {
            VALID_OPERATORS.contains(&key.as_str()) && check_operand(val)
        } else {
            !val.is_object() && !val.is_array()
        }
    })
}

/// Look up a dotted property path in a record document.
fn lookup<'a>(rec: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = rec;
    for step in path.split('.') {
        cur = cur.get(step)?;
    }
    Some(cur)
}

/// Return true if the record satisfies every constraint in the filter.
pub fn searched(rec: &Value, cst: &Value) -> bool {
    let mut and_conditions: Vec<(&str, &Value)> = Vec::new();
    let mut or_conditions: Vec<(&str, &Value)> = Vec::new();

    if let Some(clauses) = cst.get("$and").and_then(Value::as_array) {
        for clause in clauses {
            let Some(obj) = clause.as_object() else {
                continue;
            };
            for (key, val) in obj {
                if key == "$or" {
                    if let Some(alts) = val.as_array() {
                        for alt in alts {
                            if let Some(altobj) = alt.as_object() {
                                for (k, v) in altobj {
                                    or_conditions.push((k, v));
                                }
                            }
                        }
                    }
                } else {
                    and_conditions.push((key, val));
                }
            }
        }
    }

    let and_met = and_conditions.iter().all(|(path, want)| lookup(rec, path) == Some(want));
    let or_met = or_conditions.iter().any(|(path, want)| lookup(rec, path) == Some(want));

    (or_conditions.is_empty() || or_met) && and_met
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn rec() -> Value {
        json!({
            "id": "mdm1:0001",
            "name": "Alpha",
            "owner": "u1",
            "status": {"state": "edit"}
        })
    }

    #[test]
    fn test_searched_and() {
        let cst = json!({"$and": [{"name": "Alpha"}, {"owner": "u1"}]});
        assert!(searched(&rec(), &cst));

        let cst = json!({"$and": [{"name": "Alpha"}, {"owner": "u2"}]});
        assert!(!searched(&rec(), &cst));
    }

    #[test]
    fn test_searched_dotted_or() {
        let cst = json!({"$and": [
            {"$or": [{"status.state": "edit"}, {"status.state": "ready"}]}
        ]});
        assert!(searched(&rec(), &cst));

        let cst = json!({"$and": [
            {"$or": [{"status.state": "published"}, {"status.state": "ready"}]}
        ]});
        assert!(!searched(&rec(), &cst));
    }

    #[test]
    fn test_searched_mixed() {
        let cst = json!({"$and": [
            {"owner": "u1"},
            {"$or": [{"name": "Alpha"}, {"name": "Beta"}]}
        ]});
        assert!(searched(&rec(), &cst));

        let cst = json!({"$and": [
            {"owner": "u2"},
            {"$or": [{"name": "Alpha"}]}
        ]});
        assert!(!searched(&rec(), &cst));
    }

    #[cfg(not(feature = "legacy-compat"))]
    #[test]
    fn test_structure_check() {
        assert!(check_query_structure(&json!({"$and": [{"name": "Alpha"}]})));
        assert!(check_query_structure(&json!({"$and": [
            {"$or": [{"status.state": "edit"}]}
        ]})));
        assert!(!check_query_structure(&json!({"name": "Alpha"})));
        assert!(!check_query_structure(&json!({"$and": [{"$bogus": 1}]})));
        assert!(!check_query_structure(&json!([1, 2])));
    }

    #[cfg(feature = "legacy-compat")]
    #[test]
    fn test_structure_check_legacy_first_key_only() {
        // only the first key is examined
        assert!(check_query_structure(&json!({"$and": [{"$bogus": 1}]})));
        assert!(!check_query_structure(&json!({"name": "Alpha"})));
    }
}
