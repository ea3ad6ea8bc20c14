//! Query evaluation for the in-memory store.
//!
//! Supports the subset of Mongo query and aggregation syntax the service
//! needs: field equality, comparison and membership operators on dotted
//! paths, `$and`/`$or`, sorting, projection and a handful of pipeline stages.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::error::{LogdError, Result};
use crate::store::SortKey;
use crate::types::Document;

/// Resolves a dotted path inside a document.
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Returns true if `doc` satisfies `query`.
pub(crate) fn matches(doc: &Document, query: &Document) -> Result<bool> {
    for (key, cond) in query {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(cond, "$and")? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(cond, "$or")? {
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            op if op.starts_with('$') => {
                return Err(LogdError::InvalidQuery(format!("unknown top-level operator {op}")));
            }
            path => field_matches(lookup(doc, path), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(cond: &'a Value, op: &str) -> Result<Vec<&'a Document>> {
    cond.as_array()
        .ok_or_else(|| LogdError::InvalidQuery(format!("{op} expects an array")))?
        .iter()
        .map(|c| {
            c.as_object()
                .ok_or_else(|| LogdError::InvalidQuery(format!("{op} clauses must be objects")))
        })
        .collect()
}

fn is_operator_doc(cond: &Value) -> bool {
    cond.as_object()
        .is_some_and(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

fn field_matches(value: Option<&Value>, cond: &Value) -> Result<bool> {
    let Some(ops) = cond.as_object().filter(|_| is_operator_doc(cond)) else {
        return Ok(equals(value, cond));
    };
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(value, arg),
            "$ne" => !equals(value, arg),
            "$gt" => compares(value, arg, |o| o == Ordering::Greater),
            "$gte" => compares(value, arg, |o| o != Ordering::Less),
            "$lt" => compares(value, arg, |o| o == Ordering::Less),
            "$lte" => compares(value, arg, |o| o != Ordering::Greater),
            "$in" => members(arg, op)?.iter().any(|m| equals(value, m)),
            "$nin" => !members(arg, op)?.iter().any(|m| equals(value, m)),
            "$exists" => value.is_some() == truthy(arg),
            other => {
                return Err(LogdError::InvalidQuery(format!("unsupported operator {other}")));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn members<'a>(arg: &'a Value, op: &str) -> Result<&'a Vec<Value>> {
    arg.as_array()
        .ok_or_else(|| LogdError::InvalidQuery(format!("{op} expects an array")))
}

/// Equality with array-element semantics: a scalar condition matches an
/// array field if any element equals it. A missing field equals `null`.
fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(v) => values_equal(v, expected),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Range comparison only between values of the same type bracket.
fn compares(value: Option<&Value>, arg: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(value) = value else {
        return false;
    };
    if let Value::Array(items) = value {
        if !arg.is_array() {
            return items
                .iter()
                .any(|item| type_rank(item) == type_rank(arg) && accept(compare(Some(item), Some(arg))));
        }
    }
    type_rank(value) == type_rank(arg) && accept(compare(Some(value), Some(arg)))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

const fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over optional JSON values; a missing value sorts as `null`.
pub(crate) fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(l, r)| compare(Some(l), Some(r)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => {
            serde_json::to_string(x).unwrap_or_default().cmp(&serde_json::to_string(y).unwrap_or_default())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Stable sort by the given keys.
pub(crate) fn sort(docs: &mut [Document], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        keys.iter()
            .map(|k| {
                let ord = compare(lookup(a, &k.field), lookup(b, &k.field));
                if k.descending { ord.reverse() } else { ord }
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

/// Applies an inclusion or exclusion projection. `_id` is kept unless
/// explicitly excluded.
pub(crate) fn project(doc: &Document, projection: &Document) -> Result<Document> {
    let fields: Vec<(&String, bool)> = projection
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .map(|(k, v)| (k, truthy(v)))
        .collect();
    let inclusion = fields.iter().any(|(_, include)| *include);
    if inclusion && fields.iter().any(|(_, include)| !*include) {
        return Err(LogdError::InvalidQuery(
            "projection cannot mix inclusion and exclusion".to_string(),
        ));
    }
    let keep_id = projection.get("_id").is_none_or(truthy);

    let mut out = if inclusion {
        let mut out = Document::new();
        for (path, _) in &fields {
            if let Some(v) = lookup(doc, path) {
                set_path(&mut out, path, v.clone());
            }
        }
        if let Some(id) = doc.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
        out
    } else {
        let mut out = doc.clone();
        for (path, _) in &fields {
            remove_path(&mut out, path);
        }
        out
    };
    if !keep_id {
        out.remove("_id");
    }
    Ok(out)
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

/// Runs an aggregation pipeline over `docs`.
pub(crate) fn aggregate(mut docs: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((name, arg)), None) = (entries.next(), entries.next()) else {
            return Err(LogdError::InvalidQuery(
                "pipeline stage must have exactly one key".to_string(),
            ));
        };
        docs = match name.as_str() {
            "$match" => {
                let query = stage_object(arg, name)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, query)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$sort" => {
                let keys = SortKey::parse_document(stage_object(arg, name)?)?;
                sort(&mut docs, &keys);
                docs
            }
            "$skip" => docs.into_iter().skip(stage_count(arg, name)?).collect(),
            "$limit" => docs.into_iter().take(stage_count(arg, name)?).collect(),
            "$project" => {
                let projection = stage_object(arg, name)?;
                docs.iter()
                    .map(|d| project(d, projection))
                    .collect::<Result<Vec<_>>>()?
            }
            "$count" => {
                let field = arg
                    .as_str()
                    .filter(|f| !f.is_empty() && !f.starts_with('$'))
                    .ok_or_else(|| LogdError::InvalidQuery("$count expects a field name".to_string()))?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Document::new();
                    out.insert(field.to_string(), Value::from(docs.len()));
                    vec![out]
                }
            }
            "$group" => group(&docs, stage_object(arg, name)?)?,
            other => {
                return Err(LogdError::InvalidQuery(format!("unsupported stage {other}")));
            }
        };
    }
    Ok(docs)
}

fn stage_object<'a>(arg: &'a Value, name: &str) -> Result<&'a Document> {
    arg.as_object()
        .ok_or_else(|| LogdError::InvalidQuery(format!("{name} expects an object")))
}

fn stage_count(arg: &Value, name: &str) -> Result<usize> {
    arg.as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| LogdError::InvalidQuery(format!("{name} expects a non-negative integer")))
}

/// Evaluates a group expression: `"$path"` reads a field, an object is
/// evaluated key by key, anything else is a literal.
fn evaluate(doc: &Document, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            lookup(doc, &s[1..]).cloned().unwrap_or(Value::Null)
        }
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), evaluate(doc, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[derive(Debug)]
enum Accumulator {
    Sum { int: i64, float: f64, is_float: bool },
    Avg { total: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self> {
        match op {
            "$sum" => Ok(Self::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
            }),
            "$avg" => Ok(Self::Avg { total: 0.0, count: 0 }),
            "$min" => Ok(Self::Min(None)),
            "$max" => Ok(Self::Max(None)),
            other => Err(LogdError::InvalidQuery(format!("unsupported accumulator {other}"))),
        }
    }

    fn add(&mut self, value: Value) {
        match self {
            Self::Sum {
                int,
                float,
                is_float,
            } => {
                if let Value::Number(n) = value {
                    match n.as_i64() {
                        Some(i) if !*is_float => match int.checked_add(i) {
                            Some(sum) => *int = sum,
                            None => {
                                *is_float = true;
                                *float = *int as f64 + i as f64;
                            }
                        },
                        _ => {
                            if !*is_float {
                                *is_float = true;
                                *float = *int as f64;
                            }
                            *float += n.as_f64().unwrap_or(0.0);
                        }
                    }
                }
            }
            Self::Avg { total, count } => {
                if let Some(f) = value.as_f64() {
                    *total += f;
                    *count += 1;
                }
            }
            Self::Min(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .is_none_or(|c| compare(Some(&value), Some(c)) == Ordering::Less)
                {
                    *current = Some(value);
                }
            }
            Self::Max(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .is_none_or(|c| compare(Some(&value), Some(c)) == Ordering::Greater)
                {
                    *current = Some(value);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Self::Sum {
                int,
                float,
                is_float,
            } => {
                if is_float {
                    Number::from_f64(float).map_or(Value::Null, Value::Number)
                } else {
                    Value::from(int)
                }
            }
            Self::Avg { total, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Number::from_f64(total / count as f64).map_or(Value::Null, Value::Number)
                }
            }
            Self::Min(v) | Self::Max(v) => v.unwrap_or(Value::Null),
        }
    }
}

fn group(docs: &[Document], spec: &Document) -> Result<Vec<Document>> {
    let key_expr = spec
        .get("_id")
        .ok_or_else(|| LogdError::InvalidQuery("$group requires _id".to_string()))?;

    let mut outputs = Vec::new();
    for (name, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
        let acc = acc
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| LogdError::InvalidQuery(format!("{name} must be a single accumulator")))?;
        let Some((op, expr)) = acc.iter().next() else {
            continue;
        };
        Accumulator::new(op)?;
        outputs.push((name.clone(), op.clone(), expr.clone()));
    }

    let mut groups: Vec<(Value, Vec<Accumulator>)> = Vec::new();
    for doc in docs {
        let key = evaluate(doc, key_expr);
        let index = match groups.iter().position(|(k, _)| *k == key) {
            Some(i) => i,
            None => {
                let accs = outputs
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>>>()?;
                groups.push((key, accs));
                groups.len() - 1
            }
        };
        for (acc, (_, _, expr)) in groups[index].1.iter_mut().zip(&outputs) {
            acc.add(evaluate(doc, expr));
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Document::new();
            out.insert("_id".to_string(), key);
            for (acc, (name, _, _)) in accs.into_iter().zip(&outputs) {
                out.insert(name.clone(), acc.finish());
            }
            out
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        match v {
            Value::Object(m) => m,
            _ => Document::new(),
        }
    }

    fn check(d: &Value, q: Value) -> bool {
        matches(&doc(d.clone()), &doc(q)).unwrap_or(false)
    }

    #[test]
    fn lookup_dotted_paths() {
        let d = doc(json!({"body": {"service": "billing", "hops": [1, 2]}}));
        assert_eq!(lookup(&d, "body.service"), Some(&json!("billing")));
        assert_eq!(lookup(&d, "body.hops.1"), Some(&json!(2)));
        assert_eq!(lookup(&d, "body.missing"), None);
        assert_eq!(lookup(&d, "body.service.x"), None);
    }

    #[test]
    fn equality_and_operators() {
        let d = json!({"type": 2, "app": "web", "tags": ["a", "b"], "body": {"ms": 120}});
        assert!(check(&d, json!({})));
        assert!(check(&d, json!({"type": 2})));
        assert!(check(&d, json!({"type": 2.0})));
        assert!(!check(&d, json!({"type": 3})));
        assert!(check(&d, json!({"tags": "a"})));
        assert!(check(&d, json!({"body.ms": {"$gt": 100, "$lte": 120}})));
        assert!(!check(&d, json!({"body.ms": {"$lt": 100}})));
        assert!(check(&d, json!({"app": {"$in": ["web", "api"]}})));
        assert!(check(&d, json!({"app": {"$nin": ["api"]}})));
        assert!(check(&d, json!({"app": {"$ne": "api"}})));
        assert!(check(&d, json!({"missing": {"$exists": false}})));
        assert!(check(&d, json!({"missing": null})));
        assert!(!check(&d, json!({"app": {"$gt": 5}})));
    }

    #[test]
    fn logical_operators() {
        let d = json!({"type": 2, "app": "web"});
        assert!(check(&d, json!({"$or": [{"type": 1}, {"app": "web"}]})));
        assert!(!check(&d, json!({"$and": [{"type": 2}, {"app": "api"}]})));
    }

    #[test]
    fn invalid_queries_are_errors() {
        let d = doc(json!({"a": 1}));
        assert!(matches(&d, &doc(json!({"a": {"$regex": "x"}}))).is_err());
        assert!(matches(&d, &doc(json!({"$nor": []}))).is_err());
        assert!(matches(&d, &doc(json!({"$or": {}}))).is_err());
    }

    #[test]
    fn sort_multiple_keys() {
        let mut docs = vec![
            doc(json!({"app": "b", "time": 1})),
            doc(json!({"app": "a", "time": 1})),
            doc(json!({"app": "a", "time": 3})),
        ];
        sort(&mut docs, &[SortKey::desc("time"), SortKey::asc("app")]);
        let order: Vec<_> = docs.iter().map(|d| (d["app"].clone(), d["time"].clone())).collect();
        assert_eq!(
            order,
            vec![(json!("a"), json!(3)), (json!("a"), json!(1)), (json!("b"), json!(1))]
        );
    }

    #[test]
    fn projection_modes() {
        let d = doc(json!({"_id": "1", "app": "web", "body": {"a": 1, "b": 2}}));
        let inc = project(&d, &doc(json!({"app": 1, "body.a": 1}))).ok();
        assert_eq!(inc, Some(doc(json!({"app": "web", "body": {"a": 1}, "_id": "1"}))));

        let exc = project(&d, &doc(json!({"body": 0, "_id": 0}))).ok();
        assert_eq!(exc, Some(doc(json!({"app": "web"}))));

        assert!(project(&d, &doc(json!({"app": 1, "body": 0}))).is_err());
    }

    #[test]
    fn aggregate_group_and_sort() {
        let docs = vec![
            doc(json!({"app": "web", "ms": 10})),
            doc(json!({"app": "api", "ms": 5})),
            doc(json!({"app": "web", "ms": 30})),
        ];
        let pipeline = vec![
            doc(json!({"$group": {
                "_id": "$app",
                "n": {"$sum": 1},
                "total": {"$sum": "$ms"},
                "avg": {"$avg": "$ms"},
                "max": {"$max": "$ms"}
            }})),
            doc(json!({"$sort": {"n": -1}})),
        ];
        let out = aggregate(docs, &pipeline);
        assert!(out.is_ok());
        if let Ok(out) = out {
            assert_eq!(out.len(), 2);
            assert_eq!(out[0]["_id"], json!("web"));
            assert_eq!(out[0]["n"], json!(2));
            assert_eq!(out[0]["total"], json!(40));
            assert_eq!(out[0]["avg"], json!(20.0));
            assert_eq!(out[0]["max"], json!(30));
            assert_eq!(out[1]["_id"], json!("api"));
        }
    }

    #[test]
    fn aggregate_match_count_and_paging() {
        let docs: Vec<_> = (0..10).map(|n| doc(json!({"n": n}))).collect();
        let out = aggregate(
            docs.clone(),
            &[doc(json!({"$match": {"n": {"$gte": 5}}})), doc(json!({"$count": "hits"}))],
        );
        assert_eq!(out.ok(), Some(vec![doc(json!({"hits": 5}))]));

        let out = aggregate(docs, &[doc(json!({"$skip": 8})), doc(json!({"$limit": 5}))]);
        assert_eq!(out.map(|d| d.len()).ok(), Some(2));
    }

    #[test]
    fn aggregate_rejects_unknown_stages() {
        assert!(aggregate(Vec::new(), &[doc(json!({"$lookup": {}}))]).is_err());
        assert!(aggregate(Vec::new(), &[doc(json!({"$skip": 1, "$limit": 1}))]).is_err());
        assert!(aggregate(Vec::new(), &[doc(json!({"$group": {"n": {"$sum": 1}}}))]).is_err());
    }
}
