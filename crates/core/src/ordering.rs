//! Ordering engine for rendered collections.
//!
//! Sorting goes through a named accessor per field. Two numbers compare
//! numerically; anything else is rendered to text and compared with
//! [`natural_cmp`]. Sorting is stable in both directions.

use std::cmp::Ordering;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::LiteObj;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// A field value extracted for comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Bool(bool),
    Null,
}

impl FieldValue {
    fn render(&self) -> String {
        match self {
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Null => String::new(),
        }
    }
}

impl From<&serde_json::Value> for FieldValue {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Null),
            serde_json::Value::String(s) => FieldValue::Text(s.clone()),
            other => FieldValue::Text(other.to_string()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self { FieldValue::Text(s.to_string()) }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self { FieldValue::Number(n as f64) }
}

pub type Accessor<T> = Box<dyn Fn(&T) -> FieldValue + Send + Sync>;

/// Named field accessors for one entity type.
pub struct FieldAccessors<T> {
    map: FxHashMap<String, Accessor<T>>,
}

impl<T> Default for FieldAccessors<T> {
    fn default() -> Self { Self { map: FxHashMap::default() } }
}

impl<T> FieldAccessors<T> {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, name: &str, f: impl Fn(&T) -> FieldValue + Send + Sync + 'static) -> Self {
        self.insert(name, f);
        self
    }

    pub fn insert(&mut self, name: &str, f: impl Fn(&T) -> FieldValue + Send + Sync + 'static) {
        self.map.insert(name.to_string(), Box::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&Accessor<T>> { self.map.get(name) }
}

impl LiteObj {
    /// Accessors for the common metadata columns.
    pub fn accessors() -> FieldAccessors<LiteObj> {
        FieldAccessors::new()
            .with("name", |o: &LiteObj| FieldValue::Text(o.name.clone()))
            .with("namespace", |o: &LiteObj| FieldValue::Text(o.namespace.clone().unwrap_or_default()))
            .with("age", |o: &LiteObj| FieldValue::Number(o.creation_ts as f64))
            .with("resourceVersion", |o: &LiteObj| {
                o.resource_version.as_deref().map(FieldValue::from).unwrap_or(FieldValue::Null)
            })
    }
}

/// Compare two accessed values: numerically when both are numbers, naturally as text otherwise.
pub fn compare_values(a: &FieldValue, b: &FieldValue) -> Ordering {
    match (a, b) {
        (FieldValue::Number(x), FieldValue::Number(y)) => x.total_cmp(y),
        _ => natural_cmp(&a.render(), &b.render()),
    }
}

/// Case-insensitive comparison where digit runs compare by numeric value,
/// so `pod-2` sorts before `pod-10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();
    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let da = take_digits(&mut ai);
                let db = take_digits(&mut bi);
                let (ta, tb) = (da.trim_start_matches('0'), db.trim_start_matches('0'));
                let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                ai.next();
                bi.next();
            }
        }
    }
}

fn take_digits(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut out = String::new();
    while let Some(c) = it.peek().copied().filter(|c| c.is_ascii_digit()) {
        out.push(c);
        it.next();
    }
    out
}

/// Return `items` ordered by `sort_key`. Unknown keys compare as equal, which leaves the
/// input order untouched. Equal keys keep their relative input order in both directions.
pub fn sort_items<T: Clone>(items: &[T], sort_key: &str, direction: SortDirection, accessors: &FieldAccessors<T>) -> Vec<T> {
    let Some(access) = accessors.get(sort_key) else {
        return items.to_vec();
    };
    // Extract keys once per element
    let mut keyed: Vec<(FieldValue, &T)> = items.iter().map(|it| (access(it), it)).collect();
    // slice::sort_by is a stable merge sort
    keyed.sort_by(|(a, _), (b, _)| match direction {
        SortDirection::Asc => compare_values(a, b),
        SortDirection::Desc => compare_values(b, a),
    });
    keyed.into_iter().map(|(_, it)| it.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row { name: &'static str, v: f64 }

    fn rows_accessors() -> FieldAccessors<Row> {
        FieldAccessors::new()
            .with("name", |r: &Row| FieldValue::from(r.name))
            .with("v", |r: &Row| FieldValue::Number(r.v))
    }

    fn names(rows: &[Row]) -> Vec<&'static str> { rows.iter().map(|r| r.name).collect() }

    #[test]
    fn equal_keys_keep_input_order() {
        let rows = vec![Row { name: "b", v: 1.0 }, Row { name: "a", v: 1.0 }, Row { name: "c", v: 2.0 }];
        let out = sort_items(&rows, "v", SortDirection::Asc, &rows_accessors());
        assert_eq!(names(&out), ["b", "a", "c"]);
        let out = sort_items(&rows, "v", SortDirection::Desc, &rows_accessors());
        assert_eq!(names(&out), ["c", "b", "a"]);
    }

    #[test]
    fn unknown_key_is_identity() {
        let rows = vec![Row { name: "z", v: 3.0 }, Row { name: "a", v: 1.0 }];
        let out = sort_items(&rows, "missing", SortDirection::Asc, &rows_accessors());
        assert_eq!(out, rows);
    }

    #[test]
    fn natural_order_for_embedded_numbers() {
        let rows = vec![Row { name: "pod-10", v: 0.0 }, Row { name: "Pod-2", v: 0.0 }, Row { name: "pod-1", v: 0.0 }];
        let out = sort_items(&rows, "name", SortDirection::Asc, &rows_accessors());
        assert_eq!(names(&out), ["pod-1", "Pod-2", "pod-10"]);
    }

    #[test]
    fn natural_cmp_cases() {
        assert_eq!(natural_cmp("pod-2", "pod-10"), Ordering::Less);
        assert_eq!(natural_cmp("ABC", "abc"), Ordering::Equal);
        assert_eq!(natural_cmp("a007", "a7"), Ordering::Equal);
        assert_eq!(natural_cmp("web", "web-1"), Ordering::Less);
        assert_eq!(natural_cmp("b", "A"), Ordering::Greater);
    }

    #[test]
    fn mixed_values_fall_back_to_text() {
        assert_eq!(compare_values(&FieldValue::Number(10.0), &FieldValue::Text("9".into())), Ordering::Greater);
        assert_eq!(compare_values(&FieldValue::Number(2.0), &FieldValue::Number(10.0)), Ordering::Less);
        assert_eq!(compare_values(&FieldValue::Null, &FieldValue::Text("a".into())), Ordering::Less);
    }

    #[test]
    fn registry_lookup_and_override() {
        let mut acc = rows_accessors();
        assert!(acc.get("v").is_some());
        assert!(acc.get("missing").is_none());
        acc.insert("v", |r: &Row| FieldValue::Number(-r.v));
        let rows = vec![Row { name: "a", v: 1.0 }, Row { name: "b", v: 2.0 }];
        let out = sort_items(&rows, "v", SortDirection::Asc, &acc);
        assert_eq!(names(&out), ["b", "a"]);
    }

    #[test]
    fn lite_obj_accessors_sort_by_age() {
        let mk = |name: &str, ts: i64| LiteObj {
            uid: [0u8; 16],
            namespace: Some("default".into()),
            name: name.into(),
            resource_version: None,
            creation_ts: ts,
            labels: Default::default(),
        };
        let items = vec![mk("new", 300), mk("old", 100), mk("mid", 200)];
        let out = sort_items(&items, "age", SortDirection::Asc, &LiteObj::accessors());
        let got: Vec<&str> = out.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(got, ["old", "mid", "new"]);
    }
}
