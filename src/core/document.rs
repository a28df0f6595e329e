//! In-memory model of the case-management document and the repair pass that
//! re-establishes its invariants before every write.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Dependent collections and the parent their foreign key must resolve to.
/// A dependent record with a missing or unresolved key is dropped on repair.
const DEPENDENT_RELATIONS: &[(CollectionRef, &str, CollectionRef)] = &[(
    CollectionRef::VerificationRequests,
    "caseId",
    CollectionRef::Cases,
)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectionRef {
    Cases,
    People,
    Organizations,
    VerificationRequests,
    Templates,
    Categories,
}

/// The single mutable document this layer persists.
///
/// Collections hold arbitrary JSON objects; the only structure this layer
/// enforces is the presence of a defined, non-null `id` per entry and
/// resolvable foreign keys for dependent records. Unknown top-level fields
/// (view scalars, migration leftovers) pass through untouched — no schema
/// version is enforced here.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Document {
    pub cases: Vec<Value>,
    pub people: Vec<Value>,
    pub organizations: Vec<Value>,
    pub verification_requests: Vec<Value>,
    pub templates: Vec<Value>,
    pub categories: Vec<Value>,
    pub view_state: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    /// Total number of entries across all collections.
    pub fn entry_count(&self) -> usize {
        self.collections().iter().map(|c| c.len()).sum()
    }

    /// Serialize as the on-disk format: pretty-printed JSON, 2-space indent.
    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parse raw file bytes, re-establishing the document invariants.
    pub fn parse(bytes: &[u8]) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Ok(validate_and_repair(value))
    }

    fn collections(&self) -> [&Vec<Value>; 6] {
        [
            &self.cases,
            &self.people,
            &self.organizations,
            &self.verification_requests,
            &self.templates,
            &self.categories,
        ]
    }

    fn collection(&self, which: CollectionRef) -> &Vec<Value> {
        match which {
            CollectionRef::Cases => &self.cases,
            CollectionRef::People => &self.people,
            CollectionRef::Organizations => &self.organizations,
            CollectionRef::VerificationRequests => &self.verification_requests,
            CollectionRef::Templates => &self.templates,
            CollectionRef::Categories => &self.categories,
        }
    }

    fn collection_mut(&mut self, which: CollectionRef) -> &mut Vec<Value> {
        match which {
            CollectionRef::Cases => &mut self.cases,
            CollectionRef::People => &mut self.people,
            CollectionRef::Organizations => &mut self.organizations,
            CollectionRef::VerificationRequests => &mut self.verification_requests,
            CollectionRef::Templates => &mut self.templates,
            CollectionRef::Categories => &mut self.categories,
        }
    }
}

/// Re-establish the document invariants on an arbitrary JSON value.
///
/// Pure function: missing or non-array collections become empty arrays, the
/// view-state object always exists, entries without a defined non-null `id`
/// are dropped, and dependent records whose parent id does not resolve among
/// surviving parents are dropped. Entries with a defined id are never removed
/// by the id pass.
pub fn validate_and_repair(data: Value) -> Document {
    let mut obj = match data {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let mut doc = Document {
        cases: take_array(&mut obj, "cases"),
        people: take_array(&mut obj, "people"),
        organizations: take_array(&mut obj, "organizations"),
        verification_requests: take_array(&mut obj, "verificationRequests"),
        templates: take_array(&mut obj, "templates"),
        categories: take_array(&mut obj, "categories"),
        view_state: take_object(&mut obj, "viewState"),
        // Remaining top-level fields pass through untouched.
        extra: obj,
    };

    for which in [
        CollectionRef::Cases,
        CollectionRef::People,
        CollectionRef::Organizations,
        CollectionRef::VerificationRequests,
        CollectionRef::Templates,
        CollectionRef::Categories,
    ] {
        doc.collection_mut(which).retain(has_defined_id);
    }

    for (dependent, key, parent) in DEPENDENT_RELATIONS {
        let surviving: HashSet<String> = doc
            .collection(*parent)
            .iter()
            .filter_map(|entry| id_key(entry.get("id")?))
            .collect();
        doc.collection_mut(*dependent).retain(|entry| {
            entry
                .get(*key)
                .and_then(id_key)
                .is_some_and(|id| surviving.contains(&id))
        });
    }

    doc
}

fn take_array(obj: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match obj.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn take_object(obj: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match obj.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn has_defined_id(entry: &Value) -> bool {
    entry
        .as_object()
        .and_then(|o| o.get("id"))
        .is_some_and(|id| !id.is_null())
}

/// Canonical comparison key for an id value; string and numeric ids both
/// resolve, null never does.
fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_id_entries_are_dropped() {
        let doc = validate_and_repair(json!({
            "cases": [],
            "people": [{"id": null, "name": "X"}],
        }));
        assert!(doc.cases.is_empty());
        assert!(doc.people.is_empty());
    }

    #[test]
    fn defined_ids_survive() {
        let doc = validate_and_repair(json!({
            "people": [
                {"id": "p-1", "name": "A"},
                {"id": 7, "name": "B"},
                {"name": "no id"},
            ],
        }));
        assert_eq!(doc.people.len(), 2);
    }

    #[test]
    fn missing_collections_become_arrays() {
        let doc = validate_and_repair(json!({"cases": "not-an-array"}));
        assert!(doc.cases.is_empty());
        assert!(doc.templates.is_empty());
        assert!(doc.view_state.is_empty());
    }

    #[test]
    fn orphaned_dependents_are_dropped() {
        let doc = validate_and_repair(json!({
            "cases": [{"id": "c-1"}],
            "verificationRequests": [
                {"id": "v-1", "caseId": "c-1"},
                {"id": "v-2", "caseId": "c-gone"},
                {"id": "v-3"},
            ],
        }));
        assert_eq!(doc.verification_requests.len(), 1);
        assert_eq!(doc.verification_requests[0]["id"], "v-1");
    }

    #[test]
    fn dependent_of_dropped_parent_is_dropped() {
        let doc = validate_and_repair(json!({
            "cases": [{"id": null}],
            "verificationRequests": [{"id": "v-1", "caseId": null}],
        }));
        assert!(doc.cases.is_empty());
        assert!(doc.verification_requests.is_empty());
    }

    #[test]
    fn numeric_case_ids_resolve() {
        let doc = validate_and_repair(json!({
            "cases": [{"id": 42}],
            "verificationRequests": [{"id": "v-1", "caseId": 42}],
        }));
        assert_eq!(doc.verification_requests.len(), 1);
    }

    #[test]
    fn unknown_top_level_fields_pass_through() {
        let doc = validate_and_repair(json!({
            "cases": [],
            "selectedCaseId": "c-9",
            "viewState": {"activeTab": "cases"},
        }));
        assert_eq!(doc.extra["selectedCaseId"], "c-9");
        assert_eq!(doc.view_state["activeTab"], "cases");
    }

    #[test]
    fn round_trips_through_pretty_json() {
        let doc = validate_and_repair(json!({
            "cases": [{"id": "c-1", "title": "Review"}],
            "viewState": {"zoom": 1.5},
        }));
        let text = doc.to_pretty_json().unwrap();
        assert!(text.contains("\n  \"cases\""));
        let back = Document::parse(text.as_bytes()).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn non_object_input_repairs_to_empty_document() {
        let doc = validate_and_repair(json!([1, 2, 3]));
        assert_eq!(doc.entry_count(), 0);
    }
}
