use std::collections::BTreeMap;

use crate::model::FieldPath;
use crate::value::{FirestoreValue, ValueKind};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    /// Retrieves a value referenced by the provided field path if it exists.
    pub fn get(&self, field_path: &FieldPath) -> Option<&FirestoreValue> {
        get_from_segments(self.fields(), field_path.segments())
    }

    /// Sets the value at `field_path`, creating intermediate maps as needed.
    pub fn set(&mut self, field_path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, field_path.segments(), value);
    }

    /// Removes the value at `field_path`, if present. No-op if any intermediate
    /// segment is not itself a map.
    pub fn remove(&mut self, field_path: &FieldPath) {
        remove_at_segments(&mut self.fields, field_path.segments());
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let (first, rest) = match segments.split_first() {
        Some(parts) => parts,
        None => return,
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }
    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));
    if !matches!(entry.kind(), ValueKind::Map(_)) {
        *entry = FirestoreValue::from_map(BTreeMap::new());
    }
    if let ValueKind::Map(map) = entry.kind() {
        let mut nested = map.clone();
        set_at_segments(&mut nested.fields, rest, value);
        *entry = FirestoreValue::from_map(nested.fields);
    }
}

fn remove_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let (first, rest) = match segments.split_first() {
        Some(parts) => parts,
        None => return,
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    if let Some(entry) = fields.get_mut(first) {
        if let ValueKind::Map(map) = entry.kind() {
            let mut nested = map.clone();
            remove_at_segments(&mut nested.fields, rest);
            *entry = FirestoreValue::from_map(nested.fields);
        }
    }
}

fn get_from_segments<'a>(
    fields: &'a BTreeMap<String, FirestoreValue>,
    segments: &[String],
) -> Option<&'a FirestoreValue> {
    let (first, rest) = segments.split_first()?;
    let value = fields.get(first)?;
    if rest.is_empty() {
        Some(value)
    } else if let ValueKind::Map(child) = value.kind() {
        get_from_segments(child.fields(), rest)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_map_entries() {
        let mut map = BTreeMap::new();
        map.insert("foo".to_string(), FirestoreValue::from_integer(1));
        let value = MapValue::new(map.clone());
        assert_eq!(value.fields().get("foo"), map.get("foo"));
    }

    #[test]
    fn get_returns_nested_value() {
        let mut inner = BTreeMap::new();
        inner.insert("bar".to_string(), FirestoreValue::from_string("baz"));
        let mut map = BTreeMap::new();
        map.insert("foo".to_string(), FirestoreValue::from_map(inner));
        let value = MapValue::new(map);
        let path = FieldPath::from_dot_separated("foo.bar").unwrap();
        let result = value.get(&path).unwrap();
        match result.kind() {
            ValueKind::String(s) => assert_eq!(s, "baz"),
            _ => panic!("expected string"),
        }
    }
}
