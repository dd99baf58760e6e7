//! PK-string construction and synthetic id assignment.

use crate::error::{Error, Result};
use crate::value::{Record, Value};

/// The ordered list of field names that make up a table's primary key.
/// May be empty, in which case a synthetic `_id` field is used instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyDef(Vec<String>);

pub const SYNTHETIC_ID_FIELD: &str = "_id";

impl PrimaryKeyDef {
    /// Builds a PK definition, rejecting duplicate field names.
    pub fn new(fields: Vec<String>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for f in &fields {
            if !seen.insert(f.clone()) {
                return Err(Error::DuplicatePkDefinition(f.clone()));
            }
        }
        Ok(Self(fields))
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `field` is one of the PK's components, or (for an empty
    /// PKDef) if it is the synthetic `_id` field.
    pub fn touches(&self, field: &str) -> bool {
        if self.0.is_empty() {
            field == SYNTHETIC_ID_FIELD
        } else {
            self.0.iter().any(|f| f == field)
        }
    }

    /// True if any key in `patch` would change this record's PK.
    pub fn touched_by(&self, patch: &Record) -> bool {
        patch.keys().any(|k| self.touches(k))
    }

    /// Builds the canonical PKString for `record`, auto-assigning a
    /// synthetic `_id` (a fresh UUID) when the PKDef is empty and the
    /// record doesn't already carry one.
    ///
    /// Returns `PrimaryKeyValueNull` listing every missing component when
    /// the record is incomplete; mutates `record` in place only to add the
    /// synthetic `_id` when one must be generated.
    pub fn build_pk_string(&self, record: &mut Record) -> Result<String> {
        if self.0.is_empty() {
            if let Some(existing) = record.get(SYNTHETIC_ID_FIELD) {
                return existing
                    .to_pk_component()
                    .ok_or_else(|| Error::PrimaryKeyValueNull(vec![SYNTHETIC_ID_FIELD.to_string()]));
            }
            let id = crate::util::new_uuid_string();
            record.insert(SYNTHETIC_ID_FIELD.to_string(), Value::Str(id.clone()));
            return Ok(id);
        }

        let mut missing = Vec::new();
        let mut parts = Vec::with_capacity(self.0.len());
        for field in &self.0 {
            match record.get(field).and_then(Value::to_pk_component) {
                Some(part) => parts.push(part),
                None => missing.push(field.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::PrimaryKeyValueNull(missing));
        }
        Ok(parts.join("-"))
    }

    /// Same as `build_pk_string`, but for a read-only lookup: a partial
    /// record supplying only the PK fields. Never assigns a synthetic id.
    pub fn build_pk_string_from_partial(&self, partial: &Record) -> Result<String> {
        if self.0.is_empty() {
            return partial
                .get(SYNTHETIC_ID_FIELD)
                .and_then(Value::to_pk_component)
                .ok_or_else(|| Error::PrimaryKeyValueNull(vec![SYNTHETIC_ID_FIELD.to_string()]));
        }
        let mut missing = Vec::new();
        let mut parts = Vec::with_capacity(self.0.len());
        for field in &self.0 {
            match partial.get(field).and_then(Value::to_pk_component) {
                Some(part) => parts.push(part),
                None => missing.push(field.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::PrimaryKeyValueNull(missing));
        }
        Ok(parts.join("-"))
    }
}

pub fn new_uuid_string() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn rejects_duplicate_pk_fields() {
        let res = PrimaryKeyDef::new(vec!["id".into(), "id".into()]);
        assert!(matches!(res, Err(Error::DuplicatePkDefinition(_))));
    }

    #[test]
    fn single_field_pk_string_is_the_field_value() {
        let pk = PrimaryKeyDef::new(vec!["id".into()]).unwrap();
        let mut r = record! { "id" => 1i64 };
        assert_eq!(pk.build_pk_string(&mut r).unwrap(), "1");
    }

    #[test]
    fn composite_pk_joins_with_dash() {
        let pk = PrimaryKeyDef::new(vec!["a".into(), "b".into()]).unwrap();
        let mut r = record! { "a" => "x", "b" => "y" };
        assert_eq!(pk.build_pk_string(&mut r).unwrap(), "x-y");
    }

    #[test]
    fn missing_pk_component_is_rejected() {
        let pk = PrimaryKeyDef::new(vec!["id".into()]).unwrap();
        let mut r: Record = record! { "name" => "A" };
        assert!(matches!(
            pk.build_pk_string(&mut r),
            Err(Error::PrimaryKeyValueNull(_))
        ));
    }

    #[test]
    fn empty_pkdef_assigns_synthetic_id() {
        let pk = PrimaryKeyDef::new(vec![]).unwrap();
        let mut r: Record = record! { "name" => "A" };
        let id = pk.build_pk_string(&mut r).unwrap();
        assert_eq!(r.get(SYNTHETIC_ID_FIELD).unwrap().as_str(), Some(id.as_str()));
    }
}
