//! Class schemas and the class registry.
//!
//! Schemas describe the fields of an object class and let the store reject
//! operations and stored rows whose values do not fit before they are applied.
//! Classes without a schema are accepted unless the registry is strict.

use crate::value::{json_type_name, parse_date, parse_relation, Fields, Pointer};
use crate::{error::Result, ClassName, Error, FieldOperation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Pointer,
    Relation,
    Array,
    Object,
    /// Any JSON value
    Any,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Number => write!(f, "Number"),
            FieldType::Boolean => write!(f, "Bool"),
            FieldType::Date => write!(f, "Date"),
            FieldType::Pointer => write!(f, "Pointer"),
            FieldType::Relation => write!(f, "Relation"),
            FieldType::Array => write!(f, "Array"),
            FieldType::Object => write!(f, "Object"),
            FieldType::Any => write!(f, "Any"),
        }
    }
}

/// Definition of a field in a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Class referenced by pointer and relation fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_class: Option<ClassName>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            target_class: None,
        }
    }

    /// A pointer field referencing `target_class`.
    pub fn pointer(name: impl Into<String>, target_class: impl Into<ClassName>) -> Self {
        Self {
            target_class: Some(target_class.into()),
            ..Self::new(name, FieldType::Pointer)
        }
    }

    /// A relation field referencing `target_class`.
    pub fn relation(name: impl Into<String>, target_class: impl Into<ClassName>) -> Self {
        Self {
            target_class: Some(target_class.into()),
            ..Self::new(name, FieldType::Relation)
        }
    }

    /// Validate a JSON value against this field definition. Null always fits.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::Any => true,
            _ if value.is_null() => true,
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Date => parse_date(value).is_some(),
            FieldType::Pointer => Pointer::from_value(value)
                .is_some_and(|p| self.accepts_class(&p.class_name)),
            FieldType::Relation => {
                parse_relation(value).is_some_and(|(class, _)| self.accepts_class(&class))
            }
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        };

        if valid {
            Ok(())
        } else {
            Err(self.mismatch(json_type_name(value)))
        }
    }

    /// Validate that `operation` can be applied to this field.
    pub fn validate_operation(&self, operation: &FieldOperation) -> Result<()> {
        match operation {
            FieldOperation::Set { value } => self.validate(value),
            FieldOperation::Delete => Ok(()),
            FieldOperation::Increment { .. } => match self.field_type {
                FieldType::Number | FieldType::Any => Ok(()),
                _ => Err(self.mismatch("Increment")),
            },
            FieldOperation::Add { .. }
            | FieldOperation::AddUnique { .. }
            | FieldOperation::Remove { .. } => match self.field_type {
                FieldType::Array | FieldType::Any => Ok(()),
                _ => Err(self.mismatch(operation.name())),
            },
            FieldOperation::Relation { target_class, .. } => match self.field_type {
                FieldType::Relation if self.accepts_class(target_class) => Ok(()),
                FieldType::Any => Ok(()),
                _ => Err(self.mismatch(&format!("Relation<{target_class}>"))),
            },
        }
    }

    fn accepts_class(&self, class_name: &str) -> bool {
        self.target_class
            .as_deref()
            .map_or(true, |target| target == class_name)
    }

    fn mismatch(&self, got: &str) -> Error {
        let expected = match &self.target_class {
            Some(target) => format!("{}<{target}>", self.field_type),
            None => self.field_type.to_string(),
        };
        Error::TypeMismatch {
            field: self.name.clone(),
            expected,
            got: got.to_string(),
        }
    }
}

/// Schema for one object class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSchema {
    /// Class name
    pub name: ClassName,
    /// Field definitions
    pub fields: Vec<FieldDef>,
}

impl ClassSchema {
    pub fn new(name: impl Into<ClassName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Validate every declared field present in `fields`. Undeclared keys are
    /// allowed.
    pub fn validate_fields(&self, fields: &Fields) -> Result<()> {
        for field in &self.fields {
            if let Some(value) = fields.get(&field.name) {
                field.validate(value)?;
            }
        }
        Ok(())
    }
}

/// Registry of known classes, consulted when decoding stored rows and
/// validating operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRegistry {
    /// Class schemas by name
    pub classes: HashMap<ClassName, ClassSchema>,
    /// Reject classes that were never registered
    #[serde(default)]
    pub strict: bool,
}

impl ClassRegistry {
    /// A registry that accepts any class.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that only accepts registered classes.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    /// Register a class schema.
    pub fn register(&mut self, schema: ClassSchema) -> &mut Self {
        self.classes.insert(schema.name.clone(), schema);
        self
    }

    /// Builder-style method to register a class.
    pub fn with_class(mut self, schema: ClassSchema) -> Self {
        self.register(schema);
        self
    }

    pub fn get(&self, class_name: &str) -> Option<&ClassSchema> {
        self.classes.get(class_name)
    }

    /// Fail if `class_name` is unknown to a strict registry.
    pub fn check_class(&self, class_name: &str) -> Result<Option<&ClassSchema>> {
        match self.classes.get(class_name) {
            Some(schema) => Ok(Some(schema)),
            None if self.strict => Err(Error::UnknownClass(class_name.to_string())),
            None => Ok(None),
        }
    }

    /// Validate an operation on `key` of an object of `class_name`.
    pub fn validate_operation(
        &self,
        class_name: &str,
        key: &str,
        operation: &FieldOperation,
    ) -> Result<()> {
        match self.check_class(class_name)?.and_then(|schema| schema.field(key)) {
            Some(field) => field.validate_operation(operation),
            None => Ok(()),
        }
    }

    /// Validate a decoded field map of an object of `class_name`.
    pub fn validate_fields(&self, class_name: &str, fields: &Fields) -> Result<()> {
        match self.check_class(class_name)? {
            Some(schema) => schema.validate_fields(fields),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ClassRegistry {
        ClassRegistry::new().with_class(ClassSchema::new(
            "Post",
            vec![
                FieldDef::new("title", FieldType::String),
                FieldDef::new("score", FieldType::Number),
                FieldDef::new("tags", FieldType::Array),
                FieldDef::pointer("author", "User"),
                FieldDef::relation("likes", "User"),
            ],
        ))
    }

    #[test]
    fn validate_valid_fields() {
        let fields = json!({
            "title": "Hello",
            "score": 3,
            "author": {"__type": "Pointer", "className": "User", "localId": "u-1"},
            "extra": true,
        });
        assert!(registry()
            .validate_fields("Post", fields.as_object().unwrap())
            .is_ok());
    }

    #[test]
    fn validate_wrong_type() {
        let fields = json!({"score": "three"});
        let result = registry().validate_fields("Post", fields.as_object().unwrap());
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "score"));
    }

    #[test]
    fn pointer_target_class_is_checked() {
        let fields = json!({
            "author": {"__type": "Pointer", "className": "Team", "localId": "t-1"},
        });
        let err = registry()
            .validate_fields("Post", fields.as_object().unwrap())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'author': expected Pointer<User>, got Pointer"
        );
    }

    #[test]
    fn validate_operations() {
        let registry = registry();
        assert!(registry
            .validate_operation("Post", "score", &FieldOperation::increment(1))
            .is_ok());
        assert!(registry
            .validate_operation("Post", "title", &FieldOperation::increment(1))
            .is_err());
        assert!(registry
            .validate_operation("Post", "tags", &FieldOperation::add(vec![json!(1)]))
            .is_ok());
        assert!(registry
            .validate_operation("Post", "likes", &FieldOperation::add_relation("User", ["u".into()]))
            .is_ok());
        assert!(registry
            .validate_operation("Post", "likes", &FieldOperation::add_relation("Team", ["t".into()]))
            .is_err());
        assert!(registry
            .validate_operation("Post", "title", &FieldOperation::Delete)
            .is_ok());
    }

    #[test]
    fn unknown_classes() {
        assert!(registry()
            .validate_operation("Comment", "x", &FieldOperation::increment(1))
            .is_ok());

        let strict = ClassRegistry::strict();
        let result = strict.validate_fields("Comment", &Fields::new());
        assert!(matches!(result, Err(Error::UnknownClass(c)) if c == "Comment"));
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Boolean.to_string(), "Bool");
        assert_eq!(FieldType::Any.to_string(), "Any");
    }

    #[test]
    fn registry_serialization() {
        let registry = registry();
        let json = serde_json::to_string(&registry).unwrap();
        let parsed: ClassRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(registry, parsed);
    }
}
