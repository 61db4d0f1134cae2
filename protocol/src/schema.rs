//! Parameter declarations per request type.
//!
//! A schema belongs to a request *type*, not to an instance: it lists the
//! parameters every request of that type must carry and the defaults applied
//! to optional ones that were left out.

use std::collections::HashMap;

use crate::command::Request;
use crate::error::ProtocolError;
use crate::kinds;

/// Declared parameters of one request type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSchema {
    kind: String,
    required: Vec<String>,
    optional: Vec<(String, String)>,
}

impl RequestSchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            required: Vec::new(),
            optional: Vec::new(),
        }
    }

    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn optional(mut self, name: impl Into<String>, default: impl Into<String>) -> Self {
        self.optional.push((name.into(), default.into()));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn required_params(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    /// Fills in defaults for optional parameters the sender omitted.
    pub fn apply_defaults(&self, request: &mut Request) {
        for (name, default) in &self.optional {
            request
                .parameters
                .entry(name.clone())
                .or_insert_with(|| default.clone());
        }
    }

    /// Checks that every required parameter is present.
    pub fn validate(&self, request: &Request) -> Result<(), ProtocolError> {
        match self
            .required
            .iter()
            .find(|name| !request.parameters.contains_key(name.as_str()))
        {
            Some(name) => Err(ProtocolError::MissingParameter {
                kind: request.kind.clone(),
                name: name.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Lookup table of schemas by request type.
///
/// Types without a schema are accepted as-is; whether anyone handles them is
/// decided later by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct SchemaTable {
    schemas: HashMap<String, RequestSchema>,
}

impl SchemaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding only the schemas of the core protocol requests.
    pub fn core() -> Self {
        let mut table = Self::new();
        table.insert(RequestSchema::new(kinds::HELLO).required("os"));
        table.insert(RequestSchema::new(kinds::PING));
        table.insert(RequestSchema::new(kinds::SHUTDOWN).optional("requester", ""));
        table
    }

    /// Inserts or replaces the schema for its type, returning the previous one.
    pub fn insert(&mut self, schema: RequestSchema) -> Option<RequestSchema> {
        self.schemas.insert(schema.kind.clone(), schema)
    }

    pub fn get(&self, kind: &str) -> Option<&RequestSchema> {
        self.schemas.get(kind)
    }

    pub fn apply_defaults(&self, request: &mut Request) {
        if let Some(schema) = self.get(&request.kind) {
            schema.apply_defaults(request);
        }
    }

    pub fn validate(&self, request: &Request) -> Result<(), ProtocolError> {
        match self.get(&request.kind) {
            Some(schema) => schema.validate(request),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_project_schema() -> RequestSchema {
        RequestSchema::new("OpenProject")
            .required("file")
            .optional("readonly", "false")
    }

    #[test]
    fn test_defaults_fill_missing_optional_params() {
        let schema = open_project_schema();
        let mut request = Request::new(1, "OpenProject").with_param("file", "/tmp/p");

        schema.apply_defaults(&mut request);

        assert_eq!(request.param("readonly"), Some("false"));
        assert_eq!(request.param("file"), Some("/tmp/p"));
    }

    #[test]
    fn test_defaults_never_override_sent_values() {
        let schema = open_project_schema();
        let mut request = Request::new(1, "OpenProject").with_param("readonly", "true");

        schema.apply_defaults(&mut request);

        assert_eq!(request.param("readonly"), Some("true"));
    }

    #[test]
    fn test_missing_required_param_is_reported() {
        let schema = open_project_schema();
        let request = Request::new(1, "OpenProject");

        let error = schema.validate(&request).unwrap_err();
        assert_eq!(
            error,
            ProtocolError::MissingParameter {
                kind: "OpenProject".to_string(),
                name: "file".to_string(),
            }
        );
        assert!(error.to_string().contains("file"));
    }

    #[test]
    fn test_table_ignores_unknown_types() {
        let table = SchemaTable::core();
        let mut request = Request::new(1, "Teleport");

        table.apply_defaults(&mut request);

        assert!(table.validate(&request).is_ok());
        assert!(request.parameters.is_empty());
    }

    #[test]
    fn test_core_table_requires_os_for_hello() {
        let table = SchemaTable::core();

        assert!(table.validate(&Request::new(1, kinds::HELLO)).is_err());
        assert!(table
            .validate(&Request::new(1, kinds::HELLO).with_param("os", "linux"))
            .is_ok());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_insert_replaces_existing_schema() {
        let mut table = SchemaTable::new();
        assert!(table.insert(RequestSchema::new("Eval")).is_none());
        assert!(table
            .insert(RequestSchema::new("Eval").required("code"))
            .is_some());
        assert_eq!(table.get("Eval").unwrap().required_params().count(), 1);
    }
}
