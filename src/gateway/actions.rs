use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Validation errors for action parameters
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    UnknownAction(String),
    ParamsNotObject,
    InvalidFields {
        missing: Vec<String>,
        unknown: Vec<String>,
    },
    /// The idempotency key was already used for a different preview.
    IdempotencyKeyReused,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::UnknownAction(id) => write!(f, "unknown action '{}'", id),
            ValidationError::ParamsNotObject => write!(f, "params must be a JSON object"),
            ValidationError::InvalidFields { missing, unknown } => {
                let mut parts = Vec::new();
                if !missing.is_empty() {
                    parts.push(format!("missing required field(s): {}", missing.join(", ")));
                }
                if !unknown.is_empty() {
                    parts.push(format!("unknown field(s): {}", unknown.join(", ")));
                }
                write!(f, "{}", parts.join("; "))
            }
            ValidationError::IdempotencyKeyReused => {
                write!(f, "idempotency key was already used for a different preview")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Declared contract of one side-effecting action.
#[derive(Clone, Debug, Deserialize)]
pub struct ActionSpec {
    /// Stable id, e.g. "gmail.send"
    pub id: String,
    /// Provider whose credential the action runs with
    pub provider: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    /// Fields that define "the same action"; empty means all fields
    #[serde(default)]
    pub digest_fields: Vec<String>,
    /// Human-readable summary with `{field}` placeholders
    #[serde(default)]
    pub summary: String,
}

impl ActionSpec {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            required: Vec::new(),
            optional: Vec::new(),
            digest_fields: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn required(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn optional(mut self, fields: &[&str]) -> Self {
        self.optional = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn digest_fields(mut self, fields: &[&str]) -> Self {
        self.digest_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn summary(mut self, template: &str) -> Self {
        self.summary = template.to_string();
        self
    }

    /// Checks params against the contract.
    ///
    /// Rules:
    /// - params must be a JSON object
    /// - every required field present, non-null, and not a blank string
    /// - no fields outside required + optional
    ///
    /// All offending fields are reported at once.
    pub fn validate(&self, params: &Value) -> Result<(), ValidationError> {
        let object = params.as_object().ok_or(ValidationError::ParamsNotObject)?;

        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|field| object.get(field.as_str()).map_or(true, is_blank))
            .cloned()
            .collect();

        let mut unknown: Vec<String> = object
            .keys()
            .filter(|key| !self.required.contains(key) && !self.optional.contains(key))
            .cloned()
            .collect();
        unknown.sort();

        if missing.is_empty() && unknown.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::InvalidFields { missing, unknown })
        }
    }

    /// SHA-256 (hex) over the action id and the canonical JSON of the
    /// digest fields. Key order and non-digest fields do not affect it.
    pub fn digest(&self, params: &Value) -> String {
        let subset: Map<String, Value> = match params.as_object() {
            Some(object) if !self.digest_fields.is_empty() => self
                .digest_fields
                .iter()
                .filter_map(|field| object.get(field).map(|v| (field.clone(), v.clone())))
                .collect(),
            Some(object) => object.clone(),
            None => Map::new(),
        };

        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_json(&Value::Object(subset)).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Renders the summary template. Missing fields render empty.
    pub fn render_summary(&self, params: &Value) -> String {
        if self.summary.is_empty() {
            return self.id.clone();
        }

        let mut out = String::with_capacity(self.summary.len());
        let mut rest = self.summary.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let field = &after[..close];
                    match params.get(field) {
                        Some(Value::String(s)) => out.push_str(s),
                        Some(Value::Null) | None => {}
                        Some(other) => out.push_str(&other.to_string()),
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// JSON with object keys sorted at every level and no insignificant
/// whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&object[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Registered actions by id.
#[derive(Clone, Debug, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionSpec>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an action.
    pub fn register(&mut self, spec: ActionSpec) {
        self.actions.insert(spec.id.clone(), spec);
    }

    pub fn with(mut self, spec: ActionSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn resolve(&self, action_id: &str) -> Result<&ActionSpec, ValidationError> {
        self.actions
            .get(action_id)
            .ok_or_else(|| ValidationError::UnknownAction(action_id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn send_mail() -> ActionSpec {
        ActionSpec::new("gmail.send", "gmail")
            .required(&["to", "subject"])
            .optional(&["body", "cc"])
            .digest_fields(&["to", "subject", "body"])
            .summary("Send '{subject}' to {to}")
    }

    #[test]
    fn test_valid_params() {
        let params = json!({"to": "a@example.com", "subject": "Hi", "body": "..."});
        assert!(send_mail().validate(&params).is_ok());
    }

    #[test]
    fn test_missing_subject_is_listed() {
        let err = send_mail()
            .validate(&json!({"to": "a@example.com"}))
            .unwrap_err();

        assert_eq!(
            err,
            ValidationError::InvalidFields {
                missing: vec!["subject".to_string()],
                unknown: vec![],
            }
        );
        assert!(err.to_string().contains("subject"));
    }

    #[test]
    fn test_blank_and_null_count_as_missing() {
        let err = send_mail()
            .validate(&json!({"to": "  ", "subject": null}))
            .unwrap_err();
        match err {
            ValidationError::InvalidFields { missing, .. } => {
                assert_eq!(missing, vec!["to".to_string(), "subject".to_string()])
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = send_mail()
            .validate(&json!({"to": "a", "subject": "b", "bcc": "c", "attach": 1}))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidFields {
                missing: vec![],
                unknown: vec!["attach".to_string(), "bcc".to_string()],
            }
        );
    }

    #[test]
    fn test_params_must_be_object() {
        assert_eq!(
            send_mail().validate(&json!(["to"])).unwrap_err(),
            ValidationError::ParamsNotObject
        );
    }

    #[test]
    fn test_digest_ignores_key_order_and_non_digest_fields() {
        let spec = send_mail();
        let a = json!({"to": "a@example.com", "subject": "Hi", "cc": "x@example.com"});
        let b = json!({"subject": "Hi", "to": "a@example.com"});
        let c = json!({"subject": "Hello", "to": "a@example.com"});

        assert_eq!(spec.digest(&a), spec.digest(&b));
        assert_ne!(spec.digest(&a), spec.digest(&c));
        assert_eq!(spec.digest(&a).len(), 64);
    }

    #[test]
    fn test_digest_is_scoped_by_action() {
        let params = json!({"to": "a", "subject": "b"});
        let other = ActionSpec::new("gmail.draft", "gmail").digest_fields(&["to", "subject"]);
        assert_ne!(send_mail().digest(&params), other.digest(&params));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"y": 1, "x": [true, null]}, "a": "s"});
        assert_eq!(canonical_json(&value), r#"{"a":"s","b":{"x":[true,null],"y":1}}"#);
    }

    #[test]
    fn test_render_summary() {
        let params = json!({"to": "a@example.com", "subject": "Hi"});
        assert_eq!(send_mail().render_summary(&params), "Send 'Hi' to a@example.com");

        let bare = ActionSpec::new("drive.upload", "gdrive");
        assert_eq!(bare.render_summary(&params), "drive.upload");
    }

    #[test]
    fn test_registry_resolve() {
        let registry = ActionRegistry::new().with(send_mail());
        assert!(registry.resolve("gmail.send").is_ok());
        assert_eq!(
            registry.resolve("gmail.nuke").unwrap_err(),
            ValidationError::UnknownAction("gmail.nuke".to_string())
        );
        assert_eq!(registry.ids(), vec!["gmail.send"]);
    }
}
