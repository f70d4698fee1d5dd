//! Declared parameter schemas, checked at admission time so handlers only
//! ever see well-formed params.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    StringList,
    Object,
}

impl ParamKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::StringList => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
            ParamKind::Object => value.is_object(),
        }
    }

    fn json_type(&self) -> Value {
        match self {
            ParamKind::String => json!({"type": "string"}),
            ParamKind::Integer => json!({"type": "integer"}),
            ParamKind::Number => json!({"type": "number"}),
            ParamKind::Boolean => json!({"type": "boolean"}),
            ParamKind::StringList => json!({"type": "array", "items": {"type": "string"}}),
            ParamKind::Object => json!({"type": "object"}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamField {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// Flat object schema: a list of typed, optionally required fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSchema {
    #[serde(default)]
    pub fields: Vec<ParamField>,
    /// Accept keys that are not declared.
    #[serde(default)]
    pub allow_extra: bool,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.fields.push(ParamField {
            name: name.into(),
            kind,
            required: true,
            description: String::new(),
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.fields.push(ParamField {
            name: name.into(),
            kind,
            required: false,
            description: String::new(),
        });
        self
    }

    pub fn allow_extra(mut self) -> Self {
        self.allow_extra = true;
        self
    }

    /// Check `params` against the schema. The error names the offending field.
    pub fn validate(&self, params: &Value) -> Result<(), String> {
        let Some(object) = params.as_object() else {
            return Err("params must be a JSON object".to_string());
        };

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.kind.matches(value) => {
                    return Err(format!(
                        "field '{}' must be {:?}, got {}",
                        field.name,
                        field.kind,
                        value_kind(value)
                    ));
                }
                Some(_) => {}
            }
        }

        if !self.allow_extra {
            if let Some(unknown) = object
                .keys()
                .find(|k| !self.fields.iter().any(|f| &f.name == *k))
            {
                return Err(format!("unknown field '{}'", unknown));
            }
        }
        Ok(())
    }

    /// Render as a JSON Schema object for LLM tool descriptions.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let mut prop = field.kind.json_type();
            if !field.description.is_empty() {
                prop["description"] = Value::String(field.description.clone());
            }
            properties.insert(field.name.clone(), prop);
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": self.allow_extra,
        })
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
