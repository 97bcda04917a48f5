//! Tool parameter and response schemas.
//!
//! Callers may describe a shape either with a type deriving
//! [`schemars::JsonSchema`] or with a raw JSON Schema object. Both are
//! normalized here into one JSON Schema value before any backend sees them.

use serde_json::{Map, Value, json};

#[derive(Debug, Clone)]
pub enum Schema {
    Json(Value),
    Typed {
        name: String,
        schema: schemars::Schema,
    },
}

impl Schema {
    pub fn json(value: Value) -> Self {
        Self::Json(value)
    }

    pub fn of<T: schemars::JsonSchema>() -> Self {
        Self::Typed {
            name: T::schema_name().into_owned(),
            schema: schemars::schema_for!(T),
        }
    }

    /// An object schema with no properties.
    pub fn empty() -> Self {
        Self::Json(json!({ "type": "object", "properties": {} }))
    }

    pub fn name(&self) -> String {
        match self {
            Self::Typed { name, .. } => sanitize_schema_name(name),
            Self::Json(v) => v
                .get("title")
                .and_then(Value::as_str)
                .map(sanitize_schema_name)
                .unwrap_or_else(|| "response".to_string()),
        }
    }

    pub fn to_json_schema(&self) -> Value {
        let raw = match self {
            Self::Json(v) => v.clone(),
            Self::Typed { schema, .. } => schema.as_value().clone(),
        };
        normalize(raw)
    }
}

impl From<Value> for Schema {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

fn normalize(value: Value) -> Value {
    let mut obj = match value {
        Value::Object(obj) => obj,
        Value::Null => Map::new(),
        other => return other,
    };
    obj.remove("$schema");
    if !obj.contains_key("type") && (obj.is_empty() || obj.contains_key("properties")) {
        obj.insert("type".to_string(), Value::String("object".to_string()));
    }
    if obj.get("type").and_then(Value::as_str) == Some("object") && !obj.contains_key("properties")
    {
        obj.insert("properties".to_string(), Value::Object(Map::new()));
    }
    Value::Object(obj)
}

/// Rewrite a schema for strict structured-output modes: every object is
/// closed with `additionalProperties: false` and lists all of its properties
/// as required. `None` when the schema explicitly allows extra properties.
pub(crate) fn strict_schema(schema: &Value) -> Option<Value> {
    let mut out = schema.clone();
    close_objects(&mut out).then_some(out)
}

fn close_objects(node: &mut Value) -> bool {
    let Value::Object(obj) = node else {
        return true;
    };

    let is_object = obj.get("type").and_then(Value::as_str) == Some("object")
        || obj.contains_key("properties");
    if is_object {
        match obj.get("additionalProperties") {
            None | Some(Value::Bool(false)) => {}
            Some(_) => return false,
        }
        obj.insert("additionalProperties".to_string(), Value::Bool(false));
        let required: Vec<Value> = obj
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().map(Value::String).collect())
            .unwrap_or_default();
        obj.insert("required".to_string(), Value::Array(required));
    }

    for key in ["properties", "$defs", "definitions"] {
        if let Some(Value::Object(children)) = obj.get_mut(key) {
            if !children.values_mut().all(close_objects) {
                return false;
            }
        }
    }
    for key in ["items", "prefixItems", "anyOf", "oneOf", "allOf"] {
        let closed = match obj.get_mut(key) {
            Some(Value::Array(children)) => children.iter_mut().all(close_objects),
            Some(child @ Value::Object(_)) => close_objects(child),
            _ => true,
        };
        if !closed {
            return false;
        }
    }
    true
}

fn sanitize_schema_name(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "response".to_string()
    } else {
        out
    }
}

/// A structured-output request in wire-neutral form.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
    pub strict: bool,
}

impl ResponseFormat {
    pub fn from_schema(schema: &Schema) -> Self {
        Self {
            name: schema.name(),
            schema: schema.to_json_schema(),
            strict: true,
        }
    }

    /// Appended to the system prompt for backends that cannot enforce a schema natively.
    pub fn instruction(&self) -> String {
        format!(
            "Respond only with a single JSON value that conforms to this JSON Schema. \
             Do not wrap it in markdown or add commentary.\n{}",
            self.schema
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(schemars::JsonSchema)]
    #[allow(dead_code)]
    struct Weather {
        city: String,
    }

    #[test]
    fn typed_and_raw_schemas_normalize_to_the_same_wire_shape() {
        let typed = Schema::of::<Weather>().to_json_schema();
        assert!(typed.get("$schema").is_none());
        assert_eq!(typed["type"], "object");
        assert_eq!(typed["properties"]["city"]["type"], "string");
        assert_eq!(typed["required"], json!(["city"]));

        let raw = Schema::json(json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "properties": { "city": { "type": "string" } },
            "required": ["city"]
        }))
        .to_json_schema();
        assert_eq!(raw["type"], typed["type"]);
        assert_eq!(raw["properties"], typed["properties"]);
        assert_eq!(raw["required"], typed["required"]);
        assert!(raw.get("$schema").is_none());
    }

    #[test]
    fn null_schema_becomes_empty_object() {
        assert_eq!(
            Schema::json(Value::Null).to_json_schema(),
            json!({ "type": "object", "properties": {} })
        );
    }

    #[derive(schemars::JsonSchema)]
    #[allow(dead_code)]
    struct Forecast {
        place: Weather,
        days: Vec<Weather>,
        note: Option<String>,
    }

    fn required(schema: &Value) -> Vec<&str> {
        let mut names: Vec<&str> = schema["required"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    #[test]
    fn strict_schema_closes_every_object_and_requires_every_property() {
        let strict = strict_schema(&Schema::of::<Forecast>().to_json_schema()).unwrap();
        assert_eq!(strict["additionalProperties"], false);
        assert_eq!(required(&strict), vec!["days", "note", "place"]);

        let weather = &strict["$defs"]["Weather"];
        assert_eq!(weather["additionalProperties"], false);
        assert_eq!(required(weather), vec!["city"]);
    }

    #[test]
    fn strict_schema_reaches_nested_inline_objects() {
        let strict = strict_schema(&json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "sku": { "type": "string" }, "qty": { "type": "integer" } }
                    }
                },
                "choice": { "anyOf": [{ "type": "object", "properties": { "x": { "type": "number" } } }] }
            }
        }))
        .unwrap();
        let item = &strict["properties"]["items"]["items"];
        assert_eq!(item["additionalProperties"], false);
        assert_eq!(required(item), vec!["qty", "sku"]);
        assert_eq!(required(&strict["properties"]["choice"]["anyOf"][0]), vec!["x"]);
    }

    #[test]
    fn open_objects_cannot_be_made_strict() {
        let open = json!({
            "type": "object",
            "properties": {
                "tags": { "type": "object", "additionalProperties": { "type": "string" } }
            }
        });
        assert!(strict_schema(&open).is_none());
    }

    #[test]
    fn response_format_takes_name_from_type() {
        let format = ResponseFormat::from_schema(&Schema::of::<Weather>());
        assert_eq!(format.name, "Weather");
        assert!(format.instruction().contains("\"city\""));
    }
}
