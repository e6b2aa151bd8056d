//! Marshals VM instance references into DAP variables.
//!
//! Simple kinds render from `valueAsString`; collections and plain instances
//! get a stored reference so the client can lazily expand them. Child fetches
//! that fail at the RPC layer degrade to an error-valued variable instead of
//! failing the whole `variables` request.

use std::collections::BTreeSet;

use dart_vmservice::VmConnection;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::registry::{StoredData, StoredRefs};

/// Above this many siblings, `toString` is no longer invoked to improve an
/// instance's display string. Keeps large collections from fanning out into
/// hundreds of `invoke` round trips.
pub const MAX_TO_STRING_SIBLINGS: usize = 15;

/// Getters never evaluated during expansion: trivially derivable and present
/// on every object.
pub const GETTER_BLOCKLIST: &[&str] = &["hashCode", "runtimeType"];

/// Cap on class-hierarchy depth when enumerating getters, in case a broken
/// VM response produces a superclass cycle.
const MAX_CLASS_DEPTH: usize = 100;

/// One DAP variable, pre-serialization.
#[derive(Clone, Debug, Default)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub variables_reference: i64,
    pub indexed_variables: Option<i64>,
    pub evaluate_name: Option<String>,
}

impl Variable {
    pub fn scalar(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn into_json(self) -> Value {
        let mut out = json!({
            "name": self.name,
            "value": self.value,
            "variablesReference": self.variables_reference,
        });
        if let Some(indexed) = self.indexed_variables {
            out["indexedVariables"] = json!(indexed);
        }
        if let Some(evaluate_name) = self.evaluate_name {
            out["evaluateName"] = json!(evaluate_name);
        }
        out
    }
}

/// Context for marshaling values belonging to one paused thread.
pub struct Marshaler<'a> {
    pub vm: &'a VmConnection,
    pub refs: &'a Mutex<StoredRefs>,
    pub thread_num: i64,
    pub isolate_id: &'a str,
    /// Session-level switch for invoking `toString` on instances. When off,
    /// the sibling-count heuristic never applies either.
    pub to_string_enabled: bool,
}

impl Marshaler<'_> {
    /// Convert an instance reference into a DAP variable. `allow_to_string`
    /// is false when the instance sits among more than
    /// [`MAX_TO_STRING_SIBLINGS`] siblings.
    pub async fn marshal(
        &self,
        name: &str,
        instance: &Value,
        evaluate_name: Option<String>,
        allow_to_string: bool,
    ) -> Variable {
        if is_sentinel(instance) {
            return Variable::scalar(name, sentinel_display(instance));
        }

        let kind = instance_kind(instance);
        match kind {
            "Null" | "Bool" | "Int" | "Double" | "String" => Variable {
                name: name.to_string(),
                value: self.simple_value(instance, allow_to_string).await,
                evaluate_name,
                ..Default::default()
            },
            "List" => {
                let length = instance.get("length").and_then(|v| v.as_i64()).unwrap_or(0);
                let reference = self
                    .store_instance(instance.clone(), evaluate_name.clone())
                    .await;
                Variable {
                    name: name.to_string(),
                    value: format!("List ({})", count_noun(length)),
                    variables_reference: reference,
                    indexed_variables: Some(length),
                    evaluate_name,
                }
            }
            "Map" => {
                let length = instance.get("length").and_then(|v| v.as_i64()).unwrap_or(0);
                let reference = self
                    .store_instance(instance.clone(), evaluate_name.clone())
                    .await;
                Variable {
                    name: name.to_string(),
                    value: format!("Map ({})", count_noun(length)),
                    variables_reference: reference,
                    indexed_variables: Some(length),
                    evaluate_name,
                }
            }
            _ => {
                let value = self.display(instance, allow_to_string).await;
                let reference = if instance.get("id").is_some() {
                    self.store_instance(instance.clone(), evaluate_name.clone())
                        .await
                } else {
                    0
                };
                Variable {
                    name: name.to_string(),
                    value,
                    variables_reference: reference,
                    indexed_variables: None,
                    evaluate_name,
                }
            }
        }
    }

    /// Display for a simple kind. A truncated value is re-fetched in full
    /// when the sibling bound allows the extra round trip.
    async fn simple_value(&self, instance: &Value, allow_full: bool) -> String {
        let truncated = instance
            .get("valueAsStringIsTruncated")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if truncated && allow_full {
            if let Some(id) = instance.get("id").and_then(|v| v.as_str()) {
                if let Ok(full) = self.vm.get_object(self.isolate_id, id, None, None).await {
                    return simple_display(&full);
                }
            }
        }
        simple_display(instance)
    }

    /// The display string for an instance: `valueAsString` for simple kinds,
    /// otherwise the result of invoking `toString` (when allowed and when it
    /// returns something better than the default `Instance of '...'`).
    pub async fn display(&self, instance: &Value, allow_to_string: bool) -> String {
        if is_sentinel(instance) {
            return sentinel_display(instance);
        }
        let kind = instance_kind(instance);
        if matches!(kind, "Null" | "Bool" | "Int" | "Double" | "String") {
            return simple_display(instance);
        }

        let fallback = class_display(instance);
        if !self.to_string_enabled || !allow_to_string {
            return fallback;
        }
        let Some(id) = instance.get("id").and_then(|v| v.as_str()) else {
            return fallback;
        };
        match self.vm.invoke(self.isolate_id, id, "toString").await {
            Ok(result) => {
                let text = result
                    .get("valueAsString")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if text.is_empty() || text.starts_with("Instance of ") {
                    fallback
                } else {
                    text.to_string()
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "toString invocation failed");
                fallback
            }
        }
    }

    /// The complete `valueAsString` of an instance, re-fetching the object
    /// when the reference carries a truncated string. Used for exception
    /// descriptions, which should never be cut short.
    pub async fn full_string(&self, instance: &Value) -> String {
        let truncated = instance
            .get("valueAsStringIsTruncated")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !truncated {
            return self.display(instance, true).await;
        }
        let Some(id) = instance.get("id").and_then(|v| v.as_str()) else {
            return simple_display(instance);
        };
        match self.vm.get_object(self.isolate_id, id, None, None).await {
            Ok(full) => full
                .get("valueAsString")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| simple_display(instance)),
            Err(_) => simple_display(instance),
        }
    }

    /// Expand a stored reference into its child variables.
    pub async fn children(
        &self,
        data: &StoredData,
        start: Option<i64>,
        count: Option<i64>,
    ) -> Vec<Variable> {
        match data {
            StoredData::FrameLocals { frame, .. } => self.frame_locals(frame).await,
            StoredData::Instance {
                instance,
                evaluate_name,
            } => {
                self.instance_children(instance, evaluate_name.as_deref(), start, count)
                    .await
            }
            StoredData::MapEntry {
                key,
                value,
                evaluate_name,
            } => {
                let key_var = self.marshal("key", key, None, true).await;
                let value_var = self
                    .marshal("value", value, evaluate_name.clone(), true)
                    .await;
                vec![key_var, value_var]
            }
            StoredData::Frame { .. } | StoredData::Script { .. } | StoredData::Label => {
                Vec::new()
            }
        }
    }

    async fn frame_locals(&self, frame: &Value) -> Vec<Variable> {
        let vars = frame
            .get("vars")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let allow_to_string = vars.len() <= MAX_TO_STRING_SIBLINGS;

        let mut out = Vec::with_capacity(vars.len());
        for var in &vars {
            let Some(name) = var.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            // Synthetic locals like :async_op are VM internals.
            if name.starts_with(':') {
                continue;
            }
            let value = var.get("value").cloned().unwrap_or(Value::Null);
            out.push(
                self.marshal(name, &value, Some(name.to_string()), allow_to_string)
                    .await,
            );
        }
        out
    }

    async fn instance_children(
        &self,
        instance: &Value,
        evaluate_name: Option<&str>,
        start: Option<i64>,
        count: Option<i64>,
    ) -> Vec<Variable> {
        let Some(id) = instance.get("id").and_then(|v| v.as_str()) else {
            return Vec::new();
        };
        let object = match self.vm.get_object(self.isolate_id, id, start, count).await {
            Ok(object) => object,
            Err(err) => {
                return vec![Variable::scalar("value", format!("<error: {err}>"))];
            }
        };

        match instance_kind(&object) {
            "List" => self.list_children(&object, evaluate_name, start).await,
            "Map" => self.map_children(&object, evaluate_name, start).await,
            _ => self.field_and_getter_children(&object, evaluate_name).await,
        }
    }

    async fn list_children(
        &self,
        object: &Value,
        evaluate_name: Option<&str>,
        start: Option<i64>,
    ) -> Vec<Variable> {
        let elements = object
            .get("elements")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let base = start.unwrap_or(0);
        let allow_to_string = elements.len() <= MAX_TO_STRING_SIBLINGS;

        let mut out = Vec::with_capacity(elements.len());
        for (offset, element) in elements.iter().enumerate() {
            let index = base + offset as i64;
            let child_evaluate_name =
                evaluate_name.map(|parent| format!("{parent}[{index}]"));
            out.push(
                self.marshal(
                    &format!("[{index}]"),
                    element,
                    child_evaluate_name,
                    allow_to_string,
                )
                .await,
            );
        }
        out
    }

    async fn map_children(
        &self,
        object: &Value,
        evaluate_name: Option<&str>,
        start: Option<i64>,
    ) -> Vec<Variable> {
        let associations = object
            .get("associations")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let base = start.unwrap_or(0);
        let allow_to_string = associations.len() <= MAX_TO_STRING_SIBLINGS;

        let mut out = Vec::with_capacity(associations.len());
        for (offset, association) in associations.iter().enumerate() {
            let index = base + offset as i64;
            let key = association.get("key").cloned().unwrap_or(Value::Null);
            let value = association.get("value").cloned().unwrap_or(Value::Null);

            let key_display = self.display(&key, allow_to_string).await;
            let value_display = self.display(&value, allow_to_string).await;
            let child_evaluate_name = match (evaluate_name, instance_kind(&key)) {
                (Some(parent), "String") => key
                    .get("valueAsString")
                    .and_then(|v| v.as_str())
                    .map(|k| format!("{parent}[{k:?}]")),
                (Some(parent), "Int") => key
                    .get("valueAsString")
                    .and_then(|v| v.as_str())
                    .map(|k| format!("{parent}[{k}]")),
                _ => None,
            };

            // Key and value are stored as a pair so expanding the entry shows
            // both sides without re-walking the map.
            let reference = {
                let mut refs = self.refs.lock().await;
                refs.store(
                    self.thread_num,
                    StoredData::MapEntry {
                        key,
                        value,
                        evaluate_name: child_evaluate_name,
                    },
                )
            };

            out.push(Variable {
                name: index.to_string(),
                value: format!("{key_display} -> {value_display}"),
                variables_reference: reference,
                indexed_variables: None,
                evaluate_name: None,
            });
        }
        out
    }

    async fn field_and_getter_children(
        &self,
        object: &Value,
        evaluate_name: Option<&str>,
    ) -> Vec<Variable> {
        let fields = object
            .get("fields")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let allow_to_string = fields.len() <= MAX_TO_STRING_SIBLINGS;

        let mut out = Vec::with_capacity(fields.len());
        for field in &fields {
            let Some(name) = field
                .pointer("/decl/name")
                .or_else(|| field.get("name"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            let value = field.get("value").cloned().unwrap_or(Value::Null);
            let child_evaluate_name = evaluate_name.map(|parent| format!("{parent}.{name}"));
            out.push(
                self.marshal(name, &value, child_evaluate_name, allow_to_string)
                    .await,
            );
        }

        out.extend(self.getter_children(object, evaluate_name).await);
        out
    }

    /// Evaluate the getters declared across the class hierarchy and append
    /// them after the fields. A getter that throws becomes an error-valued
    /// variable rather than poisoning its siblings.
    async fn getter_children(
        &self,
        object: &Value,
        evaluate_name: Option<&str>,
    ) -> Vec<Variable> {
        let Some(object_id) = object.get("id").and_then(|v| v.as_str()) else {
            return Vec::new();
        };
        let getters = self.getter_names(object).await;
        let allow_to_string = getters.len() <= MAX_TO_STRING_SIBLINGS;

        let mut out = Vec::with_capacity(getters.len());
        for getter in getters {
            let child_evaluate_name = evaluate_name.map(|parent| format!("{parent}.{getter}"));
            match self.vm.evaluate(self.isolate_id, object_id, &getter).await {
                Ok(result) => {
                    out.push(
                        self.marshal(&getter, &result, child_evaluate_name, allow_to_string)
                            .await,
                    );
                }
                Err(err) => {
                    out.push(Variable::scalar(getter, format!("<error: {err}>")));
                }
            }
        }
        out
    }

    /// Getter names for the object's class and its superclasses, deduplicated
    /// and sorted. Operators, private members, and blocklisted names are
    /// skipped.
    async fn getter_names(&self, object: &Value) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let mut class_id = object
            .pointer("/class/id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let mut depth = 0;
        while let Some(id) = class_id.take() {
            depth += 1;
            if depth > MAX_CLASS_DEPTH {
                break;
            }
            let class = match self.vm.get_object(self.isolate_id, &id, None, None).await {
                Ok(class) => class,
                Err(err) => {
                    tracing::debug!(error = %err, "class fetch failed during getter walk");
                    break;
                }
            };

            if let Some(functions) = class.get("functions").and_then(|v| v.as_array()) {
                for function in functions {
                    let Some(raw) = function.get("name").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let is_getter = function
                        .get("isGetter")
                        .and_then(|v| v.as_bool())
                        .unwrap_or_else(|| raw.starts_with("get:"));
                    if !is_getter {
                        continue;
                    }
                    let name = raw.strip_prefix("get:").unwrap_or(raw);
                    if name.starts_with('_')
                        || GETTER_BLOCKLIST.contains(&name)
                        || !name.chars().all(|c| c.is_alphanumeric() || c == '_')
                    {
                        continue;
                    }
                    names.insert(name.to_string());
                }
            }

            class_id = class
                .pointer("/super/id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }
        names
    }

    async fn store_instance(&self, instance: Value, evaluate_name: Option<String>) -> i64 {
        let mut refs = self.refs.lock().await;
        refs.store(
            self.thread_num,
            StoredData::Instance {
                instance,
                evaluate_name,
            },
        )
    }
}

fn instance_kind(instance: &Value) -> &str {
    instance.get("kind").and_then(|v| v.as_str()).unwrap_or("")
}

fn is_sentinel(instance: &Value) -> bool {
    instance.get("type").and_then(|v| v.as_str()) == Some("Sentinel")
        || instance.get("type").and_then(|v| v.as_str()) == Some("@Sentinel")
}

fn sentinel_display(instance: &Value) -> String {
    instance
        .get("valueAsString")
        .and_then(|v| v.as_str())
        .unwrap_or("<sentinel>")
        .to_string()
}

/// Display for simple kinds, straight from `valueAsString`. Strings are
/// quoted; a truncated value gets an ellipsis.
fn simple_display(instance: &Value) -> String {
    if instance_kind(instance) == "Null" {
        return "null".to_string();
    }
    let value = instance
        .get("valueAsString")
        .and_then(|v| v.as_str())
        .unwrap_or("<unknown>");
    let truncated = instance
        .get("valueAsStringIsTruncated")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if instance_kind(instance) == "String" {
        if truncated {
            format!("\"{value}…\"")
        } else {
            format!("\"{value}\"")
        }
    } else if truncated {
        format!("{value}…")
    } else {
        value.to_string()
    }
}

fn class_display(instance: &Value) -> String {
    instance
        .pointer("/class/name")
        .and_then(|v| v.as_str())
        .map(|name| format!("Instance of '{name}'"))
        .unwrap_or_else(|| "Instance".to_string())
}

fn count_noun(length: i64) -> String {
    if length == 1 {
        "1 item".to_string()
    } else {
        format!("{length} items")
    }
}
