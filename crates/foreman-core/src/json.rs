//! Object-graph JSON codec
//!
//! Business payloads are object graphs, not trees: the same object may be
//! reachable from several places, and cycles are allowed. The codec keeps
//! identity by numbering containers in pre-order and writing any container
//! seen before as `{"___objectref": N}`.
//!
//! Date-valued object fields travel as epoch-millisecond strings listed in
//! the owning object's `___dates___` array. Objects tagged with `___class`
//! or `___jsonclass` are rehydrated through [`ClassMappings`].

use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value as JsonValue};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Field marking a reference to a previously serialized container
pub const OBJECTREF_FIELD: &str = "___objectref";

/// Field listing the date-valued fields of an object
pub const DATES_FIELD: &str = "___dates___";

/// Class tag written by the platform SDKs
pub const CLASS_FIELD: &str = "___class";

/// Class tag written by the platform server
pub const JSONCLASS_FIELD: &str = "___jsonclass";

/// Typed instance produced by a class factory
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Builds a typed instance from the raw JSON object
pub type ClassFactory = Arc<dyn Fn(&Map<String, JsonValue>) -> Result<Instance> + Send + Sync>;

/// Index of a container node in an [`ObjectGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// A value in the graph; containers are referenced by id
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Date(DateTime<Utc>),
    Array(NodeId),
    Object(NodeId),
}

impl Value {
    /// Container id, if this value is an array or object
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Value::Array(id) | Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// An object node
#[derive(Clone, Default)]
pub struct ObjectNode {
    /// Fields in document order
    pub fields: Vec<(String, Value)>,

    /// Instance built by a class factory, if the object's class is mapped
    pub instance: Option<Instance>,
}

impl ObjectNode {
    /// Look up a field by name
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Class tag carried by the object
    pub fn class_name(&self) -> Option<&str> {
        self.get(CLASS_FIELD)
            .and_then(Value::as_str)
            .or_else(|| self.get(JSONCLASS_FIELD).and_then(Value::as_str))
    }

    /// Insert or replace a field, keeping its position when it already exists
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }
}

impl std::fmt::Debug for ObjectNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectNode")
            .field("fields", &self.fields)
            .field("instance", &self.instance.is_some())
            .finish()
    }
}

/// A container node
#[derive(Debug, Clone)]
pub enum Node {
    Array(Vec<Value>),
    Object(ObjectNode),
}

/// Arena of containers plus a root value
#[derive(Debug, Clone)]
pub struct ObjectGraph {
    nodes: Vec<Node>,
    root: Value,
}

impl Default for ObjectGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectGraph {
    /// Create an empty graph with a null root
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: Value::Null,
        }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn set_root(&mut self, root: Value) {
        self.root = root;
    }

    /// Number of containers
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add an array node
    pub fn add_array(&mut self, items: Vec<Value>) -> Value {
        Value::Array(self.alloc(Node::Array(items)))
    }

    /// Add an object node
    pub fn add_object(&mut self, fields: Vec<(String, Value)>) -> Value {
        Value::Object(self.alloc(Node::Object(ObjectNode {
            fields,
            instance: None,
        })))
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    /// Items of an array value
    pub fn array(&self, value: &Value) -> Option<&[Value]> {
        match value {
            Value::Array(id) => match self.node(*id) {
                Some(Node::Array(items)) => Some(items),
                _ => None,
            },
            _ => None,
        }
    }

    /// Object node behind an object value
    pub fn object(&self, value: &Value) -> Option<&ObjectNode> {
        match value {
            Value::Object(id) => match self.node(*id) {
                Some(Node::Object(object)) => Some(object),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn object_mut(&mut self, value: &Value) -> Option<&mut ObjectNode> {
        match value {
            Value::Object(id) => match self.node_mut(*id) {
                Some(Node::Object(object)) => Some(object),
                _ => None,
            },
            _ => None,
        }
    }

    /// Append an item to an array node
    pub fn push(&mut self, array: &Value, item: Value) -> Result<()> {
        match array {
            Value::Array(id) => match self.node_mut(*id) {
                Some(Node::Array(items)) => {
                    items.push(item);
                    Ok(())
                }
                _ => Err(Error::Serialization(format!("node {} is not an array", id.0))),
            },
            _ => Err(Error::Serialization("value is not an array".to_string())),
        }
    }

    /// Typed instance attached to an object value
    pub fn instance<T: Any>(&self, value: &Value) -> Option<&T> {
        self.object(value)
            .and_then(|object| object.instance.as_ref())
            .and_then(|instance| instance.downcast_ref::<T>())
    }

    /// Top-level items when the root is an array (the argument list)
    pub fn items(&self) -> &[Value] {
        self.array(&self.root).unwrap_or(&[])
    }

    /// Build a tree-shaped graph from plain JSON
    pub fn from_json(value: JsonValue) -> Self {
        let mut graph = Self::new();
        let root = graph.insert_json(value);
        graph.root = root;
        graph
    }

    /// Insert plain JSON as new nodes and return its value
    pub fn insert_json(&mut self, value: JsonValue) -> Value {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => {
                let items = items.into_iter().map(|item| self.insert_json(item)).collect();
                self.add_array(items)
            }
            JsonValue::Object(map) => {
                let fields = map
                    .into_iter()
                    .map(|(k, v)| {
                        let v = self.insert_json(v);
                        (k, v)
                    })
                    .collect();
                self.add_object(fields)
            }
        }
    }

    /// Expand into plain JSON; shared containers are duplicated and cycles are an error
    pub fn to_json(&self) -> Result<JsonValue> {
        self.value_to_json(&self.root, &mut HashSet::new())
    }

    /// Expand a single value into plain JSON
    pub fn value_to_json(&self, value: &Value, path: &mut HashSet<NodeId>) -> Result<JsonValue> {
        Ok(match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => JsonValue::Number(n.clone()),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Date(d) => JsonValue::Number(d.timestamp_millis().into()),
            Value::Array(id) | Value::Object(id) => {
                if !path.insert(*id) {
                    return Err(Error::Serialization(format!(
                        "cycle through node {} cannot be expanded",
                        id.0
                    )));
                }
                let json = match self.node(*id) {
                    Some(Node::Array(items)) => JsonValue::Array(
                        items
                            .iter()
                            .map(|item| self.value_to_json(item, path))
                            .collect::<Result<_>>()?,
                    ),
                    Some(Node::Object(object)) => {
                        let mut map = Map::new();
                        for (k, v) in &object.fields {
                            map.insert(k.clone(), self.value_to_json(v, path)?);
                        }
                        JsonValue::Object(map)
                    }
                    None => return Err(dangling(*id)),
                };
                path.remove(id);
                json
            }
        })
    }
}

fn dangling(id: NodeId) -> Error {
    Error::Serialization(format!("dangling node id {}", id.0))
}

/// Registry of class factories keyed by class tag
#[derive(Clone, Default)]
pub struct ClassMappings {
    factories: HashMap<String, ClassFactory>,
}

impl ClassMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a class tag
    pub fn insert<F>(&mut self, class_name: impl Into<String>, factory: F)
    where
        F: Fn(&Map<String, JsonValue>) -> Result<Instance> + Send + Sync + 'static,
    {
        self.factories.insert(class_name.into(), Arc::new(factory));
    }

    /// Register a class tag that deserializes into `T`
    pub fn register<T>(&mut self, class_name: impl Into<String>)
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.insert(class_name, |object| {
            let typed: T = serde_json::from_value(JsonValue::Object(object.clone()))?;
            Ok(Arc::new(typed) as Instance)
        });
    }

    /// Add every mapping of `other`, replacing existing ones
    pub fn extend(&mut self, other: &ClassMappings) {
        for (class_name, factory) in &other.factories {
            self.factories.insert(class_name.clone(), factory.clone());
        }
    }

    pub fn get(&self, class_name: &str) -> Option<&ClassFactory> {
        self.factories.get(class_name)
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn factory_for(&self, object: &Map<String, JsonValue>) -> Option<&ClassFactory> {
        let tagged = |field: &str| {
            object
                .get(field)
                .and_then(JsonValue::as_str)
                .and_then(|class_name| self.get(class_name))
        };
        tagged(CLASS_FIELD).or_else(|| tagged(JSONCLASS_FIELD))
    }
}

impl std::fmt::Debug for ClassMappings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

/// Serialize a graph, writing repeated containers as object references
pub fn stringify(graph: &ObjectGraph) -> Result<String> {
    let mut encoder = Encoder {
        graph,
        seen: HashMap::new(),
    };
    let json = encoder.encode(graph.root())?;
    Ok(serde_json::to_string(&json)?)
}

/// Parse JSON text into a graph, resolving references, dates and class tags
pub fn parse(text: &str, mappings: &ClassMappings) -> Result<ObjectGraph> {
    let json: JsonValue = serde_json::from_str(text)?;

    let mut decoder = Decoder {
        graph: ObjectGraph::new(),
        patches: Vec::new(),
        mappings,
    };

    let root = decoder.decode(json)?;
    decoder.graph.set_root(root);
    decoder.resolve()
}

struct Encoder<'a> {
    graph: &'a ObjectGraph,
    seen: HashMap<NodeId, usize>,
}

impl Encoder<'_> {
    fn encode(&mut self, value: &Value) -> Result<JsonValue> {
        Ok(match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => JsonValue::Number(n.clone()),
            Value::String(s) => JsonValue::String(s.clone()),
            // Outside an object there is no marker to record the date in
            Value::Date(d) => JsonValue::String(d.timestamp_millis().to_string()),
            Value::Array(id) | Value::Object(id) => self.encode_node(*id)?,
        })
    }

    fn encode_node(&mut self, id: NodeId) -> Result<JsonValue> {
        if let Some(index) = self.seen.get(&id) {
            let mut reference = Map::new();
            reference.insert(OBJECTREF_FIELD.to_string(), JsonValue::from(*index));
            return Ok(JsonValue::Object(reference));
        }

        let index = self.seen.len();
        self.seen.insert(id, index);

        let graph = self.graph;
        match graph.node(id) {
            Some(Node::Array(items)) => Ok(JsonValue::Array(
                items
                    .iter()
                    .map(|item| self.encode(item))
                    .collect::<Result<_>>()?,
            )),
            Some(Node::Object(object)) => {
                let mut map = Map::new();
                let mut dates: Vec<JsonValue> = Vec::new();

                for (key, value) in &object.fields {
                    if key == DATES_FIELD {
                        continue;
                    }
                    let encoded = match value {
                        Value::Date(d) => {
                            let millis = JsonValue::String(d.timestamp_millis().to_string());
                            if !dates.contains(&millis) {
                                dates.push(millis.clone());
                            }
                            millis
                        }
                        other => self.encode(other)?,
                    };
                    map.insert(key.clone(), encoded);
                }

                if !dates.is_empty() {
                    map.insert(DATES_FIELD.to_string(), JsonValue::Array(dates));
                }

                Ok(JsonValue::Object(map))
            }
            None => Err(dangling(id)),
        }
    }
}

enum Slot {
    Item(usize),
    Field(usize),
}

struct Patch {
    node: NodeId,
    slot: Slot,
    target: usize,
}

struct Decoder<'a> {
    graph: ObjectGraph,
    patches: Vec<Patch>,
    mappings: &'a ClassMappings,
}

impl Decoder<'_> {
    /// First pass: allocate containers in pre-order and note every reference site
    fn decode(&mut self, json: JsonValue) -> Result<Value> {
        match json {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => Ok(Value::Bool(b)),
            JsonValue::Number(n) => Ok(Value::Number(n)),
            JsonValue::String(s) => Ok(Value::String(s)),
            JsonValue::Array(items) => {
                let id = self.graph.alloc(Node::Array(Vec::with_capacity(items.len())));
                for (index, item) in items.into_iter().enumerate() {
                    let value = self.decode_child(item, id, Slot::Item(index))?;
                    if let Some(Node::Array(slots)) = self.graph.node_mut(id) {
                        slots.push(value);
                    }
                }
                Ok(Value::Array(id))
            }
            JsonValue::Object(map) => self.decode_object(map),
        }
    }

    fn decode_object(&mut self, map: Map<String, JsonValue>) -> Result<Value> {
        let dates: Vec<String> = match map.get(DATES_FIELD) {
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let instance = match self.mappings.factory_for(&map) {
            Some(factory) => {
                let mut raw = map.clone();
                raw.retain(|key, _| key != DATES_FIELD);
                Some(factory(&raw)?)
            }
            None => None,
        };

        let id = self.graph.alloc(Node::Object(ObjectNode {
            fields: Vec::with_capacity(map.len()),
            instance,
        }));

        let mut index = 0;
        for (key, value) in map {
            if key == DATES_FIELD {
                continue;
            }
            let value = match value {
                JsonValue::String(s) if dates.contains(&s) => match parse_millis(&s) {
                    Some(date) => Value::Date(date),
                    None => Value::String(s),
                },
                other => self.decode_child(other, id, Slot::Field(index))?,
            };
            if let Some(Node::Object(object)) = self.graph.node_mut(id) {
                object.fields.push((key, value));
            }
            index += 1;
        }

        Ok(Value::Object(id))
    }

    fn decode_child(&mut self, json: JsonValue, parent: NodeId, slot: Slot) -> Result<Value> {
        match reference_target(&json)? {
            Some(target) => {
                self.patches.push(Patch {
                    node: parent,
                    slot,
                    target,
                });
                Ok(Value::Null)
            }
            None => self.decode(json),
        }
    }

    /// Second pass: point every reference site at its container
    fn resolve(mut self) -> Result<ObjectGraph> {
        for patch in std::mem::take(&mut self.patches) {
            let target = match self.graph.node(NodeId(patch.target)) {
                Some(Node::Array(_)) => Value::Array(NodeId(patch.target)),
                Some(Node::Object(_)) => Value::Object(NodeId(patch.target)),
                None => {
                    return Err(Error::CorruptPayload(format!(
                        "object reference {} is out of range ({} containers)",
                        patch.target,
                        self.graph.len()
                    )))
                }
            };

            match (self.graph.node_mut(patch.node), patch.slot) {
                (Some(Node::Array(items)), Slot::Item(index)) => {
                    if let Some(item) = items.get_mut(index) {
                        *item = target;
                    }
                }
                (Some(Node::Object(object)), Slot::Field(index)) => {
                    if let Some((_, field)) = object.fields.get_mut(index) {
                        *field = target;
                    }
                }
                _ => return Err(dangling(patch.node)),
            }
        }

        Ok(self.graph)
    }
}

fn reference_target(json: &JsonValue) -> Result<Option<usize>> {
    let JsonValue::Object(map) = json else {
        return Ok(None);
    };
    match map.get(OBJECTREF_FIELD) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(id) => id
            .as_u64()
            .map(|id| Some(id as usize))
            .ok_or_else(|| Error::CorruptPayload(format!("invalid object reference {}", id))),
    }
}

fn parse_millis(s: &str) -> Option<DateTime<Utc>> {
    s.parse::<i64>()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_plain_json_is_unchanged() {
        let graph = ObjectGraph::from_json(json!({"a": [1, 2, {"b": "c"}], "d": null}));
        let text = stringify(&graph).unwrap();
        assert_eq!(text, r#"{"a":[1,2,{"b":"c"}],"d":null}"#);
    }

    #[test]
    fn test_shared_object_becomes_reference() {
        let mut graph = ObjectGraph::new();
        let shared = graph.add_object(vec![("name".into(), Value::String("bob".into()))]);
        let root = graph.add_array(vec![shared.clone(), shared]);
        graph.set_root(root);

        let text = stringify(&graph).unwrap();
        assert_eq!(text, r#"[{"name":"bob"},{"___objectref":1}]"#);

        let parsed = parse(&text, &ClassMappings::new()).unwrap();
        let items = parsed.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], items[1]);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_cycle_survives_roundtrip() {
        let mut graph = ObjectGraph::new();
        let parent = graph.add_object(vec![("name".into(), Value::String("p".into()))]);
        let child = graph.add_object(vec![("parent".into(), parent.clone())]);
        graph.object_mut(&parent).unwrap().set("child", child);
        graph.set_root(parent);

        let text = stringify(&graph).unwrap();
        assert_eq!(text, r#"{"name":"p","child":{"parent":{"___objectref":0}}}"#);

        let parsed = parse(&text, &ClassMappings::new()).unwrap();
        let root = parsed.root().clone();
        let child = parsed.object(&root).unwrap().get("child").unwrap().clone();
        let back = parsed.object(&child).unwrap().get("parent").unwrap();
        assert_eq!(*back, root);
        assert!(parsed.to_json().is_err());
    }

    #[test]
    fn test_forward_reference_resolves() {
        let text = r#"[{"next":{"___objectref":2}},{"v":1}]"#;
        let parsed = parse(text, &ClassMappings::new()).unwrap();
        let items = parsed.items();
        let next = parsed.object(&items[0]).unwrap().get("next").unwrap();
        assert_eq!(*next, items[1]);
    }

    #[test]
    fn test_reference_out_of_range_is_corrupt() {
        let text = r#"[{"___objectref":5}]"#;
        assert!(matches!(
            parse(text, &ClassMappings::new()),
            Err(Error::CorruptPayload(_))
        ));
    }

    #[test]
    fn test_dates_roundtrip() {
        let when = Utc.timestamp_millis_opt(1_600_000_000_123).unwrap();
        let mut graph = ObjectGraph::new();
        let root = graph.add_object(vec![
            ("created".into(), Value::Date(when)),
            ("title".into(), Value::String("x".into())),
        ]);
        graph.set_root(root);

        let text = stringify(&graph).unwrap();
        assert_eq!(
            text,
            r#"{"created":"1600000000123","title":"x","___dates___":["1600000000123"]}"#
        );

        let parsed = parse(&text, &ClassMappings::new()).unwrap();
        let object = parsed.object(parsed.root()).unwrap();
        assert_eq!(object.get("created"), Some(&Value::Date(when)));
        assert!(object.get(DATES_FIELD).is_none());
    }

    #[test]
    fn test_dates_marker_not_counted_as_container() {
        let text = r#"[{"at":"5","___dates___":["5"]},{"___objectref":1}]"#;
        let parsed = parse(text, &ClassMappings::new()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.items()[0], parsed.items()[1]);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Person {
        name: String,
    }

    #[test]
    fn test_class_mapping_builds_instance() {
        let mut mappings = ClassMappings::new();
        mappings.register::<Person>("models.Person");

        let text = r#"[{"___class":"models.Person","name":"ann"},{"___class":"models.Other","x":1}]"#;
        let parsed = parse(text, &mappings).unwrap();
        let items = parsed.items();

        let person: &Person = parsed.instance(&items[0]).unwrap();
        assert_eq!(person.name, "ann");
        assert!(parsed.object(&items[1]).unwrap().instance.is_none());
        assert_eq!(parsed.object(&items[1]).unwrap().class_name(), Some("models.Other"));
    }

    #[test]
    fn test_jsonclass_tag_is_mapped() {
        let mut mappings = ClassMappings::new();
        mappings.register::<Person>("models.Person");
        let text = r#"{"___jsonclass":"models.Person","name":"kim"}"#;
        let parsed = parse(text, &mappings).unwrap();
        assert_eq!(parsed.instance::<Person>(parsed.root()).unwrap().name, "kim");
    }

    #[test]
    fn test_syntax_error_is_deserialization() {
        assert!(matches!(
            parse("[1,", &ClassMappings::new()),
            Err(Error::Deserialization(_))
        ));
    }
}
