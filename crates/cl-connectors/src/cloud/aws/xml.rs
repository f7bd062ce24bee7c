//! Converts AWS XML responses into JSON shaped like the SDK output.
//!
//! The conversion is shape-free, so list detection is heuristic. An element
//! is a list when its children are `member`/`item` wrappers, when it is an
//! `Items` container, or when its children share one name related to its own
//! (`DBInstances` > `DBInstance`, `VpcSecurityGroups` >
//! `VpcSecurityGroupMembership`). A plural-named container is a list too,
//! even with one structured child, and an empty one is `[]`, so a resource
//! keeps the same shape whatever its member count. `true`/`false` and
//! integer text become JSON scalars, except in identifier-like members.
//! EC2 responses also rename `fooSet` lists to `Foos` and capitalize member
//! names.

use crate::traits::{ConnectorError, ConnectorResult};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{Map, Value};

#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

/// Parses an XML document into a JSON object.
///
/// The root element is unwrapped. For query-protocol responses the
/// `<Action>Result` wrapper is merged into the top level, keeping
/// `ResponseMetadata` alongside.
pub fn xml_to_json(body: &str, ec2: bool) -> ConnectorResult<Value> {
    let root = parse(body)?;
    let Some(root) = root else {
        return Ok(Value::Object(Map::new()));
    };

    if root.children.is_empty() {
        let mut map = Map::new();
        map.insert(key_name(&root.name, ec2), convert(&root, ec2));
        return Ok(Value::Object(map));
    }

    let mut value = convert_children(&root, ec2);
    if root.name.ends_with("Response") {
        if let Value::Object(map) = &mut value {
            let wrappers: Vec<String> = map
                .keys()
                .filter(|k| k.ends_with("Result"))
                .cloned()
                .collect();
            for key in wrappers {
                if let Some(Value::Object(inner)) = map.remove(&key) {
                    map.extend(inner);
                }
            }
        }
    }
    Ok(value)
}

/// Extracts `(code, message)` from an AWS XML error document.
pub fn error_code(body: &str) -> Option<(String, String)> {
    let root = parse(body).ok()??;
    let mut stack = vec![&root];
    while let Some(node) = stack.pop() {
        if node.name == "Error" {
            let find = |name: &str| {
                node.children
                    .iter()
                    .find(|c| c.name == name)
                    .map(|c| c.text.clone())
                    .unwrap_or_default()
            };
            return Some((find("Code"), find("Message")));
        }
        stack.extend(node.children.iter());
    }
    None
}

fn parse(body: &str) -> ConnectorResult<Option<Node>> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ConnectorError::InvalidResponse(format!("Malformed XML: {}", e)))?;
        match event {
            Event::Start(e) => stack.push(Node {
                name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                ..Node::default()
            }),
            Event::Empty(e) => {
                let node = Node {
                    name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                    ..Node::default()
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Text(t) => {
                if let Some(node) = stack.last_mut() {
                    let text = t.unescape().map_err(|e| {
                        ConnectorError::InvalidResponse(format!("Malformed XML text: {}", e))
                    })?;
                    node.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                if let Some(node) = stack.pop() {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root = Some(node),
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(root)
}

/// Plural-looking containers that are structures.
const STRUCTURES: &[&str] = &[
    "PendingModifiedValues",
    "Credentials",
    "ResponseMetadata",
    "Attributes",
];

/// Name suffixes of members whose text stays a string even when numeric.
const STRING_MEMBERS: &[&str] = &[
    "Id", "ID", "Arn", "Name", "Account", "Owner", "Number", "Value", "Marker", "Token", "Version",
    "Code", "Key",
];

fn looks_plural(name: &str) -> bool {
    if STRUCTURES.contains(&name) {
        return false;
    }
    name == "Items"
        || name.ends_with("Set")
        || (name.ends_with('s') && !["ss", "us", "is", "as"].iter().any(|end| name.ends_with(end)))
}

/// Singular stem of a container name (`Policies` > `Polic`, `tagSet` > `tag`).
fn stem(name: &str) -> &str {
    name.strip_suffix("Set")
        .or_else(|| name.strip_suffix("ies"))
        .or_else(|| name.strip_suffix('s'))
        .unwrap_or(name)
}

fn is_list(node: &Node) -> bool {
    let Some(first) = node.children.first() else {
        return false;
    };
    if !node.children.iter().all(|c| c.name == first.name) || STRUCTURES.contains(&node.name.as_str()) {
        return false;
    }
    if first.name == "member" || first.name == "item" || node.name == "Items" {
        return true;
    }
    let singular = stem(&node.name);
    if node.name != first.name
        && !singular.is_empty()
        && (node.name.starts_with(&first.name) || first.name.starts_with(singular))
    {
        return true;
    }
    looks_plural(&node.name) && (node.children.len() > 1 || !first.children.is_empty())
}

/// Types leaf text: booleans and integers become JSON scalars.
fn scalar(name: &str, text: &str) -> Value {
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    let keep_string = name == "member"
        || name == "item"
        || STRING_MEMBERS.iter().any(|suffix| name.ends_with(suffix));
    if !keep_string && is_integer(text) {
        if let Ok(n) = text.parse::<i64>() {
            return Value::from(n);
        }
    }
    Value::String(text.to_string())
}

/// Integer text without leading zeros, which would not survive a round trip.
fn is_integer(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
}

fn convert(node: &Node, ec2: bool) -> Value {
    if node.children.is_empty() {
        if node.text.is_empty() && looks_plural(&node.name) {
            return Value::Array(Vec::new());
        }
        return scalar(&node.name, &node.text);
    }
    if is_list(node) {
        return Value::Array(node.children.iter().map(|c| convert(c, ec2)).collect());
    }
    convert_children(node, ec2)
}

fn convert_children(node: &Node, ec2: bool) -> Value {
    let mut map = Map::new();
    for child in &node.children {
        let key = key_name(&child.name, ec2);
        let value = convert(child, ec2);
        match map.get_mut(&key) {
            // Flattened lists repeat the element name.
            Some(Value::Array(items)) if !is_list(child) => items.push(value),
            Some(existing) => {
                let previous = existing.take();
                *existing = Value::Array(vec![previous, value]);
            }
            None => {
                map.insert(key, value);
            }
        }
    }
    Value::Object(map)
}

fn key_name(name: &str, ec2: bool) -> String {
    if !ec2 {
        return name.to_string();
    }
    let base = match name.strip_suffix("Set") {
        Some(stem) if !stem.is_empty() => {
            if stem.ends_with('s') {
                stem.to_string()
            } else {
                format!("{}s", stem)
            }
        }
        _ => name.to_string(),
    };
    let mut chars = base.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => base,
    }
}
