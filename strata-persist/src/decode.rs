//! Decoding binary document state into ordered node candidates.
//!
//! Two identity strategies exist and are not interchangeable:
//!
//! - [`IdentityStrategy::ContentDigest`] walks the XML fragment `default`
//!   depth-first. Every element becomes a node; its id is
//!   `sha256("{type}\0{order}\0{text}")` truncated to 16 hex chars. Any edit
//!   that shifts a preceding element changes the ids of all following ones.
//! - [`IdentityStrategy::StableKey`] reads the root map `nodes`, where each
//!   key is an engine-assigned node id and each value describes the node.
//!
//! ```text
//! <paragraph>Hello</paragraph>          order 0, parent None
//! <bulletList>                          order 1, parent None
//!   <listItem>one</listItem>            order 2, parent = id(bulletList)
//! </bulletList>
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value};
use sha2::{Digest, Sha256};
use yrs::{Doc, GetString, Map, Out, ReadTxn, Transact, Xml, XmlFragment, XmlOut};

use crate::engine::decode_state;
use crate::error::DecodeError;

/// Root XML fragment holding rich-text content.
pub const ROOT_FRAGMENT: &str = "default";
/// Root map holding explicitly keyed nodes.
pub const NODE_MAP: &str = "nodes";
/// Length of content-derived node ids, in hex chars.
pub const NODE_ID_LEN: usize = 16;

const DEFAULT_NODE_TYPE: &str = "paragraph";

/// How node identity is assigned during decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityStrategy {
    ContentDigest,
    StableKey,
}

/// A decoded node, not yet reconciled with storage.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCandidate {
    pub id: String,
    pub node_type: String,
    /// `{"text": ..., "attrs": {...}}`
    pub content: Value,
    pub parent_id: Option<String>,
    pub order: i64,
}

impl NodeCandidate {
    pub fn text(&self) -> &str {
        self.content.get("text").and_then(Value::as_str).unwrap_or("")
    }
}

/// Content-derived node id.
///
/// Fields are NUL-separated; neither a tag nor a number can contain NUL,
/// so distinct `(type, order, text)` triples never hash the same input.
pub fn content_node_id(node_type: &str, order: i64, text: &str) -> String {
    let digest = Sha256::new()
        .chain_update(node_type.as_bytes())
        .chain_update([0u8])
        .chain_update(order.to_string().as_bytes())
        .chain_update([0u8])
        .chain_update(text.as_bytes())
        .finalize();
    let mut id = hex::encode(digest);
    id.truncate(NODE_ID_LEN);
    id
}

/// Decode binary state into node candidates in document order.
pub fn decode_nodes(state: &[u8], strategy: IdentityStrategy) -> Result<Vec<NodeCandidate>, DecodeError> {
    let doc = decode_state(state)?;
    match strategy {
        IdentityStrategy::ContentDigest => Ok(nodes_from_fragment(&doc)),
        IdentityStrategy::StableKey => nodes_from_map(&doc),
    }
}

// ─── Content digest ──────────────────────────────────────────────────

fn nodes_from_fragment(doc: &Doc) -> Vec<NodeCandidate> {
    let fragment = doc.get_or_insert_xml_fragment(ROOT_FRAGMENT);
    let txn = doc.transact();
    let mut nodes = Vec::new();
    walk_elements(&txn, &fragment, None, &mut nodes);
    nodes
}

/// Pre-order walk: a parent is emitted before its children.
fn walk_elements<T, F>(txn: &T, parent: &F, parent_id: Option<&str>, nodes: &mut Vec<NodeCandidate>)
where
    T: ReadTxn,
    F: XmlFragment,
{
    for index in 0..parent.len(txn) {
        let Some(XmlOut::Element(element)) = parent.get(txn, index) else {
            continue;
        };

        let node_type = element.tag().to_string();
        let text = collect_text(txn, &element);
        let order = nodes.len() as i64;
        let id = content_node_id(&node_type, order, &text);

        let mut attrs = JsonMap::new();
        for (name, value) in element.attributes(txn) {
            attrs.insert(name.to_string(), Value::String(value.to_string(txn)));
        }

        nodes.push(NodeCandidate {
            id: id.clone(),
            node_type,
            content: json!({ "text": text, "attrs": attrs }),
            parent_id: parent_id.map(str::to_string),
            order,
        });

        walk_elements(txn, &element, Some(id.as_str()), nodes);
    }
}

/// Concatenated text of every descendant text node.
fn collect_text<T, F>(txn: &T, parent: &F) -> String
where
    T: ReadTxn,
    F: XmlFragment,
{
    let mut text = String::new();
    for index in 0..parent.len(txn) {
        match parent.get(txn, index) {
            Some(XmlOut::Text(t)) => text.push_str(&t.get_string(txn)),
            Some(XmlOut::Element(e)) => text.push_str(&collect_text(txn, &e)),
            _ => {}
        }
    }
    text
}

// ─── Stable key ──────────────────────────────────────────────────────

struct KeyedEntry {
    key: String,
    node_type: String,
    text: String,
    parent_id: Option<String>,
    order: Option<f64>,
    attrs: Value,
}

fn nodes_from_map(doc: &Doc) -> Result<Vec<NodeCandidate>, DecodeError> {
    let map = doc.get_or_insert_map(NODE_MAP);
    let txn = doc.transact();

    let mut entries = Vec::new();
    for (key, value) in map.iter(&txn) {
        let fields = out_to_json(&txn, value, key)?;
        entries.push(keyed_entry(key, fields)?);
    }

    check_parents(&entries)?;

    entries.sort_by(|a, b| {
        let ao = a.order.unwrap_or(f64::MAX);
        let bo = b.order.unwrap_or(f64::MAX);
        ao.total_cmp(&bo).then_with(|| a.key.cmp(&b.key))
    });

    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(order, entry)| NodeCandidate {
            id: entry.key,
            node_type: entry.node_type,
            content: json!({ "text": entry.text, "attrs": entry.attrs }),
            parent_id: entry.parent_id,
            order: order as i64,
        })
        .collect())
}

fn out_to_json<T: ReadTxn>(txn: &T, value: Out, key: &str) -> Result<Value, DecodeError> {
    match value {
        Out::Any(any) => serde_json::to_value(&any).map_err(|e| DecodeError::InvalidEntry {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        Out::YMap(nested) => {
            let mut object = JsonMap::new();
            for (field, inner) in nested.iter(txn) {
                object.insert(field.to_string(), out_to_json(txn, inner, key)?);
            }
            Ok(Value::Object(object))
        }
        other => Ok(Value::String(other.to_string(txn))),
    }
}

fn keyed_entry(key: &str, fields: Value) -> Result<KeyedEntry, DecodeError> {
    let invalid = |reason: &str| DecodeError::InvalidEntry {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let Value::Object(mut fields) = fields else {
        return Err(invalid("expected a map"));
    };

    let node_type = match fields.remove("type") {
        None | Some(Value::Null) => DEFAULT_NODE_TYPE.to_string(),
        Some(Value::String(t)) if !t.is_empty() => t,
        Some(_) => return Err(invalid("`type` must be a non-empty string")),
    };
    let text = match fields.remove("text") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(t)) => t,
        Some(_) => return Err(invalid("`text` must be a string")),
    };
    let parent_id = match fields.remove("parentId") {
        None | Some(Value::Null) => None,
        Some(Value::String(p)) => Some(p),
        Some(_) => return Err(invalid("`parentId` must be a string")),
    };
    let order = match fields.remove("order") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64(),
        Some(_) => return Err(invalid("`order` must be a number")),
    };
    let attrs = match fields.remove("attrs") {
        None | Some(Value::Null) => Value::Object(JsonMap::new()),
        Some(a @ Value::Object(_)) => a,
        Some(_) => return Err(invalid("`attrs` must be a map")),
    };

    Ok(KeyedEntry {
        key: key.to_string(),
        node_type,
        text,
        parent_id,
        order,
        attrs,
    })
}

/// Every parent must exist and parent chains must terminate.
fn check_parents(entries: &[KeyedEntry]) -> Result<(), DecodeError> {
    let parents: HashMap<&str, Option<&str>> = entries
        .iter()
        .map(|e| (e.key.as_str(), e.parent_id.as_deref()))
        .collect();

    for entry in entries {
        let mut seen = HashSet::new();
        seen.insert(entry.key.as_str());
        let mut cursor = entry.parent_id.as_deref();
        while let Some(parent) = cursor {
            let Some(next) = parents.get(parent) else {
                return Err(DecodeError::DanglingParent {
                    node: entry.key.clone(),
                    parent: parent.to_string(),
                });
            };
            if !seen.insert(parent) {
                return Err(DecodeError::Cycle(entry.key.clone()));
            }
            cursor = *next;
        }
    }
    Ok(())
}
