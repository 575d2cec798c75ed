//! Writer for the object-graph format, used to author fixtures.

use super::{FORMAT_VERSION, GraphObject, GraphValue, MAGIC, tag};
use std::collections::HashMap;
use std::sync::Arc;

/// Serializes a [`GraphValue`] tree. Objects shared through `Arc` are written
/// once and referenced afterwards.
#[derive(Debug, Default)]
pub struct ObjectGraphEncoder {
    table: HashMap<*const GraphObject, u32>,
    next_index: u32,
}

impl ObjectGraphEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `root` as a complete stream with header.
    pub fn encode(mut self, root: &GraphValue) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        self.value(root, &mut out);
        out
    }

    fn value(&mut self, value: &GraphValue, out: &mut Vec<u8>) {
        match value {
            GraphValue::None => frame(tag::NONE, &[], out),
            GraphValue::Bool(v) => frame(tag::BOOL, &[u8::from(*v)], out),
            GraphValue::Int(v) => frame(tag::INT, &v.to_le_bytes(), out),
            GraphValue::Float(v) => frame(tag::FLOAT, &v.to_le_bytes(), out),
            GraphValue::Str(s) => frame(tag::STR, s.as_bytes(), out),
            GraphValue::Bytes(b) => frame(tag::BYTES, b, out),
            GraphValue::List(items) => {
                let mut payload = Vec::new();
                for item in items {
                    self.value(item, &mut payload);
                }
                frame(tag::LIST, &payload, out);
            }
            GraphValue::Dict(entries) => {
                let payload = self.entries(entries);
                frame(tag::DICT, &payload, out);
            }
            GraphValue::Object(object) => {
                let key = Arc::as_ptr(object);
                if let Some(index) = self.table.get(&key) {
                    frame(tag::REF, &index.to_le_bytes(), out);
                    return;
                }
                let mut payload = Vec::new();
                frame(tag::STR, object.type_name.as_bytes(), &mut payload);
                let state = self.entries(object.state.entries());
                frame(tag::DICT, &state, &mut payload);
                frame(tag::OBJECT, &payload, out);
                // Indices follow completion order, matching the decoder.
                self.table.insert(key, self.next_index);
                self.next_index += 1;
            }
        }
    }

    fn entries(&mut self, entries: &[(String, GraphValue)]) -> Vec<u8> {
        let mut payload = Vec::new();
        for (key, value) in entries {
            frame(tag::STR, key.as_bytes(), &mut payload);
            self.value(value, &mut payload);
        }
        payload
    }
}

fn frame(tag: u8, payload: &[u8], out: &mut Vec<u8>) {
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}
