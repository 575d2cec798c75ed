//! Closed decoding loop for the object-graph format.
//!
//! The decoder knows nothing about pipelines: it turns bytes into a
//! [`GraphValue`] tree. Typed construction happens afterwards through the
//! [`crate::registry::TypeRegistry`].

use super::{FORMAT_VERSION, GraphObject, GraphValue, MAGIC, MAX_DEPTH, ObjectState, tag};
use crate::error::DecodeError;
use std::sync::Arc;

/// Decode a complete stream (header + one root value).
pub fn decode_graph(bytes: &[u8]) -> Result<GraphValue, DecodeError> {
    let mut cursor = Cursor::new(bytes);

    let magic = cursor.take(MAGIC.len()).map_err(|_| DecodeError::BadMagic {
        found: bytes.iter().take(MAGIC.len()).copied().collect(),
    })?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic {
            found: magic.to_vec(),
        });
    }
    let version = cursor.u16()?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion { version });
    }

    let mut decoder = GraphDecoder::default();
    let root = decoder.value(&mut cursor, 0)?;
    if cursor.remaining() > 0 {
        return Err(DecodeError::TrailingBytes {
            trailing: cursor.remaining(),
        });
    }
    tracing::debug!(
        objects = decoder.completed.len(),
        bytes = bytes.len(),
        "Decoded object graph"
    );
    Ok(root)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn array8(&mut self) -> Result<[u8; 8], DecodeError> {
        let b = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(out)
    }
}

#[derive(Default)]
struct GraphDecoder {
    /// Objects in completion order; the back-reference table.
    completed: Vec<Arc<GraphObject>>,
}

impl GraphDecoder {
    fn value(&mut self, cursor: &mut Cursor<'_>, depth: usize) -> Result<GraphValue, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep { limit: MAX_DEPTH });
        }
        let tag_offset = cursor.pos;
        let tag = cursor.u8()?;
        let len = cursor.u32()? as usize;
        let payload_offset = cursor.pos;
        let payload = cursor.take(len)?;

        let expect_len = |expected: usize, what: &'static str| {
            if len == expected {
                Ok(())
            } else {
                Err(DecodeError::Malformed {
                    what,
                    offset: tag_offset,
                    message: format!("payload length {len}, expected {expected}"),
                })
            }
        };

        match tag {
            tag::NONE => {
                expect_len(0, "None")?;
                Ok(GraphValue::None)
            }
            tag::BOOL => {
                expect_len(1, "bool")?;
                match payload[0] {
                    0 => Ok(GraphValue::Bool(false)),
                    1 => Ok(GraphValue::Bool(true)),
                    other => Err(DecodeError::Malformed {
                        what: "bool",
                        offset: payload_offset,
                        message: format!("byte {other} is neither 0 nor 1"),
                    }),
                }
            }
            tag::INT => {
                expect_len(8, "int")?;
                let mut inner = Cursor::new(payload);
                Ok(GraphValue::Int(i64::from_le_bytes(inner.array8()?)))
            }
            tag::FLOAT => {
                expect_len(8, "float")?;
                let mut inner = Cursor::new(payload);
                Ok(GraphValue::Float(f64::from_le_bytes(inner.array8()?)))
            }
            tag::STR => Ok(GraphValue::Str(utf8(payload, payload_offset)?)),
            tag::BYTES => Ok(GraphValue::Bytes(payload.to_vec())),
            tag::LIST => {
                let mut inner = Cursor::new(payload);
                let mut items = Vec::new();
                while inner.remaining() > 0 {
                    items.push(self.nested(&mut inner, payload_offset, depth)?);
                }
                Ok(GraphValue::List(items))
            }
            tag::DICT => {
                let mut inner = Cursor::new(payload);
                Ok(GraphValue::Dict(self.entries(
                    &mut inner,
                    payload_offset,
                    depth,
                )?))
            }
            tag::OBJECT => {
                let mut inner = Cursor::new(payload);
                let type_name = match self.nested(&mut inner, payload_offset, depth)? {
                    GraphValue::Str(name) => name,
                    other => {
                        return Err(DecodeError::Malformed {
                            what: "object",
                            offset: payload_offset,
                            message: format!("type name must be a str, got {}", other.kind()),
                        });
                    }
                };
                let state_offset = payload_offset + inner.pos;
                let state = match self.nested(&mut inner, payload_offset, depth)? {
                    GraphValue::Dict(entries) => entries,
                    other => {
                        return Err(DecodeError::Malformed {
                            what: "object",
                            offset: state_offset,
                            message: format!("state must be a dict, got {}", other.kind()),
                        });
                    }
                };
                if inner.remaining() > 0 {
                    return Err(DecodeError::Malformed {
                        what: "object",
                        offset: payload_offset + inner.pos,
                        message: format!("{} unexpected bytes after state", inner.remaining()),
                    });
                }
                let object = Arc::new(GraphObject {
                    state: ObjectState::new(state).with_type_name(&type_name),
                    type_name,
                });
                // Only complete objects become referenceable.
                self.completed.push(Arc::clone(&object));
                Ok(GraphValue::Object(object))
            }
            tag::REF => {
                expect_len(4, "ref")?;
                let mut inner = Cursor::new(payload);
                let index = inner.u32()?;
                self.completed
                    .get(index as usize)
                    .map(|obj| GraphValue::Object(Arc::clone(obj)))
                    .ok_or(DecodeError::InvalidReference {
                        index,
                        available: self.completed.len(),
                    })
            }
            other => Err(DecodeError::UnknownTag {
                tag: other,
                offset: tag_offset,
            }),
        }
    }

    /// Decode a value from a sub-cursor, translating offsets back to the stream.
    fn nested(
        &mut self,
        inner: &mut Cursor<'_>,
        base: usize,
        depth: usize,
    ) -> Result<GraphValue, DecodeError> {
        self.value(inner, depth + 1).map_err(|e| rebase(e, base))
    }

    fn entries(
        &mut self,
        inner: &mut Cursor<'_>,
        base: usize,
        depth: usize,
    ) -> Result<Vec<(String, GraphValue)>, DecodeError> {
        let mut entries: Vec<(String, GraphValue)> = Vec::new();
        while inner.remaining() > 0 {
            let key_offset = base + inner.pos;
            let key = match self.nested(inner, base, depth)? {
                GraphValue::Str(key) => key,
                other => {
                    return Err(DecodeError::Malformed {
                        what: "dict",
                        offset: key_offset,
                        message: format!("keys must be str, got {}", other.kind()),
                    });
                }
            };
            if inner.remaining() == 0 {
                return Err(DecodeError::Malformed {
                    what: "dict",
                    offset: key_offset,
                    message: format!("key '{key}' has no value"),
                });
            }
            if entries.iter().any(|(k, _)| *k == key) {
                return Err(DecodeError::Malformed {
                    what: "dict",
                    offset: key_offset,
                    message: format!("duplicate key '{key}'"),
                });
            }
            let value = self.nested(inner, base, depth)?;
            entries.push((key, value));
        }
        Ok(entries)
    }
}

fn utf8(payload: &[u8], offset: usize) -> Result<String, DecodeError> {
    String::from_utf8(payload.to_vec()).map_err(|e| DecodeError::Malformed {
        what: "str",
        offset,
        message: e.to_string(),
    })
}

fn rebase(err: DecodeError, base: usize) -> DecodeError {
    match err {
        DecodeError::Truncated { offset, needed } => DecodeError::Truncated {
            offset: offset + base,
            needed,
        },
        DecodeError::UnknownTag { tag, offset } => DecodeError::UnknownTag {
            tag,
            offset: offset + base,
        },
        DecodeError::Malformed {
            what,
            offset,
            message,
        } => DecodeError::Malformed {
            what,
            offset: offset + base,
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ObjectGraphEncoder;

    fn header() -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out
    }

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_rejects_bad_magic() {
        let err = decode_graph(b"PK\x03\x04rest").unwrap_err();
        assert!(matches!(err, DecodeError::BadMagic { .. }));
    }

    #[test]
    fn test_rejects_short_stream_as_bad_magic() {
        assert!(matches!(
            decode_graph(b"PK").unwrap_err(),
            DecodeError::BadMagic { .. }
        ));
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&7u16.to_le_bytes());
        bytes.extend(frame(tag::NONE, &[]));
        assert_eq!(
            decode_graph(&bytes).unwrap_err(),
            DecodeError::UnsupportedVersion { version: 7 }
        );
    }

    #[test]
    fn test_decodes_scalars() {
        let mut bytes = header();
        let mut list = frame(tag::INT, &(-5i64).to_le_bytes());
        list.extend(frame(tag::FLOAT, &2.5f64.to_le_bytes()));
        list.extend(frame(tag::STR, b"abc"));
        list.extend(frame(tag::BOOL, &[1]));
        bytes.extend(frame(tag::LIST, &list));
        assert_eq!(
            decode_graph(&bytes).unwrap(),
            GraphValue::List(vec![
                GraphValue::Int(-5),
                GraphValue::Float(2.5),
                GraphValue::str("abc"),
                GraphValue::Bool(true),
            ])
        );
    }

    #[test]
    fn test_rejects_unknown_tag() {
        let mut bytes = header();
        bytes.extend(frame(0x42, &[]));
        assert!(matches!(
            decode_graph(&bytes).unwrap_err(),
            DecodeError::UnknownTag { tag: 0x42, .. }
        ));
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let mut bytes = header();
        bytes.push(tag::STR);
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        assert!(matches!(
            decode_graph(&bytes).unwrap_err(),
            DecodeError::Truncated { needed: 10, .. }
        ));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = header();
        bytes.extend(frame(tag::NONE, &[]));
        bytes.push(0xff);
        assert_eq!(
            decode_graph(&bytes).unwrap_err(),
            DecodeError::TrailingBytes { trailing: 1 }
        );
    }

    #[test]
    fn test_rejects_forward_reference() {
        let mut bytes = header();
        bytes.extend(frame(tag::REF, &0u32.to_le_bytes()));
        assert_eq!(
            decode_graph(&bytes).unwrap_err(),
            DecodeError::InvalidReference {
                index: 0,
                available: 0
            }
        );
    }

    #[test]
    fn test_rejects_self_reference_inside_object() {
        // An object whose state refers to index 0 while object 0 is still open.
        let mut state = frame(tag::STR, b"me");
        state.extend(frame(tag::REF, &0u32.to_le_bytes()));
        let mut payload = frame(tag::STR, b"test.Cyclic");
        payload.extend(frame(tag::DICT, &state));
        let mut bytes = header();
        bytes.extend(frame(tag::OBJECT, &payload));
        assert!(matches!(
            decode_graph(&bytes).unwrap_err(),
            DecodeError::InvalidReference { index: 0, .. }
        ));
    }

    #[test]
    fn test_back_reference_shares_object() {
        let shared = GraphValue::object("test.Shared", [("v", GraphValue::Int(1))]);
        let root = GraphValue::List(vec![shared.clone(), shared]);
        let bytes = ObjectGraphEncoder::new().encode(&root);
        let decoded = decode_graph(&bytes).unwrap();
        let GraphValue::List(items) = decoded else {
            panic!("expected list");
        };
        let (a, b) = (items[0].as_object().unwrap(), items[1].as_object().unwrap());
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn test_rejects_excessive_nesting() {
        let mut value = frame(tag::NONE, &[]);
        for _ in 0..(MAX_DEPTH + 2) {
            value = frame(tag::LIST, &value);
        }
        let mut bytes = header();
        bytes.extend(value);
        assert_eq!(
            decode_graph(&bytes).unwrap_err(),
            DecodeError::TooDeep { limit: MAX_DEPTH }
        );
    }

    #[test]
    fn test_rejects_duplicate_dict_key() {
        let mut entries = frame(tag::STR, b"k");
        entries.extend(frame(tag::NONE, &[]));
        entries.extend(frame(tag::STR, b"k"));
        entries.extend(frame(tag::NONE, &[]));
        let mut bytes = header();
        bytes.extend(frame(tag::DICT, &entries));
        assert!(matches!(
            decode_graph(&bytes).unwrap_err(),
            DecodeError::Malformed { what: "dict", .. }
        ));
    }
}
