//! Deterministic JSON text for digests, fingerprints and the final output document.
//!
//! Digest text matches what Python's `json.dumps(doc, sort_keys=True)` emits
//! (`", "` / `": "` separators, non-ASCII escaped as `\uXXXX`), so documents
//! pre-stamped by other Seven Bridges tooling hash the same here.

use crate::error::{Result, RunnerError};
use serde_json::Value;
use serde_json::ser::{Formatter, PrettyFormatter, Serializer};
use std::io;

/// Canonicalize a JSON value by sorting object keys recursively.
pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut ordered = serde_json::Map::with_capacity(map.len());
            for key in keys {
                ordered.insert(key.clone(), canonicalize_json(&map[key]));
            }
            Value::Object(ordered)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}

/// Single-line text with sorted keys, used as hashing input.
pub fn digest_text(value: &Value) -> Result<String> {
    let mut out = Vec::new();
    let mut ser = Serializer::with_formatter(&mut out, SpacedFormatter);
    serde::Serialize::serialize(&canonicalize_json(value), &mut ser)
        .map_err(|e| RunnerError::Internal(format!("serialize digest text: {e}")))?;
    into_string(out)
}

/// Four-space indented text with `": "` key separators, key order preserved.
pub fn output_text(value: &Value) -> Result<String> {
    let mut out = Vec::new();
    let formatter = AsciiPretty {
        inner: PrettyFormatter::with_indent(b"    "),
    };
    let mut ser = Serializer::with_formatter(&mut out, formatter);
    serde::Serialize::serialize(value, &mut ser)
        .map_err(|e| RunnerError::Internal(format!("serialize output document: {e}")))?;
    into_string(out)
}

/// Lowercase hex encoding of a digest.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn into_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| RunnerError::Internal(format!("non-utf8 json: {e}")))
}

fn write_ascii_fragment<W>(writer: &mut W, fragment: &str) -> io::Result<()>
where
    W: ?Sized + io::Write,
{
    let bytes = fragment.as_bytes();
    let mut start = 0;
    for (idx, ch) in fragment.char_indices() {
        if ch.is_ascii() {
            continue;
        }
        writer.write_all(&bytes[start..idx])?;
        let mut units = [0u16; 2];
        for unit in ch.encode_utf16(&mut units) {
            write!(writer, "\\u{unit:04x}")?;
        }
        start = idx + ch.len_utf8();
    }
    writer.write_all(&bytes[start..])
}

struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        write_ascii_fragment(writer, fragment)
    }
}

struct AsciiPretty<'a> {
    inner: PrettyFormatter<'a>,
}

impl Formatter for AsciiPretty<'_> {
    fn begin_array<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.inner.begin_array(writer)
    }

    fn end_array<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.inner.end_array(writer)
    }

    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.inner.begin_array_value(writer, first)
    }

    fn end_array_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.inner.end_array_value(writer)
    }

    fn begin_object<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.inner.begin_object(writer)
    }

    fn end_object<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.inner.end_object(writer)
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.inner.begin_object_key(writer, first)
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.inner.begin_object_value(writer)
    }

    fn end_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.inner.end_object_value(writer)
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        write_ascii_fragment(writer, fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_text_sorts_keys_and_spaces_separators() {
        let text = digest_text(&json!({"b": [1, 2], "a": {"d": true, "c": null}})).unwrap();
        assert_eq!(text, r#"{"a": {"c": null, "d": true}, "b": [1, 2]}"#);
    }

    #[test]
    fn non_ascii_is_escaped_like_python() {
        let text = digest_text(&json!({"name": "café 𝄞"})).unwrap();
        assert_eq!(text, r#"{"name": "caf\u00e9 \ud834\udd1e"}"#);
    }

    #[test]
    fn output_text_uses_four_space_indent() {
        let text = output_text(&json!({"sum": 3, "files": ["a"]})).unwrap();
        assert_eq!(
            text,
            "{\n    \"sum\": 3,\n    \"files\": [\n        \"a\"\n    ]\n}"
        );
    }

    #[test]
    fn hex_is_lowercase() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
