//! Argument list codec: UTF-8 bytes of the object-graph JSON

use crate::json::{self, ClassMappings, ObjectGraph};
use crate::{Error, Result};

/// Encode an argument graph into bytes
pub fn encode(args: &ObjectGraph) -> Result<Vec<u8>> {
    Ok(json::stringify(args)?.into_bytes())
}

/// Decode argument bytes; empty input is an empty argument list
pub fn decode(bytes: &[u8], mappings: &ClassMappings) -> Result<ObjectGraph> {
    if bytes.is_empty() {
        let mut graph = ObjectGraph::new();
        let root = graph.add_array(Vec::new());
        graph.set_root(root);
        return Ok(graph);
    }

    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::CorruptPayload(format!("arguments are not UTF-8: {}", e)))?;

    json::parse(text, mappings)
}

/// Encode plain JSON as an argument payload
pub fn encode_json(value: serde_json::Value) -> Result<Vec<u8>> {
    encode(&ObjectGraph::from_json(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_bytes_decode_to_empty_list() {
        let graph = decode(&[], &ClassMappings::new()).unwrap();
        assert!(graph.items().is_empty());
        assert_eq!(graph.to_json().unwrap(), json!([]));
    }

    #[test]
    fn test_encode_is_utf8_json() {
        let bytes = encode_json(json!(["héllo", 2])).unwrap();
        assert_eq!(String::from_utf8(bytes.clone()).unwrap(), r#"["héllo",2]"#);

        let graph = decode(&bytes, &ClassMappings::new()).unwrap();
        assert_eq!(graph.to_json().unwrap(), json!(["héllo", 2]));
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        assert!(matches!(
            decode(&[0xff, 0xfe], &ClassMappings::new()),
            Err(Error::CorruptPayload(_))
        ));
    }
}
