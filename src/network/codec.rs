//! JSON wire codec.
//!
//! Peers write one JSON document per message with no delimiter or length
//! prefix. The decoder buffers bytes until a document is complete and splits
//! documents that arrive in the same read, so correctness does not depend on
//! how the transport chunks the stream.

use serde::Serialize;
use serde_json::Value;

use crate::raft::Packet;

use super::NetworkError;

/// A decoded document from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Packet(Packet),
    /// Valid JSON that is not a known packet. Only its `term` is looked at.
    Unrecognized { term: Option<u64> },
}

impl Inbound {
    pub fn term(&self) -> Option<u64> {
        match self {
            Inbound::Packet(packet) => packet.term(),
            Inbound::Unrecognized { term } => *term,
        }
    }
}

pub fn classify(value: Value) -> Inbound {
    let term = value.get("term").and_then(Value::as_u64);
    match serde_json::from_value::<Packet>(value) {
        Ok(packet) => Inbound::Packet(packet),
        Err(_) => Inbound::Unrecognized { term },
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, NetworkError> {
    Ok(serde_json::to_vec(message)?)
}

pub struct JsonDecoder {
    buf: Vec<u8>,
    max_frame: usize,
}

impl JsonDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    /// Feeds a chunk and returns every document it completes.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Value>, NetworkError> {
        self.buf.extend_from_slice(chunk);

        let mut docs = Vec::new();
        let consumed = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            loop {
                match stream.next() {
                    Some(Ok(doc)) => docs.push(doc),
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => return Err(NetworkError::Malformed(e)),
                    None => break,
                }
            }
            stream.byte_offset()
        };
        self.buf.drain(..consumed);

        if self.buf.len() > self.max_frame {
            return Err(NetworkError::FrameTooLarge(self.max_frame));
        }
        Ok(docs)
    }

    #[cfg(test)]
    fn has_partial(&self) -> bool {
        self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_single_document() {
        let mut decoder = JsonDecoder::new(1024);
        let docs = decoder.decode(br#"{"name":"get-state"}"#).unwrap();
        assert_eq!(docs, vec![json!({"name": "get-state"})]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn splits_coalesced_documents() {
        let mut decoder = JsonDecoder::new(1024);
        let docs = decoder
            .decode(br#"{"name":"append","term":1}{"name":"append","term":2}"#)
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["term"], 2);
    }

    #[test]
    fn buffers_partial_document_across_reads() {
        let mut decoder = JsonDecoder::new(1024);
        assert!(decoder.decode(br#"{"name":"vo"#).unwrap().is_empty());
        assert!(decoder.has_partial());

        let docs = decoder.decode(br#"te","term":3}{"na"#).unwrap();
        assert_eq!(docs, vec![json!({"name": "vote", "term": 3})]);
        assert!(decoder.has_partial());
    }

    #[test]
    fn rejects_malformed_json() {
        let mut decoder = JsonDecoder::new(1024);
        match decoder.decode(b"{not json}") {
            Err(NetworkError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn rejects_oversized_partial_frame() {
        let mut decoder = JsonDecoder::new(8);
        match decoder.decode(br#"{"name":"append","leader":"#) {
            Err(NetworkError::FrameTooLarge(8)) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn classifies_known_and_unknown_documents() {
        match classify(json!({"name": "discover-leader", "term": 2})) {
            Inbound::Packet(p) => assert_eq!(p.name(), "discover-leader"),
            other => panic!("expected packet, got {other:?}"),
        }

        let legacy_reply = classify(json!({"success": true, "term": 9}));
        assert_eq!(legacy_reply, Inbound::Unrecognized { term: Some(9) });
        assert_eq!(legacy_reply.term(), Some(9));

        assert_eq!(
            classify(json!({"name": "snapshot"})),
            Inbound::Unrecognized { term: None }
        );
    }
}
