//! Streamer
//!
//! Convenience pumps built on the incremental cursors: whole-string and
//! whole-stream conversion with a fixed window, an announcer that turns a
//! byte feed into a stream of completed top-level elements, and an
//! interactive exchange where a dispatcher picks the element type from
//! the buffered prefix.

use std::io::{Read, Write};

use crate::error::Error;
use crate::node::Node;
use crate::text::{Deserializer, Serializer};

/// Window used by the whole-document helpers.
const CHUNK: usize = 1024;

/// Serialize a tree to a string, pumping through a bounded window.
pub fn to_string(root: &Node) -> String {
    let mut serializer = Serializer::new();
    let mut out = String::new();
    let mut window = [0u8; CHUNK];
    while !serializer.is_complete() {
        let produced = serializer.serialize(root, &mut window);
        out.push_str(&String::from_utf8_lossy(&window[..produced]));
    }
    out
}

/// Parse a complete document into `root`. On failure the tree is cleared
/// and the error record carries context and position.
pub fn from_str(root: &mut Node, text: &str) -> Result<(), Error> {
    from_slice(root, text.as_bytes())
}

pub fn from_slice(root: &mut Node, bytes: &[u8]) -> Result<(), Error> {
    let mut deserializer = Deserializer::new();
    let mut offset = 0;
    while offset < bytes.len() && !deserializer.is_complete() {
        let window = &bytes[offset..(offset + CHUNK).min(bytes.len())];
        offset += deserializer.deserialize(root, window)?;
    }
    deserializer.finish(root)
}

/// Errors of the stream-backed helpers.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] Error),
}

/// Serialize a tree into a writer through a fixed window.
pub fn to_writer<W: Write>(root: &Node, mut writer: W) -> Result<(), StreamError> {
    let mut serializer = Serializer::new();
    let mut window = [0u8; CHUNK];
    while !serializer.is_complete() {
        let produced = serializer.serialize(root, &mut window);
        writer.write_all(&window[..produced])?;
    }
    Ok(())
}

/// Parse a tree from a reader through a fixed window.
pub fn from_reader<R: Read>(root: &mut Node, mut reader: R) -> Result<(), StreamError> {
    let mut deserializer = Deserializer::new();
    let mut window = [0u8; CHUNK];
    loop {
        let filled = reader.read(&mut window)?;
        if filled == 0 {
            deserializer.finish(root)?;
            return Ok(());
        }
        let mut offset = 0;
        while offset < filled && !deserializer.is_complete() {
            offset += deserializer.deserialize(root, &window[offset..filled])?;
        }
        if deserializer.is_complete() {
            return Ok(());
        }
    }
}

/// Assembles consecutive top-level elements out of an arbitrary byte feed
/// and announces each completed one to the consumer. The element is
/// cleared and reused between documents.
pub struct Announcer<F>
where
    F: FnMut(&Node),
{
    element: Node,
    cursor: Deserializer,
    announce: F,
}

impl<F> Announcer<F>
where
    F: FnMut(&Node),
{
    pub fn new(element: Node, announce: F) -> Self {
        Self {
            element,
            cursor: Deserializer::new(),
            announce,
        }
    }

    /// Feed a window. Every element completed inside it is announced;
    /// a trailing partial document stays buffered in the cursor.
    pub fn feed(&mut self, mut input: &[u8]) -> Result<(), Error> {
        while !input.is_empty() {
            let consumed = match self.cursor.deserialize(&mut self.element, input) {
                Ok(consumed) => consumed,
                Err(err) => {
                    // Resynchronize on the next document.
                    self.cursor = Deserializer::new();
                    return Err(err);
                }
            };
            if self.cursor.is_complete() {
                (self.announce)(&self.element);
                self.cursor = Deserializer::new();
            } else if consumed == 0 {
                // Nothing but trailing whitespace.
                return Ok(());
            }
            input = &input[consumed..];
        }
        Ok(())
    }
}

/// Interactive assembler. Bytes are buffered until the dispatcher can
/// tell from the prefix which element to parse into (a method lookup,
/// typically); the chosen element then receives the buffered bytes and
/// everything that follows, and is handed back on completion.
pub struct Exchange<D, F>
where
    D: FnMut(&[u8]) -> Option<Node>,
    F: FnMut(Node),
{
    dispatch: D,
    complete: F,
    buffered: Vec<u8>,
    active: Option<(Node, Deserializer)>,
}

impl<D, F> Exchange<D, F>
where
    D: FnMut(&[u8]) -> Option<Node>,
    F: FnMut(Node),
{
    pub fn new(dispatch: D, complete: F) -> Self {
        Self {
            dispatch,
            complete,
            buffered: Vec::new(),
            active: None,
        }
    }

    pub fn feed(&mut self, input: &[u8]) -> Result<(), Error> {
        self.buffered.extend_from_slice(input);
        loop {
            if self.active.is_none() {
                let trimmed = self
                    .buffered
                    .iter()
                    .position(|b| !b.is_ascii_whitespace())
                    .unwrap_or(self.buffered.len());
                self.buffered.drain(..trimmed);
                if self.buffered.is_empty() {
                    return Ok(());
                }
                match (self.dispatch)(&self.buffered) {
                    Some(element) => self.active = Some((element, Deserializer::new())),
                    // The dispatcher needs a longer prefix.
                    None => return Ok(()),
                }
            }
            let (element, cursor) = self.active.as_mut().unwrap();
            let pending = std::mem::take(&mut self.buffered);
            let consumed = match cursor.deserialize(element, &pending) {
                Ok(consumed) => consumed,
                Err(err) => {
                    self.active = None;
                    return Err(err);
                }
            };
            self.buffered = pending[consumed..].to_vec();
            if cursor.is_complete() {
                let (element, _) = self.active.take().unwrap();
                (self.complete)(element);
            } else {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Base;
    use pretty_assertions::assert_eq;

    fn sample() -> Node {
        Node::object(vec![
            ("key", Node::string()),
            ("n", Node::unsigned(Base::Decimal)),
        ])
    }

    #[test]
    fn test_to_writer_from_reader_roundtrip() {
        let mut node = sample();
        node.as_object_mut()
            .unwrap()
            .get_mut("key")
            .unwrap()
            .as_str_mut()
            .unwrap()
            .set("value");
        let mut bytes = Vec::new();
        to_writer(&node, &mut bytes).unwrap();
        assert_eq!(bytes, b"{\"key\":\"value\"}");

        let mut parsed = sample();
        from_reader(&mut parsed, &bytes[..]).unwrap();
        assert_eq!(
            parsed
                .as_object()
                .unwrap()
                .get("key")
                .unwrap()
                .as_str()
                .unwrap()
                .get(),
            "value"
        );
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let mut node = sample();
        node.as_object_mut()
            .unwrap()
            .get_mut("n")
            .unwrap()
            .as_number_mut()
            .unwrap()
            .set_u64(7);
        to_writer(&node, std::fs::File::create(&path).unwrap()).unwrap();

        let mut parsed = sample();
        from_reader(&mut parsed, std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(
            parsed
                .as_object()
                .unwrap()
                .get("n")
                .unwrap()
                .as_number()
                .unwrap()
                .get_u64(),
            7
        );
    }

    #[test]
    fn test_announcer_splits_documents() {
        let mut seen = Vec::new();
        {
            let mut announcer = Announcer::new(sample(), |node| {
                seen.push(
                    node.as_object()
                        .unwrap()
                        .get("n")
                        .unwrap()
                        .as_number()
                        .unwrap()
                        .get_u64(),
                );
            });
            announcer.feed(b"{\"n\":1} {\"n\":2}{\"n\"").unwrap();
            announcer.feed(b":3}").unwrap();
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_exchange_dispatches_on_prefix() {
        let mut results = Vec::new();
        {
            let mut exchange = Exchange::new(
                |prefix: &[u8]| {
                    // Wait for enough prefix to pick a schema.
                    if prefix.len() < 6 {
                        return None;
                    }
                    Some(if prefix.starts_with(b"{\"str\"") {
                        Node::object(vec![("str", Node::string())])
                    } else {
                        Node::object(vec![("num", Node::unsigned(Base::Decimal))])
                    })
                },
                |node: Node| {
                    let object = node.as_object().unwrap();
                    if let Some(value) = object.get("str") {
                        results.push(value.as_str().unwrap().get().to_string());
                    } else {
                        results.push(
                            object
                                .get("num")
                                .unwrap()
                                .as_number()
                                .unwrap()
                                .get_u64()
                                .to_string(),
                        );
                    }
                },
            );
            exchange.feed(b"{\"st").unwrap();
            exchange.feed(b"r\":\"a\"}{\"num\":4}").unwrap();
        }
        assert_eq!(results, vec!["a".to_string(), "4".to_string()]);
    }
}
