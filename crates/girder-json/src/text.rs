//! Text-framing cursors
//!
//! [`Deserializer`] and [`Serializer`] pump an element tree through
//! arbitrary byte windows. All resumable state lives in the cursor: an
//! explicit frame stack addressing the active path plus the in-progress
//! scalar scanner, so a document can be split at any byte boundary and the
//! result is identical to a single feed. The tree is re-located from the
//! root on every step; the cursor never stores references into it.
//!
//! A full output buffer is a normal pause, not an error: call again with
//! more room. Completion is observable through `is_complete`.

use smallvec::SmallVec;

use crate::error::Error;
use crate::node::{Array, Content, Field, Node, Object, Str, Variant};
use crate::scan::{B64Scan, BoolScan, DoubleScan, NumScan, Scan, StrScan, VariantScan};

// ---------------------------------------------------------------------------
// Deserialization
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ArrSt {
    Start,
    NullTag(u8),
    SkipBefore { after_comma: bool },
    Child,
    SkipAfter,
}

#[derive(Debug)]
struct ArrFrame {
    st: ArrSt,
}

#[derive(Debug)]
enum ObjSt {
    Start,
    NullTag(u8),
    SkipBefore { after_comma: bool },
    Key(StrScan),
    AfterKey { key: String },
    BeforeValue { key: String },
    Child,
    Skip(StrScan),
    SkipAfter,
}

#[derive(Debug)]
struct ObjFrame {
    st: ObjSt,
    /// Index of the field a child frame is parsing into.
    active: usize,
}

#[derive(Debug)]
enum Frame {
    Number(NumScan),
    Boolean(BoolScan),
    Str(StrScan),
    Buffer(B64Scan),
    Enum(StrScan),
    Double(DoubleScan),
    Variant(VariantScan),
    Array(ArrFrame),
    Object(ObjFrame),
}

enum Action {
    /// Input window exhausted.
    Exhausted,
    /// Current frame completed and committed; pop it.
    Pop,
    /// Descend into the child the frame just activated.
    Push,
}

/// Walk the ancestor frames down from the root to the node the deepest
/// frame operates on.
fn locate<'a>(root: &'a mut Node, ancestors: &[Frame]) -> &'a mut Node {
    let mut node = root;
    for frame in ancestors {
        node = match frame {
            Frame::Array(_) => match node {
                Node::Array(array) => array
                    .items
                    .last_mut()
                    .expect("array frame without active element"),
                _ => unreachable!("array frame over non-array node"),
            },
            Frame::Object(of) => match node {
                Node::Object(object) => &mut object.fields[of.active].node,
                _ => unreachable!("object frame over non-object node"),
            },
            _ => unreachable!("scalar frames have no children"),
        };
    }
    node
}

/// Incremental parser state. Feed byte windows with [`deserialize`];
/// close the feed with [`finish`].
///
/// [`deserialize`]: Deserializer::deserialize
/// [`finish`]: Deserializer::finish
#[derive(Debug)]
pub struct Deserializer {
    frames: SmallVec<[Frame; 8]>,
    consumed: usize,
    done: bool,
}

impl Deserializer {
    pub fn new() -> Self {
        Self {
            frames: SmallVec::new(),
            consumed: 0,
            done: false,
        }
    }

    /// True once a complete top-level value has been parsed (or the
    /// cursor failed and cleared the tree).
    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Total bytes consumed over all windows.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Feed the next input window. Returns the number of bytes consumed,
    /// which is less than `input.len()` only when the top-level value
    /// completed inside the window. On failure the tree is cleared and
    /// the error record carries position and context.
    pub fn deserialize(&mut self, root: &mut Node, input: &[u8]) -> Result<usize, Error> {
        if self.done {
            return Ok(0);
        }
        let mut pos = 0;
        match self.drive(root, input, &mut pos) {
            Ok(()) => {
                self.consumed += pos;
                Ok(pos)
            }
            Err(err) => {
                let err = err.with_context(input, pos, self.consumed + pos);
                self.consumed += pos;
                self.done = true;
                root.clear();
                tracing::warn!(error = %err, "parsing failed");
                Err(err)
            }
        }
    }

    /// Signal end of input. Completes a trailing unquoted scalar at the
    /// top level; anything still open is a malformed document and clears
    /// the tree.
    pub fn finish(&mut self, root: &mut Node) -> Result<(), Error> {
        if self.done {
            return Ok(());
        }
        if self.frames.is_empty() {
            // Nothing but whitespace was fed; an empty document leaves a
            // cleared tree without raising.
            self.done = true;
            return Ok(());
        }
        let mut pos = 0;
        let completed = matches!(self.drive(root, b"\0", &mut pos), Ok(())) && self.done;
        if !completed {
            self.done = true;
            root.clear();
            let err = Error::malformed().with_context(b"", 0, self.consumed);
            tracing::warn!(error = %err, "parsing failed");
            return Err(err);
        }
        Ok(())
    }

    fn drive(&mut self, root: &mut Node, input: &[u8], pos: &mut usize) -> Result<(), Error> {
        loop {
            if self.done {
                return Ok(());
            }
            if self.frames.is_empty() {
                // A leading whitespace run is tolerated before the
                // top-level value.
                while *pos < input.len() && input[*pos].is_ascii_whitespace() {
                    *pos += 1;
                }
                if *pos == input.len() {
                    return Ok(());
                }
                root.clear();
                self.frames.push(Self::frame_for(root));
            }
            if *pos == input.len() {
                return Ok(());
            }
            let (frame, ancestors) = self.frames.split_last_mut().unwrap();
            let node = locate(root, ancestors);
            let action = Self::step(frame, node, input, pos)?;
            match action {
                Action::Exhausted => return Ok(()),
                Action::Push => {
                    let child = locate(root, &self.frames);
                    let frame = Self::frame_for(child);
                    self.frames.push(frame);
                }
                Action::Pop => {
                    self.frames.pop();
                    match self.frames.last_mut() {
                        None => {
                            self.done = true;
                            return Ok(());
                        }
                        Some(Frame::Array(af)) => af.st = ArrSt::SkipAfter,
                        Some(Frame::Object(of)) => of.st = ObjSt::SkipAfter,
                        Some(_) => unreachable!("scalar frames have no children"),
                    }
                }
            }
        }
    }

    fn frame_for(node: &Node) -> Frame {
        match node {
            Node::Number(_) => Frame::Number(NumScan::new()),
            Node::Boolean(_) => Frame::Boolean(BoolScan::new()),
            Node::Str(_) => Frame::Str(StrScan::new()),
            Node::Buffer(_) => Frame::Buffer(B64Scan::new()),
            Node::Enum(_) => Frame::Enum(StrScan::new()),
            Node::Double(_) => Frame::Double(DoubleScan::new()),
            Node::Variant(_) => Frame::Variant(VariantScan::new()),
            Node::Array(_) => Frame::Array(ArrFrame { st: ArrSt::Start }),
            Node::Object(_) => Frame::Object(ObjFrame {
                st: ObjSt::Start,
                active: 0,
            }),
        }
    }

    fn step(
        frame: &mut Frame,
        node: &mut Node,
        input: &[u8],
        pos: &mut usize,
    ) -> Result<Action, Error> {
        match frame {
            Frame::Number(scan) => match scan.feed(input, pos)? {
                Scan::More => Ok(Action::Exhausted),
                Scan::Done => {
                    let number = match node {
                        Node::Number(n) => n,
                        _ => unreachable!(),
                    };
                    if scan.null {
                        number.null = true;
                        number.set = false;
                    } else {
                        number.negative = scan.negative;
                        number.magnitude = scan.magnitude;
                        number.set = true;
                        number.null = false;
                    }
                    Ok(Action::Pop)
                }
            },
            Frame::Boolean(scan) => match scan.feed(input, pos)? {
                Scan::More => Ok(Action::Exhausted),
                Scan::Done => {
                    let boolean = match node {
                        Node::Boolean(b) => b,
                        _ => unreachable!(),
                    };
                    if scan.null {
                        boolean.null = true;
                        boolean.set = false;
                    } else {
                        boolean.value = scan.value;
                        boolean.set = true;
                        boolean.null = false;
                    }
                    Ok(Action::Pop)
                }
            },
            Frame::Str(scan) => match scan.feed(input, pos)? {
                Scan::More => Ok(Action::Exhausted),
                Scan::Done => {
                    let target = match node {
                        Node::Str(s) => s,
                        _ => unreachable!(),
                    };
                    commit_str(scan, target)?;
                    Ok(Action::Pop)
                }
            },
            Frame::Buffer(scan) => match scan.feed(input, pos)? {
                Scan::More => Ok(Action::Exhausted),
                Scan::Done => {
                    let buffer = match node {
                        Node::Buffer(b) => b,
                        _ => unreachable!(),
                    };
                    if scan.null {
                        buffer.null = true;
                        buffer.set = false;
                    } else {
                        buffer.data = std::mem::take(&mut scan.data);
                        buffer.set = true;
                        buffer.null = false;
                    }
                    Ok(Action::Pop)
                }
            },
            Frame::Enum(scan) => match scan.feed(input, pos)? {
                Scan::More => Ok(Action::Exhausted),
                Scan::Done => {
                    let target = match node {
                        Node::Enum(e) => e,
                        _ => unreachable!(),
                    };
                    if scan.is_null() {
                        target.null = true;
                        target.set = false;
                    } else {
                        let text = scan.take_text()?;
                        match target.registry.code_of(&text) {
                            Some(code) => {
                                target.code = code;
                                target.set = true;
                                target.null = false;
                            }
                            None => {
                                return Err(Error::new(format!(
                                    "Unknown enum value \"{text}\""
                                )))
                            }
                        }
                    }
                    Ok(Action::Pop)
                }
            },
            Frame::Double(scan) => match scan.feed(input, pos)? {
                Scan::More => Ok(Action::Exhausted),
                Scan::Done => {
                    let double = match node {
                        Node::Double(d) => d,
                        _ => unreachable!(),
                    };
                    if scan.null {
                        double.null = true;
                        double.set = false;
                    } else {
                        double.value = scan.value;
                        double.set = true;
                        double.null = false;
                    }
                    Ok(Action::Pop)
                }
            },
            Frame::Variant(scan) => match scan.feed(input, pos)? {
                Scan::More => Ok(Action::Exhausted),
                Scan::Done => {
                    let variant = match node {
                        Node::Variant(v) => v,
                        _ => unreachable!(),
                    };
                    commit_variant(scan, variant)?;
                    Ok(Action::Pop)
                }
            },
            Frame::Array(af) => {
                let array = match node {
                    Node::Array(a) => a,
                    _ => unreachable!(),
                };
                array_step(af, array, input, pos)
            }
            Frame::Object(of) => {
                let object = match node {
                    Node::Object(o) => o,
                    _ => unreachable!(),
                };
                object_step(of, object, input, pos)
            }
        }
    }
}

impl Default for Deserializer {
    fn default() -> Self {
        Self::new()
    }
}

fn commit_str(scan: &mut StrScan, target: &mut Str) -> Result<(), Error> {
    let null = scan.is_null();
    let quoted = scan.quoted;
    let text = scan.take_text()?;
    // The parse outcome owns the quoted attribute from here on, so an
    // opaque payload re-serializes raw.
    target.quoted = quoted;
    target.quote_found = quoted;
    target.value = text;
    if null {
        target.null = true;
        target.set = false;
    } else {
        target.set = true;
        target.null = false;
    }
    Ok(())
}

fn commit_variant(scan: &mut VariantScan, variant: &mut Variant) -> Result<(), Error> {
    match scan {
        VariantScan::Start => unreachable!("variant scanner fed at least one byte"),
        VariantScan::Opaque { open, buf, .. } => {
            let text = String::from_utf8(std::mem::take(buf))
                .map_err(|_| Error::new("Invalid UTF-8 in string value"))?;
            variant.content = if *open == b'{' {
                Content::Object
            } else {
                Content::Array
            };
            variant.body.quoted = false;
            variant.body.quote_found = false;
            variant.body.value = text;
            variant.body.set = true;
            variant.body.null = false;
        }
        VariantScan::Plain(str_scan) => {
            commit_str(str_scan, &mut variant.body)?;
            variant.content = if variant.body.quote_found {
                Content::String
            } else if variant.body.is_null() {
                Content::Null
            } else if variant.body.value == "true" || variant.body.value == "false" {
                Content::Boolean
            } else {
                Content::Number
            };
        }
    }
    Ok(())
}

fn array_step(
    af: &mut ArrFrame,
    array: &mut Array,
    input: &[u8],
    pos: &mut usize,
) -> Result<Action, Error> {
    while *pos < input.len() {
        let byte = input[*pos];
        match &af.st {
            ArrSt::Start => {
                if byte.is_ascii_whitespace() {
                    *pos += 1;
                } else if byte == b'[' {
                    *pos += 1;
                    af.st = ArrSt::SkipBefore { after_comma: false };
                } else if byte == b'n' {
                    *pos += 1;
                    af.st = ArrSt::NullTag(1);
                } else {
                    return Err(Error::new("Invalid value.\"null\" or \"[\" expected."));
                }
            }
            ArrSt::NullTag(matched) => {
                if byte != b"null"[usize::from(*matched)] {
                    return Err(Error::new("Invalid value.\"null\" or \"[\" expected."));
                }
                if *matched == 3 {
                    *pos += 1;
                    array.null = true;
                    return Ok(Action::Pop);
                }
                af.st = ArrSt::NullTag(*matched + 1);
                *pos += 1;
            }
            ArrSt::SkipBefore { after_comma } => {
                if byte.is_ascii_whitespace() {
                    *pos += 1;
                } else if byte == b']' {
                    if *after_comma {
                        return Err(Error::new("Expected new element, \"]\" found."));
                    }
                    *pos += 1;
                    return Ok(Action::Pop);
                } else if byte == b',' {
                    return Err(Error::new("Expected new element, \",\" found."));
                } else {
                    array.add();
                    af.st = ArrSt::Child;
                    return Ok(Action::Push);
                }
            }
            ArrSt::Child => unreachable!("child frame is active"),
            ArrSt::SkipAfter => {
                if byte.is_ascii_whitespace() {
                    *pos += 1;
                } else if byte == b']' {
                    *pos += 1;
                    return Ok(Action::Pop);
                } else if byte == b',' {
                    *pos += 1;
                    af.st = ArrSt::SkipBefore { after_comma: true };
                } else {
                    return Err(Error::new(format!(
                        "Unexpected character \"{}\". Expected either \",\" or \"]\"",
                        byte as char
                    )));
                }
            }
        }
    }
    Ok(Action::Exhausted)
}

fn object_step(
    of: &mut ObjFrame,
    object: &mut Object,
    input: &[u8],
    pos: &mut usize,
) -> Result<Action, Error> {
    while *pos < input.len() {
        let byte = input[*pos];
        match &mut of.st {
            ObjSt::Start => {
                if byte.is_ascii_whitespace() {
                    *pos += 1;
                } else if byte == b'{' {
                    *pos += 1;
                    of.st = ObjSt::SkipBefore { after_comma: false };
                } else if byte == b'n' {
                    *pos += 1;
                    of.st = ObjSt::NullTag(1);
                } else {
                    return Err(Error::new("Invalid value.\"null\" or \"{\" expected."));
                }
            }
            ObjSt::NullTag(matched) => {
                if byte != b"null"[usize::from(*matched)] {
                    return Err(Error::new("Invalid value.\"null\" or \"{\" expected."));
                }
                if *matched == 3 {
                    *pos += 1;
                    object.null = true;
                    return Ok(Action::Pop);
                }
                of.st = ObjSt::NullTag(*matched + 1);
                *pos += 1;
            }
            ObjSt::SkipBefore { after_comma } => {
                if byte.is_ascii_whitespace() {
                    *pos += 1;
                } else if byte == b'}' {
                    if *after_comma {
                        return Err(Error::new("Expected new element, \"}\" found."));
                    }
                    *pos += 1;
                    return Ok(Action::Pop);
                } else if byte == b',' {
                    return Err(Error::new("Expected new element, \",\" found."));
                } else if byte == b':' {
                    return Err(Error::new("Expected new element, \":\" found."));
                } else if byte == b'"' {
                    of.st = ObjSt::Key(StrScan::new());
                } else {
                    return Err(Error::new("Key must be properly quoted."));
                }
            }
            ObjSt::Key(scan) => match scan.feed(input, pos)? {
                Scan::More => return Ok(Action::Exhausted),
                Scan::Done => {
                    let key = scan.take_text()?;
                    of.st = ObjSt::AfterKey { key };
                }
            },
            ObjSt::AfterKey { key } => {
                if byte.is_ascii_whitespace() {
                    *pos += 1;
                } else if byte == b':' {
                    *pos += 1;
                    let key = std::mem::take(key);
                    of.st = ObjSt::BeforeValue { key };
                } else if byte == b'}' {
                    return Err(Error::new("Expected value, \"}\" found."));
                } else if byte == b',' {
                    return Err(Error::new("Expected value, \",\" found."));
                } else {
                    return Err(Error::new("Colon expected."));
                }
            }
            ObjSt::BeforeValue { key } => {
                if byte.is_ascii_whitespace() {
                    *pos += 1;
                } else if byte == b'}' {
                    return Err(Error::new("Expected value, \"}\" found."));
                } else if byte == b',' {
                    return Err(Error::new("Expected value, \",\" found."));
                } else if byte == b':' {
                    return Err(Error::new("Expected value, \":\" found."));
                } else if let Some(index) = object.position_of(key) {
                    of.active = index;
                    of.st = ObjSt::Child;
                    return Ok(Action::Push);
                } else if object.open {
                    // Materialize a variant field for the unknown label.
                    let label = std::mem::take(key);
                    object.fields.push(Field {
                        label,
                        node: Node::Variant(Variant::new()),
                    });
                    of.active = object.fields.len() - 1;
                    of.st = ObjSt::Child;
                    return Ok(Action::Push);
                } else {
                    // Unknown label on a closed object: consume the value
                    // through a scratch scanner and drop it.
                    of.st = ObjSt::Skip(StrScan::new());
                }
            }
            ObjSt::Child => unreachable!("child frame is active"),
            ObjSt::Skip(scan) => match scan.feed(input, pos)? {
                Scan::More => return Ok(Action::Exhausted),
                Scan::Done => of.st = ObjSt::SkipAfter,
            },
            ObjSt::SkipAfter => {
                if byte.is_ascii_whitespace() {
                    *pos += 1;
                } else if byte == b'}' {
                    *pos += 1;
                    return Ok(Action::Pop);
                } else if byte == b',' {
                    *pos += 1;
                    of.st = ObjSt::SkipBefore { after_comma: true };
                } else {
                    return Err(Error::new(format!(
                        "Expected either \",\" or \"}}\", \"{}\" found.",
                        byte as char
                    )));
                }
            }
        }
    }
    Ok(Action::Exhausted)
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

const B64_TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

#[derive(Debug)]
struct PendingEmit {
    buf: Vec<u8>,
    at: usize,
}

#[derive(Debug)]
struct TextEmit {
    raw: bool,
    opened: bool,
    at: usize,
    /// The escaping backslash was written, the quote itself was not.
    escape_pending: bool,
}

#[derive(Debug)]
struct BlobEmit {
    opened: bool,
    idx: usize,
    phase: u8,
    last: u8,
    tail_done: bool,
}

#[derive(Debug)]
enum ASt {
    Open,
    Sep { next: usize },
    Child,
    Close,
}

#[derive(Debug)]
struct ArrEmit {
    st: ASt,
    idx: usize,
}

#[derive(Debug)]
enum OSt {
    Open,
    Key(PendingEmit),
    Child,
    Close,
}

#[derive(Debug)]
struct ObjEmit {
    st: OSt,
    idx: usize,
}

#[derive(Debug)]
enum SFrame {
    Pending(PendingEmit),
    Text(TextEmit),
    Blob(BlobEmit),
    Array(ArrEmit),
    Object(ObjEmit),
}

enum EmitAction {
    Full,
    Pop,
    Push,
}

fn locate_ref<'a>(root: &'a Node, ancestors: &[SFrame]) -> &'a Node {
    let mut node = root;
    for frame in ancestors {
        node = match frame {
            SFrame::Array(ae) => match node {
                Node::Array(array) => &array.items[ae.idx],
                _ => unreachable!(),
            },
            SFrame::Object(oe) => match node {
                Node::Object(object) => &object.fields[oe.idx].node,
                _ => unreachable!(),
            },
            _ => unreachable!("scalar frames have no children"),
        };
    }
    node
}

fn next_set_item(array: &Array, from: usize) -> Option<usize> {
    (from..array.items.len()).find(|&i| array.items[i].is_set())
}

fn next_set_field(object: &Object, from: usize) -> Option<usize> {
    (from..object.fields.len()).find(|&i| object.fields[i].node.is_set())
}

/// Incremental writer. Call [`serialize`] repeatedly with output windows
/// until [`is_complete`] reports true; a full window is a pause, not a
/// failure.
///
/// [`serialize`]: Serializer::serialize
/// [`is_complete`]: Serializer::is_complete
#[derive(Debug)]
pub struct Serializer {
    frames: SmallVec<[SFrame; 8]>,
    started: bool,
    done: bool,
}

impl Serializer {
    pub fn new() -> Self {
        Self {
            frames: SmallVec::new(),
            started: false,
            done: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Write the next chunk of the document into `out`, returning the
    /// number of bytes produced.
    pub fn serialize(&mut self, root: &Node, out: &mut [u8]) -> usize {
        if self.done || out.is_empty() {
            return 0;
        }
        if !self.started {
            self.started = true;
            self.frames.push(Self::sframe_for(root));
        }
        let mut written = 0;
        while written < out.len() && !self.done {
            let (frame, ancestors) = self.frames.split_last_mut().unwrap();
            let node = locate_ref(root, ancestors);
            let action = Self::emit_step(frame, node, out, &mut written);
            match action {
                EmitAction::Full => break,
                EmitAction::Push => {
                    let child = locate_ref(root, &self.frames);
                    let frame = Self::sframe_for(child);
                    self.frames.push(frame);
                }
                EmitAction::Pop => {
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.done = true;
                        continue;
                    }
                    let (frame, ancestors) = self.frames.split_last_mut().unwrap();
                    let parent = locate_ref(root, ancestors);
                    match (frame, parent) {
                        (SFrame::Array(ae), Node::Array(array)) => {
                            ae.st = match next_set_item(array, ae.idx + 1) {
                                Some(next) => ASt::Sep { next },
                                None => ASt::Close,
                            };
                        }
                        (SFrame::Object(oe), Node::Object(object)) => {
                            oe.st = match next_set_field(object, oe.idx + 1) {
                                Some(next) => {
                                    let mut buf = vec![b',', b'"'];
                                    buf.extend_from_slice(object.fields[next].label.as_bytes());
                                    buf.extend_from_slice(b"\":");
                                    oe.idx = next;
                                    OSt::Key(PendingEmit { buf, at: 0 })
                                }
                                None => OSt::Close,
                            };
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
        written
    }

    fn sframe_for(node: &Node) -> SFrame {
        match node {
            Node::Number(n) => {
                let mut buf = Vec::new();
                if n.null {
                    buf.extend_from_slice(b"null");
                } else {
                    let (negative, magnitude) = if n.set {
                        (n.negative, n.magnitude)
                    } else {
                        (n.default_negative, n.default_magnitude)
                    };
                    let sign = if negative { "-" } else { "" };
                    let rendered = match n.base {
                        crate::node::Base::Decimal => format!("{sign}{magnitude}"),
                        crate::node::Base::Octal => format!("\"{sign}0{magnitude:o}\""),
                        crate::node::Base::Hexadecimal => format!("\"{sign}0x{magnitude:X}\""),
                    };
                    buf.extend_from_slice(rendered.as_bytes());
                }
                SFrame::Pending(PendingEmit { buf, at: 0 })
            }
            Node::Boolean(b) => {
                let text: &[u8] = if b.null {
                    b"null"
                } else if b.get() {
                    b"true"
                } else {
                    b"false"
                };
                SFrame::Pending(PendingEmit {
                    buf: text.to_vec(),
                    at: 0,
                })
            }
            Node::Enum(e) => {
                let buf = if e.null {
                    b"null".to_vec()
                } else {
                    match e.registry.name_of(e.code()) {
                        Some(name) => format!("\"{name}\"").into_bytes(),
                        None => b"null".to_vec(),
                    }
                };
                SFrame::Pending(PendingEmit { buf, at: 0 })
            }
            Node::Double(d) => {
                let buf = if d.null {
                    b"null".to_vec()
                } else {
                    format!("{}", d.get()).into_bytes()
                };
                SFrame::Pending(PendingEmit { buf, at: 0 })
            }
            Node::Str(s) => SFrame::Text(TextEmit {
                raw: !s.is_quoted() || s.is_null(),
                opened: false,
                at: 0,
                escape_pending: false,
            }),
            Node::Variant(v) => SFrame::Text(TextEmit {
                raw: !v.body.is_quoted() || v.body.is_null(),
                opened: false,
                at: 0,
                escape_pending: false,
            }),
            Node::Buffer(b) => {
                if b.is_null() || !b.set {
                    SFrame::Pending(PendingEmit {
                        buf: b"null".to_vec(),
                        at: 0,
                    })
                } else {
                    SFrame::Blob(BlobEmit {
                        opened: false,
                        idx: 0,
                        phase: 0,
                        last: 0,
                        tail_done: false,
                    })
                }
            }
            Node::Array(a) => {
                if a.is_null() {
                    SFrame::Pending(PendingEmit {
                        buf: b"null".to_vec(),
                        at: 0,
                    })
                } else {
                    SFrame::Array(ArrEmit { st: ASt::Open, idx: 0 })
                }
            }
            Node::Object(o) => {
                if o.is_null() {
                    SFrame::Pending(PendingEmit {
                        buf: b"null".to_vec(),
                        at: 0,
                    })
                } else {
                    SFrame::Object(ObjEmit { st: OSt::Open, idx: 0 })
                }
            }
        }
    }

    fn emit_step(frame: &mut SFrame, node: &Node, out: &mut [u8], written: &mut usize) -> EmitAction {
        match frame {
            SFrame::Pending(pending) => drain_pending(pending, out, written),
            SFrame::Text(emit) => {
                let body = match node {
                    Node::Str(s) => s,
                    Node::Variant(v) => &v.body,
                    _ => unreachable!(),
                };
                emit_text(emit, body, out, written)
            }
            SFrame::Blob(emit) => {
                let buffer = match node {
                    Node::Buffer(b) => b,
                    _ => unreachable!(),
                };
                emit_blob(emit, buffer.get(), out, written)
            }
            SFrame::Array(ae) => {
                let array = match node {
                    Node::Array(a) => a,
                    _ => unreachable!(),
                };
                loop {
                    match &ae.st {
                        ASt::Open => {
                            if *written == out.len() {
                                return EmitAction::Full;
                            }
                            out[*written] = b'[';
                            *written += 1;
                            match next_set_item(array, 0) {
                                Some(first) => {
                                    ae.idx = first;
                                    ae.st = ASt::Child;
                                    return EmitAction::Push;
                                }
                                None => ae.st = ASt::Close,
                            }
                        }
                        ASt::Sep { next } => {
                            if *written == out.len() {
                                return EmitAction::Full;
                            }
                            out[*written] = b',';
                            *written += 1;
                            ae.idx = *next;
                            ae.st = ASt::Child;
                            return EmitAction::Push;
                        }
                        ASt::Child => unreachable!("child frame is active"),
                        ASt::Close => {
                            if *written == out.len() {
                                return EmitAction::Full;
                            }
                            out[*written] = b']';
                            *written += 1;
                            return EmitAction::Pop;
                        }
                    }
                }
            }
            SFrame::Object(oe) => {
                let object = match node {
                    Node::Object(o) => o,
                    _ => unreachable!(),
                };
                loop {
                    match &mut oe.st {
                        OSt::Open => {
                            if *written == out.len() {
                                return EmitAction::Full;
                            }
                            out[*written] = b'{';
                            *written += 1;
                            match next_set_field(object, 0) {
                                Some(first) => {
                                    let mut buf = Vec::new();
                                    buf.push(b'"');
                                    buf.extend_from_slice(object.fields[first].label.as_bytes());
                                    buf.extend_from_slice(b"\":");
                                    oe.idx = first;
                                    oe.st = OSt::Key(PendingEmit { buf, at: 0 });
                                }
                                None => oe.st = OSt::Close,
                            }
                        }
                        OSt::Key(pending) => match drain_pending(pending, out, written) {
                            EmitAction::Full => return EmitAction::Full,
                            EmitAction::Pop => {
                                oe.st = OSt::Child;
                                return EmitAction::Push;
                            }
                            EmitAction::Push => unreachable!(),
                        },
                        OSt::Child => unreachable!("child frame is active"),
                        OSt::Close => {
                            if *written == out.len() {
                                return EmitAction::Full;
                            }
                            out[*written] = b'}';
                            *written += 1;
                            return EmitAction::Pop;
                        }
                    }
                }
            }
        }
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

fn drain_pending(pending: &mut PendingEmit, out: &mut [u8], written: &mut usize) -> EmitAction {
    let room = out.len() - *written;
    let left = pending.buf.len() - pending.at;
    let take = room.min(left);
    out[*written..*written + take].copy_from_slice(&pending.buf[pending.at..pending.at + take]);
    *written += take;
    pending.at += take;
    if pending.at == pending.buf.len() {
        EmitAction::Pop
    } else {
        EmitAction::Full
    }
}

fn emit_text(emit: &mut TextEmit, body: &Str, out: &mut [u8], written: &mut usize) -> EmitAction {
    if emit.raw {
        let value = body.get();
        let bytes: &[u8] = if body.is_null() || value.is_empty() {
            b"null"
        } else {
            value.as_bytes()
        };
        while *written < out.len() && emit.at < bytes.len() {
            out[*written] = bytes[emit.at];
            *written += 1;
            emit.at += 1;
        }
        return if emit.at == bytes.len() {
            EmitAction::Pop
        } else {
            EmitAction::Full
        };
    }
    let bytes = body.get().as_bytes();
    if !emit.opened {
        if *written == out.len() {
            return EmitAction::Full;
        }
        out[*written] = b'"';
        *written += 1;
        emit.opened = true;
    }
    while *written < out.len() && emit.at < bytes.len() {
        let byte = bytes[emit.at];
        if byte == b'"' && !emit.escape_pending {
            out[*written] = b'\\';
            *written += 1;
            emit.escape_pending = true;
        } else {
            out[*written] = byte;
            *written += 1;
            emit.escape_pending = false;
            emit.at += 1;
        }
    }
    if emit.at == bytes.len() {
        if *written == out.len() {
            return EmitAction::Full;
        }
        out[*written] = b'"';
        *written += 1;
        return EmitAction::Pop;
    }
    EmitAction::Full
}

fn emit_blob(emit: &mut BlobEmit, data: &[u8], out: &mut [u8], written: &mut usize) -> EmitAction {
    if !emit.opened {
        if *written == out.len() {
            return EmitAction::Full;
        }
        out[*written] = b'"';
        *written += 1;
        emit.opened = true;
    }
    while *written < out.len() && emit.idx < data.len() {
        let byte = data[emit.idx];
        match emit.phase {
            0 => {
                out[*written] = B64_TABLE[usize::from(byte >> 2)];
                emit.last = (byte & 0x03) << 4;
                emit.idx += 1;
                emit.phase = 1;
            }
            1 => {
                out[*written] = B64_TABLE[usize::from(((byte & 0xF0) >> 4) | emit.last)];
                emit.last = (byte & 0x0F) << 2;
                emit.idx += 1;
                emit.phase = 2;
            }
            2 => {
                out[*written] = B64_TABLE[usize::from(((byte & 0xC0) >> 6) | emit.last)];
                emit.last = byte & 0x3F;
                emit.phase = 3;
            }
            _ => {
                out[*written] = B64_TABLE[usize::from(byte & 0x3F)];
                emit.idx += 1;
                emit.phase = 0;
            }
        }
        *written += 1;
    }
    if emit.idx == data.len() {
        if emit.phase != 0 && !emit.tail_done {
            if *written == out.len() {
                return EmitAction::Full;
            }
            out[*written] = B64_TABLE[usize::from(emit.last)];
            *written += 1;
            emit.tail_done = true;
        }
        if *written == out.len() {
            return EmitAction::Full;
        }
        out[*written] = b'"';
        *written += 1;
        return EmitAction::Pop;
    }
    EmitAction::Full
}
