//! Binary framing
//!
//! MessagePack subset carrying the same element model as the text
//! framing: positive/negative fixint, uint/int 8-64, nil, false, true,
//! fixstr/str-8/str-16, bin-8/bin-16, fixarray/array-16, fixmap/map-16,
//! float-64 for the double element. [`Packer`] and [`Unpacker`] follow
//! the text cursors' pause/resume contract: any byte boundary is a legal
//! stopping point.
//!
//! Unset object fields are packed as nil so the map count stays equal to
//! the registration count; arrays pack only their set elements and count
//! accordingly. A closed object skips the value of an unknown label,
//! nested containers included, just as the text framing consumes it
//! through a scratch string.

use smallvec::SmallVec;

use crate::error::Error;
use crate::node::{Node, Str};

const NIL: u8 = 0xC0;
const FALSE: u8 = 0xC2;
const TRUE: u8 = 0xC3;
const BIN8: u8 = 0xC4;
const BIN16: u8 = 0xC5;
const FLOAT64: u8 = 0xCB;
const UINT8: u8 = 0xCC;
const UINT16: u8 = 0xCD;
const UINT32: u8 = 0xCE;
const UINT64: u8 = 0xCF;
const INT8: u8 = 0xD0;
const INT16: u8 = 0xD1;
const INT32: u8 = 0xD2;
const INT64: u8 = 0xD3;
const STR8: u8 = 0xD9;
const STR16: u8 = 0xDA;
const ARRAY16: u8 = 0xDC;
const MAP16: u8 = 0xDE;

fn pack_unsigned(value: u64, out: &mut Vec<u8>) {
    if value <= 0x7F {
        out.push(value as u8);
    } else if value <= 0xFF {
        out.push(UINT8);
        out.push(value as u8);
    } else if value <= 0xFFFF {
        out.push(UINT16);
        out.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value <= 0xFFFF_FFFF {
        out.push(UINT32);
        out.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        out.push(UINT64);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

fn pack_signed(value: i64, out: &mut Vec<u8>) {
    if value >= 0 {
        pack_unsigned(value as u64, out);
    } else if value >= -32 {
        out.push(value as i8 as u8);
    } else if value >= i64::from(i8::MIN) {
        out.push(INT8);
        out.push(value as i8 as u8);
    } else if value >= i64::from(i16::MIN) {
        out.push(INT16);
        out.extend_from_slice(&(value as i16).to_be_bytes());
    } else if value >= i64::from(i32::MIN) {
        out.push(INT32);
        out.extend_from_slice(&(value as i32).to_be_bytes());
    } else {
        out.push(INT64);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

fn pack_str_header(len: usize, out: &mut Vec<u8>) {
    if len <= 31 {
        out.push(0xA0 | len as u8);
    } else if len <= 0xFF {
        out.push(STR8);
        out.push(len as u8);
    } else {
        out.push(STR16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
}

// ---------------------------------------------------------------------------
// Packing
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingEmit {
    buf: Vec<u8>,
    at: usize,
}

impl PendingEmit {
    fn new(buf: Vec<u8>) -> Self {
        Self { buf, at: 0 }
    }

    /// Copy into `out`; true when fully drained.
    fn drain(&mut self, out: &mut [u8], written: &mut usize) -> bool {
        let take = (out.len() - *written).min(self.buf.len() - self.at);
        out[*written..*written + take].copy_from_slice(&self.buf[self.at..self.at + take]);
        *written += take;
        self.at += take;
        self.at == self.buf.len()
    }
}

#[derive(Debug)]
struct DataEmit {
    head: PendingEmit,
    idx: usize,
}

#[derive(Debug)]
enum PackArrSt {
    Head(PendingEmit),
    Sep,
    Child,
}

#[derive(Debug)]
struct PackArr {
    st: PackArrSt,
    idx: usize,
}

#[derive(Debug)]
enum PackObjSt {
    Head(PendingEmit),
    Entry(PendingEmit),
    Child,
}

#[derive(Debug)]
struct PackObj {
    st: PackObjSt,
    idx: usize,
}

#[derive(Debug)]
enum PackFrame {
    Pending(PendingEmit),
    Data(DataEmit),
    Array(PackArr),
    Object(PackObj),
}

/// Incremental binary writer.
#[derive(Debug)]
pub struct Packer {
    frames: SmallVec<[PackFrame; 8]>,
    started: bool,
    done: bool,
}

impl Packer {
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

    pub fn pack(&mut self, root: &Node, out: &mut [u8]) -> usize {
        if self.done || out.is_empty() {
            return 0;
        }
        if !self.started {
            self.started = true;
            self.frames.push(Self::frame_for(root));
        }
        let mut written = 0;
        while written < out.len() && !self.done {
            let (frame, ancestors) = self.frames.split_last_mut().unwrap();
            let node = locate_pack(root, ancestors);
            let done = Self::emit(frame, node, out, &mut written);
            match done {
                Emit::Full => break,
                Emit::Push => {
                    let child = locate_pack(root, &self.frames);
                    let frame = Self::frame_for(child);
                    self.frames.push(frame);
                }
                Emit::Pop => {
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.done = true;
                        break;
                    }
                    let (frame, ancestors) = self.frames.split_last_mut().unwrap();
                    let parent = locate_pack(root, ancestors);
                    Self::advance(frame, parent);
                }
            }
        }
        written
    }

    fn advance(frame: &mut PackFrame, parent: &Node) {
        match (frame, parent) {
            (PackFrame::Array(pa), Node::Array(array)) => {
                pa.idx += 1;
                while pa.idx < array.items.len() && !array.items[pa.idx].is_set() {
                    pa.idx += 1;
                }
                pa.st = PackArrSt::Sep;
            }
            (PackFrame::Object(po), Node::Object(object)) => {
                po.idx += 1;
                po.st = Self::object_entry(object, po.idx);
            }
            _ => unreachable!(),
        }
    }

    fn object_entry(object: &crate::node::Object, idx: usize) -> PackObjSt {
        match object.fields.get(idx) {
            None => PackObjSt::Child, // exhausted; Sep step pops
            Some(field) => {
                let mut buf = Vec::new();
                pack_str_header(field.label.len(), &mut buf);
                buf.extend_from_slice(field.label.as_bytes());
                if !field.node.is_set() {
                    // Unset fields travel as nil to keep the map count.
                    buf.push(NIL);
                }
                PackObjSt::Entry(PendingEmit::new(buf))
            }
        }
    }

    fn frame_for(node: &Node) -> PackFrame {
        let mut buf = Vec::new();
        match node {
            Node::Number(n) => {
                if n.null {
                    buf.push(NIL);
                } else {
                    let (negative, magnitude) = if n.set {
                        (n.negative, n.magnitude)
                    } else {
                        (n.default_negative, n.default_magnitude)
                    };
                    if negative {
                        pack_signed((magnitude as i64).wrapping_neg(), &mut buf);
                    } else {
                        pack_unsigned(magnitude, &mut buf);
                    }
                }
                PackFrame::Pending(PendingEmit::new(buf))
            }
            Node::Boolean(b) => {
                buf.push(if b.null {
                    NIL
                } else if b.get() {
                    TRUE
                } else {
                    FALSE
                });
                PackFrame::Pending(PendingEmit::new(buf))
            }
            Node::Enum(e) => {
                if e.null {
                    buf.push(NIL);
                } else {
                    pack_unsigned(u64::from(e.code()), &mut buf);
                }
                PackFrame::Pending(PendingEmit::new(buf))
            }
            Node::Double(d) => {
                if d.null {
                    buf.push(NIL);
                } else {
                    buf.push(FLOAT64);
                    buf.extend_from_slice(&d.get().to_be_bytes());
                }
                PackFrame::Pending(PendingEmit::new(buf))
            }
            Node::Str(s) => Self::str_frame(s),
            Node::Variant(v) => Self::str_frame(&v.body),
            Node::Buffer(b) => {
                if b.is_null() || !b.set {
                    buf.push(NIL);
                    PackFrame::Pending(PendingEmit::new(buf))
                } else {
                    let data = b.get();
                    if data.len() <= 0xFF {
                        buf.push(BIN8);
                        buf.push(data.len() as u8);
                    } else {
                        buf.push(BIN16);
                        buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
                    }
                    PackFrame::Data(DataEmit {
                        head: PendingEmit::new(buf),
                        idx: 0,
                    })
                }
            }
            Node::Array(a) => {
                if a.is_null() {
                    buf.push(NIL);
                    return PackFrame::Pending(PendingEmit::new(buf));
                }
                let count = a.items.iter().filter(|item| item.is_set()).count();
                if count <= 15 {
                    buf.push(0x90 | count as u8);
                } else {
                    buf.push(ARRAY16);
                    buf.extend_from_slice(&(count as u16).to_be_bytes());
                }
                PackFrame::Array(PackArr {
                    st: PackArrSt::Head(PendingEmit::new(buf)),
                    idx: 0,
                })
            }
            Node::Object(o) => {
                if o.is_null() {
                    buf.push(NIL);
                    return PackFrame::Pending(PendingEmit::new(buf));
                }
                let count = o.fields.len();
                if count <= 15 {
                    buf.push(0x80 | count as u8);
                } else {
                    buf.push(MAP16);
                    buf.extend_from_slice(&(count as u16).to_be_bytes());
                }
                PackFrame::Object(PackObj {
                    st: PackObjSt::Head(PendingEmit::new(buf)),
                    idx: 0,
                })
            }
        }
    }

    fn str_frame(s: &Str) -> PackFrame {
        let mut buf = Vec::new();
        if s.is_null() {
            buf.push(NIL);
            return PackFrame::Pending(PendingEmit::new(buf));
        }
        let bytes = s.get().as_bytes();
        pack_str_header(bytes.len(), &mut buf);
        PackFrame::Data(DataEmit {
            head: PendingEmit::new(buf),
            idx: 0,
        })
    }

    fn emit(frame: &mut PackFrame, node: &Node, out: &mut [u8], written: &mut usize) -> Emit {
        match frame {
            PackFrame::Pending(pending) => {
                if pending.drain(out, written) {
                    Emit::Pop
                } else {
                    Emit::Full
                }
            }
            PackFrame::Data(data) => {
                if !data.head.drain(out, written) {
                    return Emit::Full;
                }
                let bytes: &[u8] = match node {
                    Node::Str(s) => s.get().as_bytes(),
                    Node::Variant(v) => v.body.get().as_bytes(),
                    Node::Buffer(b) => b.get(),
                    _ => unreachable!(),
                };
                while *written < out.len() && data.idx < bytes.len() {
                    out[*written] = bytes[data.idx];
                    *written += 1;
                    data.idx += 1;
                }
                if data.idx == bytes.len() {
                    Emit::Pop
                } else {
                    Emit::Full
                }
            }
            PackFrame::Array(pa) => {
                let array = match node {
                    Node::Array(a) => a,
                    _ => unreachable!(),
                };
                if let PackArrSt::Head(head) = &mut pa.st {
                    if !head.drain(out, written) {
                        return Emit::Full;
                    }
                    while pa.idx < array.items.len() && !array.items[pa.idx].is_set() {
                        pa.idx += 1;
                    }
                    pa.st = PackArrSt::Sep;
                }
                debug_assert!(matches!(pa.st, PackArrSt::Sep));
                if pa.idx < array.items.len() {
                    pa.st = PackArrSt::Child;
                    Emit::Push
                } else {
                    Emit::Pop
                }
            }
            PackFrame::Object(po) => {
                let object = match node {
                    Node::Object(o) => o,
                    _ => unreachable!(),
                };
                loop {
                    match &mut po.st {
                        PackObjSt::Head(head) => {
                            if !head.drain(out, written) {
                                return Emit::Full;
                            }
                            po.st = Self::object_entry(object, po.idx);
                            if matches!(po.st, PackObjSt::Child) {
                                return Emit::Pop;
                            }
                        }
                        PackObjSt::Entry(pending) => {
                            if !pending.drain(out, written) {
                                return Emit::Full;
                            }
                            if object.fields[po.idx].node.is_set() {
                                po.st = PackObjSt::Child;
                                return Emit::Push;
                            }
                            // nil already written for the unset field
                            po.idx += 1;
                            po.st = Self::object_entry(object, po.idx);
                            if matches!(po.st, PackObjSt::Child) {
                                return Emit::Pop;
                            }
                        }
                        PackObjSt::Child => return Emit::Pop,
                    }
                }
            }
        }
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

enum Emit {
    Full,
    Pop,
    Push,
}

fn locate_pack<'a>(root: &'a Node, ancestors: &[PackFrame]) -> &'a Node {
    let mut node = root;
    for frame in ancestors {
        node = match frame {
            PackFrame::Array(pa) => match node {
                Node::Array(array) => &array.items[pa.idx],
                _ => unreachable!(),
            },
            PackFrame::Object(po) => match node {
                Node::Object(object) => &object.fields[po.idx].node,
                _ => unreachable!(),
            },
            _ => unreachable!("scalar frames have no children"),
        };
    }
    node
}

/// Pack a whole tree into a vector.
pub fn to_vec(root: &Node) -> Vec<u8> {
    let mut packer = Packer::new();
    let mut out = Vec::new();
    let mut window = [0u8; 1024];
    while !packer.is_complete() {
        let produced = packer.pack(root, &mut window);
        out.extend_from_slice(&window[..produced]);
    }
    out
}

// ---------------------------------------------------------------------------
// Unpacking
// ---------------------------------------------------------------------------

/// Collects a fixed number of big-endian payload bytes across windows.
#[derive(Debug, Clone, Copy)]
struct ByteAcc {
    need: u8,
    got: u8,
    acc: u64,
}

impl ByteAcc {
    fn new(need: u8) -> Self {
        Self {
            need,
            got: 0,
            acc: 0,
        }
    }

    fn feed(&mut self, input: &[u8], pos: &mut usize) -> bool {
        while self.got < self.need && *pos < input.len() {
            self.acc = (self.acc << 8) | u64::from(input[*pos]);
            *pos += 1;
            self.got += 1;
        }
        self.got == self.need
    }
}

#[derive(Debug)]
enum UnNumSt {
    Header,
    Unsigned(ByteAcc),
    Signed(ByteAcc),
}

#[derive(Debug)]
enum UnStrSt {
    Header,
    Length(ByteAcc),
    Data { len: usize, buf: Vec<u8> },
}

#[derive(Debug)]
struct UnStr {
    st: UnStrSt,
    null: bool,
}

impl UnStr {
    fn new() -> Self {
        Self {
            st: UnStrSt::Header,
            null: false,
        }
    }

    /// Returns the collected bytes when the string is complete.
    fn feed(&mut self, input: &[u8], pos: &mut usize) -> Result<Option<Vec<u8>>, Error> {
        loop {
            match &mut self.st {
                UnStrSt::Header => {
                    if *pos == input.len() {
                        return Ok(None);
                    }
                    let header = input[*pos];
                    *pos += 1;
                    match header {
                        NIL => {
                            self.null = true;
                            return Ok(Some(Vec::new()));
                        }
                        0xA0..=0xBF => {
                            self.st = UnStrSt::Data {
                                len: usize::from(header & 0x1F),
                                buf: Vec::new(),
                            }
                        }
                        STR8 => self.st = UnStrSt::Length(ByteAcc::new(1)),
                        STR16 => self.st = UnStrSt::Length(ByteAcc::new(2)),
                        _ => {
                            return Err(Error::new(format!(
                                "Unexpected header 0x{header:02X} for a string"
                            )))
                        }
                    }
                }
                UnStrSt::Length(acc) => {
                    if !acc.feed(input, pos) {
                        return Ok(None);
                    }
                    self.st = UnStrSt::Data {
                        len: acc.acc as usize,
                        buf: Vec::new(),
                    };
                }
                UnStrSt::Data { len, buf } => {
                    while buf.len() < *len && *pos < input.len() {
                        buf.push(input[*pos]);
                        *pos += 1;
                    }
                    if buf.len() == *len {
                        return Ok(Some(std::mem::take(buf)));
                    }
                    return Ok(None);
                }
            }
        }
    }
}

#[derive(Debug)]
enum UnFrame {
    Number(UnNumSt),
    Boolean,
    Str(UnStr),
    Buffer(UnStr),
    Enum(UnNumSt),
    Double(ByteAcc, bool),
    Variant(UnStr),
    Array(UnArr),
    Object(UnObj),
}

#[derive(Debug)]
enum UnArrSt {
    Header,
    Count(ByteAcc),
    Next,
    Child,
}

#[derive(Debug)]
struct UnArr {
    st: UnArrSt,
    remaining: u32,
}

#[derive(Debug)]
enum UnObjSt {
    Header,
    Count(ByteAcc),
    Key(UnStr),
    Skip(SkipValue),
    Child,
}

/// What a pending length field describes while skipping.
#[derive(Debug, Clone, Copy)]
enum LenKind {
    /// str/bin: raw payload bytes to discard.
    Payload,
    /// array: elements still to consume.
    Array,
    /// map: key/value pairs still to consume.
    Map,
}

/// Discards one complete value, nested containers included, across
/// window boundaries. A closed object routes an unknown key's value
/// through this, mirroring the scratch-string skip of the text framing.
#[derive(Debug)]
struct SkipValue {
    /// Values still to consume; containers add their children.
    remaining: u64,
    /// Payload bytes of the current value left to discard.
    discard: usize,
    length: Option<(ByteAcc, LenKind)>,
}

impl SkipValue {
    fn new() -> Self {
        Self {
            remaining: 1,
            discard: 0,
            length: None,
        }
    }

    /// True once the whole value has been consumed.
    fn feed(&mut self, input: &[u8], pos: &mut usize) -> Result<bool, Error> {
        loop {
            if let Some((acc, kind)) = &mut self.length {
                if !acc.feed(input, pos) {
                    return Ok(false);
                }
                match kind {
                    LenKind::Payload => self.discard = acc.acc as usize,
                    LenKind::Array => self.remaining += acc.acc,
                    LenKind::Map => self.remaining += acc.acc * 2,
                }
                self.length = None;
            }
            if self.discard > 0 {
                let take = self.discard.min(input.len() - *pos);
                *pos += take;
                self.discard -= take;
                if self.discard > 0 {
                    return Ok(false);
                }
            }
            if self.remaining == 0 {
                return Ok(true);
            }
            if *pos == input.len() {
                return Ok(false);
            }
            let header = input[*pos];
            *pos += 1;
            self.remaining -= 1;
            match header {
                0x00..=0x7F | 0xE0..=0xFF | NIL | TRUE | FALSE => {}
                UINT8 | INT8 => self.discard = 1,
                UINT16 | INT16 => self.discard = 2,
                UINT32 | INT32 => self.discard = 4,
                UINT64 | INT64 | FLOAT64 => self.discard = 8,
                0xA0..=0xBF => self.discard = usize::from(header & 0x1F),
                STR8 | BIN8 => self.length = Some((ByteAcc::new(1), LenKind::Payload)),
                STR16 | BIN16 => self.length = Some((ByteAcc::new(2), LenKind::Payload)),
                0x90..=0x9F => self.remaining += u64::from(header & 0x0F),
                ARRAY16 => self.length = Some((ByteAcc::new(2), LenKind::Array)),
                0x80..=0x8F => self.remaining += u64::from(header & 0x0F) * 2,
                MAP16 => self.length = Some((ByteAcc::new(2), LenKind::Map)),
                _ => {
                    return Err(Error::new(format!(
                        "Unexpected header 0x{header:02X} in a skipped value"
                    )))
                }
            }
        }
    }
}

#[derive(Debug)]
struct UnObj {
    st: UnObjSt,
    remaining: u32,
    active: usize,
}

/// Incremental binary parser.
#[derive(Debug)]
pub struct Unpacker {
    frames: SmallVec<[UnFrame; 8]>,
    consumed: usize,
    done: bool,
}

impl Unpacker {
    pub fn new() -> Self {
        Self {
            frames: SmallVec::new(),
            consumed: 0,
            done: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    pub fn unpack(&mut self, root: &mut Node, input: &[u8]) -> Result<usize, Error> {
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
                tracing::warn!(error = %err, "binary parsing failed");
                Err(err)
            }
        }
    }

    fn drive(&mut self, root: &mut Node, input: &[u8], pos: &mut usize) -> Result<(), Error> {
        loop {
            if self.done {
                return Ok(());
            }
            if self.frames.is_empty() {
                if *pos == input.len() {
                    return Ok(());
                }
                root.clear();
                self.frames.push(Self::frame_for(root));
            }
            // No window check here: a drained container pops without
            // needing further bytes, and every frame reports Exhausted
            // itself when it does need more.
            let (frame, ancestors) = self.frames.split_last_mut().unwrap();
            let node = locate_unpack(root, ancestors);
            let action = Self::step(frame, node, input, pos)?;
            match action {
                UnAction::Exhausted => return Ok(()),
                UnAction::Push => {
                    let child = locate_unpack(root, &self.frames);
                    let frame = Self::frame_for(child);
                    self.frames.push(frame);
                }
                UnAction::Pop => {
                    self.frames.pop();
                    match self.frames.last_mut() {
                        None => {
                            self.done = true;
                            return Ok(());
                        }
                        Some(UnFrame::Array(ua)) => {
                            ua.remaining -= 1;
                            ua.st = UnArrSt::Next;
                        }
                        Some(UnFrame::Object(uo)) => {
                            uo.remaining -= 1;
                            uo.st = if uo.remaining == 0 {
                                UnObjSt::Child // drained; popped next step
                            } else {
                                UnObjSt::Key(UnStr::new())
                            };
                        }
                        Some(_) => unreachable!(),
                    }
                }
            }
        }
    }

    fn frame_for(node: &Node) -> UnFrame {
        match node {
            Node::Number(_) => UnFrame::Number(UnNumSt::Header),
            Node::Boolean(_) => UnFrame::Boolean,
            Node::Str(_) => UnFrame::Str(UnStr::new()),
            Node::Buffer(_) => UnFrame::Buffer(UnStr::new()),
            Node::Enum(_) => UnFrame::Enum(UnNumSt::Header),
            Node::Double(_) => UnFrame::Double(ByteAcc::new(8), false),
            Node::Variant(_) => UnFrame::Variant(UnStr::new()),
            Node::Array(_) => UnFrame::Array(UnArr {
                st: UnArrSt::Header,
                remaining: 0,
            }),
            Node::Object(_) => UnFrame::Object(UnObj {
                st: UnObjSt::Header,
                remaining: 0,
                active: 0,
            }),
        }
    }

    fn number_step(
        st: &mut UnNumSt,
        input: &[u8],
        pos: &mut usize,
    ) -> Result<Option<(bool, u64, bool)>, Error> {
        loop {
            match st {
                UnNumSt::Header => {
                    if *pos == input.len() {
                        return Ok(None);
                    }
                    let header = input[*pos];
                    *pos += 1;
                    match header {
                        NIL => return Ok(Some((false, 0, true))),
                        0x00..=0x7F => return Ok(Some((false, u64::from(header), false))),
                        0xE0..=0xFF => {
                            let value = i64::from(header as i8);
                            return Ok(Some((true, value.unsigned_abs(), false)));
                        }
                        UINT8 | UINT16 | UINT32 | UINT64 => {
                            *st = UnNumSt::Unsigned(ByteAcc::new(1 << (header - UINT8)));
                        }
                        INT8 | INT16 | INT32 | INT64 => {
                            *st = UnNumSt::Signed(ByteAcc::new(1 << (header - INT8)));
                        }
                        _ => {
                            return Err(Error::new(format!(
                                "Unexpected header 0x{header:02X} for a number"
                            )))
                        }
                    }
                }
                UnNumSt::Unsigned(acc) => {
                    if !acc.feed(input, pos) {
                        return Ok(None);
                    }
                    return Ok(Some((false, acc.acc, false)));
                }
                UnNumSt::Signed(acc) => {
                    if !acc.feed(input, pos) {
                        return Ok(None);
                    }
                    // Sign-extend from the collected width.
                    let bits = u32::from(acc.need) * 8;
                    let shifted = (acc.acc as i64) << (64 - bits) >> (64 - bits);
                    return Ok(Some((shifted < 0, shifted.unsigned_abs(), false)));
                }
            }
        }
    }

    fn step(
        frame: &mut UnFrame,
        node: &mut Node,
        input: &[u8],
        pos: &mut usize,
    ) -> Result<UnAction, Error> {
        match frame {
            UnFrame::Number(st) => match Self::number_step(st, input, pos)? {
                None => Ok(UnAction::Exhausted),
                Some((negative, magnitude, null)) => {
                    let number = match node {
                        Node::Number(n) => n,
                        _ => unreachable!(),
                    };
                    if null {
                        number.null = true;
                        number.set = false;
                    } else {
                        number.negative = negative;
                        number.magnitude = magnitude;
                        number.set = true;
                        number.null = false;
                    }
                    Ok(UnAction::Pop)
                }
            },
            UnFrame::Enum(st) => match Self::number_step(st, input, pos)? {
                None => Ok(UnAction::Exhausted),
                Some((_, magnitude, null)) => {
                    let target = match node {
                        Node::Enum(e) => e,
                        _ => unreachable!(),
                    };
                    if null {
                        target.null = true;
                        target.set = false;
                    } else {
                        target.code = magnitude as u32;
                        target.set = true;
                        target.null = false;
                    }
                    Ok(UnAction::Pop)
                }
            },
            UnFrame::Boolean => {
                if *pos == input.len() {
                    return Ok(UnAction::Exhausted);
                }
                let header = input[*pos];
                *pos += 1;
                let boolean = match node {
                    Node::Boolean(b) => b,
                    _ => unreachable!(),
                };
                match header {
                    NIL => {
                        boolean.null = true;
                        boolean.set = false;
                    }
                    TRUE => boolean.set(true),
                    FALSE => boolean.set(false),
                    _ => {
                        return Err(Error::new(format!(
                            "Unexpected header 0x{header:02X} for a boolean"
                        )))
                    }
                }
                Ok(UnAction::Pop)
            }
            UnFrame::Double(acc, got_header) => {
                if !*got_header {
                    if *pos == input.len() {
                        return Ok(UnAction::Exhausted);
                    }
                    let header = input[*pos];
                    *pos += 1;
                    let double = match node {
                        Node::Double(d) => d,
                        _ => unreachable!(),
                    };
                    if header == NIL {
                        double.null = true;
                        double.set = false;
                        return Ok(UnAction::Pop);
                    }
                    if header != FLOAT64 {
                        return Err(Error::new(format!(
                            "Unexpected header 0x{header:02X} for a double"
                        )));
                    }
                    *got_header = true;
                }
                if !acc.feed(input, pos) {
                    return Ok(UnAction::Exhausted);
                }
                let double = match node {
                    Node::Double(d) => d,
                    _ => unreachable!(),
                };
                double.set(f64::from_bits(acc.acc));
                Ok(UnAction::Pop)
            }
            UnFrame::Str(scan) => match scan.feed(input, pos)? {
                None => Ok(UnAction::Exhausted),
                Some(bytes) => {
                    let target = match node {
                        Node::Str(s) => s,
                        _ => unreachable!(),
                    };
                    if scan.null {
                        target.null = true;
                        target.set = false;
                    } else {
                        target.value = String::from_utf8(bytes)
                            .map_err(|_| Error::new("Invalid UTF-8 in string value"))?;
                        target.set = true;
                        target.null = false;
                    }
                    Ok(UnAction::Pop)
                }
            },
            UnFrame::Variant(scan) => match scan.feed(input, pos)? {
                None => Ok(UnAction::Exhausted),
                Some(bytes) => {
                    let variant = match node {
                        Node::Variant(v) => v,
                        _ => unreachable!(),
                    };
                    if scan.null {
                        variant.body.null = true;
                        variant.body.set = false;
                        variant.content = crate::node::Content::Null;
                    } else {
                        variant.body.value = String::from_utf8(bytes)
                            .map_err(|_| Error::new("Invalid UTF-8 in string value"))?;
                        variant.body.set = true;
                        variant.body.null = false;
                        variant.body.quoted = true;
                        variant.content = crate::node::Content::String;
                    }
                    Ok(UnAction::Pop)
                }
            },
            UnFrame::Buffer(scan) => {
                // bin headers share the length-then-payload shape.
                if let UnStrSt::Header = scan.st {
                    if *pos == input.len() {
                        return Ok(UnAction::Exhausted);
                    }
                    let header = input[*pos];
                    match header {
                        NIL => {
                            *pos += 1;
                            let buffer = match node {
                                Node::Buffer(b) => b,
                                _ => unreachable!(),
                            };
                            buffer.null = true;
                            buffer.set = false;
                            return Ok(UnAction::Pop);
                        }
                        BIN8 => {
                            *pos += 1;
                            scan.st = UnStrSt::Length(ByteAcc::new(1));
                        }
                        BIN16 => {
                            *pos += 1;
                            scan.st = UnStrSt::Length(ByteAcc::new(2));
                        }
                        _ => {
                            return Err(Error::new(format!(
                                "Unexpected header 0x{header:02X} for a buffer"
                            )))
                        }
                    }
                }
                match scan.feed_after_header(input, pos) {
                    None => Ok(UnAction::Exhausted),
                    Some(bytes) => {
                        let buffer = match node {
                            Node::Buffer(b) => b,
                            _ => unreachable!(),
                        };
                        buffer.data = bytes;
                        buffer.set = true;
                        buffer.null = false;
                        Ok(UnAction::Pop)
                    }
                }
            }
            UnFrame::Array(ua) => {
                let array = match node {
                    Node::Array(a) => a,
                    _ => unreachable!(),
                };
                loop {
                    match &mut ua.st {
                        UnArrSt::Header => {
                            if *pos == input.len() {
                                return Ok(UnAction::Exhausted);
                            }
                            let header = input[*pos];
                            *pos += 1;
                            match header {
                                NIL => {
                                    array.null = true;
                                    return Ok(UnAction::Pop);
                                }
                                0x90..=0x9F => {
                                    ua.remaining = u32::from(header & 0x0F);
                                    ua.st = UnArrSt::Next;
                                }
                                ARRAY16 => ua.st = UnArrSt::Count(ByteAcc::new(2)),
                                _ => {
                                    return Err(Error::new(format!(
                                        "Unexpected header 0x{header:02X} for an array"
                                    )))
                                }
                            }
                        }
                        UnArrSt::Count(acc) => {
                            if !acc.feed(input, pos) {
                                return Ok(UnAction::Exhausted);
                            }
                            ua.remaining = acc.acc as u32;
                            ua.st = UnArrSt::Next;
                        }
                        UnArrSt::Next => {
                            if ua.remaining == 0 {
                                return Ok(UnAction::Pop);
                            }
                            array.add();
                            ua.st = UnArrSt::Child;
                            return Ok(UnAction::Push);
                        }
                        UnArrSt::Child => unreachable!("child frame is active"),
                    }
                }
            }
            UnFrame::Object(uo) => {
                let object = match node {
                    Node::Object(o) => o,
                    _ => unreachable!(),
                };
                loop {
                    match &mut uo.st {
                        UnObjSt::Header => {
                            if *pos == input.len() {
                                return Ok(UnAction::Exhausted);
                            }
                            let header = input[*pos];
                            *pos += 1;
                            match header {
                                NIL => {
                                    object.null = true;
                                    return Ok(UnAction::Pop);
                                }
                                0x80..=0x8F => {
                                    uo.remaining = u32::from(header & 0x0F);
                                    uo.st = if uo.remaining == 0 {
                                        return Ok(UnAction::Pop);
                                    } else {
                                        UnObjSt::Key(UnStr::new())
                                    };
                                }
                                MAP16 => uo.st = UnObjSt::Count(ByteAcc::new(2)),
                                _ => {
                                    return Err(Error::new(format!(
                                        "Unexpected header 0x{header:02X} for an object"
                                    )))
                                }
                            }
                        }
                        UnObjSt::Count(acc) => {
                            if !acc.feed(input, pos) {
                                return Ok(UnAction::Exhausted);
                            }
                            uo.remaining = acc.acc as u32;
                            if uo.remaining == 0 {
                                return Ok(UnAction::Pop);
                            }
                            uo.st = UnObjSt::Key(UnStr::new());
                        }
                        UnObjSt::Key(scan) => match scan.feed(input, pos)? {
                            None => return Ok(UnAction::Exhausted),
                            Some(bytes) => {
                                let key = String::from_utf8(bytes)
                                    .map_err(|_| Error::new("Invalid UTF-8 in string value"))?;
                                match object.position_of(&key) {
                                    Some(index) => {
                                        uo.active = index;
                                        uo.st = UnObjSt::Child;
                                        return Ok(UnAction::Push);
                                    }
                                    None if object.open => {
                                        object.fields.push(crate::node::Field {
                                            label: key,
                                            node: Node::Variant(crate::node::Variant::new()),
                                        });
                                        uo.active = object.fields.len() - 1;
                                        uo.st = UnObjSt::Child;
                                        return Ok(UnAction::Push);
                                    }
                                    None => {
                                        // Unknown label on a closed object:
                                        // discard the value, like the text
                                        // framing does.
                                        uo.st = UnObjSt::Skip(SkipValue::new());
                                    }
                                }
                            }
                        },
                        UnObjSt::Skip(skip) => {
                            if !skip.feed(input, pos)? {
                                return Ok(UnAction::Exhausted);
                            }
                            uo.remaining -= 1;
                            if uo.remaining == 0 {
                                return Ok(UnAction::Pop);
                            }
                            uo.st = UnObjSt::Key(UnStr::new());
                        }
                        UnObjSt::Child => {
                            // Reached only when the map drained.
                            return Ok(UnAction::Pop);
                        }
                    }
                }
            }
        }
    }
}

impl Default for Unpacker {
    fn default() -> Self {
        Self::new()
    }
}

enum UnAction {
    Exhausted,
    Pop,
    Push,
}

fn locate_unpack<'a>(root: &'a mut Node, ancestors: &[UnFrame]) -> &'a mut Node {
    let mut node = root;
    for frame in ancestors {
        node = match frame {
            UnFrame::Array(_) => match node {
                Node::Array(array) => array
                    .items
                    .last_mut()
                    .expect("array frame without active element"),
                _ => unreachable!(),
            },
            UnFrame::Object(uo) => match node {
                Node::Object(object) => &mut object.fields[uo.active].node,
                _ => unreachable!(),
            },
            _ => unreachable!("scalar frames have no children"),
        };
    }
    node
}

impl UnStr {
    /// Continue after the caller handled the header byte itself (buffers
    /// reuse the length/payload machinery with bin headers).
    fn feed_after_header(&mut self, input: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
        loop {
            match &mut self.st {
                UnStrSt::Header => unreachable!("header handled by caller"),
                UnStrSt::Length(acc) => {
                    if !acc.feed(input, pos) {
                        return None;
                    }
                    self.st = UnStrSt::Data {
                        len: acc.acc as usize,
                        buf: Vec::new(),
                    };
                }
                UnStrSt::Data { len, buf } => {
                    while buf.len() < *len && *pos < input.len() {
                        buf.push(input[*pos]);
                        *pos += 1;
                    }
                    if buf.len() == *len {
                        return Some(std::mem::take(buf));
                    }
                    return None;
                }
            }
        }
    }
}

/// Unpack a complete binary document into `root`.
pub fn from_slice(root: &mut Node, bytes: &[u8]) -> Result<(), Error> {
    let mut unpacker = Unpacker::new();
    let mut offset = 0;
    while offset < bytes.len() && !unpacker.is_complete() {
        offset += unpacker.unpack(root, &bytes[offset..])?;
    }
    if !unpacker.is_complete() {
        root.clear();
        return Err(Error::malformed());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Base;

    fn schema() -> Node {
        Node::object(vec![
            ("name", Node::string()),
            ("count", Node::unsigned(Base::Decimal)),
            ("offset", Node::signed(Base::Decimal)),
            ("alive", Node::boolean()),
            ("blob", Node::buffer()),
        ])
    }

    fn fill(node: &mut Node) {
        let object = node.as_object_mut().unwrap();
        object.get_mut("name").unwrap().as_str_mut().unwrap().set("girder");
        object
            .get_mut("count")
            .unwrap()
            .as_number_mut()
            .unwrap()
            .set_u64(300);
        object
            .get_mut("offset")
            .unwrap()
            .as_number_mut()
            .unwrap()
            .set_i64(-5);
        object
            .get_mut("alive")
            .unwrap()
            .as_boolean_mut()
            .unwrap()
            .set(true);
        object
            .get_mut("blob")
            .unwrap()
            .as_buffer_mut()
            .unwrap()
            .set(vec![1, 2, 3]);
    }

    #[test]
    fn test_roundtrip_object() {
        let mut node = schema();
        fill(&mut node);
        let bytes = to_vec(&node);

        let mut parsed = schema();
        from_slice(&mut parsed, &bytes).unwrap();
        let object = parsed.as_object().unwrap();
        assert_eq!(object.get("name").unwrap().as_str().unwrap().get(), "girder");
        assert_eq!(
            object.get("count").unwrap().as_number().unwrap().get_u64(),
            300
        );
        assert_eq!(
            object.get("offset").unwrap().as_number().unwrap().get_i64(),
            -5
        );
        assert!(object.get("alive").unwrap().as_boolean().unwrap().get());
        assert_eq!(object.get("blob").unwrap().as_buffer().unwrap().get(), &[1, 2, 3]);
    }

    #[test]
    fn test_unset_fields_travel_as_nil() {
        let node = schema();
        let bytes = to_vec(&node);
        // fixmap of 5 with each entry a fixstr key followed by nil.
        assert_eq!(bytes[0], 0x85);
        let mut parsed = schema();
        from_slice(&mut parsed, &bytes).unwrap();
        assert!(parsed.as_object().unwrap().get("name").unwrap().is_null());
    }

    #[test]
    fn test_fixint_boundaries() {
        for value in [0u64, 1, 127, 128, 255, 256, 65535, 65536, u64::from(u32::MAX) + 1] {
            let mut node = Node::unsigned(Base::Decimal);
            node.as_number_mut().unwrap().set_u64(value);
            let bytes = to_vec(&node);
            let mut parsed = Node::unsigned(Base::Decimal);
            from_slice(&mut parsed, &bytes).unwrap();
            assert_eq!(parsed.as_number().unwrap().get_u64(), value, "value {value}");
        }
    }

    #[test]
    fn test_negative_fixint_is_twos_complement() {
        let mut node = Node::signed(Base::Decimal);
        node.as_number_mut().unwrap().set_i64(-1);
        assert_eq!(to_vec(&node), vec![0xFF]);

        node.as_number_mut().unwrap().set_i64(-32);
        assert_eq!(to_vec(&node), vec![0xE0]);

        node.as_number_mut().unwrap().set_i64(-33);
        assert_eq!(to_vec(&node), vec![INT8, (-33i8) as u8]);
    }

    #[test]
    fn test_signed_widths_roundtrip() {
        for value in [-1i64, -32, -33, -128, -129, -32768, -32769, i64::from(i32::MIN) - 1] {
            let mut node = Node::signed(Base::Decimal);
            node.as_number_mut().unwrap().set_i64(value);
            let bytes = to_vec(&node);
            let mut parsed = Node::signed(Base::Decimal);
            from_slice(&mut parsed, &bytes).unwrap();
            assert_eq!(parsed.as_number().unwrap().get_i64(), value, "value {value}");
        }
    }

    #[test]
    fn test_array_counts_set_elements() {
        let mut node = Node::array_of(Node::unsigned(Base::Decimal));
        {
            let array = node.as_array_mut().unwrap();
            array.add().as_number_mut().unwrap().set_u64(9);
            array.add(); // unset; skipped on the wire
            array.add().as_number_mut().unwrap().set_u64(10);
        }
        let bytes = to_vec(&node);
        assert_eq!(bytes, vec![0x92, 9, 10]);
    }

    #[test]
    fn test_split_feed_equivalence() {
        let mut node = schema();
        fill(&mut node);
        let bytes = to_vec(&node);
        for split in 1..bytes.len() {
            let mut parsed = schema();
            let mut unpacker = Unpacker::new();
            let mut offset = 0;
            while offset < split {
                offset += unpacker.unpack(&mut parsed, &bytes[offset..split]).unwrap();
            }
            while offset < bytes.len() && !unpacker.is_complete() {
                offset += unpacker.unpack(&mut parsed, &bytes[offset..]).unwrap();
            }
            assert!(unpacker.is_complete(), "split at {split}");
            assert_eq!(
                parsed
                    .as_object()
                    .unwrap()
                    .get("count")
                    .unwrap()
                    .as_number()
                    .unwrap()
                    .get_u64(),
                300,
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_unknown_members_are_skipped() {
        // Pack through a wider schema, parse through a narrower one: the
        // extra members (one of them a nested container) are discarded.
        let mut wide = Node::object(vec![
            (
                "extra",
                Node::object(vec![
                    ("deep", Node::array_of(Node::unsigned(Base::Decimal))),
                    ("s", Node::string()),
                ]),
            ),
            ("hole", Node::boolean()),
            ("count", Node::unsigned(Base::Decimal)),
        ]);
        {
            let object = wide.as_object_mut().unwrap();
            let extra = object.get_mut("extra").unwrap().as_object_mut().unwrap();
            let deep = extra.get_mut("deep").unwrap().as_array_mut().unwrap();
            deep.add().as_number_mut().unwrap().set_u64(1);
            deep.add().as_number_mut().unwrap().set_u64(2);
            extra.get_mut("s").unwrap().as_str_mut().unwrap().set("junk");
            object
                .get_mut("count")
                .unwrap()
                .as_number_mut()
                .unwrap()
                .set_u64(300);
        }
        let bytes = to_vec(&wide);

        let narrow = || Node::object(vec![("count", Node::unsigned(Base::Decimal))]);
        let mut parsed = narrow();
        from_slice(&mut parsed, &bytes).unwrap();
        assert_eq!(
            parsed
                .as_object()
                .unwrap()
                .get("count")
                .unwrap()
                .as_number()
                .unwrap()
                .get_u64(),
            300
        );

        // The skip machinery survives arbitrary window boundaries too.
        for split in 1..bytes.len() {
            let mut parsed = narrow();
            let mut unpacker = Unpacker::new();
            let mut offset = 0;
            while offset < split {
                offset += unpacker.unpack(&mut parsed, &bytes[offset..split]).unwrap();
            }
            while offset < bytes.len() && !unpacker.is_complete() {
                offset += unpacker.unpack(&mut parsed, &bytes[offset..]).unwrap();
            }
            assert!(unpacker.is_complete(), "split at {split}");
            assert_eq!(
                parsed
                    .as_object()
                    .unwrap()
                    .get("count")
                    .unwrap()
                    .as_number()
                    .unwrap()
                    .get_u64(),
                300,
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_str16_header() {
        let long = "x".repeat(300);
        let mut node = Node::string();
        node.as_str_mut().unwrap().set(long.clone());
        let bytes = to_vec(&node);
        assert_eq!(bytes[0], STR8 + 1); // STR16
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 300);
        let mut parsed = Node::string();
        from_slice(&mut parsed, &bytes).unwrap();
        assert_eq!(parsed.as_str().unwrap().get(), long);
    }
}
