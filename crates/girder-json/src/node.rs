//! Typed element tree
//!
//! Every JSON cell is a [`Node`]: a tagged value with a small closed case
//! set. Containers own their children directly, so a registered schema is
//! an ordinary Rust value that can be cloned, inspected and re-parsed
//! into. Codec cursors (see `text` and `binary`) never store references
//! into the tree; they re-locate the active path on every step.
//!
//! Observable state rules:
//! - a value is *set* once assigned or successfully deserialized, and
//!   readers of an unset value see its default;
//! - *null* is a distinct state that still counts as set;
//! - an object is set iff any field is set, an array iff it has elements.

use crate::enumeration::EnumRegistry;

/// Radix of a number element. Octal and hexadecimal numbers travel quoted,
/// decimal numbers unquoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    Octal,
    Decimal,
    Hexadecimal,
}

/// Integer element. Magnitude and sign are kept apart so one storage
/// covers the full `u64` and `i64` ranges; overflow of the target type is
/// the caller's concern, not the codec's.
#[derive(Debug, Clone)]
pub struct Number {
    pub(crate) signed: bool,
    pub(crate) base: Base,
    pub(crate) set: bool,
    pub(crate) null: bool,
    pub(crate) negative: bool,
    pub(crate) magnitude: u64,
    pub(crate) default_negative: bool,
    pub(crate) default_magnitude: u64,
}

impl Number {
    pub fn unsigned(base: Base) -> Self {
        Self {
            signed: false,
            base,
            set: false,
            null: false,
            negative: false,
            magnitude: 0,
            default_negative: false,
            default_magnitude: 0,
        }
    }

    pub fn signed(base: Base) -> Self {
        Self {
            signed: true,
            ..Self::unsigned(base)
        }
    }

    pub fn with_default_u64(mut self, value: u64) -> Self {
        self.default_negative = false;
        self.default_magnitude = value;
        self
    }

    pub fn with_default_i64(mut self, value: i64) -> Self {
        self.default_negative = value < 0;
        self.default_magnitude = value.unsigned_abs();
        self
    }

    pub fn set_u64(&mut self, value: u64) {
        self.negative = false;
        self.magnitude = value;
        self.set = true;
        self.null = false;
    }

    pub fn set_i64(&mut self, value: i64) {
        self.negative = value < 0;
        self.magnitude = value.unsigned_abs();
        self.set = true;
        self.null = false;
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn base(&self) -> Base {
        self.base
    }

    /// Value as unsigned; the default when unset. A negative value
    /// wraps, exactly as assigning it to an unsigned target would.
    pub fn get_u64(&self) -> u64 {
        let (neg, mag) = if self.set {
            (self.negative, self.magnitude)
        } else {
            (self.default_negative, self.default_magnitude)
        };
        if neg {
            (mag as i64).wrapping_neg() as u64
        } else {
            mag
        }
    }

    pub fn get_i64(&self) -> i64 {
        let (neg, mag) = if self.set {
            (self.negative, self.magnitude)
        } else {
            (self.default_negative, self.default_magnitude)
        };
        if neg {
            (mag as i64).wrapping_neg()
        } else {
            mag as i64
        }
    }

    pub fn is_set(&self) -> bool {
        self.set || self.null
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn clear(&mut self) {
        self.set = false;
        self.null = false;
        self.negative = false;
        self.magnitude = 0;
    }
}

/// Boolean element. Accepts `true`, `false`, `1`, `0` and `null` on the
/// wire.
#[derive(Debug, Clone)]
pub struct Boolean {
    pub(crate) set: bool,
    pub(crate) null: bool,
    pub(crate) value: bool,
    pub(crate) default: bool,
}

impl Boolean {
    pub fn new() -> Self {
        Self {
            set: false,
            null: false,
            value: false,
            default: false,
        }
    }

    pub fn with_default(mut self, value: bool) -> Self {
        self.default = value;
        self
    }

    pub fn set(&mut self, value: bool) {
        self.value = value;
        self.set = true;
        self.null = false;
    }

    pub fn get(&self) -> bool {
        if self.set {
            self.value
        } else {
            self.default
        }
    }

    pub fn is_set(&self) -> bool {
        self.set || self.null
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn clear(&mut self) {
        self.set = false;
        self.null = false;
        self.value = false;
    }
}

impl Default for Boolean {
    fn default() -> Self {
        Self::new()
    }
}

/// String element.
///
/// The `quoted` attribute is owned by the enclosing container position,
/// not by the value: object fields and string array elements are quoted,
/// opaque payload positions are not. An unquoted string position accepts
/// an entire balanced `{...}`/`[...]` fragment verbatim (the opaque
/// object), up to 23 nesting levels.
///
/// Serialization re-escapes only `"`. The control-character escapes that
/// deserialization collapses are intentionally not re-inserted, so a
/// value that arrived escaped re-serializes through unchanged stores.
#[derive(Debug, Clone)]
pub struct Str {
    pub(crate) quoted: bool,
    pub(crate) quote_found: bool,
    pub(crate) set: bool,
    pub(crate) null: bool,
    pub(crate) value: String,
    pub(crate) default: String,
}

impl Str {
    pub fn new() -> Self {
        Self {
            quoted: true,
            quote_found: false,
            set: false,
            null: false,
            value: String::new(),
            default: String::new(),
        }
    }

    pub fn unquoted() -> Self {
        Self {
            quoted: false,
            ..Self::new()
        }
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = value.into();
        self
    }

    pub fn set(&mut self, value: impl Into<String>) {
        self.value = value.into();
        self.set = true;
        self.null = false;
    }

    pub fn get(&self) -> &str {
        if self.set && !self.null {
            &self.value
        } else {
            &self.default
        }
    }

    pub fn is_quoted(&self) -> bool {
        self.quoted || self.quote_found
    }

    pub fn set_quoted(&mut self, quoted: bool) {
        self.quoted = quoted;
    }

    pub fn is_set(&self) -> bool {
        self.set || self.null
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn clear(&mut self) {
        self.set = false;
        self.null = false;
        self.quote_found = false;
        self.value.clear();
    }
}

impl Default for Str {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte buffer element, base-64 on the text wire, bin-8/bin-16 on the
/// binary wire.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub(crate) set: bool,
    pub(crate) null: bool,
    pub(crate) data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            set: false,
            null: false,
            data: Vec::new(),
        }
    }

    pub fn set(&mut self, data: impl Into<Vec<u8>>) {
        self.data = data.into();
        self.set = true;
        self.null = false;
    }

    pub fn get(&self) -> &[u8] {
        &self.data
    }

    pub fn is_set(&self) -> bool {
        !self.data.is_empty() && self.set
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn clear(&mut self) {
        self.set = false;
        self.null = false;
        self.data.clear();
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Enumerated element mapped through a static [`EnumRegistry`].
#[derive(Debug, Clone)]
pub struct Enumerated {
    pub(crate) registry: &'static EnumRegistry,
    pub(crate) set: bool,
    pub(crate) null: bool,
    pub(crate) code: u32,
    pub(crate) default: u32,
}

impl Enumerated {
    pub fn new(registry: &'static EnumRegistry) -> Self {
        Self {
            registry,
            set: false,
            null: false,
            code: 0,
            default: 0,
        }
    }

    pub fn with_default(mut self, code: u32) -> Self {
        self.default = code;
        self
    }

    pub fn set(&mut self, code: u32) {
        self.code = code;
        self.set = true;
        self.null = false;
    }

    pub fn code(&self) -> u32 {
        if self.set && !self.null {
            self.code
        } else {
            self.default
        }
    }

    pub fn identifier(&self) -> Option<&'static str> {
        self.registry.name_of(self.code())
    }

    pub fn is_set(&self) -> bool {
        self.set
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn clear(&mut self) {
        self.set = false;
        self.null = false;
        self.code = 0;
    }
}

/// Floating-point element. Decimal only; kept apart from [`Number`] so
/// the integer state machine stays free of exponent ambiguities.
#[derive(Debug, Clone)]
pub struct Double {
    pub(crate) set: bool,
    pub(crate) null: bool,
    pub(crate) value: f64,
    pub(crate) default: f64,
}

impl Double {
    pub fn new() -> Self {
        Self {
            set: false,
            null: false,
            value: 0.0,
            default: 0.0,
        }
    }

    pub fn with_default(mut self, value: f64) -> Self {
        self.default = value;
        self
    }

    pub fn set(&mut self, value: f64) {
        self.value = value;
        self.set = true;
        self.null = false;
    }

    pub fn get(&self) -> f64 {
        if self.set {
            self.value
        } else {
            self.default
        }
    }

    pub fn is_set(&self) -> bool {
        self.set || self.null
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn clear(&mut self) {
        self.set = false;
        self.null = false;
        self.value = 0.0;
    }
}

impl Default for Double {
    fn default() -> Self {
        Self::new()
    }
}

/// Homogeneous array. New elements are materialized by cloning the
/// prototype supplied at construction.
#[derive(Debug, Clone)]
pub struct Array {
    pub(crate) proto: Box<Node>,
    pub(crate) items: Vec<Node>,
    pub(crate) null: bool,
}

impl Array {
    pub fn of(proto: Node) -> Self {
        Self {
            proto: Box::new(proto),
            items: Vec::new(),
            null: false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append a fresh element cloned from the prototype and return it.
    pub fn add(&mut self) -> &mut Node {
        self.items.push((*self.proto).clone());
        self.items.last_mut().unwrap()
    }

    pub fn get(&self, index: usize) -> Option<&Node> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.items.iter()
    }

    pub fn is_set(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.null = false;
    }
}

/// One registered binding of an [`Object`].
#[derive(Debug, Clone)]
pub struct Field {
    pub(crate) label: String,
    pub(crate) node: Node,
}

impl Field {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

/// Labeled container with registration-ordered fields.
///
/// A closed object skips unknown labels (the value is consumed through a
/// scratch string that honors quoting and nesting). An *open* object
/// materializes a fresh [`Variant`] field for every unknown label
/// instead, which is how arbitrary JSON objects are absorbed.
#[derive(Debug, Clone)]
pub struct Object {
    pub(crate) fields: Vec<Field>,
    pub(crate) open: bool,
    pub(crate) null: bool,
}

impl Object {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            open: false,
            null: false,
        }
    }

    /// An object that accepts any label by materializing variant fields.
    pub fn open() -> Self {
        Self {
            open: true,
            ..Self::new()
        }
    }

    /// Register a field. Labels must be unique; registration order is
    /// serialization order.
    pub fn with_field(mut self, label: impl Into<String>, node: Node) -> Self {
        self.add(label, node);
        self
    }

    pub fn add(&mut self, label: impl Into<String>, node: Node) {
        let label = label.into();
        debug_assert!(
            !self.has_label(&label),
            "duplicate field label {label:?} registered"
        );
        self.fields.push(Field { label, node });
    }

    pub fn remove(&mut self, label: &str) {
        self.fields.retain(|f| f.label != label);
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.fields.iter().any(|f| f.label == label)
    }

    pub fn get(&self, label: &str) -> Option<&Node> {
        self.fields.iter().find(|f| f.label == label).map(|f| &f.node)
    }

    pub fn get_mut(&mut self, label: &str) -> Option<&mut Node> {
        self.fields
            .iter_mut()
            .find(|f| f.label == label)
            .map(|f| &mut f.node)
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub(crate) fn position_of(&self, label: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.label == label)
    }

    pub fn is_set(&self) -> bool {
        self.fields.iter().any(|f| f.node.is_set())
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn clear(&mut self) {
        for field in &mut self.fields {
            field.node.clear();
        }
        self.null = false;
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

/// Concrete shape a [`Variant`] detected on parse or was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Content {
    Empty,
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

/// Dynamically-typed JSON cell.
///
/// Scalars are stored as their textual form; `{...}`/`[...]` values are
/// captured verbatim by a quote-aware balanced scan so the tree never
/// commits to a static schema for them. Typed access re-parses on demand.
#[derive(Debug, Clone)]
pub struct Variant {
    pub(crate) content: Content,
    pub(crate) body: Str,
}

impl Variant {
    pub fn new() -> Self {
        let mut body = Str::unquoted();
        body.value = "null".into();
        Self {
            content: Content::Empty,
            body,
        }
    }

    pub fn content(&self) -> Content {
        self.content
    }

    /// The raw textual value (sub-JSON for arrays and objects).
    pub fn text(&self) -> &str {
        self.body.get()
    }

    pub fn as_bool(&self) -> bool {
        self.content == Content::Boolean && self.body.get() == "true"
    }

    /// Re-parse the stored text as a signed decimal number. Zero when the
    /// content is not a number or does not parse.
    pub fn as_number(&self) -> i64 {
        if self.content == Content::Number {
            self.body.get().parse().unwrap_or(0)
        } else {
            0
        }
    }

    /// Re-parse a captured array into variant elements.
    pub fn to_array(&self) -> Result<Array, crate::Error> {
        let mut node = Node::Array(Array::of(Node::Variant(Variant::new())));
        crate::streamer::from_str(&mut node, self.body.get())?;
        match node {
            Node::Array(array) => Ok(array),
            _ => unreachable!(),
        }
    }

    /// Re-parse a captured object into an open container.
    pub fn to_object(&self) -> Result<Object, crate::Error> {
        let mut node = Node::Object(Object::open());
        crate::streamer::from_str(&mut node, self.body.get())?;
        match node {
            Node::Object(object) => Ok(object),
            _ => unreachable!(),
        }
    }

    pub fn set_bool(&mut self, value: bool) {
        self.content = Content::Boolean;
        self.body.quoted = false;
        self.body.set(if value { "true" } else { "false" });
    }

    pub fn set_number(&mut self, value: i64) {
        self.content = Content::Number;
        self.body.quoted = false;
        self.body.set(value.to_string());
    }

    pub fn set_string(&mut self, value: impl Into<String>) {
        self.content = Content::String;
        self.body.quoted = true;
        self.body.set(value);
    }

    /// Store a serialized object or array verbatim.
    pub fn set_json(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.content = if text.trim_start().starts_with('[') {
            Content::Array
        } else {
            Content::Object
        };
        self.body.quoted = false;
        self.body.set(text);
    }

    pub fn is_set(&self) -> bool {
        self.body.is_set()
    }

    pub fn is_null(&self) -> bool {
        self.body.is_null()
    }

    pub fn clear(&mut self) {
        self.body.clear();
        self.body.value = "null".into();
        self.content = Content::Empty;
    }
}

impl Default for Variant {
    fn default() -> Self {
        Self::new()
    }
}

/// A node of the element tree.
#[derive(Debug, Clone)]
pub enum Node {
    Number(Number),
    Boolean(Boolean),
    Str(Str),
    Buffer(Buffer),
    Enum(Enumerated),
    Double(Double),
    Array(Array),
    Object(Object),
    Variant(Variant),
}

impl Node {
    // Constructors mirroring the registered-type vocabulary.

    pub fn unsigned(base: Base) -> Self {
        Node::Number(Number::unsigned(base))
    }

    pub fn signed(base: Base) -> Self {
        Node::Number(Number::signed(base))
    }

    pub fn boolean() -> Self {
        Node::Boolean(Boolean::new())
    }

    pub fn string() -> Self {
        Node::Str(Str::new())
    }

    pub fn string_unquoted() -> Self {
        Node::Str(Str::unquoted())
    }

    pub fn buffer() -> Self {
        Node::Buffer(Buffer::new())
    }

    pub fn enumeration(registry: &'static EnumRegistry) -> Self {
        Node::Enum(Enumerated::new(registry))
    }

    pub fn double() -> Self {
        Node::Double(Double::new())
    }

    pub fn array_of(proto: Node) -> Self {
        Node::Array(Array::of(proto))
    }

    pub fn object(fields: Vec<(&str, Node)>) -> Self {
        let mut object = Object::new();
        for (label, node) in fields {
            object.add(label, node);
        }
        Node::Object(object)
    }

    /// An open container absorbing arbitrary JSON objects.
    pub fn variant_object() -> Self {
        Node::Object(Object::open())
    }

    pub fn variant() -> Self {
        Node::Variant(Variant::new())
    }

    // Common capability surface.

    pub fn is_set(&self) -> bool {
        match self {
            Node::Number(v) => v.is_set(),
            Node::Boolean(v) => v.is_set(),
            Node::Str(v) => v.is_set(),
            Node::Buffer(v) => v.is_set(),
            Node::Enum(v) => v.is_set(),
            Node::Double(v) => v.is_set(),
            Node::Array(v) => v.is_set(),
            Node::Object(v) => v.is_set(),
            Node::Variant(v) => v.is_set(),
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Node::Number(v) => v.is_null(),
            Node::Boolean(v) => v.is_null(),
            Node::Str(v) => v.is_null(),
            Node::Buffer(v) => v.is_null(),
            Node::Enum(v) => v.is_null(),
            Node::Double(v) => v.is_null(),
            Node::Array(v) => v.is_null(),
            Node::Object(v) => v.is_null(),
            Node::Variant(v) => v.is_null(),
        }
    }

    pub fn clear(&mut self) {
        match self {
            Node::Number(v) => v.clear(),
            Node::Boolean(v) => v.clear(),
            Node::Str(v) => v.clear(),
            Node::Buffer(v) => v.clear(),
            Node::Enum(v) => v.clear(),
            Node::Double(v) => v.clear(),
            Node::Array(v) => v.clear(),
            Node::Object(v) => v.clear(),
            Node::Variant(v) => v.clear(),
        }
    }

    pub fn set_null(&mut self) {
        match self {
            Node::Number(v) => v.null = true,
            Node::Boolean(v) => v.null = true,
            Node::Str(v) => v.null = true,
            Node::Buffer(v) => v.null = true,
            Node::Enum(v) => v.null = true,
            Node::Double(v) => v.null = true,
            Node::Array(v) => v.null = true,
            Node::Object(v) => v.null = true,
            Node::Variant(v) => v.body.null = true,
        }
    }

    // Typed access.

    pub fn as_number(&self) -> Option<&Number> {
        match self {
            Node::Number(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_number_mut(&mut self) -> Option<&mut Number> {
        match self {
            Node::Number(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<&Boolean> {
        match self {
            Node::Boolean(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_boolean_mut(&mut self) -> Option<&mut Boolean> {
        match self {
            Node::Boolean(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&Str> {
        match self {
            Node::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str_mut(&mut self) -> Option<&mut Str> {
        match self {
            Node::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            Node::Buffer(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_buffer_mut(&mut self) -> Option<&mut Buffer> {
        match self {
            Node::Buffer(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&Enumerated> {
        match self {
            Node::Enum(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_enum_mut(&mut self) -> Option<&mut Enumerated> {
        match self {
            Node::Enum(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<&Double> {
        match self {
            Node::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double_mut(&mut self) -> Option<&mut Double> {
        match self {
            Node::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Node::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Array> {
        match self {
            Node::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Node::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Object> {
        match self {
            Node::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Node::Variant(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_variant_mut(&mut self) -> Option<&mut Variant> {
        match self {
            Node::Variant(v) => Some(v),
            _ => None,
        }
    }
}
