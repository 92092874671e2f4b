//! Parser acceptance matrix: malformed-document handling, string escape
//! coverage, unicode payloads, arrays, buffers, enums and variants, each
//! driven through a single registered-field container.

use girder_json::{from_str, to_string, Base, EnumEntry, EnumRegistry, Node};

fn keyed(node: Node) -> Node {
    Node::object(vec![("key", node)])
}

fn parse(node: Node, document: &str) -> Result<Node, girder_json::Error> {
    let mut root = keyed(node);
    from_str(&mut root, document)?;
    Ok(root)
}

fn key_of(root: &Node) -> &Node {
    root.as_object().unwrap().get("key").unwrap()
}

// -- structural failures ----------------------------------------------------

#[test]
fn test_no_value() {
    assert!(parse(Node::string(), "{\"key\":}").is_err());
}

#[test]
fn test_no_value_no_separator() {
    assert!(parse(Node::string(), "{\"key\"}").is_err());
}

#[test]
fn test_no_key() {
    assert!(parse(Node::string(), "{:\"value\"}").is_err());
}

#[test]
fn test_key_and_comma() {
    assert!(parse(Node::string(), "{\"key\",}").is_err());
}

#[test]
fn test_spurious_comma_at_the_end() {
    assert!(parse(Node::string(), "{\"key\":\"value\",}").is_err());
}

#[test]
fn test_spurious_colon_at_the_end() {
    assert!(parse(Node::string(), "{\"key\":\"value\":}").is_err());
}

#[test]
fn test_double_comma() {
    assert!(parse(Node::string(), "{\"key\":\"value\",,\"key2\":\"v\"}").is_err());
}

#[test]
fn test_key_without_quotes() {
    assert!(parse(Node::string(), "{key:\"value\"}").is_err());
}

#[test]
fn test_key_left_quote_only() {
    assert!(parse(Node::string(), "{\"key:\"value\"}").is_err());
}

#[test]
fn test_key_right_quote_only() {
    assert!(parse(Node::string(), "{key\":\"value\"}").is_err());
}

// -- arrays -----------------------------------------------------------------

#[test]
fn test_array_of_two() {
    let root = parse(
        Node::array_of(Node::unsigned(Base::Decimal)),
        "{\"key\":[1,2]}",
    )
    .unwrap();
    assert_eq!(key_of(&root).as_array().unwrap().len(), 2);
}

#[test]
fn test_null_array() {
    let root = parse(
        Node::array_of(Node::unsigned(Base::Decimal)),
        "{\"key\":null}",
    )
    .unwrap();
    assert!(key_of(&root).is_null());
    assert_eq!(key_of(&root).as_array().unwrap().len(), 0);
}

#[test]
fn test_intended_null_array_but_missed() {
    assert!(parse(Node::array_of(Node::unsigned(Base::Decimal)), "{\"key\":nill}").is_err());
}

#[test]
fn test_array_with_comma_only() {
    assert!(parse(Node::array_of(Node::unsigned(Base::Decimal)), "{\"key\":[,]}").is_err());
}

#[test]
fn test_wrongly_opened_array() {
    assert!(parse(Node::array_of(Node::unsigned(Base::Decimal)), "{\"key\":]1,2]}").is_err());
}

#[test]
fn test_wrongly_closed_array() {
    assert!(parse(Node::array_of(Node::unsigned(Base::Decimal)), "{\"key\":[1,2}}").is_err());
    assert!(parse(Node::array_of(Node::unsigned(Base::Decimal)), "{\"key\":[1,2").is_err());
}

#[test]
fn test_unbalanced_container_brackets() {
    assert!(parse(Node::string(), "[\"key\":\"value\"}").is_err());
    assert!(parse(Node::string(), "{\"key\":\"value\"]").is_err());
}

// -- strings ----------------------------------------------------------------

#[test]
fn test_plain_string() {
    let root = parse(Node::string(), "{\"key\":\"value\"}").unwrap();
    assert_eq!(key_of(&root).as_str().unwrap().get(), "value");
}

#[test]
fn test_null_string() {
    let root = parse(Node::string(), "{\"key\":null}").unwrap();
    assert!(key_of(&root).is_null());
}

#[test]
fn test_string_with_bracket_characters_inside_quotes() {
    for value in ["{", "}", "[", "]", "{\\\"a\\\":1}"] {
        let document = format!("{{\"key\":\"{value}\"}}");
        let root = parse(Node::string(), &document)
            .unwrap_or_else(|e| panic!("value {value}: {e}"));
        assert!(key_of(&root).is_set(), "value {value}");
    }
}

#[test]
fn test_unquoted_string_value() {
    let root = parse(Node::string(), "{\"key\":value}").unwrap();
    assert_eq!(key_of(&root).as_str().unwrap().get(), "value");
}

#[test]
fn test_unicode_strings_preserved() {
    for value in [
        "Ελληνικά",
        "ქართული",
        "Русский",
        "Français: œil, cœur",
        "ไทย",
    ] {
        let document = format!("{{\"key\":\"{value}\"}}");
        let root = parse(Node::string(), &document).unwrap();
        assert_eq!(key_of(&root).as_str().unwrap().get(), value);
        assert_eq!(to_string(&root), document);
    }
}

#[test]
fn test_string_left_quote_only() {
    assert!(parse(Node::string(), "{\"key\":\"value}").is_err());
}

#[test]
fn test_valid_escape_sequences() {
    let root = parse(Node::string(), r#"{"key":"a\"b\\c\/d\be\ff\ng\rh\ti"}"#).unwrap();
    assert_eq!(
        key_of(&root).as_str().unwrap().get(),
        "a\"b\\c/d\u{8}e\u{c}f\ng\rh\ti"
    );
}

#[test]
fn test_invalid_escape_sequences() {
    for escape in ["\\a", "\\'", "\\?", "\\v", "\\x41"] {
        let document = format!("{{\"key\":\"{escape}\"}}");
        assert!(parse(Node::string(), &document).is_err(), "escape {escape}");
    }
}

#[test]
fn test_embedded_raw_control_bytes_survive() {
    // Raw newlines and tabs inside a quoted value are copied verbatim.
    let root = parse(Node::string(), "{\"key\":\"a\nb\tc\rd\"}").unwrap();
    assert_eq!(key_of(&root).as_str().unwrap().get(), "a\nb\tc\rd");
}

// -- numbers ----------------------------------------------------------------

#[test]
fn test_number_rejects_trailing_letter() {
    assert!(parse(Node::unsigned(Base::Decimal), "{\"key\":123abc}").is_err());
}

#[test]
fn test_number_null() {
    let root = parse(Node::unsigned(Base::Decimal), "{\"key\":null}").unwrap();
    assert!(key_of(&root).is_null());
}

#[test]
fn test_quoted_decimal() {
    let root = parse(Node::unsigned(Base::Decimal), "{\"key\":\"123\"}").unwrap();
    assert_eq!(key_of(&root).as_number().unwrap().get_u64(), 123);
}

#[test]
fn test_double_with_single_point() {
    let root = parse(Node::double(), "{\"key\":123.456}").unwrap();
    assert_eq!(key_of(&root).as_double().unwrap().get(), 123.456);
}

#[test]
fn test_double_with_two_points_fails() {
    assert!(parse(Node::double(), "{\"key\":123.456.789}").is_err());
}

// -- buffers ----------------------------------------------------------------

#[test]
fn test_buffer_not_null_not_base64() {
    assert!(parse(Node::buffer(), "{\"key\":nill}").is_err());
    assert!(parse(Node::buffer(), "{\"key\":\"a*b\"}").is_err());
}

#[test]
fn test_buffer_null() {
    let root = parse(Node::buffer(), "{\"key\":null}").unwrap();
    assert!(key_of(&root).is_null());
}

// -- enums ------------------------------------------------------------------

static TEST_ENUM: EnumRegistry = EnumRegistry::new(&[
    EnumEntry { name: "one", code: 1 },
    EnumEntry { name: "two", code: 2 },
]);

#[test]
fn test_enum_value() {
    let root = parse(Node::enumeration(&TEST_ENUM), "{\"key\":\"two\"}").unwrap();
    assert_eq!(key_of(&root).as_enum().unwrap().code(), 2);
    assert_eq!(key_of(&root).as_enum().unwrap().identifier(), Some("two"));
}

#[test]
fn test_invalid_enum_value() {
    let err = parse(Node::enumeration(&TEST_ENUM), "{\"key\":\"three\"}").unwrap_err();
    assert!(err.message().contains("Unknown enum value"));
}

// -- variants ---------------------------------------------------------------

#[test]
fn test_variant_container_preserves_insertion_order() {
    let mut root = Node::variant_object();
    from_str(&mut root, "{\"z\":1,\"a\":2,\"m\":3}").unwrap();
    let labels: Vec<&str> = root
        .as_object()
        .unwrap()
        .fields()
        .map(|field| field.label())
        .collect();
    assert_eq!(labels, vec!["z", "a", "m"]);
}

#[test]
fn test_variant_container_built_programmatically() {
    let mut root = Node::variant_object();
    {
        let object = root.as_object_mut().unwrap();
        let mut name = girder_json::Variant::new();
        name.set_string("girder");
        object.add("name", Node::Variant(name));
        let mut count = girder_json::Variant::new();
        count.set_number(3);
        object.add("count", Node::Variant(count));
    }
    assert_eq!(to_string(&root), "{\"name\":\"girder\",\"count\":3}");
}

#[test]
fn test_variant_null_unquoted() {
    // Null detection happens after the unquoted scan completes and before
    // number classification.
    let mut root = Node::variant_object();
    from_str(&mut root, "{\"v\":null}").unwrap();
    let variant = root
        .as_object()
        .unwrap()
        .get("v")
        .unwrap()
        .as_variant()
        .unwrap();
    assert_eq!(variant.content(), girder_json::Content::Null);
    assert!(variant.is_null());
    assert_eq!(variant.as_number(), 0);
}

#[test]
fn test_variant_roundtrip_through_reparse() {
    let mut root = Node::variant_object();
    from_str(&mut root, "{\"outer\":{\"inner\":[1,2,3]}}").unwrap();
    let nested = root
        .as_object()
        .unwrap()
        .get("outer")
        .unwrap()
        .as_variant()
        .unwrap()
        .to_object()
        .unwrap();
    let inner = nested.get("inner").unwrap().as_variant().unwrap();
    assert_eq!(inner.content(), girder_json::Content::Array);
    let items = inner.to_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items.get(2).unwrap().as_variant().unwrap().as_number(), 3);
}
