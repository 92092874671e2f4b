//! Enumeration registry
//!
//! Enumerated values travel as quoted identifiers in the text framing and
//! as unsigned codes in the binary framing. The mapping between the two is
//! a static registry supplied at element construction time.

/// One identifier/code pair of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumEntry {
    pub name: &'static str,
    pub code: u32,
}

/// A static name/code table for one enumerated type.
///
/// Name lookup is case-insensitive, code lookup exact. Registries are
/// usually declared as `static` items next to the enum they describe:
///
/// ```
/// use girder_json::{EnumEntry, EnumRegistry};
///
/// static STATES: EnumRegistry = EnumRegistry::new(&[
///     EnumEntry { name: "enabled", code: 0 },
///     EnumEntry { name: "disabled", code: 1 },
/// ]);
///
/// assert_eq!(STATES.code_of("Enabled"), Some(0));
/// assert_eq!(STATES.name_of(1), Some("disabled"));
/// ```
#[derive(Debug)]
pub struct EnumRegistry {
    entries: &'static [EnumEntry],
}

impl EnumRegistry {
    pub const fn new(entries: &'static [EnumEntry]) -> Self {
        Self { entries }
    }

    pub fn code_of(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.code)
    }

    pub fn name_of(&self, code: u32) -> Option<&'static str> {
        self.entries.iter().find(|e| e.code == code).map(|e| e.name)
    }
}
