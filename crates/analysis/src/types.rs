//! Recovered storage-variable types.
//!
//! The analyzer does not see declarations, only access patterns, so a type
//! starts as a bag of hints (masks seen, sign extensions, mapping hashes)
//! plus a byte length, and is resolved to a coarse class on demand. A type
//! may be widened after creation: an address that later flows through an
//! `EXTCODESIZE` check becomes a contract, a one-byte field double-negated
//! into a flag becomes a bool.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const WORD_BYTES: u32 = 32;

/// Evidence gathered while analyzing accesses to a storage location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeHints {
    pub is_signed: bool,
    pub is_array: bool,
    pub is_mapping: bool,
    pub is_dynamic: bool,
    /// Value lives at the high end of the word (`bytesM`).
    pub is_higher_order: bool,
    pub is_bool: bool,
    pub is_enum: bool,
    pub is_contract: bool,
    /// Arithmetic was performed on the value.
    pub is_computable: bool,
    pub is_bytes: bool,
    /// The access read a dynamic value's length word.
    pub is_length: bool,
}

/// Coarse classification a hint bag resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeClass {
    ElementaryStatic,
    ElementaryDynamic,
    UserDefineEnum,
    UserDefineContract,
    ArrayStatic,
    ArrayDynamic,
    MappingStatic,
    MappingDynamic,
    Other,
}

impl TypeClass {
    pub fn canonical_name(&self) -> &'static str {
        match self {
            TypeClass::ElementaryStatic => "elementary_static",
            TypeClass::ElementaryDynamic => "elementary_dynamic",
            TypeClass::UserDefineEnum => "user_define_enum",
            TypeClass::UserDefineContract => "user_define_contract",
            TypeClass::ArrayStatic => "array_type_static",
            TypeClass::ArrayDynamic => "array_type_dynamic",
            TypeClass::MappingStatic => "mapping_type_static",
            TypeClass::MappingDynamic => "mapping_type_dynamic",
            TypeClass::Other => "other_type",
        }
    }
}

/// A storage variable's type: hints, byte length, and the lazily-resolved
/// class with its rendered name (`uint128`, `address`, `mapping_type_static`, …).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmType {
    pub hints: TypeHints,
    /// Length in bytes; -1 when unknown.
    pub length: i64,
    class: Option<TypeClass>,
    type_name: String,
}

impl Default for EvmType {
    fn default() -> Self {
        EvmType {
            hints: TypeHints::default(),
            length: -1,
            class: None,
            type_name: String::new(),
        }
    }
}

impl EvmType {
    pub fn new(hints: TypeHints, length: Option<u32>) -> Self {
        EvmType {
            hints,
            length: length.map(i64::from).unwrap_or(-1),
            class: None,
            type_name: String::new(),
        }
    }

    /// Rebuild from a previously rendered name (analyzer-state reload).
    pub fn from_name(name: &str) -> Self {
        let mut ty = EvmType {
            type_name: name.to_string(),
            ..Default::default()
        };
        ty.infer();
        ty
    }

    pub fn class(&mut self) -> TypeClass {
        if self.class.is_none() {
            self.infer();
        }
        self.class.unwrap_or(TypeClass::Other)
    }

    /// Resolved class without forcing inference (`Other` when unresolved).
    pub fn class_ref(&self) -> TypeClass {
        self.class.unwrap_or(TypeClass::Other)
    }

    pub fn is_elementary(&mut self) -> bool {
        matches!(
            self.class(),
            TypeClass::ElementaryStatic | TypeClass::ElementaryDynamic
        )
    }

    pub fn is_array(&mut self) -> bool {
        matches!(self.class(), TypeClass::ArrayStatic | TypeClass::ArrayDynamic)
    }

    pub fn is_mapping(&mut self) -> bool {
        matches!(
            self.class(),
            TypeClass::MappingStatic | TypeClass::MappingDynamic
        )
    }

    pub fn is_dynamic(&mut self) -> bool {
        matches!(
            self.class(),
            TypeClass::ElementaryDynamic | TypeClass::ArrayDynamic | TypeClass::MappingDynamic
        )
    }

    pub fn is_contract(&mut self) -> bool {
        self.class() == TypeClass::UserDefineContract
    }

    // Widening operations. Each overrides the inferred class.

    pub fn widen_to_contract(&mut self) {
        self.class = Some(TypeClass::UserDefineContract);
        self.type_name = "user_define_contract".to_string();
    }

    pub fn widen_to_enum(&mut self) {
        self.class = Some(TypeClass::UserDefineEnum);
        self.type_name = "user_define_enum".to_string();
    }

    pub fn widen_to_bool(&mut self) {
        self.class = Some(TypeClass::ElementaryStatic);
        self.type_name = "bool".to_string();
    }

    pub fn widen_to_string(&mut self) {
        self.class = Some(TypeClass::ElementaryDynamic);
        self.type_name = "string".to_string();
    }

    /// Numeric widening after arithmetic use; containers are left alone.
    pub fn widen_to_computable(&mut self) {
        if self.is_mapping() || self.is_array() || self.is_dynamic() {
            return;
        }
        self.class = Some(TypeClass::ElementaryStatic);
        self.type_name = if self.hints.is_signed {
            format!("int{}", self.length.max(0) * 8)
        } else {
            format!("uint{}", self.length.max(0) * 8)
        };
    }

    pub fn widen_to_bytes(&mut self, m: u32) {
        self.class = Some(TypeClass::ElementaryStatic);
        self.type_name = format!("bytes{m}");
        self.length = i64::from(m);
    }

    /// Resolve the hint bag into a class and a rendered name.
    fn infer(&mut self) {
        if !self.type_name.is_empty() {
            self.infer_from_name();
            return;
        }
        let hints = self.hints;
        if hints.is_array {
            self.class = Some(if hints.is_dynamic {
                TypeClass::ArrayDynamic
            } else {
                TypeClass::ArrayStatic
            });
        } else if hints.is_mapping {
            self.class = Some(if hints.is_dynamic {
                TypeClass::MappingDynamic
            } else {
                TypeClass::MappingStatic
            });
        } else if hints.is_dynamic {
            self.class = Some(TypeClass::ElementaryDynamic);
            self.type_name = if hints.is_bytes { "bytes" } else { "string" }.to_string();
        } else if hints.is_higher_order {
            self.class = Some(TypeClass::ElementaryStatic);
            self.type_name = format!("bytes{}", self.length.max(0));
        } else if hints.is_signed {
            self.class = Some(TypeClass::ElementaryStatic);
            self.type_name = format!("int{}", self.length.max(0) * 8);
        } else {
            match self.length {
                1 => {
                    if hints.is_bool {
                        self.class = Some(TypeClass::ElementaryStatic);
                        self.type_name = "bool".to_string();
                    } else if hints.is_enum {
                        self.class = Some(TypeClass::UserDefineEnum);
                        self.type_name = "user_define_enum".to_string();
                    } else {
                        self.class = Some(TypeClass::ElementaryStatic);
                        self.type_name = "uint8".to_string();
                    }
                }
                20 => {
                    if hints.is_contract {
                        self.class = Some(TypeClass::UserDefineContract);
                        self.type_name = "user_define_contract".to_string();
                    } else if hints.is_computable {
                        self.class = Some(TypeClass::ElementaryStatic);
                        self.type_name = "uint160".to_string();
                    } else {
                        self.class = Some(TypeClass::ElementaryStatic);
                        self.type_name = "address".to_string();
                    }
                }
                n => {
                    self.class = Some(TypeClass::ElementaryStatic);
                    self.type_name = format!("uint{}", n.max(0) * 8);
                }
            }
        }
    }

    fn infer_from_name(&mut self) {
        let name = self.type_name.clone();
        let set_len = |this: &mut Self, l: i64| this.length = l;
        match name.as_str() {
            "bytes" | "string" | "elementary_dynamic" => {
                self.class = Some(TypeClass::ElementaryDynamic);
            }
            "bool" => {
                self.class = Some(TypeClass::ElementaryStatic);
                set_len(self, 1);
            }
            "address" => {
                self.class = Some(TypeClass::ElementaryStatic);
                set_len(self, 20);
            }
            "user_define_enum" => {
                self.class = Some(TypeClass::UserDefineEnum);
                set_len(self, 1);
            }
            "user_define_contract" => {
                self.class = Some(TypeClass::UserDefineContract);
                set_len(self, 20);
            }
            "array_type_static" => self.class = Some(TypeClass::ArrayStatic),
            "array_type_dynamic" => self.class = Some(TypeClass::ArrayDynamic),
            "mapping_type_static" => self.class = Some(TypeClass::MappingStatic),
            "mapping_type_dynamic" => self.class = Some(TypeClass::MappingDynamic),
            n if n.starts_with("uint") => {
                self.class = Some(TypeClass::ElementaryStatic);
                if let Ok(bits) = n.trim_start_matches("uint").parse::<i64>() {
                    set_len(self, bits / 8);
                }
            }
            n if n.starts_with("int") => {
                self.class = Some(TypeClass::ElementaryStatic);
                self.hints.is_signed = true;
                if let Ok(bits) = n.trim_start_matches("int").parse::<i64>() {
                    set_len(self, bits / 8);
                }
            }
            n if n.starts_with("bytes") => {
                self.class = Some(TypeClass::ElementaryStatic);
                if let Ok(len) = n.trim_start_matches("bytes").parse::<i64>() {
                    set_len(self, len);
                }
            }
            _ => self.class = Some(TypeClass::Other),
        }
    }
}

impl fmt::Display for EvmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut this = self.clone();
        this.class();
        if this.type_name.is_empty() {
            write!(f, "{}", this.class_ref().canonical_name())
        } else {
            write!(f, "{}", this.type_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_word_defaults_to_uint256() {
        let mut ty = EvmType::new(TypeHints::default(), Some(32));
        assert_eq!(ty.class(), TypeClass::ElementaryStatic);
        assert_eq!(ty.to_string(), "uint256");
    }

    #[test]
    fn twenty_bytes_is_address_until_widened() {
        let mut ty = EvmType::new(TypeHints::default(), Some(20));
        assert_eq!(ty.to_string(), "address");
        ty.widen_to_contract();
        assert_eq!(ty.to_string(), "user_define_contract");
    }

    #[test]
    fn signed_hint_yields_int() {
        let hints = TypeHints {
            is_signed: true,
            ..Default::default()
        };
        let mut ty = EvmType::new(hints, Some(16));
        assert_eq!(ty.to_string(), "int128");
    }

    #[test]
    fn mapping_hint_wins_over_length() {
        let hints = TypeHints {
            is_mapping: true,
            ..Default::default()
        };
        let mut ty = EvmType::new(hints, Some(32));
        assert_eq!(ty.class(), TypeClass::MappingStatic);
        assert!(!ty.is_dynamic());
    }

    #[test]
    fn widening_containers_to_computable_is_a_noop() {
        let hints = TypeHints {
            is_mapping: true,
            ..Default::default()
        };
        let mut ty = EvmType::new(hints, Some(32));
        ty.widen_to_computable();
        assert_eq!(ty.class(), TypeClass::MappingStatic);
    }

    #[test]
    fn roundtrips_through_rendered_name() {
        let hints = TypeHints {
            is_higher_order: true,
            ..Default::default()
        };
        let ty = EvmType::new(hints, Some(8));
        let name = ty.to_string();
        assert_eq!(name, "bytes8");
        let mut back = EvmType::from_name(&name);
        assert_eq!(back.class(), TypeClass::ElementaryStatic);
        assert_eq!(back.length, 8);
    }
}
