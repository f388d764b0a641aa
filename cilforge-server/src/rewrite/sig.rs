//! Hand-rolled ECMA-335 §II.23.2 blob signature encoders. `cilforge_metadata` only ever *reads*
//! blob signatures (§4.5 implementation note in `layout.rs`), so every signature a rewritten
//! method needs — a `MemberRef`'s method signature, a `TypeSpec`'s generic instantiation, a field
//! reference's type — is built by hand here rather than through a shared writer the reader side
//! never needed.

/// ECMA-335 §II.23.2 compressed unsigned integer, mirroring `cilforge_metadata`'s
/// `read_compressed_u32` in the write direction.
pub fn compressed_u32(value: u32) -> Vec<u8> {
    if value < 0x80 {
        vec![value as u8]
    } else if value < 0x4000 {
        let v = value | 0x8000;
        vec![(v >> 8) as u8, v as u8]
    } else {
        let v = value | 0xC000_0000;
        vec![(v >> 24) as u8, (v >> 16) as u8, (v >> 8) as u8, v as u8]
    }
}

/// ELEMENT_TYPE bytes this rewriter needs to hand-encode (§II.23.1.16), restricted to primitives
/// plus the handful of structural tags (CLASS, VALUETYPE, VAR, MVAR, GENERICINST, BYREF) a
/// field-resolver call site can reference.
pub mod element_type {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    pub const OBJECT: u8 = 0x1c;
    pub const GENERICINST: u8 = 0x15;
    pub const MVAR: u8 = 0x1e;

    /// Maps a canonical `System.*` primitive name (as `structured::names::format_type` renders
    /// it) to its single-byte element type. Anything else needs a `TypeDefOrRef` coded index
    /// instead, which this module can't produce without a resolved token — see
    /// `super::encode_primitive_or_object`.
    pub fn primitive(full_name: &str) -> Option<u8> {
        Some(match full_name {
            "System.Void" => VOID,
            "System.Boolean" => BOOLEAN,
            "System.Char" => CHAR,
            "System.SByte" => I1,
            "System.Byte" => U1,
            "System.Int16" => I2,
            "System.UInt16" => U2,
            "System.Int32" => I4,
            "System.UInt32" => U4,
            "System.Int64" => I8,
            "System.UInt64" => U8,
            "System.Single" => R4,
            "System.Double" => R8,
            "System.String" => STRING,
            "System.Object" => OBJECT,
            _ => return None,
        })
    }
}

/// Encodes a field's type for a call-site signature. Primitives get their dedicated element type;
/// anything else is widened to `object` (§9 / DESIGN.md: arbitrary reference *and* value types
/// would need a resolved `TypeDefOrRef` into whatever assembly declares them, which this rewriter
/// doesn't attempt — widening to `object` keeps the generated call well-formed at the cost of an
/// implicit box/unbox the runtime's `FieldHolder<TField>` contract must tolerate for value types
/// outside this primitive set).
pub fn encode_primitive_or_object(type_name: &str) -> Vec<u8> {
    vec![element_type::primitive(type_name).unwrap_or(element_type::OBJECT)]
}

/// A `TypeDefOrRef` coded index (ECMA-335 §II.24.2.6): `(row << 2) | tag`, tag 0=TypeDef,
/// 1=TypeRef, 2=TypeSpec.
pub fn type_def_or_ref_coded(row_1_based: usize, tag: u32) -> u32 {
    ((row_1_based as u32) << 2) | tag
}

/// `class <coded-index>` or `valuetype <coded-index>` signature fragment.
pub fn encode_class_or_valuetype(coded: u32, is_value_type: bool) -> Vec<u8> {
    let mut out = vec![if is_value_type { element_type::VALUETYPE } else { element_type::CLASS }];
    out.extend(compressed_u32(coded));
    out
}

/// `GENERICINST (class|valuetype) <coded-index> <argCount> <arg>...`
pub fn encode_generic_inst(base_coded: u32, is_value_type: bool, args: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![element_type::GENERICINST, if is_value_type { element_type::VALUETYPE } else { element_type::CLASS }];
    out.extend(compressed_u32(base_coded));
    out.extend(compressed_u32(args.len() as u32));
    for arg in args {
        out.extend(arg);
    }
    out
}

pub fn encode_var(index: u32) -> Vec<u8> {
    let mut out = vec![element_type::VAR];
    out.extend(compressed_u32(index));
    out
}

pub fn encode_mvar(index: u32) -> Vec<u8> {
    let mut out = vec![element_type::MVAR];
    out.extend(compressed_u32(index));
    out
}

pub fn encode_byref(inner: Vec<u8>) -> Vec<u8> {
    let mut out = vec![element_type::BYREF];
    out.extend(inner);
    out
}

bitflags::bitflags! {
    pub struct CallingConvention: u8 {
        const DEFAULT = 0x00;
        const HAS_THIS = 0x20;
        const GENERIC = 0x10;
    }
}

/// Builds a method reference signature blob: calling convention, optional generic parameter
/// count, parameter count, return type, parameter types — in that order (§II.23.2.1/.2.2).
pub fn encode_method_ref_sig(calling_convention: CallingConvention, generic_param_count: Option<u32>, return_type: &[u8], params: &[Vec<u8>]) -> Vec<u8> {
    let mut flags = calling_convention.bits();
    if generic_param_count.is_some() {
        flags |= CallingConvention::GENERIC.bits();
    }
    let mut out = vec![flags];
    if let Some(count) = generic_param_count {
        out.extend(compressed_u32(count));
    }
    out.extend(compressed_u32(params.len() as u32));
    out.extend_from_slice(return_type);
    for p in params {
        out.extend(p);
    }
    out
}

/// `FIELD <type>` signature blob (§II.23.2.4).
pub fn encode_field_sig(type_sig: &[u8]) -> Vec<u8> {
    let mut out = vec![0x06u8];
    out.extend(type_sig);
    out
}

/// Wraps a signature body with its own compressed byte-length prefix, the form every `#Blob` heap
/// entry takes (§II.24.2.4).
pub fn length_prefixed(body: Vec<u8>) -> Vec<u8> {
    let mut out = compressed_u32(body.len() as u32);
    out.extend(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_u32_roundtrips_known_boundaries() {
        assert_eq!(compressed_u32(0x03), vec![0x03]);
        assert_eq!(compressed_u32(0x7F), vec![0x7F]);
        assert_eq!(compressed_u32(0x80), vec![0x80, 0x80]);
        assert_eq!(compressed_u32(0x4000), vec![0xC0, 0x00, 0x40, 0x00]);
    }

    #[test]
    fn field_sig_wraps_type_with_calling_tag() {
        let sig = encode_field_sig(&encode_primitive_or_object("System.Int32"));
        assert_eq!(sig, vec![0x06, element_type::I4]);
    }

    #[test]
    fn generic_method_ref_sig_orders_genparams_before_params() {
        let sig = encode_method_ref_sig(
            CallingConvention::HAS_THIS,
            Some(1),
            &encode_generic_inst(type_def_or_ref_coded(1, 1), false, &[encode_mvar(0)]),
            &[encode_primitive_or_object("System.Object"), encode_primitive_or_object("System.String")],
        );
        // HASTHIS|GENERIC, 1 genparam, 2 params, then ret, then params.
        assert_eq!(sig[0], 0x30);
        assert_eq!(sig[1], 0x01);
        assert_eq!(sig[2], 0x02);
    }
}
