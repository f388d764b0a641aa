//! Canonical signature formatting.
//!
//! Every type, field and method is addressed by a string built the same way regardless of which
//! metadata token happens to carry it in a given module, so a baseline module and a patch module
//! can be compared by name instead of by token (metadata tokens are assigned by the compiler run
//! and drift between independent compilations of otherwise-identical source).

use crate::raw::il::{MethodSignature, TypeSignatureTag};
use crate::raw::indices::coded_index::TypeDefOrRef;

/// Resolves a `TypeDefOrRef` coded index to a fully-qualified dotted name (`Namespace.Type`, with
/// `/` separating a nested type from its enclosing type, matching common IL disassembler output).
pub trait TypeNameResolver {
    fn resolve_type_def_or_ref(&self, index: TypeDefOrRef) -> String;
}

/// Renders a decoded type signature as a canonical string. Generic parameters use their
/// positional (reference) form, `!0`/`!!0`; callers that need the definition form (named type
/// parameters) substitute those tokens afterwards using the owning type or method's own
/// `GenericParam` rows.
pub fn format_type(tag: &TypeSignatureTag, resolver: &impl TypeNameResolver) -> String {
    use TypeSignatureTag::*;
    match tag {
        End => "?".to_string(),
        Void => "System.Void".to_string(),
        Bool => "System.Boolean".to_string(),
        Char => "System.Char".to_string(),
        Int1 => "System.SByte".to_string(),
        UInt1 => "System.Byte".to_string(),
        Int2 => "System.Int16".to_string(),
        UInt2 => "System.UInt16".to_string(),
        Int4 => "System.Int32".to_string(),
        UInt4 => "System.UInt32".to_string(),
        Int8 => "System.Int64".to_string(),
        UInt8 => "System.UInt64".to_string(),
        Float => "System.Single".to_string(),
        Double => "System.Double".to_string(),
        String => "System.String".to_string(),
        IntPtr => "System.IntPtr".to_string(),
        UIntPtr => "System.UIntPtr".to_string(),
        Object => "System.Object".to_string(),
        TypedByRef => "System.TypedReference".to_string(),
        Pointer(inner) => format!("{}*", format_type(&inner.as_tags_tree(), resolver)),
        Reference(inner) => format!("{}&", format_type(&inner.as_tags_tree(), resolver)),
        SzArray(inner) => format!("{}[]", format_type(&inner.as_tags_tree(), resolver)),
        Pinned(inner) => format_type(&inner.as_tags_tree(), resolver),
        Array(elem, shape) => format!("{}[{}]", format_type(&elem.as_tags_tree(), resolver), ",".repeat(shape.rank.saturating_sub(1) as usize)),
        ValueType(t) | ClassType(t) => resolver.resolve_type_def_or_ref(*t),
        CModOpt(t) => format_type(&ValueType(*t), resolver),
        GenericParam(n) => format!("!{n}"),
        MethodGenericParam(n) => format!("!!{n}"),
        GenericInst(inst) => {
            let base = format_type(&inst.ty().as_tags_tree(), resolver);
            let args: Vec<_> = inst.params().map(|p| format_type(&p, resolver)).collect();
            format!("{base}<{}>", args.join(","))
        },
        FnPointer(sig) => format_method_signature_ref("", "", sig, resolver),
        CModReq | Internal | Mod | Sentinel | Type | CAttrBoxed | CAttrFld | CAttrProp | CAttrEnum => "?".to_string(),
    }
}

/// Renders a method's reference-form signature: `ReturnType DeclaringType::Name(Arg1,Arg2)`, with
/// generic method parameters shown as `!!0`, `!!1`, ... Two independently compiled modules
/// describing the same unmodified method produce byte-identical strings.
pub fn format_method_signature_ref(
    declaring_type: &str,
    name: &str,
    sig: &MethodSignature,
    resolver: &impl TypeNameResolver,
) -> String {
    let ret = format_type(&sig.return_type().as_tags_tree(), resolver);
    let params: Vec<String> = sig.parameter_types().signatures().map(|t| format_type(&t, resolver)).collect();
    match declaring_type.is_empty() {
        true => format!("{ret} {name}({})", params.join(",")),
        false => format!("{ret} {declaring_type}::{name}({})", params.join(",")),
    }
}

/// Rewrites the `!!N` reference-form tokens produced by [`format_method_signature_ref`] into the
/// method's own generic parameter names (`T`, `U`, ...), yielding the definition-form signature a
/// human reading the source would recognise. Kept as a dedicated step rather than inline string
/// substitution at call sites, so the definition/reference pair is only ever computed once per
/// method and then looked up from the bimap built while indexing a module.
pub fn reference_to_definition_form(reference_form: &str, generic_param_names: &[String]) -> String {
    let mut out = reference_form.to_string();
    // Replace longest indices first so `!!10` isn't clobbered by a prior `!!1` replacement.
    let mut indices: Vec<usize> = (0..generic_param_names.len()).collect();
    indices.sort_by_key(|i| std::cmp::Reverse(*i));
    for i in indices {
        out = out.replace(&format!("!!{i}"), &generic_param_names[i]);
    }
    out
}
