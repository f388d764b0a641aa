//! Name-resolved views over a single loaded CLI module.

use std::io::Cursor;
use std::sync::Arc;

use crate::raw::assembly::Assembly;
use crate::raw::heaps::table::*;
use crate::raw::heaps::{BlobHeap, BlobIndex, StringHeap, StringIndex, UserStringHeap};
use crate::raw::il::{MethodBody, MethodSignature, TypeSignatureTag};
use crate::raw::indices::coded_index::{CustomAttributeType, MemberRefParent, TypeDefOrRef};
use crate::raw::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::raw::indices::sizes::IndexSizes;
use crate::raw::pe::PEFile;
use crate::structured::names::{format_method_signature_ref, format_type, reference_to_definition_form, TypeNameResolver};
use crate::utilities::FromByteStream;

/// A CLI assembly loaded into memory and kept alive for the rest of the process. A running
/// compile server only ever accumulates modules (one per baseline, one per patch) and never drops
/// one mid-session, so leaking the backing bytes once avoids threading a borrow or an `Arc`
/// through every view this module hands out.
pub struct LoadedModule {
    assembly: Assembly<'static>,
}

/// Blob-encoded signatures (field types, method signatures, generic instantiations) don't
/// actually consult heap index widths once the relevant blob has already been sliced out of the
/// `#Blob` heap; only the coded-index *width inside table rows* depends on the module's real
/// index sizes, and that decoding already happened when the tables were parsed. A throwaway
/// zero-sized `IndexSizes` is therefore safe to reuse across every ad-hoc blob decode below.
fn blob_index_sizes() -> Arc<IndexSizes> {
    Arc::new(IndexSizes::new(0, &[0u32; 55]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeView {
    pub row_index: usize,
    pub full_name: String,
    pub namespace: String,
    pub name: String,
    pub flags: TypeAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldView {
    pub row_index: usize,
    pub declaring_type: String,
    pub name: String,
    pub type_name: String,
    pub flags: FieldAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodView {
    pub row_index: usize,
    pub declaring_type: String,
    pub name: String,
    pub generic_param_names: Vec<String>,
    /// Reference-form signature (`!!0`, `!!1`, ...): stable across recompiles, used as a diff key.
    pub signature_ref: String,
    /// Definition-form signature (own generic parameter names substituted in): used for display.
    pub signature_def: String,
    pub flags: MethodAttributes,
    pub impl_flags: MethodImplAttributes,
    pub rva: u32,
}

impl MethodView {
    pub fn is_generic(&self) -> bool {
        !self.generic_param_names.is_empty()
    }
}

/// The resolved target of a `call`/`callvirt`/`newobj`/`ldftn` instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCallTarget {
    pub declaring_type: String,
    pub name: String,
    pub signature: String,
    /// Non-empty when the operand was a `MethodSpec` (a generic method instantiation), one
    /// formatted type argument per generic parameter.
    pub generic_args: Vec<String>,
}

/// The resolved target of an `ldfld`/`stfld`/`ldsfld`/`stsfld` instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFieldTarget {
    pub declaring_type: String,
    pub name: String,
    pub type_name: String,
}

impl LoadedModule {
    pub fn load(bytes: Vec<u8>) -> std::io::Result<Self> {
        let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        let pe = PEFile::try_from(bytes)?;
        let assembly = Assembly::try_from(pe)?;
        Ok(Self { assembly })
    }

    pub fn assembly(&self) -> &Assembly<'_> {
        &self.assembly
    }

    fn strings(&self) -> &StringHeap<'_> {
        self.assembly.metadata_root().get_heap::<StringHeap>().expect("module has no #Strings heap")
    }

    fn blobs(&self) -> &BlobHeap<'_> {
        self.assembly.metadata_root().get_heap::<BlobHeap>().expect("module has no #Blob heap")
    }

    fn tables(&self) -> &TableHeap {
        self.assembly.metadata_root().get_heap::<TableHeap>().expect("module has no #~ heap")
    }

    fn user_strings(&self) -> Option<&UserStringHeap<'_>> {
        self.assembly.metadata_root().get_heap::<UserStringHeap>()
    }

    fn string(&self, index: StringIndex) -> &str {
        self.strings().get(index).unwrap_or_default()
    }

    fn type_def_table(&self) -> &TypeDefTable {
        self.tables().get_table::<TypeDefTable>().expect("module has no TypeDef table")
    }

    fn type_ref_table(&self) -> Option<&TypeRefTable> {
        self.tables().get_table::<TypeRefTable>()
    }

    fn type_spec_table(&self) -> Option<&TypeSpecTable> {
        self.tables().get_table::<TypeSpecTable>()
    }

    fn field_table(&self) -> Option<&FieldTable> {
        self.tables().get_table::<FieldTable>()
    }

    fn method_def_table(&self) -> Option<&MethodDefTable> {
        self.tables().get_table::<MethodDefTable>()
    }

    fn nested_class_table(&self) -> Option<&NestedClassTable> {
        self.tables().get_table::<NestedClassTable>()
    }

    fn generic_param_table(&self) -> Option<&GenericParamTable> {
        self.tables().get_table::<GenericParamTable>()
    }

    fn standalone_sig_table(&self) -> Option<&StandAloneSigTable> {
        self.tables().get_table::<StandAloneSigTable>()
    }

    fn type_def_full_name(&self, row_index: usize) -> String {
        let row = &self.type_def_table()[row_index];
        let simple = self.string(row.type_name);
        if let Some(nested) = self.nested_class_table() {
            let rid = row_index + 1;
            if let Some(nc) = nested.iter().find(|nc| nc.nested_class.0 == rid) {
                let enclosing = self.type_def_full_name(nc.enclosing_class.0 - 1);
                return format!("{enclosing}/{simple}");
            }
        }
        let namespace = self.string(row.type_namespace);
        match namespace.is_empty() {
            true => simple.to_string(),
            false => format!("{namespace}.{simple}"),
        }
    }

    fn type_ref_full_name(&self, row_index: usize) -> String {
        let table = self.type_ref_table().expect("TypeRef coded index used but module has no TypeRef table");
        let row = &table[row_index];
        let simple = self.string(row.type_name);
        let scope: MetadataToken = row.resolution_scope.into();
        if scope.kind() == MetadataTokenKind::TypeRef {
            let enclosing = self.type_ref_full_name(scope.index() - 1);
            return format!("{enclosing}/{simple}");
        }
        let namespace = self.string(row.type_namespace);
        match namespace.is_empty() {
            true => simple.to_string(),
            false => format!("{namespace}.{simple}"),
        }
    }

    fn type_spec_name(&self, row_index: usize) -> String {
        let Some(table) = self.type_spec_table() else { return "?".to_string() };
        let Some(row) = table.get(row_index) else { return "?".to_string() };
        let Some(blob) = self.blobs().get(row.signature) else { return "?".to_string() };
        let mut stream = Cursor::new(blob);
        let sizes = blob_index_sizes();
        match TypeSignatureTag::read(&mut stream, &sizes) {
            Ok(tag) => format_type(&tag, self),
            Err(_) => "?".to_string(),
        }
    }

    fn field_type_name(&self, signature: BlobIndex) -> String {
        let Some(blob) = self.blobs().get(signature) else { return "?".to_string() };
        let mut stream = Cursor::new(blob);
        let Ok(tag_byte) = u8::read(&mut stream, &()) else { return "?".to_string() };
        if tag_byte != 0x06 {
            return "?".to_string();
        }
        let sizes = blob_index_sizes();
        match TypeSignatureTag::read(&mut stream, &sizes) {
            Ok(tag) => format_type(&tag, self),
            Err(_) => "?".to_string(),
        }
    }

    fn generic_param_names_of(&self, owner_kind: MetadataTokenKind, owner_rid: usize) -> Vec<String> {
        let Some(table) = self.generic_param_table() else { return vec![] };
        let mut params: Vec<&GenericParam> = table
            .iter()
            .filter(|gp| {
                let owner: MetadataToken = gp.owner.into();
                owner.kind() == owner_kind && owner.index() == owner_rid
            })
            .collect();
        params.sort_by_key(|gp| gp.number);
        params.into_iter().map(|gp| self.string(gp.name).to_string()).collect()
    }

    fn method_signature_strings(
        &self,
        signature: BlobIndex,
        generic_param_names: &[String],
        declaring_type: &str,
        name: &str,
    ) -> (String, String) {
        let Some(blob) = self.blobs().get(signature) else { return ("?".to_string(), "?".to_string()) };
        let mut stream = Cursor::new(blob);
        let sizes = blob_index_sizes();
        let Ok(sig) = MethodSignature::read(&mut stream, &sizes) else { return ("?".to_string(), "?".to_string()) };
        let reference_form = format_method_signature_ref(declaring_type, name, &sig, self);
        let definition_form = reference_to_definition_form(&reference_form, generic_param_names);
        (reference_form, definition_form)
    }

    fn field_range(&self, type_row: usize) -> std::ops::Range<usize> {
        let defs = self.type_def_table();
        let start = defs[type_row].field_list.0.saturating_sub(1);
        let end = match defs.get(type_row + 1) {
            Some(next) => next.field_list.0.saturating_sub(1),
            None => self.field_table().map(Table::len).unwrap_or(start),
        };
        start..end.max(start)
    }

    fn method_range(&self, type_row: usize) -> std::ops::Range<usize> {
        let defs = self.type_def_table();
        let start = defs[type_row].method_list.0.saturating_sub(1);
        let end = match defs.get(type_row + 1) {
            Some(next) => next.method_list.0.saturating_sub(1),
            None => self.method_def_table().map(Table::len).unwrap_or(start),
        };
        start..end.max(start)
    }

    fn declaring_type_of_field(&self, field_row: usize) -> Option<String> {
        let defs = self.type_def_table();
        let target = field_row + 1;
        let mut owner = None;
        for i in 0..defs.len() {
            match defs[i].field_list.0 <= target {
                true => owner = Some(i),
                false => break,
            }
        }
        owner.map(|i| self.type_def_full_name(i))
    }

    fn declaring_type_of_method(&self, method_row: usize) -> Option<String> {
        let defs = self.type_def_table();
        let target = method_row + 1;
        let mut owner = None;
        for i in 0..defs.len() {
            match defs[i].method_list.0 <= target {
                true => owner = Some(i),
                false => break,
            }
        }
        owner.map(|i| self.type_def_full_name(i))
    }

    fn member_ref_parent_name(&self, parent: MemberRefParent) -> Option<String> {
        let token: MetadataToken = parent.into();
        match token.kind() {
            MetadataTokenKind::TypeDef => Some(self.type_def_full_name(token.index() - 1)),
            MetadataTokenKind::TypeRef => Some(self.type_ref_full_name(token.index() - 1)),
            MetadataTokenKind::TypeSpec => Some(self.type_spec_name(token.index() - 1)),
            MetadataTokenKind::ModuleRef => {
                let refs = self.tables().get_table::<ModuleRefTable>()?;
                Some(self.string(refs.get(token.index() - 1)?.name).to_string())
            },
            MetadataTokenKind::MethodDef => self.declaring_type_of_method(token.index() - 1),
            _ => None,
        }
    }

    pub fn types(&self) -> Vec<TypeView> {
        (0..self.type_def_table().len()).map(|i| self.type_view(i)).collect()
    }

    pub fn type_view(&self, row_index: usize) -> TypeView {
        let row = &self.type_def_table()[row_index];
        TypeView {
            row_index,
            full_name: self.type_def_full_name(row_index),
            namespace: self.string(row.type_namespace).to_string(),
            name: self.string(row.type_name).to_string(),
            flags: row.flags,
        }
    }

    pub fn type_by_full_name(&self, full_name: &str) -> Option<TypeView> {
        (0..self.type_def_table().len()).map(|i| self.type_view(i)).find(|t| t.full_name == full_name)
    }

    pub fn fields_of(&self, type_row: usize) -> Vec<FieldView> {
        self.field_range(type_row).map(|i| self.field_view(type_row, i)).collect()
    }

    fn field_view(&self, type_row: usize, field_row: usize) -> FieldView {
        let declaring_type = self.type_def_full_name(type_row);
        let row = &self.field_table().expect("type has fields but module has no Field table")[field_row];
        FieldView {
            row_index: field_row,
            declaring_type,
            name: self.string(row.name).to_string(),
            type_name: self.field_type_name(row.signature),
            flags: row.flags,
        }
    }

    pub fn methods_of(&self, type_row: usize) -> Vec<MethodView> {
        self.method_range(type_row).map(|i| self.method_view(type_row, i)).collect()
    }

    fn method_view(&self, type_row: usize, method_row: usize) -> MethodView {
        let declaring_type = self.type_def_full_name(type_row);
        let row = &self.method_def_table().expect("type has methods but module has no MethodDef table")[method_row];
        let name = self.string(row.name).to_string();
        let generic_param_names = self.generic_param_names_of(MetadataTokenKind::MethodDef, method_row + 1);
        let (signature_ref, signature_def) = self.method_signature_strings(row.signature, &generic_param_names, &declaring_type, &name);
        MethodView {
            row_index: method_row,
            declaring_type,
            name,
            generic_param_names,
            signature_ref,
            signature_def,
            flags: row.flags,
            impl_flags: row.impl_flags,
            rva: row.rva,
        }
    }

    /// Decodes the IL body of a method, or `None` for methods with no RVA (abstract, `extern`, or
    /// interface methods).
    pub fn method_body(&self, method_row: usize) -> std::io::Result<Option<MethodBody<'_>>> {
        let Some(methods) = self.method_def_table() else { return Ok(None) };
        let Some(row) = methods.get(method_row) else { return Ok(None) };
        if row.rva == 0 {
            return Ok(None);
        }
        let Some((_, data, _)) = self.assembly.pe_file().resolve_rva(row.rva) else {
            return Err(std::io::ErrorKind::InvalidData.into());
        };
        let mut stream = Cursor::new(data);
        let blob_heap = self.blobs();

        let owned_empty_sigs;
        let signatures = match self.standalone_sig_table() {
            Some(table) => table,
            None => {
                owned_empty_sigs = StandAloneSigTable::read(&mut Cursor::new(&[][..]), &IndexSizes::new(0, &[0u32; 55]), 0)?;
                &owned_empty_sigs
            },
        };

        let sizes = blob_index_sizes();
        Ok(Some(MethodBody::read(&mut stream, blob_heap, signatures, &sizes)?))
    }

    /// Resolves a `call`/`callvirt`/`newobj`/`ldftn`/`ldvirtftn` operand token to the method it
    /// names, following `MethodSpec` through to its generic instantiation arguments.
    pub fn resolve_call_target(&self, token: MetadataToken) -> Option<ResolvedCallTarget> {
        match token.kind() {
            MetadataTokenKind::MethodDef => {
                let row_index = token.index() - 1;
                let row = self.method_def_table()?.get(row_index)?;
                let declaring_type = self.declaring_type_of_method(row_index)?;
                let name = self.string(row.name).to_string();
                let generic_param_names = self.generic_param_names_of(MetadataTokenKind::MethodDef, row_index + 1);
                let (signature, _) = self.method_signature_strings(row.signature, &generic_param_names, &declaring_type, &name);
                Some(ResolvedCallTarget { declaring_type, name, signature, generic_args: vec![] })
            },
            MetadataTokenKind::MemberRef => {
                let row_index = token.index() - 1;
                let row = self.tables().get_table::<MemberRefTable>()?.get(row_index)?;
                let declaring_type = self.member_ref_parent_name(row.class)?;
                let name = self.string(row.name).to_string();
                let blob = self.blobs().get(row.signature)?;
                let mut stream = Cursor::new(blob);
                let sizes = blob_index_sizes();
                let sig = MethodSignature::read(&mut stream, &sizes).ok()?;
                let signature = format_method_signature_ref(&declaring_type, &name, &sig, self);
                Some(ResolvedCallTarget { declaring_type, name, signature, generic_args: vec![] })
            },
            MetadataTokenKind::MethodSpec => {
                let row_index = token.index() - 1;
                let row = self.tables().get_table::<MethodSpecTable>()?.get(row_index)?;
                let base_token: MetadataToken = row.method.into();
                let mut target = self.resolve_call_target(base_token)?;
                if let Some(blob) = self.blobs().get(row.instantiation) {
                    let mut stream = Cursor::new(blob);
                    if u8::read(&mut stream, &()).ok() == Some(0x0A) {
                        let sizes = blob_index_sizes();
                        if let Ok(count) = crate::utilities::read_compressed_u32(&mut stream) {
                            let mut args = Vec::with_capacity(count as usize);
                            for _ in 0..count {
                                match TypeSignatureTag::read(&mut stream, &sizes) {
                                    Ok(tag) => args.push(format_type(&tag, self)),
                                    Err(_) => break,
                                }
                            }
                            target.generic_args = args;
                        }
                    }
                }
                Some(target)
            },
            _ => None,
        }
    }

    /// Resolves an `ldfld`/`stfld`/`ldsfld`/`stsfld` operand token to the field it names.
    pub fn resolve_field_target(&self, token: MetadataToken) -> Option<ResolvedFieldTarget> {
        match token.kind() {
            MetadataTokenKind::Field => {
                let row_index = token.index() - 1;
                let row = self.field_table()?.get(row_index)?;
                let declaring_type = self.declaring_type_of_field(row_index)?;
                Some(ResolvedFieldTarget {
                    declaring_type,
                    name: self.string(row.name).to_string(),
                    type_name: self.field_type_name(row.signature),
                })
            },
            MetadataTokenKind::MemberRef => {
                let row_index = token.index() - 1;
                let row = self.tables().get_table::<MemberRefTable>()?.get(row_index)?;
                let declaring_type = self.member_ref_parent_name(row.class)?;
                let blob = self.blobs().get(row.signature)?;
                let mut stream = Cursor::new(blob);
                if u8::read(&mut stream, &()).ok() != Some(0x06) {
                    return None;
                }
                let sizes = blob_index_sizes();
                let tag = TypeSignatureTag::read(&mut stream, &sizes).ok()?;
                Some(ResolvedFieldTarget {
                    declaring_type,
                    name: self.string(row.name).to_string(),
                    type_name: format_type(&tag, self),
                })
            },
            _ => None,
        }
    }

    /// Resolves a raw metadata token naming a type directly (the operand of `newarr`,
    /// `castclass`, `isinst`, `box`, `unbox[_any]`, `initobj`, `sizeof`, ...) to a fully-qualified
    /// name. Unlike [`TypeNameResolver::resolve_type_def_or_ref`] this takes the plain
    /// `MetadataToken` IL operands carry rather than a `TypeDefOrRef` coded index.
    pub fn resolve_type_token(&self, token: MetadataToken) -> String {
        match token.kind() {
            MetadataTokenKind::TypeDef => self.type_def_full_name(token.index() - 1),
            MetadataTokenKind::TypeRef => self.type_ref_full_name(token.index() - 1),
            MetadataTokenKind::TypeSpec => self.type_spec_name(token.index() - 1),
            _ => "?".to_string(),
        }
    }

    /// Resolves a `ldstr` operand to the UTF-16 literal it carries.
    pub fn resolve_user_string(&self, token: MetadataToken) -> Option<String> {
        if token.kind() != MetadataTokenKind::String {
            return None;
        }
        self.user_strings()?.get(token.index())
    }

    /// Finds the `AssemblyRef` row (1-based RID) naming `assembly_name`, if this module already
    /// references it. A recompiled patch module always carries one for every `/reference:` it was
    /// given, so this never needs to append a new row itself.
    pub fn assembly_ref_row_by_name(&self, assembly_name: &str) -> Option<usize> {
        let table = self.tables().get_table::<AssemblyRefTable>()?;
        table.iter().position(|row| self.string(row.name) == assembly_name).map(|i| i + 1)
    }

    /// Raw RVA a `MethodDef` row currently points its body at (0 for bodiless methods). Needed
    /// by a rewriter patching that RVA after re-emitting a method's body elsewhere in the file.
    pub fn method_rva(&self, method_row: usize) -> Option<u32> {
        self.method_def_table()?.get(method_row).map(|r| r.rva)
    }

    /// Raw method signature blob (no length prefix, no calling-convention interpretation) of an
    /// existing `MethodDef`. Lets a caller reuse an already-correct signature verbatim when
    /// building a `MemberRef` into another module for the same method, instead of re-deriving it
    /// from the method's formatted name/signature strings.
    pub fn method_signature_blob(&self, method_row: usize) -> Option<&[u8]> {
        let row = self.method_def_table()?.get(method_row)?;
        self.blobs().get(row.signature)
    }

    /// Raw field signature blob (no length prefix), for the same reason as
    /// [`Self::method_signature_blob`].
    pub fn field_signature_blob(&self, field_row: usize) -> Option<&[u8]> {
        let row = self.field_table()?.get(field_row)?;
        self.blobs().get(row.signature)
    }

    /// `true` if `type_row`'s `VISIBILITY_MASK` bits name a nested visibility (ECMA-335 II.23.1.15)
    /// — the value-encoded sub-field runs `NotPublic`(0)..`Public`(1) then `NestedPublic`(2) up, so
    /// nested-ness is "visibility >= NestedPublic", not a single independent bit.
    pub fn type_is_nested(&self, type_row: usize) -> bool {
        let flags = self.type_def_table()[type_row].flags;
        (flags.bits() & TypeAttributes::VISIBILITY_MASK.bits()) >= TypeAttributes::NESTED_PUBLIC.bits()
    }

    /// `true` if `type_row` carries a `CustomAttribute` row whose constructor's declaring type's
    /// simple name is `attribute_short_name` (`"CompilerGeneratedAttribute"`, not the
    /// fully-qualified BCL name, since the ctor is almost always reached through a `MemberRef` into
    /// an external assembly rather than a local `TypeDef`).
    pub fn type_has_custom_attribute(&self, type_row: usize, attribute_short_name: &str) -> bool {
        let Some(attrs) = self.tables().get_table::<CustomAttributeTable>() else { return false };
        attrs.iter().any(|ca| {
            let parent: MetadataToken = ca.parent.into();
            if parent.kind() != MetadataTokenKind::TypeDef || parent.index() - 1 != type_row {
                return false;
            }
            self.custom_attribute_ctor_type_name(ca.ty)
                .as_deref()
                .and_then(|n| n.rsplit(['.', '/']).next())
                == Some(attribute_short_name)
        })
    }

    fn custom_attribute_ctor_type_name(&self, ty: CustomAttributeType) -> Option<String> {
        let token: MetadataToken = ty.into();
        match token.kind() {
            MetadataTokenKind::MethodDef => self.declaring_type_of_method(token.index() - 1),
            MetadataTokenKind::MemberRef => {
                let row = self.tables().get_table::<MemberRefTable>()?.get(token.index() - 1)?;
                self.member_ref_parent_name(row.class)
            },
            _ => None,
        }
    }
}

impl TypeNameResolver for LoadedModule {
    fn resolve_type_def_or_ref(&self, index: TypeDefOrRef) -> String {
        let token: MetadataToken = index.into();
        match token.kind() {
            MetadataTokenKind::TypeDef => self.type_def_full_name(token.index() - 1),
            MetadataTokenKind::TypeRef => self.type_ref_full_name(token.index() - 1),
            MetadataTokenKind::TypeSpec => self.type_spec_name(token.index() - 1),
            _ => "?".to_string(),
        }
    }
}
