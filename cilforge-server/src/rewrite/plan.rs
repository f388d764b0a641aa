//! C5 rewrite planning (§4.5). Pure semantic analysis over a freshly compiled patch module's
//! decoded bodies: decides which operands need baseline-identity rebinding, which field accesses
//! need `FieldResolver`/`FieldHolder` redirection (§6), and which methods need their extension-rename
//! suffix restored. Emission (`rewrite::emit`) consumes the plan without re-deriving any of this.

use std::collections::HashMap;

use cilforge_metadata::structured::body::{self, DecodedInstruction};
use cilforge_metadata::structured::module::LoadedModule;

use crate::baseline_index::BaselineIndex;
use crate::compiler::EXTENSION_RENAME_SUFFIX;
use crate::domain::{DiffResult, MemberModifyState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebindTargetKind {
    Type,
    Method,
    Field,
}

/// An operand in the patch module that resolves, by name, to a baseline type but whose token today
/// points at the patch module's own re-declared copy — "For every TypeReference/MethodReference/
/// FieldReference operand whose scope is the patch module itself but whose fully-qualified name
/// matches a baseline type, replace with an imported reference into the baseline module" (§4.5).
#[derive(Debug, Clone)]
pub struct RebindOperation {
    pub method_row: usize,
    pub instruction_index: usize,
    pub target_kind: RebindTargetKind,
    pub baseline_assembly: String,
    pub declaring_type: String,
    pub member_name: String,
    pub signature: String,
    /// The instruction's own opcode mnemonic (`call`/`callvirt`, `ldfld`/`stfld`/`ldsfld`/..., or
    /// `castclass`/`isinst`/...). Rebinding only ever swaps the operand token, never the opcode, so
    /// emission re-emits this exact byte rather than guessing one from `target_kind` alone.
    pub original_mnemonic: String,
    /// Raw `#Blob` bytes for `member_name`'s signature, read back from the patch module's own
    /// local redeclaration of `declaring_type` (the same member, just homed intra-module today).
    /// `emit` needs the actual blob to mint a `MemberRef`; `signature` above is a display string,
    /// not something a byte-accurate writer could re-derive.
    pub signature_blob: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccessKind {
    Read,
    Write,
    Address,
}

/// A `ldfld`/`stfld`/`ldflda` against a field that was added this cycle, to be redirected through
/// the field-resolver contract (§6: `ldfld` -> `GetHolder` then `ldfld F`; `stfld` -> `Store`;
/// `ldflda` -> `GetHolder` then `GetRef`).
#[derive(Debug, Clone)]
pub struct FieldRedirectOperation {
    pub method_row: usize,
    pub instruction_index: usize,
    pub access: FieldAccessKind,
    pub declaring_type: String,
    pub field_name: String,
    pub field_type_name: String,
    pub is_static: bool,
}

/// A method whose declared name in the emitted module still carries [`EXTENSION_RENAME_SUFFIX`]
/// and must be restored to its original, user-facing name (§4.2 "Post-emit").
#[derive(Debug, Clone)]
pub struct ExtensionRestoreOperation {
    pub method_row: usize,
    pub original_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct RewritePlan {
    pub rebinds: Vec<RebindOperation>,
    pub field_redirects: Vec<FieldRedirectOperation>,
    pub extension_restores: Vec<ExtensionRestoreOperation>,
}

impl RewritePlan {
    pub fn is_empty(&self) -> bool {
        self.rebinds.is_empty() && self.field_redirects.is_empty() && self.extension_restores.is_empty()
    }
}

/// Whether `declaring_type` both (a) is declared by `patch_module` itself, i.e. its reference to
/// this type would otherwise resolve intra-module, and (b) is a type the baseline already knows —
/// the exact condition §4.5 rebinds.
pub fn needs_baseline_rebind(patch_module: &LoadedModule, baseline: &BaselineIndex, declaring_type: &str) -> bool {
    patch_module.type_by_full_name(declaring_type).is_some() && baseline.assembly_of_type(declaring_type).is_some()
}

/// Builds the full rewrite plan for one compiled patch module.
///
/// `added_fields` keys are `(declaring_type, field_name)` pairs sourced from this cycle's
/// [`DiffResult`] — those, and only those, get the field-resolver treatment; accesses to
/// already-existing fields are left as ordinary `ldfld`/`stfld`/`ldflda` once rebound.
pub fn plan_rewrite(
    patch_module: &LoadedModule,
    baseline: &BaselineIndex,
    diff: &DiffResult,
    extension_marker_attribute: &str,
) -> RewritePlan {
    let mut plan = RewritePlan::default();
    let added_fields: HashMap<(&str, &str), ()> = diff
        .types
        .values()
        .flat_map(|t| t.added_fields.values())
        .map(|f| ((f.declaring_type.as_str(), f.field_name.as_str()), ()))
        .collect();

    for ty in patch_module.types() {
        for method in patch_module.methods_of(ty.row_index) {
            if let Some(original) = restore_original_name(&method.name, extension_marker_attribute) {
                plan.extension_restores.push(ExtensionRestoreOperation { method_row: method.row_index, original_name: original });
            }

            let Ok(Some(body)) = patch_module.method_body(method.row_index) else { continue };
            let decoded = body::decode(patch_module, &body);

            for (instruction_index, instr) in decoded.instructions.iter().enumerate() {
                match instr {
                    DecodedInstruction::Call { mnemonic, target } => {
                        if needs_baseline_rebind(patch_module, baseline, &target.declaring_type) {
                            if let Some(assembly) = baseline.assembly_of_type(&target.declaring_type) {
                                let signature_blob = local_method_signature_blob(patch_module, &target.declaring_type, &target.name);
                                plan.rebinds.push(RebindOperation {
                                    method_row: method.row_index,
                                    instruction_index,
                                    target_kind: RebindTargetKind::Method,
                                    baseline_assembly: assembly.to_string(),
                                    declaring_type: target.declaring_type.clone(),
                                    member_name: target.name.clone(),
                                    signature: target.signature.clone(),
                                    original_mnemonic: mnemonic.clone(),
                                    signature_blob,
                                });
                            }
                        }
                    },
                    DecodedInstruction::Field { mnemonic, target } => {
                        let key = (target.declaring_type.as_str(), target.name.as_str());
                        if added_fields.contains_key(&key) {
                            let access = match mnemonic.as_str() {
                                "stfld" | "stsfld" => FieldAccessKind::Write,
                                "ldflda" | "ldsflda" => FieldAccessKind::Address,
                                _ => FieldAccessKind::Read,
                            };
                            let is_static = matches!(mnemonic.as_str(), "ldsfld" | "ldsflda" | "stsfld");
                            plan.field_redirects.push(FieldRedirectOperation {
                                method_row: method.row_index,
                                instruction_index,
                                access,
                                declaring_type: target.declaring_type.clone(),
                                field_name: target.name.clone(),
                                field_type_name: target.type_name.clone(),
                                is_static,
                            });
                        } else if needs_baseline_rebind(patch_module, baseline, &target.declaring_type) {
                            if let Some(assembly) = baseline.assembly_of_type(&target.declaring_type) {
                                let signature_blob = local_field_signature_blob(patch_module, &target.declaring_type, &target.name);
                                plan.rebinds.push(RebindOperation {
                                    method_row: method.row_index,
                                    instruction_index,
                                    target_kind: RebindTargetKind::Field,
                                    baseline_assembly: assembly.to_string(),
                                    declaring_type: target.declaring_type.clone(),
                                    member_name: target.name.clone(),
                                    signature: target.type_name.clone(),
                                    original_mnemonic: mnemonic.clone(),
                                    signature_blob,
                                });
                            }
                        }
                    },
                    DecodedInstruction::Type { mnemonic, name } => {
                        if needs_baseline_rebind(patch_module, baseline, name) {
                            if let Some(assembly) = baseline.assembly_of_type(name) {
                                plan.rebinds.push(RebindOperation {
                                    method_row: method.row_index,
                                    instruction_index,
                                    target_kind: RebindTargetKind::Type,
                                    baseline_assembly: assembly.to_string(),
                                    declaring_type: name.clone(),
                                    member_name: String::new(),
                                    signature: String::new(),
                                    original_mnemonic: mnemonic.clone(),
                                    signature_blob: Vec::new(),
                                });
                            }
                        }
                    },
                    _ => {},
                }
            }
        }
    }

    plan
}

/// Raw signature bytes for `member_name` as declared on `declaring_type`'s local redeclaration in
/// `patch_module`. Empty when the type or member can't be found locally, which leaves `emit` no
/// worse off than a display-string signature would have.
fn local_method_signature_blob(patch_module: &LoadedModule, declaring_type: &str, member_name: &str) -> Vec<u8> {
    let Some(ty) = patch_module.type_by_full_name(declaring_type) else { return Vec::new() };
    patch_module
        .methods_of(ty.row_index)
        .into_iter()
        .find(|m| m.name == member_name)
        .and_then(|m| patch_module.method_signature_blob(m.row_index))
        .map(|b| b.to_vec())
        .unwrap_or_default()
}

fn local_field_signature_blob(patch_module: &LoadedModule, declaring_type: &str, member_name: &str) -> Vec<u8> {
    let Some(ty) = patch_module.type_by_full_name(declaring_type) else { return Vec::new() };
    patch_module
        .fields_of(ty.row_index)
        .into_iter()
        .find(|f| f.name == member_name)
        .and_then(|f| patch_module.field_signature_blob(f.row_index))
        .map(|b| b.to_vec())
        .unwrap_or_default()
}

/// `true` if `name` carries [`EXTENSION_RENAME_SUFFIX`]; the marker attribute argument exists for
/// API symmetry with the documented fallback (§9) and isn't consulted by this suffix-based check.
fn restore_original_name(name: &str, _extension_marker_attribute: &str) -> Option<String> {
    name.strip_suffix(EXTENSION_RENAME_SUFFIX).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restores_suffixed_names_only() {
        assert_eq!(restore_original_name("IsEmpty__Patch__", "attr"), Some("IsEmpty".to_string()));
        assert_eq!(restore_original_name("IsEmpty", "attr"), None);
    }
}
