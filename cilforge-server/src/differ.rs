//! C3 — Structural Differ. Decides, per method/field in a freshly compiled patch module, whether
//! it is unchanged, `Added`, or `Modified` relative to the latest definition the server has seen
//! (§4.3 "Body equivalence").
//!
//! `cilforge_metadata::structured::body` resolves every call/field/type operand to a
//! fully-qualified name and branch targets to instruction-index deltas (see its module docs), so a
//! compiler-generated state machine or closure moving to a new metadata token between compiles
//! never by itself makes an unrelated method's decoded body compare unequal. But `decode` is flat:
//! it never inlines a *different* method's body into the one it was asked to decode, so an edit
//! made only inside an `async` method's `MoveNext` or a lambda's closure method is invisible at the
//! call site that reaches it — `call Builder.Start<TSM>` and `ldftn <M>b__0` are still the same
//! tokens by name even though what they lead to changed. [`bodies_equivalent_recursive`] closes
//! that gap by resolving both of those call shapes back to the method they reach and recursing, so
//! it is always the *outer* method that ends up reported as `Modified`.

use std::path::Path;

use cilforge_metadata::raw::heaps::table::MethodAttributes;
use cilforge_metadata::structured::body::{self, DecodedBody, DecodedInstruction};
use cilforge_metadata::structured::module::{LoadedModule, MethodView, ResolvedCallTarget};

use crate::baseline_index::BaselineIndex;
use crate::domain::{DiffResult, FieldDiff, MemberModifyState, MethodDiff, TypeDiff};
use crate::error::{ServerError, ServerResult};
use crate::hook_cache::HookCache;

/// Bounds the async/nested-closure recursion (§4.3) against a pathological chain of lambdas each
/// capturing the next — real C# nesting never goes this deep.
const MAX_RECURSION_DEPTH: u32 = 8;

pub struct StructuralDiffer<'a> {
    baseline: &'a BaselineIndex,
    hook_cache: &'a HookCache,
}

impl<'a> StructuralDiffer<'a> {
    pub fn new(baseline: &'a BaselineIndex, hook_cache: &'a HookCache) -> Self {
        Self { baseline, hook_cache }
    }

    /// Walks every type declared in `patch_module` (the subset of the assembly C2 recompiled) and
    /// classifies each of its methods/fields against the latest known definition.
    #[tracing::instrument(skip_all, fields(assembly = %assembly_name))]
    pub fn diff_patch(&self, assembly_name: &str, patch_module: &LoadedModule, patch_dll_path: &Path) -> ServerResult<DiffResult> {
        let mut result = DiffResult::default();

        for ty in patch_module.types() {
            if ty.full_name == "<Module>" {
                continue;
            }
            let mut type_diff = TypeDiff {
                type_full_name: ty.full_name.clone(),
                assembly_name: assembly_name.to_string(),
                patch_assembly_path: Some(patch_dll_path.to_path_buf()),
                ..Default::default()
            };

            // Neither the baseline index nor any prior patch cycle has ever heard of this type:
            // every member on it is new this cycle, but §4.3 only records the ones a caller outside
            // the type could actually observe changing — a fresh type's own ctor/accessor bodies
            // are implied by the type itself being Added, not separately interesting.
            let is_new_type = self.baseline.assembly_of_type(&ty.full_name).is_none() && !self.hook_cache.is_known_type(&ty.full_name);

            for method in patch_module.methods_of(ty.row_index) {
                let Ok(Some(body)) = patch_module.method_body(method.row_index) else { continue };
                let new_body = body::decode(patch_module, &body);

                let baseline_assembly = self.baseline.assembly_of_type(&ty.full_name).map(str::to_string);
                let previous = self
                    .baseline
                    .get_latest_method_definition(self.hook_cache, &ty.full_name, &method.signature_ref, baseline_assembly.as_deref())
                    .map_err(|e| ServerError::DiffInternal(e.to_string()))?;

                let state = match previous {
                    None if is_new_type && is_constructor_or_accessor(&method) => None,
                    None => Some(MemberModifyState::Added),
                    Some((old_module, old_row)) => match old_module.method_body(old_row) {
                        Ok(Some(old_body)) => {
                            let old_decoded = body::decode(&old_module, &old_body);
                            (!bodies_equivalent_recursive(&old_module, patch_module, &old_decoded, &new_body, 0)).then_some(MemberModifyState::Modified)
                        },
                        // A previously abstract/extern method now has a body: treat as newly added.
                        Ok(None) => Some(MemberModifyState::Added),
                        Err(e) => return Err(ServerError::DiffInternal(e.to_string())),
                    },
                };

                if let Some(state) = state {
                    type_diff.modified_methods.insert(
                        method.signature_ref.clone(),
                        MethodDiff {
                            declaring_type: ty.full_name.clone(),
                            signature: method.signature_ref.clone(),
                            has_generic_parameters: method.is_generic(),
                            state,
                        },
                    );
                }
            }

            for field in patch_module.fields_of(ty.row_index) {
                let already_known = self
                    .baseline
                    .assembly_of_type(&ty.full_name)
                    .and_then(|_| self.field_exists_in_baseline(&ty.full_name, &field.name))
                    .unwrap_or(false)
                    || self.hook_cache.method_info(&ty.full_name, &field.name).is_some();
                if !already_known {
                    type_diff.added_fields.insert(
                        field.name.clone(),
                        FieldDiff { declaring_type: ty.full_name.clone(), field_name: field.name.clone(), type_name: field.type_name.clone() },
                    );
                }
            }

            if !type_diff.modified_methods.is_empty() || !type_diff.added_fields.is_empty() {
                result.types.insert(ty.full_name.clone(), type_diff);
            }
        }

        Ok(result)
    }

    fn field_exists_in_baseline(&self, type_full_name: &str, field_name: &str) -> Option<bool> {
        let assembly_name = self.baseline.assembly_of_type(type_full_name)?;
        let asm = self.baseline.assembly(assembly_name)?;
        let ty = asm.module.type_by_full_name(type_full_name)?;
        Some(asm.module.fields_of(ty.row_index).iter().any(|f| f.name == field_name))
    }
}

/// `.ctor`/`.cctor`, or a property/event accessor (`get_`/`set_`/`add_`/`remove_`/`raise_` under
/// `SPECIAL_NAME`) — the members §4.3 says a brand-new type's Added-method report should omit,
/// since they only exist because the type does and carry no information beyond that.
fn is_constructor_or_accessor(method: &MethodView) -> bool {
    if method.name == ".ctor" || method.name == ".cctor" {
        return true;
    }
    method.flags.contains(MethodAttributes::SPECIAL_NAME)
        && ["get_", "set_", "add_", "remove_", "raise_"].iter().any(|prefix| method.name.starts_with(prefix))
}

/// Step 1-3 of the body-equivalence predicate (§4.3): instruction count, locals, and
/// exception-handler-clause count must all agree before comparing instruction-by-instruction. A
/// method whose only change is an added/removed/retargeted `try`/`catch` clause over otherwise
/// identical instructions is caught here even though [`DecodedInstruction`] carries no SEH data of
/// its own.
fn structural_prefix_equal(a: &DecodedBody, b: &DecodedBody) -> bool {
    a.instructions.len() == b.instructions.len() && a.locals == b.locals && a.exception_handler_count == b.exception_handler_count
}

/// Flat body comparison: no cross-method recursion, used for the primitive case and as the base
/// every recursive comparison eventually bottoms out to.
pub fn bodies_equivalent(a: &DecodedBody, b: &DecodedBody) -> bool {
    structural_prefix_equal(a, b) && a.instructions.iter().zip(&b.instructions).all(|(x, y)| instructions_equivalent(x, y))
}

/// [`bodies_equivalent`], but additionally resolving through the two call shapes §4.3 requires
/// recursing into: an async-builder `Start<TSM>` invocation (to `TSM::MoveNext`) and a call/ldftn
/// into a `[CompilerGenerated]`, nested closure method. `old_module`/`new_module` are the modules
/// `a`/`b` were decoded from, needed to resolve those targets' own bodies.
pub fn bodies_equivalent_recursive(old_module: &LoadedModule, new_module: &LoadedModule, a: &DecodedBody, b: &DecodedBody, depth: u32) -> bool {
    structural_prefix_equal(a, b)
        && a.instructions
            .iter()
            .zip(&b.instructions)
            .all(|(x, y)| instructions_equivalent_recursive(old_module, new_module, x, y, depth))
}

/// The operand comparison policy (§4.3): primitives compare exactly except floating-point
/// constants, which tolerate `1e-4` to absorb the re-parse/re-emit rounding a recompile can
/// introduce — `DecodedInstruction::LoadFloatConst` carries both `ldc.r4` and `ldc.r8` widened to
/// `f64`, so the same tolerance is applied uniformly rather than trying to recover the original
/// width.
fn instructions_equivalent(a: &DecodedInstruction, b: &DecodedInstruction) -> bool {
    match (a, b) {
        (DecodedInstruction::LoadFloatConst(x), DecodedInstruction::LoadFloatConst(y)) => (x - y).abs() < 1e-4,
        _ => a == b,
    }
}

/// [`instructions_equivalent`] plus the two required recursion rules. A `Call`/`ldftn` instruction
/// that already differs on its own fields (mnemonic, target name/type/signature) is reported
/// unequal immediately, exactly as the flat comparison would — recursion only ever needs to
/// override an outer comparison that otherwise looks equal, to catch a change reachable only
/// through that call.
fn instructions_equivalent_recursive(
    old_module: &LoadedModule,
    new_module: &LoadedModule,
    a: &DecodedInstruction,
    b: &DecodedInstruction,
    depth: u32,
) -> bool {
    let (DecodedInstruction::Call { mnemonic: am, target: at }, DecodedInstruction::Call { mnemonic: bm, target: bt }) = (a, b) else {
        return instructions_equivalent(a, b);
    };
    if am != bm || at != bt || depth >= MAX_RECURSION_DEPTH {
        return instructions_equivalent(a, b);
    }

    if let (Some(old_move_next), Some(new_move_next)) = (async_state_machine_move_next(old_module, at), async_state_machine_move_next(new_module, bt)) {
        return method_bodies_equivalent_by_name(old_module, new_module, &old_move_next, "MoveNext", &new_move_next, "MoveNext", depth + 1);
    }

    if is_compiler_generated_nested_method(old_module, &at.declaring_type) && is_compiler_generated_nested_method(new_module, &bt.declaring_type) {
        return method_bodies_equivalent_by_name(old_module, new_module, &at.declaring_type, &at.name, &bt.declaring_type, &bt.name, depth + 1);
    }

    true
}

/// Rule (a): `target` is a `MethodReference` to `AsyncTaskMethodBuilder[<T>]::Start<TStateMachine>`
/// (or any sibling builder — `AsyncVoidMethodBuilder`, `AsyncValueTaskMethodBuilder`, ...) — the
/// compiler always reaches it through a `MethodSpec`, so the instantiated state-machine type name
/// is `target.generic_args[0]`. Returns that type's fully-qualified name once it is confirmed to
/// declare a `MoveNext` method.
fn async_state_machine_move_next(module: &LoadedModule, target: &ResolvedCallTarget) -> Option<String> {
    if target.name != "Start" || target.generic_args.len() != 1 || !target.declaring_type.contains("MethodBuilder") {
        return None;
    }
    let state_machine_type = &target.generic_args[0];
    let ty = module.type_by_full_name(state_machine_type)?;
    module.methods_of(ty.row_index).into_iter().find(|m| m.name == "MoveNext")?;
    Some(state_machine_type.clone())
}

/// Rule (b): `declaring_type` is both nested and marked `[CompilerGenerated]` — a lambda closure or
/// local function's synthesized home, per ECMA-335's `IsNested` visibility sub-field plus the
/// attribute the C# compiler always emits on these types.
fn is_compiler_generated_nested_method(module: &LoadedModule, declaring_type: &str) -> bool {
    let Some(ty) = module.type_by_full_name(declaring_type) else { return false };
    module.type_is_nested(ty.row_index) && module.type_has_custom_attribute(ty.row_index, "CompilerGeneratedAttribute")
}

/// Resolves `old_method`/`new_method` by name on `old_type`/`new_type` in their respective modules
/// and recurses. Either side failing to resolve (a renamed or vanished nested type/method) is
/// treated as a change rather than silently skipped, so the outer call site is never wrongly
/// reported equivalent.
fn method_bodies_equivalent_by_name(
    old_module: &LoadedModule,
    new_module: &LoadedModule,
    old_type: &str,
    old_method: &str,
    new_type: &str,
    new_method: &str,
    depth: u32,
) -> bool {
    let decode_named = |module: &LoadedModule, type_name: &str, method_name: &str| -> Option<DecodedBody> {
        let ty = module.type_by_full_name(type_name)?;
        let method = module.methods_of(ty.row_index).into_iter().find(|m| m.name == method_name)?;
        let body = module.method_body(method.row_index).ok()??;
        Some(body::decode(module, &body))
    };

    match (decode_named(old_module, old_type, old_method), decode_named(new_module, new_type, new_method)) {
        (Some(old_body), Some(new_body)) => bodies_equivalent_recursive(old_module, new_module, &old_body, &new_body, depth),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_with(instructions: Vec<DecodedInstruction>) -> DecodedBody {
        DecodedBody { max_stack_size: 8, init_locals: true, locals: vec![], instructions, exception_handler_count: 0 }
    }

    #[test]
    fn float_constants_within_tolerance_are_equivalent() {
        let a = body_with(vec![DecodedInstruction::LoadFloatConst(1.0)]);
        let b = body_with(vec![DecodedInstruction::LoadFloatConst(1.0 + 5e-5)]);
        assert!(bodies_equivalent(&a, &b));
    }

    #[test]
    fn float_constants_outside_tolerance_differ() {
        let a = body_with(vec![DecodedInstruction::LoadFloatConst(1.0)]);
        let b = body_with(vec![DecodedInstruction::LoadFloatConst(1.1)]);
        assert!(!bodies_equivalent(&a, &b));
    }

    #[test]
    fn differing_instruction_counts_are_not_equivalent() {
        let a = body_with(vec![DecodedInstruction::Op("nop".into())]);
        let b = body_with(vec![DecodedInstruction::Op("nop".into()), DecodedInstruction::Op("nop".into())]);
        assert!(!bodies_equivalent(&a, &b));
    }

    #[test]
    fn branch_targets_compare_by_delta_not_identity() {
        let a = body_with(vec![DecodedInstruction::Branch { mnemonic: "br".into(), target: 2 }]);
        let b = body_with(vec![DecodedInstruction::Branch { mnemonic: "br".into(), target: 2 }]);
        assert!(bodies_equivalent(&a, &b));
    }

    #[test]
    fn differing_exception_handler_counts_are_not_equivalent() {
        let mut a = body_with(vec![DecodedInstruction::Op("nop".into())]);
        let mut b = body_with(vec![DecodedInstruction::Op("nop".into())]);
        a.exception_handler_count = 1;
        b.exception_handler_count = 0;
        assert!(!bodies_equivalent(&a, &b));
    }

    #[test]
    fn ctor_and_accessors_are_recognized() {
        fn view(name: &str, flags: MethodAttributes) -> MethodView {
            MethodView {
                row_index: 0,
                declaring_type: "N.T".into(),
                name: name.into(),
                generic_param_names: vec![],
                signature_ref: String::new(),
                signature_def: String::new(),
                flags,
                impl_flags: Default::default(),
                rva: 0,
            }
        }
        assert!(is_constructor_or_accessor(&view(".ctor", MethodAttributes::PUBLIC)));
        assert!(is_constructor_or_accessor(&view(".cctor", MethodAttributes::PRIVATE)));
        assert!(is_constructor_or_accessor(&view("get_Count", MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME)));
        assert!(!is_constructor_or_accessor(&view("get_Count", MethodAttributes::PUBLIC)));
        assert!(!is_constructor_or_accessor(&view("DoWork", MethodAttributes::PUBLIC)));
    }
}
