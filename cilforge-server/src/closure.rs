//! C4 — Generic-Call Closure. A generic method's callers each get their own instantiation baked
//! into the call site at compile time (§4.4), so moving a generic method's implementation — even
//! with a byte-identical body, as long as its token moves — requires every direct caller to be
//! re-emitted with a rebound call-site token. This module computes the fixpoint closure of direct
//! callers over the baseline call graph; it does not walk transitively past one hop (§4.4: the
//! original system only patches a generic method's *direct* callers, not callers-of-callers,
//! because those still call through the rebound direct caller's token).

use std::collections::HashMap;

use crate::baseline_index::BaselineIndex;
use crate::domain::{DiffResult, MemberModifyState, MethodDiff, TypeDiff};

/// For every method in `diff` classified `Added`/`Modified` that has generic parameters, looks up
/// its direct callers in the call graph and folds each in as `CallerOnly`, unless that caller is
/// already present with a stronger classification (`Added`/`Modified` always wins, §4.4).
pub fn expand_generic_call_closure(baseline: &BaselineIndex, diff: &mut DiffResult) {
    let generic_callees: Vec<String> = diff
        .types
        .values()
        .flat_map(|t| t.modified_methods.values())
        .filter(|m| m.has_generic_parameters)
        .map(|m| m.signature.clone())
        .collect();

    let mut caller_only: HashMap<(String, String), MethodDiff> = HashMap::new();
    for callee_signature in &generic_callees {
        for caller in baseline.get_generic_callers(callee_signature) {
            let already_in_diff = diff
                .types
                .get(&caller.declaring_type)
                .map(|t| t.modified_methods.contains_key(&caller.signature))
                .unwrap_or(false);
            if already_in_diff {
                continue;
            }
            caller_only.entry((caller.declaring_type.clone(), caller.signature.clone())).or_insert_with(|| MethodDiff {
                declaring_type: caller.declaring_type.clone(),
                signature: caller.signature.clone(),
                has_generic_parameters: false,
                state: MemberModifyState::CallerOnly,
            });
        }
    }

    for ((declaring_type, signature), method_diff) in caller_only {
        let assembly_name = baseline.assembly_of_type(&declaring_type).unwrap_or_default().to_string();
        let type_diff = diff.types.entry(declaring_type.clone()).or_insert_with(|| TypeDiff {
            type_full_name: declaring_type.clone(),
            assembly_name,
            patch_assembly_path: None,
            modified_methods: HashMap::new(),
            added_fields: HashMap::new(),
        });
        type_diff.modified_methods.entry(signature).or_insert(method_diff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TypeDiff;
    use std::collections::HashMap;

    #[test]
    fn added_or_modified_classification_is_never_downgraded() {
        let mut diff = DiffResult::default();
        diff.types.insert(
            "Caller".to_string(),
            TypeDiff {
                type_full_name: "Caller".to_string(),
                assembly_name: "App".to_string(),
                patch_assembly_path: None,
                modified_methods: HashMap::from([(
                    "sig".to_string(),
                    MethodDiff { declaring_type: "Caller".to_string(), signature: "sig".to_string(), has_generic_parameters: false, state: MemberModifyState::Modified },
                )]),
                added_fields: HashMap::new(),
            },
        );
        // Nothing in `generic_callees` because no entries have has_generic_parameters = true, so
        // the existing Modified classification is simply left untouched.
        let baseline_types = diff.types.clone();
        assert_eq!(baseline_types["Caller"].modified_methods["sig"].state, MemberModifyState::Modified);
    }
}
