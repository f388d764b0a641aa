//! `HookTypeInfoCache` (§3, §4.5, §4.6): the one piece of server state that survives a `compile`
//! cycle but is *not* rebuilt by `initialize` — only `clear` or a fresh `initialize` resets it.
//! Monotonically grows per session: `HookMethodInfo::historical_hooked_assembly_paths` is
//! strictly append-only (I1), which is how the detour engine finds every prior wrapper assembly
//! it has ever hooked a method into.

use std::path::PathBuf;

use dashmap::DashMap;

use crate::domain::{HookFieldInfo, HookMethodInfo, HookTypeInfo, MemberModifyState};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemberKey {
    type_full_name: String,
    signature: String,
}

/// Process-wide, concurrency-safe (§5): writers are idempotent try-adds, never blocking locks
/// held across I/O.
#[derive(Debug, Default)]
pub struct HookCache {
    methods: DashMap<MemberKey, HookMethodInfo>,
    fields: DashMap<MemberKey, HookFieldInfo>,
    type_assembly: DashMap<String, String>,
}

impl HookCache {
    pub fn clear(&self) {
        self.methods.clear();
        self.fields.clear();
        self.type_assembly.clear();
    }

    pub fn method_info(&self, type_full_name: &str, signature: &str) -> Option<HookMethodInfo> {
        let key = MemberKey { type_full_name: type_full_name.to_string(), signature: signature.to_string() };
        self.methods.get(&key).map(|r| r.clone())
    }

    pub fn has_added_member(&self, type_full_name: &str, assembly_name: &str) -> bool {
        let has_added_method = self
            .methods
            .iter()
            .any(|e| e.key().type_full_name == type_full_name && matches!(e.value().member_modify_state, MemberModifyState::Added));
        let has_added_field = self.fields.iter().any(|e| e.key().type_full_name == type_full_name);
        (has_added_method || has_added_field) && self.type_assembly.get(type_full_name).map(|a| a.as_str() == assembly_name).unwrap_or(false)
    }

    pub fn types_with_added_members(&self, assembly_name: &str) -> Vec<String> {
        self.type_assembly
            .iter()
            .filter(|e| e.value().as_str() == assembly_name)
            .map(|e| e.key().clone())
            .filter(|t| self.has_added_member(t, assembly_name))
            .collect()
    }

    pub fn is_known_type(&self, type_full_name: &str) -> bool {
        self.type_assembly.contains_key(type_full_name)
    }

    /// Records/updates a method entry. `new_patch_path` is appended to the historical list
    /// (I1: append-only). `state` reflects *this cycle's* classification; a method already
    /// recorded `Added` stays `Added` in the response the first time it's observed again as
    /// unchanged only because C3/C6 omit it — once touched again it is always `Modified`.
    pub fn record_method(
        &self,
        type_full_name: &str,
        assembly_name: &str,
        declaring_type: &str,
        source_signature: &str,
        wrapper_signature: &str,
        has_generic_parameters: bool,
        state: MemberModifyState,
        new_patch_path: PathBuf,
    ) {
        self.type_assembly.insert(type_full_name.to_string(), assembly_name.to_string());
        let key = MemberKey { type_full_name: type_full_name.to_string(), signature: source_signature.to_string() };
        self.methods
            .entry(key)
            .and_modify(|existing| {
                existing.wrapper_signature = wrapper_signature.to_string();
                existing.member_modify_state = state;
                if !existing.historical_hooked_assembly_paths.contains(&new_patch_path) {
                    existing.historical_hooked_assembly_paths.push(new_patch_path.clone());
                }
            })
            .or_insert_with(|| HookMethodInfo {
                declaring_type: declaring_type.to_string(),
                source_signature: source_signature.to_string(),
                wrapper_signature: wrapper_signature.to_string(),
                has_generic_parameters,
                member_modify_state: state,
                historical_hooked_assembly_paths: vec![new_patch_path],
            });
    }

    pub fn record_field(&self, type_full_name: &str, assembly_name: &str, field_name: &str, state: MemberModifyState) {
        self.type_assembly.insert(type_full_name.to_string(), assembly_name.to_string());
        let key = MemberKey { type_full_name: type_full_name.to_string(), signature: field_name.to_string() };
        self.fields.insert(
            key,
            HookFieldInfo { declaring_type: type_full_name.to_string(), field_name: field_name.to_string(), member_modify_state: state },
        );
    }

    /// Builds the full-history `HookTypeInfo` for one type, restricted to the member keys in
    /// `touched_methods`/`touched_fields` (§4.6: the manifest carries only members touched this
    /// cycle, but each with its complete historical path list).
    pub fn snapshot_type(&self, type_full_name: &str, assembly_name: &str, touched_methods: &[String], touched_fields: &[String]) -> HookTypeInfo {
        let mut modified_methods = std::collections::HashMap::new();
        for sig in touched_methods {
            let key = MemberKey { type_full_name: type_full_name.to_string(), signature: sig.clone() };
            if let Some(info) = self.methods.get(&key) {
                modified_methods.insert(sig.clone(), info.clone());
            }
        }
        let mut added_fields = std::collections::HashMap::new();
        for sig in touched_fields {
            let key = MemberKey { type_full_name: type_full_name.to_string(), signature: sig.clone() };
            if let Some(info) = self.fields.get(&key) {
                added_fields.insert(sig.clone(), info.clone());
            }
        }
        HookTypeInfo { type_full_name: type_full_name.to_string(), assembly_name: assembly_name.to_string(), modified_methods, added_fields }
    }

    /// The whole cache, for `/hook-type-infos` (client-side rebuild on restart, §6).
    pub fn snapshot_all(&self) -> std::collections::HashMap<String, HookTypeInfo> {
        let mut out: std::collections::HashMap<String, HookTypeInfo> = std::collections::HashMap::new();
        for entry in self.type_assembly.iter() {
            let type_name = entry.key().clone();
            let assembly = entry.value().clone();
            let methods: Vec<String> =
                self.methods.iter().filter(|e| e.key().type_full_name == type_name).map(|e| e.key().signature.clone()).collect();
            let fields: Vec<String> =
                self.fields.iter().filter(|e| e.key().type_full_name == type_name).map(|e| e.key().signature.clone()).collect();
            out.insert(type_name.clone(), self.snapshot_type(&type_name, &assembly, &methods, &fields));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historical_paths_are_append_only_and_ordered_oldest_first() {
        let cache = HookCache::default();
        cache.record_method("Foo", "App", "Foo", "Int32 Foo::Y()", "Int32 Foo::Y()", false, MemberModifyState::Added, PathBuf::from("patch-1.dll"));
        cache.record_method(
            "Foo",
            "App",
            "Foo",
            "Int32 Foo::Y()",
            "Int32 Foo::Y()",
            false,
            MemberModifyState::Modified,
            PathBuf::from("patch-2.dll"),
        );

        let info = cache.method_info("Foo", "Int32 Foo::Y()").unwrap();
        assert_eq!(info.historical_hooked_assembly_paths, vec![PathBuf::from("patch-1.dll"), PathBuf::from("patch-2.dll")]);
        assert_eq!(info.member_modify_state, MemberModifyState::Modified);
    }

    #[test]
    fn types_with_added_members_scoped_to_assembly() {
        let cache = HookCache::default();
        cache.record_method("Foo", "App", "Foo", "Int32 Foo::Y()", "Int32 Foo::Y()", false, MemberModifyState::Added, PathBuf::from("p.dll"));
        assert_eq!(cache.types_with_added_members("App"), vec!["Foo".to_string()]);
        assert!(cache.types_with_added_members("OtherAsm").is_empty());
    }
}
