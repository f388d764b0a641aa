//! Wire-facing and persistent data model: everything §3 and §6 of the design describe as a
//! "thing" rather than an operation. Kept free of any cilforge-metadata or I/O dependency so it
//! can be serialized, cloned into a response, and unit-tested in isolation.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One project-relative compilation unit, as supplied by the client on `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssemblyContext {
    pub name: String,
    /// Baseline module path (the DLL the host engine already loaded).
    pub output_path: PathBuf,
    pub source_files: Vec<PathBuf>,
    pub references: Vec<ReferenceContext>,
    pub preprocessor_defines: Vec<String>,
    pub allow_unsafe_code: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReferenceContext {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitializeRequest {
    pub assembly_contexts: HashMap<String, AssemblyContext>,
    #[serde(default)]
    pub preprocessor_symbols: Vec<String>,
    pub project_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompileRequest {
    /// Absolute path -> advisory last-modified timestamp. The differ is content-based, so the
    /// timestamp is carried through only for client-side bookkeeping (§6).
    pub changed_files: HashMap<PathBuf, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct CompileResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub elapsed_milliseconds: u64,
    pub hook_type_infos: HashMap<String, HookTypeInfo>,
    pub trace_id: String,
}

/// How a member came to be in the diff set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberModifyState {
    Added,
    Modified,
    /// Source body unchanged; the method is only here because a callee it invokes via a generic
    /// instantiation moved (§4.4). C5 rewrites the body to rebind the callee token; C3 never
    /// produces this variant directly.
    CallerOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HookMethodInfo {
    pub declaring_type: String,
    /// The signature the baseline/host engine already knows this method by.
    pub source_signature: String,
    /// The signature of the method in the emitted patch module (identical to `source_signature`
    /// once C2's extension-method de-rename step has run; kept distinct because the patch
    /// compiler's intermediate `__Patch__`-suffixed form briefly differs).
    pub wrapper_signature: String,
    pub has_generic_parameters: bool,
    pub member_modify_state: MemberModifyState,
    /// Oldest first, current last (§5 ordering guarantee / I1).
    pub historical_hooked_assembly_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HookFieldInfo {
    pub declaring_type: String,
    pub field_name: String,
    pub member_modify_state: MemberModifyState,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct HookTypeInfo {
    pub type_full_name: String,
    pub assembly_name: String,
    pub modified_methods: HashMap<String, HookMethodInfo>,
    pub added_fields: HashMap<String, HookFieldInfo>,
}

impl HookTypeInfo {
    pub fn is_empty(&self) -> bool {
        self.modified_methods.is_empty() && self.added_fields.is_empty()
    }
}

/// The per-cycle result C3/C4 hand to C5/C6, before it is merged into the persistent hook cache.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Type full name -> per-type diff.
    pub types: HashMap<String, TypeDiff>,
}

#[derive(Debug, Clone, Default)]
pub struct TypeDiff {
    pub type_full_name: String,
    pub assembly_name: String,
    pub patch_assembly_path: Option<PathBuf>,
    pub modified_methods: HashMap<String, MethodDiff>,
    pub added_fields: HashMap<String, FieldDiff>,
}

#[derive(Debug, Clone)]
pub struct MethodDiff {
    pub declaring_type: String,
    pub signature: String,
    pub has_generic_parameters: bool,
    pub state: MemberModifyState,
}

#[derive(Debug, Clone)]
pub struct FieldDiff {
    pub declaring_type: String,
    pub field_name: String,
    pub type_name: String,
}

/// Declaring-type + signature: identifies a caller edge in the call graph (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerKey {
    pub declaring_type: String,
    pub signature: String,
}
