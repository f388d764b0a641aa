//! C1 — Baseline Index. The one piece of server state that survives across `compile` calls until
//! the next `initialize`: what file belongs to what assembly, what types exist, the call graph
//! built by walking every baseline method body, and the definition/reference-form signature bimap
//! for generic methods (§3, §4.1, §9 "Signature parsing & generics").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cilforge_metadata::structured::body::{self, DecodedBody, DecodedInstruction};
use cilforge_metadata::structured::module::LoadedModule;
use dashmap::{DashMap, DashSet};
use rayon::prelude::*;

use crate::domain::{AssemblyContext, CallerKey};
use crate::error::{ServerError, ServerResult};
use crate::hook_cache::HookCache;

/// Definition-form (`T`, `U`) <-> reference-form (`!!0`, `!!1`) signature pairs for every generic
/// method encountered while indexing. Kept as a dedicated bimap rather than inline string
/// substitution at lookup sites (§9).
#[derive(Debug, Default)]
pub struct GenericSignatureBimap {
    def_to_ref: DashMap<String, String>,
    ref_to_def: DashMap<String, String>,
}

impl GenericSignatureBimap {
    fn insert(&self, definition_form: String, reference_form: String) {
        self.def_to_ref.insert(definition_form.clone(), reference_form.clone());
        self.ref_to_def.insert(reference_form, definition_form);
    }

    pub fn reference_form_of(&self, signature: &str) -> Option<String> {
        self.def_to_ref.get(signature).map(|v| v.clone())
    }

    pub fn definition_form_of(&self, signature: &str) -> Option<String> {
        self.ref_to_def.get(signature).map(|v| v.clone())
    }

    /// I3: both forms of a signature must resolve to the other — used by the differ and C4 to
    /// avoid missing a caller indexed under the form the caller happens to use.
    pub fn both_forms(&self, signature: &str) -> Vec<String> {
        let mut out = vec![signature.to_string()];
        if let Some(other) = self.reference_form_of(signature) {
            out.push(other);
        }
        if let Some(other) = self.definition_form_of(signature) {
            out.push(other);
        }
        out.dedup();
        out
    }
}

/// A loaded baseline module kept alive for the session, plus the client-supplied context that
/// named it.
pub struct BaselineAssembly {
    pub context: AssemblyContext,
    pub module: Arc<LoadedModule>,
}

pub struct BaselineIndex {
    pub project_path: PathBuf,
    pub preprocessor_symbols: Vec<String>,
    pub base_dll_dir: PathBuf,
    assemblies: HashMap<String, BaselineAssembly>,
    file_to_assembly: HashMap<PathBuf, String>,
    /// Conservative: since no managed-language front end runs in this process (§2A/§4.1), a
    /// type's "files" degrade to its owning assembly's whole `SourceFiles[]`. Safe for C2's
    /// input-selection (over-including a file only means recompiling more than strictly needed).
    type_to_assembly: HashMap<String, String>,
    /// Global imports kept per assembly for API parity with the source design; always empty here
    /// for the same reason (no `using`/`import` directive parsing is performed).
    global_imports: HashMap<String, Vec<String>>,
    pub call_graph: DashMap<String, DashSet<CallerKey>>,
    pub generics: GenericSignatureBimap,
    scope_filters: Vec<String>,
}

impl BaselineIndex {
    #[tracing::instrument(skip_all, fields(project_path = %project_path.display(), assemblies = contexts.len()))]
    pub fn build(
        contexts: HashMap<String, AssemblyContext>,
        preprocessor_symbols: Vec<String>,
        project_path: PathBuf,
        base_dll_dir: PathBuf,
        scope_filters: Vec<String>,
    ) -> ServerResult<Self> {
        std::fs::create_dir_all(&base_dll_dir)?;

        let mut assemblies = HashMap::with_capacity(contexts.len());
        let mut file_to_assembly = HashMap::new();
        let mut type_to_assembly = HashMap::new();
        let global_imports = contexts.keys().map(|name| (name.clone(), Vec::new())).collect();

        for (name, context) in contexts {
            let pinned = pin_baseline_module(&base_dll_dir, &context)?;
            let bytes = std::fs::read(&pinned)?;
            let module = Arc::new(LoadedModule::load(bytes).map_err(|e| ServerError::Metadata(e.to_string()))?);

            for file in &context.source_files {
                file_to_assembly.insert(file.clone(), name.clone());
            }
            for ty in module.types() {
                type_to_assembly.insert(ty.full_name, name.clone());
            }

            assemblies.insert(name.clone(), BaselineAssembly { context, module });
        }

        let index = Self {
            project_path,
            preprocessor_symbols,
            base_dll_dir,
            assemblies,
            file_to_assembly,
            type_to_assembly,
            global_imports,
            call_graph: DashMap::new(),
            generics: GenericSignatureBimap::default(),
            scope_filters,
        };

        index.build_call_graph();
        Ok(index)
    }

    /// Walks every baseline method body (one rayon job per top-level type, per §5's bounded
    /// fan-out) and registers a call-graph edge for every non-system callee.
    fn build_call_graph(&self) {
        self.assemblies.par_iter().for_each(|(_, asm)| {
            let module = &asm.module;
            module.types().par_iter().for_each(|ty| {
                for method in module.methods_of(ty.row_index) {
                    let Ok(Some(body)) = module.method_body(method.row_index) else { continue };
                    let decoded = body::decode(module, &body);
                    let caller = CallerKey { declaring_type: method.declaring_type.clone(), signature: method.signature_ref.clone() };
                    self.register_edges(&decoded, &caller);

                    if method.is_generic() {
                        self.generics.insert(method.signature_def.clone(), method.signature_ref.clone());
                    }
                }
            });
        });
    }

    fn register_edges(&self, body: &DecodedBody, caller: &CallerKey) {
        for instr in &body.instructions {
            let DecodedInstruction::Call { target, .. } = instr else { continue };
            if self.is_system_scope(&target.declaring_type) {
                continue;
            }
            let entry = self.call_graph.entry(target.signature.clone()).or_default();
            entry.insert(caller.clone());
        }
    }

    fn is_system_scope(&self, declaring_type: &str) -> bool {
        self.scope_filters.iter().any(|prefix| declaring_type.contains(prefix.as_str()))
    }

    pub fn get_assembly_of(&self, file: &Path) -> Option<&str> {
        self.file_to_assembly.get(file).map(String::as_str)
    }

    pub fn get_types_in(&self, files: &[PathBuf]) -> Vec<String> {
        let assemblies: std::collections::HashSet<&str> = files.iter().filter_map(|f| self.get_assembly_of(f)).collect();
        self.type_to_assembly.iter().filter(|(_, a)| assemblies.contains(a.as_str())).map(|(t, _)| t.clone()).collect()
    }

    pub fn get_files_of(&self, type_name: &str) -> Vec<PathBuf> {
        let Some(assembly) = self.type_to_assembly.get(type_name) else { return Vec::new() };
        self.assemblies.get(assembly).map(|a| a.context.source_files.clone()).unwrap_or_default()
    }

    pub fn get_global_imports(&self, assembly: &str) -> Vec<String> {
        self.global_imports.get(assembly).cloned().unwrap_or_default()
    }

    pub fn assembly(&self, name: &str) -> Option<&BaselineAssembly> {
        self.assemblies.get(name)
    }

    pub fn assembly_of_type(&self, type_name: &str) -> Option<&str> {
        self.type_to_assembly.get(type_name).map(String::as_str)
    }

    pub fn assembly_names(&self) -> impl Iterator<Item = &str> {
        self.assemblies.keys().map(String::as_str)
    }

    /// Merges lookups on both signature forms, per §4.1.
    pub fn get_generic_callers(&self, callee_signature: &str) -> Vec<CallerKey> {
        let mut out = Vec::new();
        for form in self.generics.both_forms(callee_signature) {
            if let Some(callers) = self.call_graph.get(&form) {
                out.extend(callers.iter().map(|c| c.clone()));
            }
        }
        out.sort_by(|a, b| (&a.declaring_type, &a.signature).cmp(&(&b.declaring_type, &b.signature)));
        out.dedup();
        out
    }

    /// Re-walks a single method's body and re-registers its outgoing edges, after C5 rewrites it
    /// (§4.1, "used after C5 rewrites a method"). Callers-of semantics: we only ever *add* edges
    /// here; an in-process patch cycle never removes a caller's own edges, since the method is
    /// being re-registered under the same caller key it already had (writers are idempotent, §5).
    pub fn update_call_graph(&self, module: &LoadedModule, method_row: usize, declaring_type: &str, signature_ref: &str) {
        let Ok(Some(body)) = module.method_body(method_row) else { return };
        let decoded = body::decode(module, &body);
        let caller = CallerKey { declaring_type: declaring_type.to_string(), signature: signature_ref.to_string() };
        self.register_edges(&decoded, &caller);
    }

    /// The sole source of truth for the differ (§4.1): scans the hook cache's historical patch
    /// paths for `type_name`/`signature` from newest to oldest, skipping missing files, and
    /// returns the first hit; falls back to the baseline body.
    pub fn get_latest_method_definition(
        &self,
        hook_cache: &HookCache,
        type_name: &str,
        signature: &str,
        baseline_assembly: Option<&str>,
    ) -> ServerResult<Option<(Arc<LoadedModule>, usize)>> {
        if let Some(info) = hook_cache.method_info(type_name, signature) {
            for path in info.historical_hooked_assembly_paths.iter().rev() {
                if !path.exists() {
                    continue;
                }
                let Ok(bytes) = std::fs::read(path) else { continue };
                let Ok(module) = LoadedModule::load(bytes) else { continue };
                if let Some(ty) = module.type_by_full_name(type_name) {
                    if let Some(method) = module.methods_of(ty.row_index).into_iter().find(|m| m.signature_ref == signature) {
                        return Ok(Some((Arc::new(module), method.row_index)));
                    }
                }
            }
        }

        let assembly_name = baseline_assembly.or_else(|| self.assembly_of_type(type_name));
        let Some(assembly_name) = assembly_name else { return Ok(None) };
        let Some(asm) = self.assembly(assembly_name) else { return Ok(None) };
        let Some(ty) = asm.module.type_by_full_name(type_name) else { return Ok(None) };
        let method = asm.module.methods_of(ty.row_index).into_iter().find(|m| m.signature_ref == signature);
        Ok(method.map(|m| (asm.module.clone(), m.row_index)))
    }
}

/// Copies a baseline module (and its reference DLLs, with debug symbols if present) into a
/// session-local directory so the original files stay unlocked by this process (§4.1).
fn pin_baseline_module(base_dll_dir: &Path, context: &AssemblyContext) -> ServerResult<PathBuf> {
    let dest = base_dll_dir.join(format!("{}.dll", context.name));
    std::fs::copy(&context.output_path, &dest)?;
    copy_sidecar_pdb(&context.output_path, &dest)?;

    for reference in &context.references {
        let ref_dest = base_dll_dir.join(reference.path.file_name().unwrap_or_default());
        if ref_dest != reference.path {
            std::fs::copy(&reference.path, &ref_dest)?;
            copy_sidecar_pdb(&reference.path, &ref_dest)?;
        }
    }

    Ok(dest)
}

fn copy_sidecar_pdb(source: &Path, dest: &Path) -> ServerResult<()> {
    let pdb_source = source.with_extension("pdb");
    if pdb_source.exists() {
        std::fs::copy(&pdb_source, dest.with_extension("pdb"))?;
    }
    Ok(())
}
