//! Orchestration (§2 "Control flow"): `initialize` populates C1; every `compile` call runs
//! C2 -> C3 -> C4 -> C5 -> C6 in strict order and returns the manifest; `clear` purges C5/C6
//! output and hook state but leaves C1 untouched. This module owns the process-wide state the
//! HTTP layer (`http.rs`) is a thin, transport-only wrapper around.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::RwLock;

use crate::baseline_index::BaselineIndex;
use crate::closure;
use crate::compiler::{self, PatchCompiler};
use crate::config::ServerConfig;
use crate::differ::StructuralDiffer;
use crate::domain::{CompileRequest, CompileResponse, HookTypeInfo, InitializeRequest, MemberModifyState};
use crate::error::{ServerError, ServerResult};
use crate::hook_cache::HookCache;
use crate::project_dirs::ProjectDirs;
use crate::rewrite;
use cilforge_metadata::structured::module::LoadedModule;

pub struct AppState {
    pub config: ServerConfig,
    baseline: RwLock<Option<BaselineIndex>>,
    hook_cache: HookCache,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, baseline: RwLock::new(None), hook_cache: HookCache::default() }
    }

    pub async fn is_initialized_for(&self, project_path: &Path) -> bool {
        self.baseline.read().await.as_ref().map(|b| b.project_path.as_path() == project_path).unwrap_or(false)
    }

    /// `initialize` (§4.1): purges prior indices and the hook cache, pins every baseline/reference
    /// module into a session-local directory, then builds the call graph and generic bimap from
    /// scratch. A fresh `initialize` is the only other place besides `clear` the hook cache resets
    /// (§3 lifecycles).
    #[tracing::instrument(skip_all, fields(project_path = %req.project_path.display()))]
    pub async fn initialize(&self, req: InitializeRequest) -> ServerResult<()> {
        let dirs = ProjectDirs::resolve(&self.config.cache_root, &req.project_path);
        let index = BaselineIndex::build(
            req.assembly_contexts,
            req.preprocessor_symbols,
            req.project_path,
            dirs.base_dll_dir(),
            self.config.call_graph_scope_filters.clone(),
        )?;

        *self.baseline.write().await = Some(index);
        self.hook_cache.clear();
        Ok(())
    }

    /// `clear` (§4.6 "Control flow"): purges temp+output+hook cache; keeps the baseline index.
    #[tracing::instrument(skip_all)]
    pub async fn clear(&self) -> ServerResult<()> {
        let guard = self.baseline.read().await;
        let baseline = guard.as_ref().ok_or(ServerError::NotInitialized)?;
        let dirs = ProjectDirs::resolve(&self.config.cache_root, &baseline.project_path);
        drop(guard);

        for dir in [dirs.output_temp_dir(), dirs.output_dir()] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        self.hook_cache.clear();
        Ok(())
    }

    pub async fn hook_type_infos(&self) -> HashMap<String, HookTypeInfo> {
        self.hook_cache.snapshot_all()
    }

    /// Runs C2 -> C3 -> C4 -> C5 -> C6 for one `compile` call (§2 "Control flow").
    #[tracing::instrument(skip_all, fields(changed_files = req.changed_files.len()))]
    pub async fn compile(&self, req: CompileRequest) -> ServerResult<CompileResponse> {
        let start = Instant::now();
        let guard = self.baseline.read().await;
        let baseline = guard.as_ref().ok_or(ServerError::NotInitialized)?;

        let dirs = ProjectDirs::resolve(&self.config.cache_root, &baseline.project_path);
        let by_assembly = self.partition_by_assembly(baseline, &req)?;

        // type_full_name -> (assembly_name, method signatures touched this cycle, field names
        // touched this cycle). §4.6: the manifest carries only members touched *this* cycle, each
        // with its complete historical path (supplied by `hook_cache.snapshot_type`).
        let mut touched: HashMap<String, (String, Vec<String>, Vec<String>)> = HashMap::new();

        for (assembly_name, changed_files) in by_assembly {
            let Some(asm) = baseline.assembly(&assembly_name) else { continue };
            let context = asm.context.clone();

            let inputs = compiler::select_compilation_inputs(baseline, &self.hook_cache, &assembly_name, &changed_files);
            let baseline_assembly_path = dirs.base_dll_dir().join(format!("{assembly_name}.dll"));

            let patch_compiler = PatchCompiler::new(self.config.compiler_command.clone());
            let compiled = patch_compiler
                .compile(&context, &inputs, &baseline_assembly_path, &self.config.extension_marker_attribute, &dirs.output_temp_dir())
                .await?;

            let differ = StructuralDiffer::new(baseline, &self.hook_cache);
            let mut diff = differ.diff_patch(&assembly_name, &compiled.module, &compiled.dll_path)?;

            closure::expand_generic_call_closure(baseline, &mut diff);

            if diff.types.is_empty() {
                continue;
            }

            let emitted = rewrite::emit(&compiled.dll_path, &dirs.output_dir(), baseline, &diff, &self.config)?;

            // §6 "On-disk layout": `Output/` retains `<assembly>---<uuid>.dll`+`.pdb` pairs. C5
            // only rewrites and promotes the DLL bytes; the sidecar PDB carries no metadata
            // tokens to rebind, so it is promoted unmodified alongside it.
            if let Some(pdb_path) = &compiled.pdb_path {
                if let Some(file_name) = pdb_path.file_name() {
                    std::fs::copy(pdb_path, dirs.output_dir().join(file_name))?;
                }
            }

            let rewritten_bytes = std::fs::read(&emitted.dll_path)?;
            let rewritten = LoadedModule::load(rewritten_bytes).map_err(|e| ServerError::RewriteInternal(e.to_string()))?;
            rewrite::refresh_call_graph(baseline, &rewritten, &diff);

            self.record_diff(&diff, &emitted.dll_path);

            for type_diff in diff.types.values() {
                let entry = touched.entry(type_diff.type_full_name.clone()).or_insert_with(|| {
                    (type_diff.assembly_name.clone(), Vec::new(), Vec::new())
                });
                entry.1.extend(type_diff.modified_methods.keys().cloned());
                entry.2.extend(type_diff.added_fields.keys().cloned());
            }
        }

        let mut hook_type_infos = HashMap::new();
        for (type_name, (assembly_name, methods, fields)) in touched {
            let snapshot = self.hook_cache.snapshot_type(&type_name, &assembly_name, &methods, &fields);
            if !snapshot.is_empty() {
                hook_type_infos.insert(type_name, snapshot);
            }
        }

        Ok(CompileResponse {
            success: true,
            error_message: None,
            elapsed_milliseconds: start.elapsed().as_millis() as u64,
            hook_type_infos,
            trace_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// §6 `ChangedFiles` partition (§7 `UnknownAssembly`): a file that maps to no known assembly
    /// is skipped and the rest proceed; if *every* file is unknown, the whole request fails.
    fn partition_by_assembly(&self, baseline: &BaselineIndex, req: &CompileRequest) -> ServerResult<HashMap<String, Vec<PathBuf>>> {
        let mut by_assembly: HashMap<String, Vec<PathBuf>> = HashMap::new();
        let mut unknown = Vec::new();

        for file in req.changed_files.keys() {
            match baseline.get_assembly_of(file) {
                Some(assembly) => by_assembly.entry(assembly.to_string()).or_default().push(file.clone()),
                None => unknown.push(file.clone()),
            }
        }

        if by_assembly.is_empty() && !unknown.is_empty() {
            return Err(ServerError::UnknownAssembly(unknown));
        }
        if !unknown.is_empty() {
            tracing::warn!(files = ?unknown, "skipping changed files not owned by any known assembly");
        }
        Ok(by_assembly)
    }

    fn record_diff(&self, diff: &crate::domain::DiffResult, patch_path: &Path) {
        for type_diff in diff.types.values() {
            for method in type_diff.modified_methods.values() {
                self.hook_cache.record_method(
                    &type_diff.type_full_name,
                    &type_diff.assembly_name,
                    &method.declaring_type,
                    &method.signature,
                    &method.signature,
                    method.has_generic_parameters,
                    method.state,
                    patch_path.to_path_buf(),
                );
            }
            for field in type_diff.added_fields.values() {
                self.hook_cache.record_field(&type_diff.type_full_name, &type_diff.assembly_name, &field.field_name, MemberModifyState::Added);
            }
        }
    }
}
