//! Layered process configuration (§2 C8, §9 "Config layering"). Priority, lowest to highest:
//! built-in defaults < an optional TOML file < `CILFORGE_*` environment variables < CLI flags.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

/// The host-engine / stdlib scope-name filter used by the call graph (§6, "Filter policy for
/// call-graph scopes"; §9's first open question). Parameterized rather than baked in, because the
/// original source hardcodes a single engine-specific token.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub cache_root: PathBuf,
    /// Command template used to invoke the external compiler (§2A). The first element is the
    /// executable; `{response}` in a later element is substituted with the path to a generated
    /// response file listing sources, references and options for this compile.
    pub compiler_command: Vec<String>,
    pub call_graph_scope_filters: Vec<String>,
    pub log_format: LogFormat,
    #[serde(with = "tracing_level_serde")]
    pub log_level: tracing::Level,
    /// Extension-method marker attribute full name (§9, second open question).
    pub extension_marker_attribute: String,
    /// Assembly name hosting the `FieldResolver<TOwner>`/`FieldHolder<TField>` contract (§6, §9
    /// third open question: the original source assumes this library is already on every host
    /// process's probing path, so the server only needs its simple name to build an `AssemblyRef`
    /// it can point new `MemberRef`/`TypeSpec` rows at, never its full path).
    pub field_resolver_assembly: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9100".parse().unwrap(),
            cache_root: PathBuf::from(".cilforge"),
            compiler_command: vec!["dotnet".into(), "build".into(), "{response}".into()],
            call_graph_scope_filters: vec!["System".into(), "mscorlib".into()],
            log_format: LogFormat::Pretty,
            log_level: tracing::Level::INFO,
            extension_marker_attribute: "System.Runtime.CompilerServices.ExtensionAttribute".into(),
            field_resolver_assembly: "CilForge.Runtime".into(),
        }
    }
}

/// Partial view of the config used to merge a TOML file: every field optional, `None` means "keep
/// whatever the lower-priority layer already set".
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    listen_addr: Option<SocketAddr>,
    cache_root: Option<PathBuf>,
    compiler_command: Option<Vec<String>>,
    call_graph_scope_filters: Option<Vec<String>>,
    log_format: Option<LogFormat>,
    log_level: Option<String>,
    extension_marker_attribute: Option<String>,
    field_resolver_assembly: Option<String>,
}

impl PartialConfig {
    fn merge_into(self, into: &mut ServerConfig) -> Result<(), String> {
        if let Some(v) = self.listen_addr {
            into.listen_addr = v;
        }
        if let Some(v) = self.cache_root {
            into.cache_root = v;
        }
        if let Some(v) = self.compiler_command {
            into.compiler_command = v;
        }
        if let Some(v) = self.call_graph_scope_filters {
            into.call_graph_scope_filters = v;
        }
        if let Some(v) = self.log_format {
            into.log_format = v;
        }
        if let Some(v) = self.log_level {
            into.log_level = v.parse().map_err(|_| format!("invalid log level {v:?}"))?;
        }
        if let Some(v) = self.extension_marker_attribute {
            into.extension_marker_attribute = v;
        }
        if let Some(v) = self.field_resolver_assembly {
            into.field_resolver_assembly = v;
        }
        Ok(())
    }
}

/// CLI flags. Anything left `None` falls through to the config-file/env/default layers.
#[derive(Debug, Parser)]
#[command(name = "cilforge-server", about = "Hot-reload compile server for a managed-bytecode host")]
pub struct CliArgs {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,
    #[arg(long)]
    pub cache_root: Option<PathBuf>,
}

impl ServerConfig {
    pub fn load(args: &CliArgs) -> Result<Self, String> {
        let mut config = ServerConfig::default();

        if let Some(path) = &args.config {
            let text = std::fs::read_to_string(path).map_err(|e| format!("reading config file {path:?}: {e}"))?;
            let partial: PartialConfig = toml::from_str(&text).map_err(|e| format!("parsing config file {path:?}: {e}"))?;
            partial.merge_into(&mut config)?;
        }

        let mut env_partial = PartialConfig::default();
        if let Ok(v) = std::env::var("CILFORGE_LISTEN_ADDR") {
            env_partial.listen_addr = Some(v.parse().map_err(|_| format!("invalid CILFORGE_LISTEN_ADDR {v:?}"))?);
        }
        if let Ok(v) = std::env::var("CILFORGE_CACHE_ROOT") {
            env_partial.cache_root = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("CILFORGE_LOG_LEVEL") {
            env_partial.log_level = Some(v);
        }
        env_partial.merge_into(&mut config)?;

        if let Some(v) = args.listen_addr {
            config.listen_addr = v;
        }
        if let Some(v) = &args.cache_root {
            config.cache_root = v.clone();
        }

        Ok(config)
    }
}

mod tracing_level_serde {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<tracing::Level, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_any_layer() {
        let config = ServerConfig::default();
        assert_eq!(config.call_graph_scope_filters, vec!["System", "mscorlib"]);
    }

    #[test]
    fn env_overrides_default_but_not_cli() {
        std::env::set_var("CILFORGE_CACHE_ROOT", "/tmp/from-env");
        let args = CliArgs { config: None, listen_addr: None, cache_root: Some(PathBuf::from("/tmp/from-cli")) };
        let config = ServerConfig::load(&args).unwrap();
        assert_eq!(config.cache_root, PathBuf::from("/tmp/from-cli"));
        std::env::remove_var("CILFORGE_CACHE_ROOT");
    }
}
