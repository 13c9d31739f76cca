//! Compiled hook modules.
//!
//! [`ModuleRegistry`] compiles `.wasm` bytes once and keeps the resulting
//! [`Module`] for every later invocation.  Modules are checked at load time
//! for the exports the calling convention needs, so a bad module fails when
//! it is loaded rather than on its first trigger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use wasmtime::{Engine, ExternType, FuncType, Module, ValType};

use crate::error::{HostError, Result};

/// Exported memory every hook module must provide.
pub const MEMORY_EXPORT: &str = "memory";
/// `(size: i32) -> i32`
pub const ALLOC_EXPORT: &str = "hookbridge_alloc";
/// `(ptr: i32)`
pub const FREE_EXPORT: &str = "hookbridge_free";
/// `(ptr: i32, len: i32) -> i32`
pub const RUN_EXPORT: &str = "hookbridge_run";

/// Metadata describing a loaded module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    /// Unique name (lookup key).
    pub name: String,
    /// Size of the `.wasm` binary.
    pub size_bytes: usize,
    pub loaded_at: DateTime<Utc>,
    /// Every export name, in declaration order.
    pub exports: Vec<String>,
}

pub(crate) struct LoadedModule {
    pub info: ModuleInfo,
    pub module: Module,
}

/// Registry of compiled modules, in load order.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<LoadedModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile, check and register `wasm_bytes` under `name`.
    ///
    /// Fails rather than overwrite an existing module of the same name.
    pub fn load(&mut self, name: &str, wasm_bytes: &[u8], engine: &Engine) -> Result<&ModuleInfo> {
        if self.modules.iter().any(|m| m.info.name == name) {
            return Err(HostError::Module {
                reason: format!("module '{name}' is already loaded"),
            });
        }

        let module =
            Module::new(engine, wasm_bytes).map_err(|e| HostError::Compilation(e.to_string()))?;
        check_exports(name, &module)?;

        let info = ModuleInfo {
            name: name.to_owned(),
            size_bytes: wasm_bytes.len(),
            loaded_at: Utc::now(),
            exports: module.exports().map(|e| e.name().to_owned()).collect(),
        };
        tracing::info!(module = name, size_bytes = info.size_bytes, "compiled hook module");

        self.modules.push(LoadedModule { info, module });
        let loaded = self.modules.last().ok_or_else(|| HostError::Module {
            reason: format!("module '{name}' vanished after load"),
        })?;
        Ok(&loaded.info)
    }

    pub fn list(&self) -> Vec<&ModuleInfo> {
        self.modules.iter().map(|m| &m.info).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ModuleInfo> {
        self.get_loaded(name).map(|m| &m.info)
    }

    pub(crate) fn get_loaded(&self, name: &str) -> Option<&LoadedModule> {
        self.modules.iter().find(|m| m.info.name == name)
    }

    pub fn unload(&mut self, name: &str) -> Result<()> {
        let idx = self
            .modules
            .iter()
            .position(|m| m.info.name == name)
            .ok_or_else(|| HostError::Module {
                reason: format!("module '{name}' not found"),
            })?;
        self.modules.remove(idx);
        tracing::info!(module = name, "unloaded hook module");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

fn check_exports(name: &str, module: &Module) -> Result<()> {
    let missing = |export: &str, want: &str| HostError::Module {
        reason: format!("module '{name}' must export {want} `{export}`"),
    };

    match module.get_export(MEMORY_EXPORT) {
        Some(ExternType::Memory(_)) => {}
        _ => return Err(missing(MEMORY_EXPORT, "a memory")),
    }
    for (export, params, results) in [
        (ALLOC_EXPORT, 1, 1),
        (FREE_EXPORT, 1, 0),
        (RUN_EXPORT, 2, 1),
    ] {
        let signature = match (params, results) {
            (1, 1) => "function (i32) -> i32",
            (1, 0) => "function (i32)",
            _ => "function (i32, i32) -> i32",
        };
        match module.get_export(export) {
            Some(ExternType::Func(ty)) if is_i32_signature(&ty, params, results) => {}
            _ => return Err(missing(export, signature)),
        }
    }
    Ok(())
}

fn is_i32_signature(ty: &FuncType, params: usize, results: usize) -> bool {
    ty.params().len() == params
        && ty.results().len() == results
        && ty
            .params()
            .chain(ty.results())
            .all(|v| matches!(v, ValType::I32))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOOK: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "hookbridge_alloc") (param i32) (result i32) i32.const 8)
          (func (export "hookbridge_free") (param i32))
          (func (export "hookbridge_run") (param i32 i32) (result i32) i32.const 0))
    "#;

    fn engine() -> Engine {
        Engine::default()
    }

    fn hook_wasm() -> Vec<u8> {
        wat::parse_str(HOOK).unwrap()
    }

    #[test]
    fn load_and_list() {
        let mut reg = ModuleRegistry::new();
        let info = reg.load("hook", &hook_wasm(), &engine()).unwrap();
        assert_eq!(info.name, "hook");
        assert!(info.exports.contains(&"hookbridge_run".to_owned()));
        assert_eq!(reg.len(), 1);
        assert!(reg.get("hook").is_some());
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut reg = ModuleRegistry::new();
        let engine = engine();
        reg.load("dup", &hook_wasm(), &engine).unwrap();
        let err = reg.load("dup", &hook_wasm(), &engine).unwrap_err();
        assert!(err.to_string().contains("already loaded"));
    }

    #[test]
    fn invalid_bytes_fail_compilation() {
        let mut reg = ModuleRegistry::new();
        let err = reg.load("bad", b"garbage bytes", &engine()).unwrap_err();
        assert!(matches!(err, HostError::Compilation(_)));
    }

    #[test]
    fn missing_exports_rejected() {
        let mut reg = ModuleRegistry::new();
        let empty = vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];
        let err = reg.load("empty", &empty, &engine()).unwrap_err();
        assert!(err.to_string().contains("memory"));

        let wrong = wat::parse_str(
            r#"(module
                 (memory (export "memory") 1)
                 (func (export "hookbridge_alloc") (param i32) (result i32) i32.const 8)
                 (func (export "hookbridge_free") (param i32))
                 (func (export "hookbridge_run") (param i32) (result i32) i32.const 0))"#,
        )
        .unwrap();
        let err = reg.load("wrong", &wrong, &engine()).unwrap_err();
        assert!(err.to_string().contains("hookbridge_run"));
        assert!(reg.is_empty());
    }

    #[test]
    fn unload() {
        let mut reg = ModuleRegistry::new();
        reg.load("bye", &hook_wasm(), &engine()).unwrap();
        reg.unload("bye").unwrap();
        assert!(reg.is_empty());
        assert!(reg.unload("bye").is_err());
    }
}
