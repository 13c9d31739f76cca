//! Module loader.
//!
//! [`ModuleLoader`] discovers `.wasm` hook modules in a directory and loads
//! them into a shared [`HookRuntime`].  Compilation and invocation are
//! CPU-bound and run on tokio's blocking pool; invocations run on a
//! [`PreparedHook`](crate::runtime::PreparedHook) outside the runtime lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{HostError, Result};
use crate::modules::ModuleInfo;
use crate::runtime::{HookOutput, HookRuntime};
use crate::trigger::Trigger;

/// Discovers and loads hook modules from a directory.
pub struct ModuleLoader {
    runtime: Arc<Mutex<HookRuntime>>,
    modules_dir: PathBuf,
    loaded_names: Vec<String>,
}

impl ModuleLoader {
    pub fn new(modules_dir: PathBuf, runtime: Arc<Mutex<HookRuntime>>) -> Self {
        tracing::info!(modules_dir = %modules_dir.display(), "module loader created");
        Self {
            runtime,
            modules_dir,
            loaded_names: Vec::new(),
        }
    }

    pub fn runtime(&self) -> Arc<Mutex<HookRuntime>> {
        Arc::clone(&self.runtime)
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    /// Load every `.wasm` file in `modules_dir`, in file-name order.
    ///
    /// Modules that fail to load are logged and skipped.
    pub async fn load_all(&mut self) -> Result<Vec<ModuleInfo>> {
        let dir = self.modules_dir.clone();

        if !dir.exists() {
            tracing::warn!(path = %dir.display(), "modules directory does not exist");
            return Ok(Vec::new());
        }
        if !dir.is_dir() {
            return Err(HostError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("{} is not a directory", dir.display()),
            )));
        }

        let mut entries: Vec<PathBuf> = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("wasm") {
                entries.push(path);
            }
        }
        entries.sort();

        tracing::info!(
            modules_dir = %dir.display(),
            count = entries.len(),
            "discovered wasm hook modules"
        );

        let mut loaded = Vec::with_capacity(entries.len());
        for path in &entries {
            match self.load_module(path).await {
                Ok(info) => loaded.push(info),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to load module, skipping"
                    );
                }
            }
        }
        Ok(loaded)
    }

    /// Load one `.wasm` file; the module is named after the file stem.
    pub async fn load_module(&mut self, path: &Path) -> Result<ModuleInfo> {
        let name = module_name(path)?;
        let wasm_bytes = tokio::fs::read(path).await?;
        tracing::debug!(
            module = %name,
            path = %path.display(),
            size_bytes = wasm_bytes.len(),
            "read wasm bytes from disk"
        );

        let rt = Arc::clone(&self.runtime);
        let task_name = name.clone();
        let info = tokio::task::spawn_blocking(move || {
            let handle = tokio::runtime::Handle::current();
            let mut guard = handle.block_on(rt.lock());
            guard.load_module(&task_name, &wasm_bytes).cloned()
        })
        .await
        .map_err(|e| HostError::Execution(format!("blocking task panicked: {e}")))??;

        self.loaded_names.push(name);
        Ok(info)
    }

    /// Run module `name` for `trigger` on the blocking pool.
    ///
    /// The runtime lock is held only while the module is looked up, so
    /// invocations run concurrently with each other and with loading.
    pub async fn invoke(&self, name: &str, trigger: Trigger) -> Result<HookOutput> {
        let hook = self.runtime.lock().await.prepare(name)?;
        tokio::task::spawn_blocking(move || hook.invoke_trigger(&trigger))
            .await
            .map_err(|e| HostError::Execution(format!("blocking task panicked: {e}")))?
    }

    pub async fn unload_module(&mut self, name: &str) -> Result<()> {
        self.runtime.lock().await.unload_module(name)?;
        self.loaded_names.retain(|n| n != name);
        Ok(())
    }

    /// Names loaded through this loader.
    pub fn list_loaded(&self) -> Vec<String> {
        self.loaded_names.clone()
    }
}

/// Module name for a path: its file stem.
pub fn module_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_owned)
        .ok_or_else(|| HostError::Module {
            reason: format!("cannot derive module name from path: {}", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::host::Host;

    const HOOK: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "hookbridge_alloc") (param i32) (result i32) i32.const 8)
          (func (export "hookbridge_free") (param i32))
          (func (export "hookbridge_run") (param i32 i32) (result i32) i32.const 0))
    "#;

    fn loader(dir: PathBuf) -> ModuleLoader {
        let host = Arc::new(Host::in_memory().unwrap());
        let runtime = Arc::new(Mutex::new(HookRuntime::new(host).unwrap()));
        ModuleLoader::new(dir, runtime)
    }

    #[tokio::test]
    async fn missing_directory_loads_nothing() {
        let mut l = loader(PathBuf::from("/definitely/not/here"));
        assert!(l.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn loads_wasm_files_in_order_and_skips_bad_ones() {
        let dir = tempfile::tempdir().unwrap();
        let wasm = wat::parse_str(HOOK).unwrap();
        fs::write(dir.path().join("b_second.wasm"), &wasm).unwrap();
        fs::write(dir.path().join("a_first.wasm"), &wasm).unwrap();
        fs::write(dir.path().join("broken.wasm"), b"nope").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut l = loader(dir.path().to_path_buf());
        let infos = l.load_all().await.unwrap();
        let names: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a_first", "b_second"]);
        assert_eq!(l.list_loaded(), vec!["a_first", "b_second"]);

        l.unload_module("a_first").await.unwrap();
        assert_eq!(l.list_loaded(), vec!["b_second"]);
        assert_eq!(l.runtime().lock().await.list_modules().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prepared_hook_runs_while_runtime_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noop.wasm");
        fs::write(&path, wat::parse_str(HOOK).unwrap()).unwrap();
        let mut l = loader(dir.path().to_path_buf());
        l.load_module(&path).await.unwrap();

        // The lock stays held by this test for the whole invocation.
        let runtime = l.runtime();
        let held = runtime.lock().await;
        let hook = held.prepare("noop").unwrap();
        let out = tokio::task::spawn_blocking(move || hook.invoke(&serde_json::Value::Null))
            .await
            .unwrap();
        // `hookbridge_run` returns a null pointer, which is a calling
        // convention error rather than a deadlock.
        assert!(matches!(out, Err(HostError::Execution(_))));
        assert_eq!(held.metrics().module("noop").unwrap().trap, 1);
        drop(held);

        let err = l.invoke("noop", Trigger::cron("* * * * *")).await.unwrap_err();
        assert!(matches!(err, HostError::Execution(_)));
        assert_eq!(l.runtime().lock().await.metrics().overall().total, 2);
    }

    #[tokio::test]
    async fn file_is_not_a_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut l = loader(file.path().to_path_buf());
        assert!(l.load_all().await.is_err());
    }

    #[test]
    fn module_name_from_stem() {
        assert_eq!(module_name(Path::new("/x/signup.wasm")).unwrap(), "signup");
    }
}
