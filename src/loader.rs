//! Locate, validate, dependency-resolve, and invoke a module (spec C4).

use std::sync::Arc;

use anyhow::Context;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::KiwiError;
use crate::helper::HelperState;
use crate::manifest::{ModuleDescriptor, CLIENT_ENTRY_FILE, SERVER_ENTRY_FILE};

/// `run(name, argline, client, foreground)` — see spec §4.4 for the full
/// nine-step algorithm. Returns `(exit_code, captured_stdout)`; stdout is
/// only captured when `foreground` is false (step 9).
pub async fn run(
    config: Arc<Config>,
    name: &str,
    argline: &str,
    client: bool,
    foreground: bool,
    auto_yes: bool,
) -> anyhow::Result<(i32, String)> {
    let catalog = Catalog::new(&config);

    // Step 1: if not installed, attempt fetch.
    if catalog.installed()?.iter().all(|n| n != name) {
        let report = catalog.fetch(&[name.to_owned()], false, false).await.unwrap_or_default();
        if !report.fetched.contains(&name.to_owned()) {
            println!("I don't have a module called '{}' :(", name);
            println!("Tip: use `kiwi --get-modules {}` to install", name);
            return Ok((KiwiError::ModuleUnknown(name.to_owned()).exit_code(), String::new()));
        }
    }

    let module_dir = catalog.module_dir(name);

    // Step 2: resolve entry file.
    let entry_file = if client { CLIENT_ENTRY_FILE } else { SERVER_ENTRY_FILE };
    let entry_path = module_dir.join(entry_file);
    if !entry_path.is_file() {
        if client {
            return Err(KiwiError::ModuleInvalid(name.to_owned())).context("missing client entry point");
        }
        println!("'{}' has no server-side logic", name);
        return Ok((KiwiError::ModuleInvalid(name.to_owned()).exit_code(), String::new()));
    }

    let wasm_bytes = tokio::fs::read(&entry_path).await.with_context(|| format!("reading {}", entry_path.display()))?;

    // Step 3: validate the entry point exports the expected symbol.
    let entrypoint = if client { "kiwi_client" } else { "kiwi_server" };
    validate_entrypoint(&wasm_bytes, entrypoint)
        .with_context(|| format!("'{}' is not my module (missing {}())", name, entrypoint))?;

    // Step 4: dependency closure.
    let descriptor = ModuleDescriptor::read(&module_dir).unwrap_or_default();
    let installed = catalog.installed()?;
    let missing_deps: Vec<String> = descriptor
        .kiwi_dependencies
        .iter()
        .filter(|d| *d != name && !installed.contains(d))
        .cloned()
        .collect();
    if !missing_deps.is_empty() {
        let report = catalog.fetch(&missing_deps, false, false).await.unwrap_or_default();
        if !report.failed.is_empty() {
            println!("Tip: some dependencies for '{}' could not be resolved: {}", name, report.failed.join(", "));
            return Err(KiwiError::DependencyUnresolved(report.failed).into());
        }
    }

    // Step 5+6: construct Helper bound to `name`, chdir is represented by
    // preopening module_home at `/` inside the WASI context rather than
    // mutating the host process's working directory (spec §4.4 step 6 notes
    // this must be "restored on return" — in the WASM ABI there is nothing
    // to restore, since only the guest's view of `/` is scoped).
    let helper_state = HelperState::new(name, &descriptor.description, module_dir.clone(), config.clone(), auto_yes)?;

    let args = split_argline(argline);
    let (ctx, stdout_buf) = crate::wasm_runtime::build_wasi_ctx(&module_dir, &args, &[])?;

    let cache_config_path = config.runtime_dir().join("cache.toml");
    let engine = crate::wasm_runtime::new_engine(&cache_config_path)?;

    // Step 7: invoke, capturing crashes (step 8).
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut prepared = crate::wasm_runtime::prepare(&engine, &wasm_bytes, ctx, helper_state.clone())?;
        crate::wasm_runtime::call_entrypoint(&mut prepared, entrypoint)
    }));

    let exit_code = match result {
        Ok(Ok(code)) => code,
        Ok(Err(trap)) => {
            let summary = crate::crashlog::one_line_summary(name, &trap.to_string());
            println!("{}", summary);
            let path = helper_state.write_crashlog("module-crash", &trap.to_string(), &[format!("{}() ({})", entrypoint, entry_file)])?;
            println!("detailed crash log can be found at {}", path.display());
            1
        }
        Err(panic) => {
            let message = panic_message(&panic);
            let summary = crate::crashlog::one_line_summary(name, &message);
            println!("{}", summary);
            let path = helper_state.write_crashlog("module-crash", &message, &[format!("{}() ({})", entrypoint, entry_file)])?;
            println!("detailed crash log can be found at {}", path.display());
            1
        }
    };

    // Step 9: capture stdout only when running in the background.
    let captured = if foreground {
        String::new()
    } else {
        String::from_utf8_lossy(&stdout_buf.read().map(|b| b.clone()).unwrap_or_default()).into_owned()
    };

    Ok((exit_code, captured))
}

fn split_argline(argline: &str) -> Vec<String> {
    argline.split_whitespace().map(str::to_owned).collect()
}

/// Server-side counterpart of [`run`], invoked from inside an `Ingress`
/// (spec §4.5 step 5: "invokes the server entry point of the module"). Feeds
/// the decoded RPC envelope bytes to the module's `kiwi_server` entrypoint
/// as WASI stdin and returns whatever it wrote to stdout, which the caller
/// decodes back into an `RpcResponse` (spec §4.5 step 8).
pub fn run_server(config: &Config, name: &str, request_bytes: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    let catalog = Catalog::new(config);
    let module_dir = catalog.module_dir(name);

    let entry_path = module_dir.join(SERVER_ENTRY_FILE);
    if !entry_path.is_file() {
        return Err(KiwiError::ModuleInvalid(name.to_owned())).context("module has no server-side logic");
    }

    let wasm_bytes = std::fs::read(&entry_path).with_context(|| format!("reading {}", entry_path.display()))?;
    validate_entrypoint(&wasm_bytes, "kiwi_server").with_context(|| format!("'{}' is not my module (missing kiwi_server())", name))?;

    let descriptor = ModuleDescriptor::read(&module_dir).unwrap_or_default();
    let helper_state = HelperState::new(name, &descriptor.description, module_dir.clone(), Arc::new(config.clone()), true)?;

    let (ctx, stdout_buf) = crate::wasm_runtime::build_wasi_ctx_with_stdin(&module_dir, &[], &[], request_bytes)?;
    let cache_config_path = config.runtime_dir().join("cache.toml");
    let engine = crate::wasm_runtime::new_engine(&cache_config_path)?;

    let mut prepared = crate::wasm_runtime::prepare(&engine, &wasm_bytes, ctx, helper_state.clone())?;
    crate::wasm_runtime::call_entrypoint(&mut prepared, "kiwi_server")?;

    let bytes = stdout_buf.read().map(|b| b.clone()).unwrap_or_default();
    Ok(bytes)
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "module panicked with a non-string payload".to_owned()
    }
}

/// Validates that a WASM module exports the named zero-argument function
/// without instantiating it (spec §4.4 step 3).
fn validate_entrypoint(wasm_bytes: &[u8], entrypoint: &str) -> anyhow::Result<()> {
    let engine = wasmtime::Engine::default();
    let module = wasmtime::Module::new(&engine, wasm_bytes)?;
    let found = module.exports().any(|e| e.name() == entrypoint && matches!(e.ty(), wasmtime::ExternType::Func(_)));
    if found {
        Ok(())
    } else {
        Err(anyhow::anyhow!("no such export"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal_module_wat(entrypoint: &str) -> Vec<u8> {
        let wat = format!(
            r#"
            (module
                (memory (export "memory") 1)
                (func (export "kiwi_alloc") (param i32) (result i32) i32.const 0)
                (func (export "{}") (result i32) i32.const 0)
            )
            "#,
            entrypoint
        );
        wat::parse_str(wat).unwrap()
    }

    #[test]
    fn validate_entrypoint_finds_exported_function() {
        let wasm = minimal_module_wat("kiwi_client");
        assert!(validate_entrypoint(&wasm, "kiwi_client").is_ok());
        assert!(validate_entrypoint(&wasm, "kiwi_server").is_err());
    }

    #[tokio::test]
    async fn run_rejects_a_module_whose_entry_point_is_not_valid_wasm() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::load(dir.path(), None).unwrap());

        // Pre-install the module locally so step 1 (fetch-if-missing) never
        // reaches the network; step 3 (entry point validation) then fails.
        let module_dir = config.modules_dir().join("broken");
        std::fs::create_dir_all(&module_dir).unwrap();
        std::fs::write(module_dir.join(CLIENT_ENTRY_FILE), b"not actually wasm").unwrap();

        let result = run(config, "broken", "", true, true, true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_reports_a_server_entry_point_as_optional() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::load(dir.path(), None).unwrap());

        let module_dir = config.modules_dir().join("client-only");
        std::fs::create_dir_all(&module_dir).unwrap();
        std::fs::write(module_dir.join(CLIENT_ENTRY_FILE), minimal_module_wat("kiwi_client")).unwrap();

        let (code, _out) = run(config, "client-only", "", false, true, true).await.unwrap();
        assert_eq!(crate::error::EXIT_BAD_INVOCATION, code);
    }
}
