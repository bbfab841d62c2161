//! Engine/store/instance plumbing shared by client and server invocations.
//!
//! Adapted from the teacher's `wasm_runner.rs`: same `wasmtime::Config`
//! knobs and `wasi_cap_std_sync` context builder, generalized from
//! "one HTTP linker extension" to "the Helper host-function surface"
//! (see `abi.rs`).

use std::path::Path;
use std::sync::{Arc, RwLock};

use wasi_cap_std_sync::WasiCtxBuilder;
use wasi_common::pipe::{ReadPipe, WritePipe};
use wasmtime::*;
use wasmtime_wasi::WasiCtx;

use crate::helper::HelperState;

pub struct PreparedInstance {
    pub store: Store<WasiCtx>,
    pub instance: Instance,
}

pub fn new_engine(cache_config_path: &Path) -> anyhow::Result<Engine> {
    let mut config = Config::default();
    config.wasm_multi_memory(true);
    config.wasm_module_linking(true);
    if let Ok(p) = std::fs::canonicalize(cache_config_path) {
        config.cache_config_load(p)?;
    }
    Engine::new(&config)
}

/// Build the WASI context for a module invocation: argv is the CGI/CLI-style
/// argline (spec §0 ABI resolution), module home is preopened at `/`, and
/// stdout is captured to a buffer so `Helper::module` can hand it back to
/// the caller as `captured_stdout` (spec §4.4 step 9).
pub fn build_wasi_ctx(
    module_home: &Path,
    args: &[String],
    env: &[(String, String)],
) -> anyhow::Result<(WasiCtx, Arc<RwLock<Vec<u8>>>)> {
    build_wasi_ctx_with_stdin(module_home, args, env, Vec::new())
}

/// Same as [`build_wasi_ctx`] but seeds stdin with `stdin_bytes` — used by the
/// server-side Loader path to hand a module's `kiwi_server` entrypoint the
/// decoded RPC envelope (spec §4.5 step 5).
pub fn build_wasi_ctx_with_stdin(
    module_home: &Path,
    args: &[String],
    env: &[(String, String)],
    stdin_bytes: Vec<u8>,
) -> anyhow::Result<(WasiCtx, Arc<RwLock<Vec<u8>>>)> {
    let stdout_buf: Arc<RwLock<Vec<u8>>> = Arc::new(RwLock::new(Vec::new()));
    let stdout = WritePipe::from_shared(stdout_buf.clone());
    let stdin = ReadPipe::from(stdin_bytes);

    let mut builder = WasiCtxBuilder::new()
        .args(args)?
        .envs(env)?
        .stdout(Box::new(stdout))
        .stdin(Box::new(stdin));

    if let Ok(dir) = wasi_cap_std_sync::Dir::open_ambient_dir(module_home, wasi_cap_std_sync::ambient_authority()) {
        builder = builder.preopened_dir(dir, "/")?;
    }

    Ok((builder.build(), stdout_buf))
}

/// Instantiate a module with the runtime's Helper host-function imports
/// linked in (spec C2: "the only surface through which a module is
/// permitted to reach the runtime").
pub fn prepare(
    engine: &Engine,
    wasm_bytes: &[u8],
    ctx: WasiCtx,
    helper_state: HelperState,
) -> anyhow::Result<PreparedInstance> {
    let mut store = Store::new(engine, ctx);
    let mut linker: Linker<WasiCtx> = Linker::new(engine);
    wasmtime_wasi::add_to_linker(&mut linker, |cx| cx)?;

    // Helper functions are stored in the store's host data via a side table
    // keyed by instance, since `Store<WasiCtx>` only carries the WASI
    // context. A `Store<(WasiCtx, HelperState)>` would be more direct, but
    // wasmtime_wasi::add_to_linker requires the closure to project `WasiCtx`
    // specifically, so HelperState is threaded through `abi::link` instead,
    // which owns its own interior `Arc` state independent of the store.
    crate::abi::link(&mut linker, helper_state)?;

    let module = Module::new(engine, wasm_bytes)?;
    let instance = linker.instantiate(&mut store, &module)?;

    Ok(PreparedInstance { store, instance })
}

/// Call the named export with no arguments, matching the `() -> ()` / `() ->
/// i32` ABI chosen for `kiwi_client`/`kiwi_server` (spec §0).
pub fn call_entrypoint(prepared: &mut PreparedInstance, entrypoint: &str) -> anyhow::Result<i32> {
    let func = prepared
        .instance
        .get_func(&mut prepared.store, entrypoint)
        .ok_or_else(|| anyhow::anyhow!("No such export '{}'", entrypoint))?;

    if let Ok(typed) = func.typed::<(), i32, _>(&prepared.store) {
        return Ok(typed.call(&mut prepared.store, ())?);
    }
    let typed = func.typed::<(), (), _>(&prepared.store)?;
    typed.call(&mut prepared.store, ())?;
    Ok(0)
}
