//! Links the Helper façade (spec C2) into a guest's imports under the
//! `kiwi_helper` module name, the same shape the teacher uses to give
//! guests host access (`wasi_experimental_http_wasmtime`'s `add_to_linker`
//! in `wasm_runner.rs`), generalized from "one HTTP call" to the full
//! Helper surface.
//!
//! Guest strings cross the boundary as `(ptr, len)` pairs into guest linear
//! memory. For host → guest results, the host asks the guest to allocate a
//! buffer via a `kiwi_alloc(len) -> ptr` export (the same convention
//! `wasi-experimental-http-wasmtime` uses) and writes the result there,
//! returning the packed `(ptr << 32) | len` as an `i64`.

use wasmtime::{Caller, Linker};
use wasmtime_wasi::WasiCtx;

use crate::helper::HelperState;

fn read_guest_string(caller: &mut Caller<'_, WasiCtx>, ptr: i32, len: i32) -> anyhow::Result<String> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("guest module has no exported memory"))?;
    let mut buf = vec![0u8; len as usize];
    memory.read(caller, ptr as usize, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn write_guest_string(caller: &mut Caller<'_, WasiCtx>, value: &str) -> anyhow::Result<i64> {
    let alloc = caller
        .get_export("kiwi_alloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| anyhow::anyhow!("guest module does not export kiwi_alloc"))?;
    let typed = alloc.typed::<i32, i32, _>(&caller)?;
    let ptr = typed.call(&mut *caller, value.len() as i32)?;

    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("guest module has no exported memory"))?;
    memory.write(caller, ptr as usize, value.as_bytes())?;

    Ok(((ptr as i64) << 32) | (value.len() as i64 & 0xffff_ffff))
}

pub fn link(linker: &mut Linker<WasiCtx>, helper: HelperState) -> anyhow::Result<()> {
    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "say",
        move |mut caller: Caller<'_, WasiCtx>, ptr: i32, len: i32| -> i32 {
            match read_guest_string(&mut caller, ptr, len) {
                Ok(msg) => {
                    h.say(&msg);
                    0
                }
                Err(_) => -1,
            }
        },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "log_info",
        move |mut caller: Caller<'_, WasiCtx>, ptr: i32, len: i32| -> i32 {
            match read_guest_string(&mut caller, ptr, len) {
                Ok(msg) => {
                    h.logger_info(&msg);
                    0
                }
                Err(_) => -1,
            }
        },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "log_warn",
        move |mut caller: Caller<'_, WasiCtx>, ptr: i32, len: i32| -> i32 {
            match read_guest_string(&mut caller, ptr, len) {
                Ok(msg) => {
                    h.logger_warn(&msg);
                    0
                }
                Err(_) => -1,
            }
        },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "log_error",
        move |mut caller: Caller<'_, WasiCtx>, ptr: i32, len: i32| -> i32 {
            match read_guest_string(&mut caller, ptr, len) {
                Ok(msg) => {
                    h.logger_error(&msg);
                    0
                }
                Err(_) => -1,
            }
        },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "ask",
        move |mut caller: Caller<'_, WasiCtx>, prompt_ptr: i32, prompt_len: i32, choices_ptr: i32, choices_len: i32, default_ptr: i32, default_len: i32| -> i64 {
            let prompt = read_guest_string(&mut caller, prompt_ptr, prompt_len).unwrap_or_default();
            let choices_csv = read_guest_string(&mut caller, choices_ptr, choices_len).unwrap_or_default();
            let default = if default_len == 0 {
                None
            } else {
                read_guest_string(&mut caller, default_ptr, default_len).ok()
            };
            let choices: Vec<String> = choices_csv.split(',').map(|s| s.to_owned()).collect();
            let answer = h.ask(&prompt, &choices, default.as_deref());
            write_guest_string(&mut caller, &answer).unwrap_or(0)
        },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "get",
        move |mut caller: Caller<'_, WasiCtx>, url_ptr: i32, url_len: i32| -> i64 {
            let url = match read_guest_string(&mut caller, url_ptr, url_len) {
                Ok(u) => u,
                Err(_) => return 0,
            };
            match h.get(&url) {
                Ok(body) => write_guest_string(&mut caller, &body).unwrap_or(0),
                Err(e) => {
                    h.logger_error(&format!("get({}) failed: {}", url, e));
                    0
                }
            }
        },
    )?;

    linker.func_wrap(
        "kiwi_helper",
        "sha256",
        move |mut caller: Caller<'_, WasiCtx>, ptr: i32, len: i32| -> i64 {
            let memory = match caller.get_export("memory").and_then(|e| e.into_memory()) {
                Some(m) => m,
                None => return 0,
            };
            let mut buf = vec![0u8; len as usize];
            if memory.read(&mut caller, ptr as usize, &mut buf).is_err() {
                return 0;
            }
            let digest = crate::helper::HelperState::sha(&buf);
            write_guest_string(&mut caller, &digest).unwrap_or(0)
        },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "module_home",
        move |mut caller: Caller<'_, WasiCtx>| -> i64 {
            write_guest_string(&mut caller, &h.module_home.display().to_string()).unwrap_or(0)
        },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "module_name",
        move |mut caller: Caller<'_, WasiCtx>| -> i64 { write_guest_string(&mut caller, &h.module_name).unwrap_or(0) },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "module_desc",
        move |mut caller: Caller<'_, WasiCtx>| -> i64 { write_guest_string(&mut caller, &h.module_desc).unwrap_or(0) },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "write_crashlog",
        move |mut caller: Caller<'_, WasiCtx>, kind_ptr: i32, kind_len: i32, msg_ptr: i32, msg_len: i32| -> i32 {
            let kind = read_guest_string(&mut caller, kind_ptr, kind_len).unwrap_or_default();
            let msg = read_guest_string(&mut caller, msg_ptr, msg_len).unwrap_or_default();
            match h.write_crashlog(&kind, &msg, &[]) {
                Ok(_) => 0,
                Err(_) => -1,
            }
        },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "module_call",
        move |mut caller: Caller<'_, WasiCtx>, name_ptr: i32, name_len: i32, argline_ptr: i32, argline_len: i32| -> i32 {
            let name = read_guest_string(&mut caller, name_ptr, name_len).unwrap_or_default();
            let argline = read_guest_string(&mut caller, argline_ptr, argline_len).unwrap_or_default();
            match h.module(&name, &argline, false) {
                Ok((code, _captured)) => code,
                Err(_) => -1,
            }
        },
    )?;

    let h = helper.clone();
    linker.func_wrap(
        "kiwi_helper",
        "request",
        move |mut caller: Caller<'_, WasiCtx>, method_ptr: i32, method_len: i32, url_ptr: i32, url_len: i32, body_ptr: i32, body_len: i32| -> i64 {
            let method = read_guest_string(&mut caller, method_ptr, method_len).unwrap_or_default();
            let url = read_guest_string(&mut caller, url_ptr, url_len).unwrap_or_default();
            let body = read_guest_string(&mut caller, body_ptr, body_len).unwrap_or_default();
            let req = crate::bridge::client::RpcRequest {
                method,
                url,
                params: Default::default(),
                headers: Default::default(),
                data: body.into_bytes(),
            };
            match h.request(req) {
                Ok(resp) => {
                    let text = String::from_utf8_lossy(&resp.body).into_owned();
                    write_guest_string(&mut caller, &text).unwrap_or(0)
                }
                Err(e) => {
                    h.logger_error(&format!("request to {} failed: {}", url, e));
                    0
                }
            }
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    const GUEST_CALLING_SAY: &str = r#"
        (module
            (import "kiwi_helper" "say" (func $say (param i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "hi")
            (func (export "kiwi_alloc") (param i32) (result i32) i32.const 1024)
            (func (export "kiwi_main") (result i32)
                (call $say (i32.const 0) (i32.const 2))
                drop
                i32.const 0)
        )
    "#;

    #[test]
    fn linked_guest_can_call_say_without_trapping() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::load(dir.path(), None).unwrap());
        let module_home = dir.path().join("modules").join("greeter");
        let helper_state = HelperState::new("greeter", "says hi", module_home.clone(), config, true).unwrap();

        let (ctx, _stdout) = crate::wasm_runtime::build_wasi_ctx(&module_home, &[], &[]).unwrap();
        let engine = wasmtime::Engine::default();
        let wasm = wat::parse_str(GUEST_CALLING_SAY).unwrap();

        let mut prepared = crate::wasm_runtime::prepare(&engine, &wasm, ctx, helper_state).unwrap();
        let code = crate::wasm_runtime::call_entrypoint(&mut prepared, "kiwi_main").unwrap();
        assert_eq!(0, code);
    }
}
