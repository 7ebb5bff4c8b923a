use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

use crate::errors::{ExecutionError, Result};
use crate::registry::NodeRegistry;
use crate::runtime::NodeRuntime;

/// External collaborator resolving a module name to its bytes. Consumed,
/// not implemented, by the core — an embedder's WASM engine owns loading
/// and caching. Grounded on
/// `pylib-v1/ailets/actor_runtime/node_wasm.py::WasmRegistry`.
pub trait ModuleRegistry: Send + Sync {
    fn has_module(&self, name: &str) -> bool;
    fn get_module(&self, name: &str) -> Result<Vec<u8>>;
}

/// In-memory module registry, mainly for tests and small embedded
/// pipelines that preload their modules rather than reading them off disk.
#[derive(Default)]
pub struct InMemoryModuleRegistry {
    modules: HashMap<String, Vec<u8>>,
}

impl InMemoryModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.modules.insert(name.into(), bytes);
    }
}

impl ModuleRegistry for InMemoryModuleRegistry {
    fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    fn get_module(&self, name: &str) -> Result<Vec<u8>> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::RegistryMiss(name.to_string()))
    }
}

/// Parsed form of the JSON (or bare string) an untrusted module's entry
/// point leaves behind on failure. Grounded on
/// `pylib-v1/ailets/actor_runtime/node_wasm.py::WasmError`.
#[derive(Clone, Debug, Deserialize)]
pub struct WasmEntryResult {
    pub code: i32,
    pub message: String,
}

/// Decodes an entry point's raw (NUL-terminated, already-stripped) return
/// string. Malformed or non-JSON payloads fall back to `code = -1` with the
/// raw text as the message, same as the original's `try/except` around
/// `json.loads`.
pub fn parse_entry_result(raw: &str) -> WasmEntryResult {
    serde_json::from_str(raw).unwrap_or_else(|_| WasmEntryResult {
        code: -1,
        message: raw.to_string(),
    })
}

/// Import-table bridge a sandboxed module's host calls are wired to. Each
/// function here is the host side of one import in
/// `pylib-v1/ailets/cons/node_runtime_wasm.py::fill_wasm_import_object` —
/// minus the WASM memory marshalling, which is the engine's job and out of
/// scope here (SPEC_FULL.md §7 Non-goals).
pub fn open_read(rt: &mut NodeRuntime, name: &str) -> i32 {
    rt.open_read(name)
}

pub fn open_write(rt: &mut NodeRuntime, name: &str) -> i32 {
    rt.open_write(name)
}

pub fn aread(rt: &mut NodeRuntime, fd: i32, buf: &mut [u8]) -> i32 {
    rt.read(fd, buf)
}

pub fn awrite(rt: &mut NodeRuntime, fd: i32, bytes: &[u8]) -> i32 {
    rt.write(fd, bytes)
}

pub fn aclose(rt: &mut NodeRuntime, fd: i32) -> i32 {
    rt.close(fd)
}

pub fn get_errno(rt: &NodeRuntime) -> i32 {
    rt.get_errno()
}

/// `dag_instantiate_with_deps`: `deps_json` is `{"alias": handle, ...}`,
/// matching the original's `DepsModel(deps=deps_dict)` validation step.
pub fn dag_instantiate_with_deps(
    rt: &mut NodeRuntime,
    nodereg: &dyn NodeRegistry,
    workflow: &str,
    deps_json: &str,
) -> i64 {
    let deps: HashMap<String, i64> = match serde_json::from_str(deps_json) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("instantiate_with_deps: error parsing '{workflow}'s input deps: {e}");
            return -1;
        }
    };
    match rt.dagops().instantiate_with_deps_v2(nodereg, workflow, &deps) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("instantiate_with_deps: error instantiating workflow {workflow}: {e}");
            -1
        }
    }
}

/// `dag_value_node`: `value_b64` is base64, matching the original's
/// `base64.b64decode` step before handing the bytes to `add_value_node`.
pub fn dag_value_node(rt: &mut NodeRuntime, value_b64: &str, explain: &str) -> i64 {
    let value = match BASE64.decode(value_b64) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("value_node: error decoding value for '{explain}': {e}");
            return -1;
        }
    };
    match rt.dagops().add_value_node(&value, Some(explain.to_string())) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("value_node: error adding value node for '{explain}': {e}");
            -1
        }
    }
}

pub fn dag_alias(rt: &mut NodeRuntime, alias: &str, node_handle: i64) -> i64 {
    match rt.dagops().alias_handle(alias, node_handle) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("alias: error adding alias '{alias}' to node {node_handle}: {e}");
            -1
        }
    }
}

pub fn dag_detach_from_alias(rt: &mut NodeRuntime, alias: &str) -> i32 {
    match rt.dagops().detach_from_alias(alias) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("detach_from_alias: error detaching from alias '{alias}': {e}");
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environment;
    use std::sync::Arc;

    #[test]
    fn parses_well_formed_entry_result() {
        let r = parse_entry_result(r#"{"code": 3, "message": "boom"}"#);
        assert_eq!(r.code, 3);
        assert_eq!(r.message, "boom");
    }

    #[test]
    fn falls_back_on_malformed_json() {
        let r = parse_entry_result("not json at all");
        assert_eq!(r.code, -1);
        assert_eq!(r.message, "not json at all");
    }

    #[test]
    fn value_node_bridge_rejects_bad_base64() {
        let env = Arc::new(Environment::new());
        let mut rt = NodeRuntime::new(env, "n".to_string(), vec![]);
        assert_eq!(dag_value_node(&mut rt, "not-base64!!", "explain"), -1);
    }

    #[test]
    fn module_registry_rejects_unregistered_name() {
        let reg = InMemoryModuleRegistry::new();
        assert!(!reg.has_module("gpt.wasm"));
        assert!(reg.get_module("gpt.wasm").is_err());
    }

    #[test]
    fn module_registry_round_trips_registered_bytes() {
        let mut reg = InMemoryModuleRegistry::new();
        reg.register("gpt.wasm", vec![0, 97, 115, 109]);
        assert!(reg.has_module("gpt.wasm"));
        assert_eq!(reg.get_module("gpt.wasm").unwrap(), vec![0, 97, 115, 109]);
    }

    #[test]
    fn value_node_bridge_accepts_valid_base64() {
        let env = Arc::new(Environment::new());
        let mut rt = NodeRuntime::new(env, "n".to_string(), vec![]);
        let encoded = BASE64.encode(b"hello");
        assert!(dag_value_node(&mut rt, &encoded, "explain") > 0);
    }
}
