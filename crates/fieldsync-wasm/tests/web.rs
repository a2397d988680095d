//! Browser binding tests. Run with `wasm-pack test --node`.

#![cfg(target_arch = "wasm32")]

use fieldsync_core::KeyValueStorage;
use fieldsync_wasm::{JsBroadcast, JsObjectStore, JsRemote, JsStorage, WasmSyncEngine};
use js_sys::{Function, Reflect};
use wasm_bindgen::JsValue;
use wasm_bindgen_test::*;

/// `localStorage`-shaped callbacks over a fresh JS `Map`.
fn map_storage() -> JsStorage {
    let map = js_sys::Map::new();
    let bind = |body: &str, args: &str| -> Function {
        let factory = Function::new_with_args("map", &format!("return function({}) {{ {} }}", args, body));
        factory
            .call1(&JsValue::NULL, &map)
            .expect("factory")
            .into()
    };
    JsStorage::new(
        bind("return map.has(k) ? map.get(k) : null;", "k"),
        bind("map.set(k, v);", "k, v"),
        bind("map.delete(k);", "k"),
        bind("return Array.from(map.keys());", ""),
    )
}

fn resolving(value: &str) -> Function {
    Function::new_no_args(&format!("return Promise.resolve({});", value))
}

fn offline_remote() -> JsRemote {
    let reject = Function::new_no_args("return Promise.reject(new Error('network offline'));");
    JsRemote::new(reject.clone(), reject.clone(), reject.clone(), reject.clone(), reject)
}

fn engine() -> WasmSyncEngine {
    WasmSyncEngine::new(
        Some(r#"{"projectName":"Bridge 42"}"#.to_string()),
        "inspector@example.com".to_string(),
        map_storage(),
        offline_remote(),
        JsObjectStore::new(resolving("{ name: 'x', url: 'https://x' }"), resolving("[]"), resolving("undefined")),
        JsBroadcast::new(Function::new_no_args("")),
    )
    .unwrap_or_else(|_| panic!("engine"))
}

#[wasm_bindgen_test]
fn storage_bridge_roundtrip() {
    let storage = map_storage();
    assert_eq!(storage.get_item("a:b").unwrap(), None);
    storage.set_item("a:b", "1").unwrap();
    assert_eq!(storage.get_item("a:b").unwrap().as_deref(), Some("1"));
    assert_eq!(storage.keys().unwrap(), vec!["a:b".to_string()]);
    storage.remove_item("a:b").unwrap();
    assert!(storage.keys().unwrap().is_empty());
}

#[wasm_bindgen_test]
async fn form_edit_is_visible_in_snapshot() {
    let engine = engine();
    assert_eq!(engine.writer_id().len(), 16);

    // Remote is offline: load still restores local state, then rejects
    assert!(engine.load_all().await.is_err());

    let patch = js_sys::Object::new();
    Reflect::set(&patch, &"elr".into(), &"ABC".into()).unwrap();
    engine.set_form_field(patch.into()).await.unwrap_or_else(|_| panic!("setFormField"));

    let snapshot = engine.snapshot().await.unwrap_or_else(|_| panic!("snapshot"));
    let form = Reflect::get(&snapshot, &"form".into()).unwrap();
    let data = Reflect::get(&form, &"data".into()).unwrap();
    assert_eq!(Reflect::get(&data, &"elr".into()).unwrap().as_string().as_deref(), Some("ABC"));
}

#[wasm_bindgen_test]
async fn invalid_elr_is_rejected_before_the_engine() {
    let engine = engine();
    let patch = js_sys::Object::new();
    Reflect::set(&patch, &"elr".into(), &"lower".into()).unwrap();
    assert!(engine.set_form_field(patch.into()).await.is_err());
    assert!(!engine.is_pending("formData".to_string()).await.unwrap_or(true));
}
