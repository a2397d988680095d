//! JavaScript collaborator bridges for WASM.
//!
//! Implements the core storage, remote, object-store and broadcast traits by
//! calling JavaScript callbacks supplied by the web app. Storage and
//! broadcast callbacks are synchronous (`localStorage`, `BroadcastChannel`);
//! remote and object-store callbacks return Promises, which we convert to
//! Rust Futures.
//!
//! # Example (TypeScript side)
//!
//! ```typescript
//! const storage = new JsStorage(
//!   (key) => localStorage.getItem(key),
//!   (key, value) => localStorage.setItem(key, value),
//!   (key) => localStorage.removeItem(key),
//!   () => Object.keys(localStorage),
//! );
//! const broadcast = new JsBroadcast((msg) => channel.postMessage(msg));
//! ```

use async_trait::async_trait;
use fieldsync_core::broadcast::{self, BroadcastChannel, BroadcastError, BroadcastMessage};
use fieldsync_core::model::{CollectionKind, ProjectPatch, ProjectRecord};
use fieldsync_core::remote::{self, ObjectStore, RemoteError, RemoteReplica, StoredObject};
use fieldsync_core::storage::{self, KeyValueStorage, StorageError};
use fieldsync_core::VersionedEnvelope;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

/// Serialize for JS with plain objects (not `Map`) for maps.
pub(crate) fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, serde_wasm_bindgen::Error> {
    value.serialize(&serde_wasm_bindgen::Serializer::json_compatible())
}

/// Best-effort message from a thrown JS value.
pub(crate) fn js_error_message(err: &JsValue) -> String {
    err.as_string()
        .or_else(|| {
            js_sys::Reflect::get(err, &"message".into())
                .ok()
                .and_then(|v| v.as_string())
        })
        .unwrap_or_else(|| format!("{:?}", err))
}

fn js_error_name(err: &JsValue) -> Option<String> {
    js_sys::Reflect::get(err, &"name".into())
        .ok()
        .and_then(|v| v.as_string())
}

fn call_sync(func: &js_sys::Function, args: &[JsValue]) -> Result<JsValue, JsValue> {
    let js_args = js_sys::Array::new();
    for arg in args {
        js_args.push(arg);
    }
    func.apply(&JsValue::NULL, &js_args)
}

/// Call a JS function and await its Promise result.
async fn call_async(func: &js_sys::Function, args: &[JsValue]) -> Result<JsValue, JsValue> {
    let promise = call_sync(func, args)?;
    JsFuture::from(js_sys::Promise::resolve(&promise)).await
}

// ========== Storage ==========

fn js_err_to_storage_err(key: &str, err: JsValue) -> StorageError {
    let msg = js_error_message(&err);
    let quota = js_error_name(&err).is_some_and(|n| n == "QuotaExceededError")
        || msg.to_lowercase().contains("quota");
    if quota {
        StorageError::QuotaExceeded(key.to_string())
    } else {
        StorageError::Backend(msg)
    }
}

/// Synchronous key/value storage backed by JS callbacks (usually `localStorage`).
#[wasm_bindgen]
pub struct JsStorage {
    get_item_fn: js_sys::Function,
    set_item_fn: js_sys::Function,
    remove_item_fn: js_sys::Function,
    keys_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsStorage {
    #[wasm_bindgen(constructor)]
    pub fn new(
        get_item_fn: js_sys::Function,
        set_item_fn: js_sys::Function,
        remove_item_fn: js_sys::Function,
        keys_fn: js_sys::Function,
    ) -> Self {
        Self {
            get_item_fn,
            set_item_fn,
            remove_item_fn,
            keys_fn,
        }
    }
}

impl KeyValueStorage for JsStorage {
    fn get_item(&self, key: &str) -> storage::Result<Option<String>> {
        let value = call_sync(&self.get_item_fn, &[key.into()])
            .map_err(|e| js_err_to_storage_err(key, e))?;
        Ok(value.as_string())
    }

    fn set_item(&self, key: &str, value: &str) -> storage::Result<()> {
        call_sync(&self.set_item_fn, &[key.into(), value.into()])
            .map_err(|e| js_err_to_storage_err(key, e))?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> storage::Result<()> {
        call_sync(&self.remove_item_fn, &[key.into()])
            .map_err(|e| js_err_to_storage_err(key, e))?;
        Ok(())
    }

    fn keys(&self) -> storage::Result<Vec<String>> {
        let result = call_sync(&self.keys_fn, &[]).map_err(|e| js_err_to_storage_err("*", e))?;
        serde_wasm_bindgen::from_value(result)
            .map_err(|e| StorageError::Backend(format!("Failed to parse keys: {}", e)))
    }
}

// ========== Remote replica ==========

fn js_err_to_remote_err(err: JsValue) -> RemoteError {
    let msg = js_error_message(&err);
    let lower = msg.to_lowercase();
    if lower.contains("unauthorized") || lower.contains("permission") || msg.contains("401") {
        RemoteError::Unauthorized
    } else if lower.contains("not found") || msg.contains("404") {
        RemoteError::NotFound(msg)
    } else if lower.contains("network") || lower.contains("fetch") || lower.contains("offline") {
        RemoteError::Network(msg)
    } else {
        RemoteError::Service(msg)
    }
}

fn to_js_remote<T: Serialize>(value: &T) -> remote::Result<JsValue> {
    to_js(value).map_err(|e| RemoteError::Service(format!("Failed to encode request: {}", e)))
}

fn from_js_optional<T: DeserializeOwned>(value: JsValue) -> remote::Result<Option<T>> {
    if value.is_null() || value.is_undefined() {
        return Ok(None);
    }
    serde_wasm_bindgen::from_value(value)
        .map(Some)
        .map_err(|e| RemoteError::Service(format!("Failed to parse response: {}", e)))
}

/// Remote replica backed by Promise-returning JS callbacks.
///
/// Every callback receives `(ownerId, projectId, ...)`; `get*` callbacks
/// resolve to the stored envelope or `null`.
#[wasm_bindgen]
pub struct JsRemote {
    get_project_fn: js_sys::Function,
    put_project_fn: js_sys::Function,
    get_collection_fn: js_sys::Function,
    put_collection_fn: js_sys::Function,
    delete_project_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsRemote {
    #[wasm_bindgen(constructor)]
    pub fn new(
        get_project_fn: js_sys::Function,
        put_project_fn: js_sys::Function,
        get_collection_fn: js_sys::Function,
        put_collection_fn: js_sys::Function,
        delete_project_fn: js_sys::Function,
    ) -> Self {
        Self {
            get_project_fn,
            put_project_fn,
            get_collection_fn,
            put_collection_fn,
            delete_project_fn,
        }
    }
}

#[async_trait(?Send)]
impl RemoteReplica for JsRemote {
    async fn get_project(
        &self,
        owner: &str,
        project: &str,
    ) -> remote::Result<Option<VersionedEnvelope<ProjectRecord>>> {
        let result = call_async(&self.get_project_fn, &[owner.into(), project.into()])
            .await
            .map_err(js_err_to_remote_err)?;
        from_js_optional(result)
    }

    async fn put_project(
        &self,
        owner: &str,
        project: &str,
        patch: VersionedEnvelope<ProjectPatch>,
    ) -> remote::Result<()> {
        let patch = to_js_remote(&patch)?;
        call_async(&self.put_project_fn, &[owner.into(), project.into(), patch])
            .await
            .map_err(js_err_to_remote_err)?;
        Ok(())
    }

    async fn get_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
    ) -> remote::Result<Option<VersionedEnvelope<Value>>> {
        let result = call_async(
            &self.get_collection_fn,
            &[owner.into(), project.into(), kind.as_str().into()],
        )
        .await
        .map_err(js_err_to_remote_err)?;
        from_js_optional(result)
    }

    async fn put_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
        envelope: VersionedEnvelope<Value>,
    ) -> remote::Result<()> {
        let envelope = to_js_remote(&envelope)?;
        call_async(
            &self.put_collection_fn,
            &[owner.into(), project.into(), kind.as_str().into(), envelope],
        )
        .await
        .map_err(js_err_to_remote_err)?;
        Ok(())
    }

    async fn delete_project(&self, owner: &str, project: &str) -> remote::Result<()> {
        call_async(&self.delete_project_fn, &[owner.into(), project.into()])
            .await
            .map_err(js_err_to_remote_err)?;
        Ok(())
    }
}

// ========== Object store ==========

/// Object store backed by Promise-returning JS callbacks.
///
/// `upload(bytes: Uint8Array, path)` and `list(prefix)` resolve to
/// `{ name, url }` objects.
#[wasm_bindgen]
pub struct JsObjectStore {
    upload_fn: js_sys::Function,
    list_fn: js_sys::Function,
    delete_prefix_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsObjectStore {
    #[wasm_bindgen(constructor)]
    pub fn new(
        upload_fn: js_sys::Function,
        list_fn: js_sys::Function,
        delete_prefix_fn: js_sys::Function,
    ) -> Self {
        Self {
            upload_fn,
            list_fn,
            delete_prefix_fn,
        }
    }
}

#[async_trait(?Send)]
impl ObjectStore for JsObjectStore {
    async fn upload(&self, bytes: &[u8], path: &str) -> remote::Result<StoredObject> {
        let js_array = js_sys::Uint8Array::from(bytes);
        let result = call_async(&self.upload_fn, &[js_array.into(), path.into()])
            .await
            .map_err(js_err_to_remote_err)?;
        serde_wasm_bindgen::from_value(result)
            .map_err(|e| RemoteError::Service(format!("Failed to parse upload result: {}", e)))
    }

    async fn list(&self, prefix: &str) -> remote::Result<Vec<StoredObject>> {
        let result = call_async(&self.list_fn, &[prefix.into()])
            .await
            .map_err(js_err_to_remote_err)?;
        serde_wasm_bindgen::from_value(result)
            .map_err(|e| RemoteError::Service(format!("Failed to parse list result: {}", e)))
    }

    async fn delete_prefix(&self, prefix: &str) -> remote::Result<()> {
        call_async(&self.delete_prefix_fn, &[prefix.into()])
            .await
            .map_err(js_err_to_remote_err)?;
        Ok(())
    }
}

// ========== Broadcast ==========

/// Cross-tab channel: `post(message)` forwards to a `BroadcastChannel`.
#[wasm_bindgen]
pub struct JsBroadcast {
    post_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsBroadcast {
    #[wasm_bindgen(constructor)]
    pub fn new(post_fn: js_sys::Function) -> Self {
        Self { post_fn }
    }
}

impl BroadcastChannel for JsBroadcast {
    fn post(&self, message: &BroadcastMessage) -> broadcast::Result<()> {
        let js_message = to_js(message).map_err(|e| BroadcastError::Post(e.to_string()))?;
        call_sync(&self.post_fn, &[js_message])
            .map_err(|e| BroadcastError::Post(js_error_message(&e)))?;
        Ok(())
    }
}
