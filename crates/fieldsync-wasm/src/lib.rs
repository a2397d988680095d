//! WASM bindings for fieldsync-core.
//!
//! Provides the bridge between the TypeScript web app and the Rust engine.
//!
//! # Architecture
//!
//! The web app creates the JS collaborator bridges with callbacks over
//! `localStorage`, its cloud client and a `BroadcastChannel`. The bridges
//! implement the core traits, so the Rust `SyncEngine` reads and writes
//! through JavaScript.
//!
//! ```text
//! TypeScript                         WASM (Rust)
//! ──────────                         ───────────
//! localStorage ──callbacks──> JsStorage      ─┐
//! cloud client ──callbacks──> JsRemote       ─┤
//! blob storage ──callbacks──> JsObjectStore  ─┼─> SyncEngine
//! BroadcastChannel.post ────> JsBroadcast    ─┘        │
//!                                                      ▼
//! onmessage / storage event ──────────────> WasmSyncEngine (exposed to JS)
//! ```
//!
//! **Note**: This crate only compiles for `wasm32` targets. When building for native
//! targets (e.g., during `cargo check --workspace`), this crate provides no exports.

#[cfg(target_arch = "wasm32")]
mod js_bridge;

#[cfg(target_arch = "wasm32")]
pub use js_bridge::{JsBroadcast, JsObjectStore, JsRemote, JsStorage};

// ============================================================================
// All WASM-specific code is gated behind target_arch = "wasm32"
// This allows `cargo check --workspace` to succeed on native targets.
// ============================================================================

#[cfg(target_arch = "wasm32")]
mod wasm_impl {
    use super::js_bridge::{JsBroadcast, JsObjectStore, JsRemote, JsStorage, to_js};
    use fieldsync_core::model::{BulkDefectRecord, FormPatch, MetadataPatch, NewImage, SessionPatch, SortPreferences};
    use fieldsync_core::validation::{validate_form_patch, validate_metadata_patch};
    use fieldsync_core::{
        BroadcastMessage, Collaborators, Collection, EngineEvent, EventBus, Inbound, InboxSender,
        OwnerId, Shared, Subscription, SyncConfig, SyncEngine, SystemTimeSource,
    };
    use futures::lock::Mutex;
    use serde::Serialize;
    use std::cell::RefCell;
    use std::fmt::Display;
    use std::rc::Rc;
    use std::sync::Arc;
    use tracing::{debug, info};
    use tracing_subscriber::layer::SubscriberExt;
    use wasm_bindgen::prelude::*;

    type Engine = SyncEngine<JsStorage, JsRemote, JsObjectStore, JsBroadcast>;

    fn js_error(e: impl Display) -> JsError {
        JsError::new(&e.to_string())
    }

    fn to_js_value<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, JsError> {
        to_js(value).map_err(js_error)
    }

    // ========== Callback Logger Layer ==========

    // Store the logger callback in thread-local storage (WASM is single-threaded)
    thread_local! {
        static LOGGER_CALLBACK: RefCell<Option<js_sys::Function>> = const { RefCell::new(None) };
    }

    /// A tracing layer that invokes a JavaScript callback for each log event.
    struct JsCallbackLayer;

    impl<S> tracing_subscriber::Layer<S> for JsCallbackLayer
    where
        S: tracing::Subscriber,
    {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            LOGGER_CALLBACK.with(|cb| {
                if let Some(callback) = cb.borrow().as_ref() {
                    let metadata = event.metadata();

                    let mut visitor = MessageVisitor::default();
                    event.record(&mut visitor);

                    let timestamp = web_time::SystemTime::now()
                        .duration_since(web_time::UNIX_EPOCH)
                        .map(|d| d.as_millis() as f64)
                        .unwrap_or(0.0);

                    let js_event = js_sys::Object::new();
                    let _ = js_sys::Reflect::set(&js_event, &"level".into(), &metadata.level().as_str().into());
                    let _ = js_sys::Reflect::set(&js_event, &"target".into(), &metadata.target().into());
                    let _ = js_sys::Reflect::set(&js_event, &"message".into(), &visitor.message.into());
                    let _ = js_sys::Reflect::set(&js_event, &"timestamp".into(), &timestamp.into());

                    let _ = callback.call1(&JsValue::NULL, &js_event);
                }
            });
        }
    }

    /// Visitor to extract message from tracing event fields
    #[derive(Default)]
    struct MessageVisitor {
        message: String,
    }

    impl MessageVisitor {
        fn push_field(&mut self, name: &str, value: String) {
            if name == "message" {
                self.message = value;
            } else if self.message.is_empty() {
                self.message = format!("{}={}", name, value);
            } else {
                self.message.push_str(&format!(" {}={}", name, value));
            }
        }
    }

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.push_field(field.name(), format!("{:?}", value));
        }

        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            self.push_field(field.name(), value.to_string());
        }
    }

    /// Initialize the WASM module (sets up panic hook and tracing for better debugging).
    ///
    /// Accepts an optional configuration object:
    /// - `init()` - console-only logging (default)
    /// - `init({ logger: (event) => {...} })` - callback + console logging
    ///
    /// The logger callback receives events with: `{ level, target, message, timestamp }`
    #[wasm_bindgen]
    pub fn init(config: Option<js_sys::Object>) {
        console_error_panic_hook::set_once();

        let callback = config
            .as_ref()
            .and_then(|cfg| js_sys::Reflect::get(cfg, &"logger".into()).ok())
            .and_then(|v| v.dyn_into::<js_sys::Function>().ok());

        let console_config = tracing_wasm::WASMLayerConfigBuilder::new()
            .set_max_level(tracing::Level::DEBUG)
            .build();

        match callback {
            Some(cb) => {
                LOGGER_CALLBACK.with(|cell| {
                    *cell.borrow_mut() = Some(cb);
                });
                let subscriber = tracing_subscriber::registry()
                    .with(JsCallbackLayer)
                    .with(tracing_wasm::WASMLayer::new(console_config));
                tracing::subscriber::set_global_default(subscriber).ok();
            }
            None => tracing_wasm::set_as_global_default_with_config(console_config),
        }

        info!("fieldsync-wasm initialized");
    }

    /// Get version string
    #[wasm_bindgen]
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Generate an owner id for a signed-out user.
    ///
    /// Store it (e.g. in `localStorage`) and pass it to the engine on every
    /// load, so the user's projects keep the same ids.
    #[wasm_bindgen(js_name = generateOwnerId)]
    pub fn generate_owner_id() -> String {
        OwnerId::anonymous().to_string()
    }

    // ========== WASM Subscription Handle ==========

    /// Subscription handle exposed to JavaScript.
    ///
    /// Call `dispose()` to unsubscribe, or let the JS garbage collector
    /// collect it (the Rust Drop will run via FinalizationRegistry).
    #[wasm_bindgen]
    pub struct WasmSubscription {
        inner: RefCell<Option<Subscription<EngineEvent>>>,
    }

    #[wasm_bindgen]
    impl WasmSubscription {
        /// Unsubscribe from events. Safe to call multiple times.
        pub fn dispose(&self) {
            self.inner.borrow_mut().take();
        }
    }

    // ========== Reports ==========

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct LoadReportJs {
        local: Vec<Collection>,
        updated: Vec<Collection>,
        urls_resolved: usize,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct PollReportJs {
        project: Vec<Collection>,
        selections_added: usize,
        metadata_changed: usize,
        selections_dropped: usize,
        confirmed_deletes: usize,
    }

    impl From<fieldsync_core::PollReport> for PollReportJs {
        fn from(report: fieldsync_core::PollReport) -> Self {
            Self {
                project: report.project,
                selections_added: report.selections_added,
                metadata_changed: report.metadata_changed,
                selections_dropped: report.selections_dropped,
                confirmed_deletes: report.confirmed_deletes,
            }
        }
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct TickReportJs {
        inbound: usize,
        flushed: usize,
        poll: Option<PollReportJs>,
    }

    fn parse_collection(name: &str) -> Result<Collection, JsError> {
        Collection::parse(name).ok_or_else(|| JsError::new(&format!("Unknown collection: {}", name)))
    }

    fn parse_new_image(value: &JsValue) -> Result<NewImage, JsError> {
        let field = |name: &str| js_sys::Reflect::get(value, &name.into()).unwrap_or(JsValue::UNDEFINED);
        let file_name = field("fileName")
            .as_string()
            .ok_or_else(|| JsError::new("Image is missing fileName"))?;
        let bytes = field("bytes");
        if !bytes.is_instance_of::<js_sys::Uint8Array>() {
            return Err(JsError::new(&format!("Image {} is missing bytes", file_name)));
        }
        Ok(NewImage {
            file_name,
            bytes: js_sys::Uint8Array::from(bytes).to_vec(),
            preview_ref: field("previewRef").as_string().unwrap_or_default(),
            is_sketch: field("isSketch").as_bool().unwrap_or(false),
        })
    }

    /// Sync engine exposed to TypeScript.
    ///
    /// Wraps the core `SyncEngine` behind an async mutex; every method that
    /// touches project state returns a Promise.
    #[wasm_bindgen]
    pub struct WasmSyncEngine {
        inner: Rc<Mutex<Engine>>,
        inbox: InboxSender,
        events: Shared<EventBus<EngineEvent>>,
        owner_id: String,
        project_id: String,
        writer_id: String,
    }

    impl WasmSyncEngine {
        /// Apply queued inbound messages now if the engine is idle; otherwise
        /// they are applied on the next `tick()`.
        fn drain_inbox(&self) -> usize {
            match self.inner.try_lock() {
                Some(mut engine) => engine.process_inbound(),
                None => {
                    debug!("Engine busy; inbound message queued");
                    0
                }
            }
        }
    }

    #[wasm_bindgen]
    impl WasmSyncEngine {
        /// Create an engine for one tab.
        ///
        /// `config_json` is a `SyncConfig` JSON object (every field optional).
        /// `owner_id` is the signed-in email, or an id from `generateOwnerId()`.
        #[wasm_bindgen(constructor)]
        pub fn new(
            config_json: Option<String>,
            owner_id: String,
            storage: JsStorage,
            remote: JsRemote,
            objects: JsObjectStore,
            broadcast: JsBroadcast,
        ) -> Result<WasmSyncEngine, JsError> {
            let config = match config_json.as_deref() {
                Some(json) if !json.trim().is_empty() => SyncConfig::from_json(json).map_err(js_error)?,
                _ => SyncConfig::default(),
            };
            if owner_id.trim().is_empty() {
                return Err(JsError::new("ownerId must not be empty"));
            }

            let deps = Collaborators {
                storage: Shared::new(storage),
                remote: Shared::new(remote),
                objects: Shared::new(objects),
                broadcast: Shared::new(broadcast),
                time: Arc::new(SystemTimeSource),
            };
            let engine = SyncEngine::new(config, OwnerId::new(&owner_id), deps);

            Ok(WasmSyncEngine {
                inbox: engine.inbox(),
                events: Shared::clone(engine.events()),
                owner_id: engine.project().owner.to_string(),
                project_id: engine.project().id.clone(),
                writer_id: engine.writer().to_string(),
                inner: Rc::new(Mutex::new(engine)),
            })
        }

        #[wasm_bindgen(getter, js_name = ownerId)]
        pub fn owner_id(&self) -> String {
            self.owner_id.clone()
        }

        #[wasm_bindgen(getter, js_name = projectId)]
        pub fn project_id(&self) -> String {
            self.project_id.clone()
        }

        /// This tab's writer id (16 hex chars).
        #[wasm_bindgen(getter, js_name = writerId)]
        pub fn writer_id(&self) -> String {
            self.writer_id.clone()
        }

        // ========== Lifecycle ==========

        /// Restore local state, then merge the remote replica.
        ///
        /// Rejects if the remote is unreachable; local state is loaded either way.
        #[wasm_bindgen(js_name = loadAll)]
        pub async fn load_all(&self) -> Result<JsValue, JsError> {
            let mut engine = self.inner.lock().await;
            let report = engine.load_all().await.map_err(js_error)?;
            to_js_value(&LoadReportJs {
                local: report.local,
                updated: report.updated,
                urls_resolved: report.urls_resolved,
            })
        }

        #[wasm_bindgen(js_name = startBackgroundSync)]
        pub async fn start_background_sync(&self) {
            self.inner.lock().await.start_background_sync();
        }

        #[wasm_bindgen(js_name = stopBackgroundSync)]
        pub async fn stop_background_sync(&self) {
            self.inner.lock().await.stop_background_sync();
        }

        /// Drive the engine: drain the inbox, send due writes and poll when due.
        /// Call from a `setInterval`.
        pub async fn tick(&self) -> Result<JsValue, JsError> {
            let mut engine = self.inner.lock().await;
            let report = engine.background_tick().await;
            to_js_value(&TickReportJs {
                inbound: report.inbound,
                flushed: report.flushed,
                poll: report.poll.map(PollReportJs::from),
            })
        }

        #[wasm_bindgen(js_name = pollOnce)]
        pub async fn poll_once(&self) -> Result<JsValue, JsError> {
            let mut engine = self.inner.lock().await;
            let report = engine.poll_once().await.map_err(js_error)?;
            to_js_value(&PollReportJs::from(report))
        }

        /// Send every pending write now. Call from `visibilitychange`/`pagehide`.
        #[wasm_bindgen(js_name = saveAllNow)]
        pub async fn save_all_now(&self) -> Result<(), JsError> {
            self.inner.lock().await.save_all_now().await.map_err(js_error)
        }

        #[wasm_bindgen(js_name = forceFlush)]
        pub async fn force_flush(&self, collection: String) -> Result<bool, JsError> {
            let collection = parse_collection(&collection)?;
            self.inner
                .lock()
                .await
                .force_flush(collection)
                .await
                .map_err(js_error)
        }

        /// Remove the project locally, in other tabs and remotely.
        #[wasm_bindgen(js_name = clearAll)]
        pub async fn clear_all(&self) -> Result<(), JsError> {
            self.inner.lock().await.clear_all().await.map_err(js_error)
        }

        // ========== State ==========

        pub async fn snapshot(&self) -> Result<JsValue, JsError> {
            let engine = self.inner.lock().await;
            to_js_value(engine.snapshot())
        }

        #[wasm_bindgen(js_name = isPending)]
        pub async fn is_pending(&self, collection: String) -> Result<bool, JsError> {
            let collection = parse_collection(&collection)?;
            Ok(self.inner.lock().await.is_pending(collection))
        }

        #[wasm_bindgen(js_name = undoDepth)]
        pub async fn undo_depth(&self) -> usize {
            self.inner.lock().await.undo_depth()
        }

        // ========== Mutations ==========

        /// Patch form fields: `{ elr?, structureNo?, date? }`.
        #[wasm_bindgen(js_name = setFormField)]
        pub async fn set_form_field(&self, patch: JsValue) -> Result<(), JsError> {
            let patch: FormPatch = serde_wasm_bindgen::from_value(patch).map_err(js_error)?;
            validate_form_patch(&patch).map_err(js_error)?;
            self.inner.lock().await.set_form_field(patch);
            Ok(())
        }

        /// Add images: an array of `{ fileName, bytes: Uint8Array, previewRef?, isSketch? }`.
        /// Resolves to the new image records.
        #[wasm_bindgen(js_name = addImages)]
        pub async fn add_images(&self, files: js_sys::Array) -> Result<JsValue, JsError> {
            let files = files
                .iter()
                .map(|file| parse_new_image(&file))
                .collect::<Result<Vec<_>, _>>()?;
            let added = self.inner.lock().await.add_images(files).await.map_err(js_error)?;
            to_js_value(&added)
        }

        /// Select or deselect an image. Resolves to the new instance id, or
        /// `undefined` when the image was deselected.
        #[wasm_bindgen(js_name = toggleSelection)]
        pub async fn toggle_selection(&self, image_id: String) -> Result<Option<String>, JsError> {
            self.inner
                .lock()
                .await
                .toggle_selection(&image_id)
                .map_err(js_error)
        }

        #[wasm_bindgen(js_name = addSelectionInstance)]
        pub async fn add_selection_instance(&self, image_id: String) -> Result<String, JsError> {
            self.inner
                .lock()
                .await
                .add_selection_instance(&image_id)
                .map_err(js_error)
        }

        #[wasm_bindgen(js_name = removeSelection)]
        pub async fn remove_selection(&self, instance_id: String) -> bool {
            self.inner.lock().await.remove_selection(&instance_id)
        }

        /// Mark a drag in progress; auto-sort waits until `setSelectionOrder`.
        #[wasm_bindgen(js_name = beginReorder)]
        pub async fn begin_reorder(&self) {
            self.inner.lock().await.begin_reorder();
        }

        #[wasm_bindgen(js_name = setSelectionOrder)]
        pub async fn set_selection_order(&self, instance_ids: Vec<String>) {
            self.inner.lock().await.set_selection_order(&instance_ids);
        }

        /// Patch one instance: `{ photoNumber?, description? }`.
        #[wasm_bindgen(js_name = updateInstanceMetadata)]
        pub async fn update_instance_metadata(
            &self,
            instance_id: String,
            patch: JsValue,
        ) -> Result<(), JsError> {
            let patch: MetadataPatch = serde_wasm_bindgen::from_value(patch).map_err(js_error)?;
            validate_metadata_patch(&patch).map_err(js_error)?;
            self.inner
                .lock()
                .await
                .update_instance_metadata(&instance_id, patch)
                .map_err(js_error)
        }

        /// Replace the bulk defect list.
        #[wasm_bindgen(js_name = setBulkDefects)]
        pub async fn set_bulk_defects(&self, records: JsValue) -> Result<(), JsError> {
            let records: Vec<BulkDefectRecord> = serde_wasm_bindgen::from_value(records).map_err(js_error)?;
            for record in &records {
                validate_metadata_patch(&MetadataPatch {
                    photo_number: Some(record.photo_number.clone()),
                    description: Some(record.description.clone()),
                })
                .map_err(js_error)?;
            }
            self.inner.lock().await.set_bulk_defects(records);
            Ok(())
        }

        #[wasm_bindgen(js_name = deleteBulkDefect)]
        pub async fn delete_bulk_defect(&self, id: String) -> bool {
            self.inner.lock().await.delete_bulk_defect(&id)
        }

        /// Restore the most recently deleted bulk defect, resolving to it
        /// (or `undefined` when the undo log is empty).
        #[wasm_bindgen(js_name = undoLastDelete)]
        pub async fn undo_last_delete(&self) -> Result<JsValue, JsError> {
            match self.inner.lock().await.undo_last_delete() {
                Some(record) => to_js_value(&record),
                None => Ok(JsValue::UNDEFINED),
            }
        }

        /// Patch view state: `{ lastActiveTab?, panelExpanded?, gridWidth?, scrollPositions? }`.
        #[wasm_bindgen(js_name = setSessionView)]
        pub async fn set_session_view(&self, patch: JsValue) -> Result<(), JsError> {
            let patch: SessionPatch = serde_wasm_bindgen::from_value(patch).map_err(js_error)?;
            self.inner.lock().await.set_session_view(patch);
            Ok(())
        }

        /// `{ mode: "manual" | "fileName" | ..., direction: "asc" | "desc" }`.
        #[wasm_bindgen(js_name = setSortPreferences)]
        pub async fn set_sort_preferences(&self, prefs: JsValue) -> Result<(), JsError> {
            let prefs: SortPreferences = serde_wasm_bindgen::from_value(prefs).map_err(js_error)?;
            self.inner.lock().await.set_sort_preferences(prefs);
            Ok(())
        }

        // ========== Inbound ==========

        /// Forward a `BroadcastChannel` message from another tab.
        #[wasm_bindgen(js_name = deliverBroadcast)]
        pub fn deliver_broadcast(&self, message: JsValue) -> Result<usize, JsError> {
            let message: BroadcastMessage = serde_wasm_bindgen::from_value(message).map_err(js_error)?;
            if self.inbox.unbounded_send(Inbound::Broadcast(message)).is_err() {
                return Err(JsError::new("Engine inbox closed"));
            }
            Ok(self.drain_inbox())
        }

        /// Forward a `storage` event key written by another tab.
        #[wasm_bindgen(js_name = storageChanged)]
        pub fn storage_changed(&self, key: String) -> Result<usize, JsError> {
            if self.inbox.unbounded_send(Inbound::StorageChanged(key)).is_err() {
                return Err(JsError::new("Engine inbox closed"));
            }
            Ok(self.drain_inbox())
        }

        // ========== Events ==========

        /// Subscribe to engine events (`collectionChanged`, `flushed`, ...).
        ///
        /// Returns a `WasmSubscription` handle. Call `dispose()` on it to unsubscribe,
        /// or let the JS garbage collector clean it up.
        #[wasm_bindgen(js_name = subscribeEvents)]
        pub fn subscribe_events(&self, callback: js_sys::Function) -> WasmSubscription {
            let rust_closure = move |event: EngineEvent| {
                if let Ok(js_event) = to_js(&event) {
                    let _ = callback.call1(&JsValue::NULL, &js_event);
                }
            };

            WasmSubscription {
                inner: RefCell::new(Some(self.events.subscribe(rust_closure))),
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use wasm_impl::*;
