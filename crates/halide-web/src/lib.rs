//! halide-web: browser host for the halide engine.
//!
//! Binds `halide-engine` to a live page: [`dom::DomHost`] implements
//! the engine's host traits over `web-sys`, [`observer::Watcher`] turns
//! DOM mutations into host events, and [`raster`] moves pixels between
//! canvases, the pipeline, and Blob URLs.
//!
//! The JavaScript surface is a handful of functions:
//!
//! - `start(configJson?, lutBase?, logFilter?)` creates the pipeline,
//!   starts observing the page, and runs the initial pass.
//! - `applySettings(settingsJson)` resolves to a JSON processing summary.
//! - `handleMessage(messageJson)` resolves to a JSON control response.
//! - `stats()` returns the engine counters as JSON.
//! - `teardown()` reverts every surface and stops all background work.

use std::cell::RefCell;

use halide_engine::{ControlMessage, ControlResponse, EngineConfig, Pipeline};
use halide_pipeline::Settings;
use tracing::info;
use wasm_bindgen::prelude::*;

pub mod dom;
pub mod logging;
pub mod observer;
pub mod raster;

use dom::DomHost;
use observer::Watcher;

struct App {
    pipeline: Pipeline<DomHost>,
    _watcher: Watcher,
}

thread_local! {
    static APP: RefCell<Option<App>> = const { RefCell::new(None) };
}

fn pipeline() -> Result<Pipeline<DomHost>, JsValue> {
    APP.with_borrow(|app| app.as_ref().map(|app| app.pipeline.clone()))
        .ok_or_else(|| JsValue::from_str("halide is not started"))
}

fn to_js(error: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&error.to_string())
}

/// Module initialization: route panics to the console.
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
}

/// Create the pipeline, observe the page, and run the initial pass.
/// A running instance is torn down first.
///
/// # Errors
///
/// Returns an error if `config_json` does not parse or the page has no
/// body to observe.
#[wasm_bindgen]
pub fn start(
    config_json: Option<String>,
    lut_base: Option<String>,
    log_filter: Option<String>,
) -> Result<(), JsValue> {
    logging::init(log_filter.as_deref());
    let config: EngineConfig = match config_json {
        Some(json) => serde_json::from_str(&json).map_err(to_js)?,
        None => EngineConfig::default(),
    };

    teardown();
    let host = DomHost::new(lut_base.unwrap_or_else(|| DomHost::DEFAULT_LUT_BASE.to_owned()))
        .with_background_margin(config.discovery.viewport_margin);
    let pipeline = Pipeline::new(host, config);
    let watcher = Watcher::observe(pipeline.clone())?;
    pipeline.start();
    APP.with_borrow_mut(|app| {
        *app = Some(App {
            pipeline,
            _watcher: watcher,
        });
    });
    info!("halide started");
    Ok(())
}

/// Apply a settings snapshot (`{"presetId": ..., "grainEnabled": ...}`).
/// Resolves to the JSON processing summary.
///
/// # Errors
///
/// Rejects if the JSON is malformed, the pipeline is not started, or
/// the preset cannot be fetched or parsed.
#[wasm_bindgen(js_name = applySettings)]
pub async fn apply_settings(settings_json: String) -> Result<String, JsValue> {
    let settings: Settings = serde_json::from_str(&settings_json).map_err(to_js)?;
    let summary = pipeline()?.apply_settings(settings).await.map_err(to_js)?;
    serde_json::to_string(&summary).map_err(to_js)
}

/// Handle a JSON control message. Always resolves to a JSON
/// `ControlResponse`.
#[wasm_bindgen(js_name = handleMessage)]
pub async fn handle_message(message_json: String) -> String {
    let response = match (ControlMessage::from_json(&message_json), pipeline()) {
        (Ok(message), Ok(pipeline)) => pipeline.handle_message(message).await,
        (Err(e), _) => ControlResponse::failed(e),
        (_, Err(_)) => ControlResponse::failed("halide is not started"),
    };
    serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"success":false,"error":"unserializable response"}"#.to_owned())
}

/// Engine counters as JSON.
///
/// # Errors
///
/// Returns an error if the pipeline is not started.
#[wasm_bindgen]
pub fn stats() -> Result<String, JsValue> {
    serde_json::to_string(&pipeline()?.stats()).map_err(to_js)
}

/// Revert every surface, stop observing, and drop the pipeline.
#[wasm_bindgen]
pub fn teardown() {
    if let Some(app) = APP.with_borrow_mut(Option::take) {
        app.pipeline.teardown();
    }
}
