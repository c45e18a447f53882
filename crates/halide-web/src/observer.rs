//! Translate DOM mutations into [`HostEvent`]s.

use halide_engine::{Host, HostEvent, Pipeline, SurfaceId};
use tracing::trace;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{Element, MutationObserver, MutationObserverInit, MutationRecord, Node};

use crate::dom::{DomHost, ID_ATTR, OVERLAY_ATTR};

/// Attributes whose changes can alter what a surface displays.
const WATCHED_ATTRIBUTES: [&str; 3] = ["src", "srcset", "style"];

type Callback = Closure<dyn FnMut(js_sys::Array, MutationObserver)>;

/// A live `MutationObserver` on the document body. Disconnects on drop.
pub struct Watcher {
    observer: MutationObserver,
    _callback: Callback,
}

impl Watcher {
    /// Observe the document body and forward events to `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns the browser error if the observer cannot be created or
    /// attached.
    pub fn observe(pipeline: Pipeline<DomHost>) -> Result<Self, JsValue> {
        let callback: Callback = Closure::new(move |records: js_sys::Array, _: MutationObserver| {
            for event in translate(pipeline.host(), &records) {
                trace!(?event, "dom mutation");
                pipeline.notify(event);
            }
        });
        let observer = MutationObserver::new(callback.as_ref().unchecked_ref())?;

        let filter = js_sys::Array::new();
        for name in WATCHED_ATTRIBUTES {
            filter.push(&JsValue::from_str(name));
        }
        let init = MutationObserverInit::new();
        init.set_child_list(true);
        init.set_subtree(true);
        init.set_attributes(true);
        init.set_attribute_filter(&filter);

        let body = web_sys::window()
            .and_then(|w| w.document())
            .and_then(|d| d.body())
            .ok_or_else(|| JsValue::from_str("no document body"))?;
        observer.observe_with_options(&body, &init)?;
        Ok(Self {
            observer,
            _callback: callback,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.observer.disconnect();
    }
}

fn surface_id(element: &Element) -> Option<SurfaceId> {
    element.get_attribute(ID_ATTR)?.parse().ok()
}

fn overlay_id(node: &Node) -> Option<SurfaceId> {
    node.dyn_ref::<Element>()?.get_attribute(OVERLAY_ATTR)?.parse().ok()
}

/// Events for one batch of mutation records.
fn translate(host: &DomHost, records: &js_sys::Array) -> Vec<HostEvent> {
    let mut events = Vec::new();
    let mut changed = false;

    for record in records.iter().filter_map(|r| r.dyn_into::<MutationRecord>().ok()) {
        match record.type_().as_str() {
            "attributes" => {
                let tracked = record
                    .target()
                    .and_then(|t| t.dyn_into::<Element>().ok())
                    .and_then(|e| surface_id(&e));
                match tracked.and_then(|id| Some((id, host.read_reference(id)?))) {
                    Some((id, value)) => events.push(HostEvent::ReferenceChanged { id, value }),
                    None => changed = true,
                }
            }
            "childList" => {
                let removed = record.removed_nodes();
                for node in (0..removed.length()).filter_map(|i| removed.item(i)) {
                    if let Some(id) = host.current_overlay_of(&node) {
                        events.push(HostEvent::OverlayRemoved(id));
                    }
                }
                let added = record.added_nodes();
                changed |= (0..added.length())
                    .filter_map(|i| added.item(i))
                    .any(|node| overlay_id(&node).is_none());
            }
            _ => {}
        }
    }

    events.extend(host.take_detached().into_iter().map(HostEvent::SurfaceDetached));
    if changed {
        events.push(HostEvent::SurfacesChanged);
    }
    events
}
