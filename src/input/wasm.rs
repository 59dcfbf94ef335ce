use std::sync::Arc;

use glam::Vec2;
use gloo_events::{EventListener, EventListenerOptions};
use wasm_bindgen::JsCast;
use web_sys::{HtmlCanvasElement, PointerEvent, WheelEvent};

use super::{InputState, MouseButton};

/// Handles DOM pointer events on the canvas and updates the shared
/// [`InputState`]. Listeners are removed when the handler is dropped.
pub struct CanvasInputHandler {
    listeners: Vec<EventListener>,
}

impl CanvasInputHandler {
    pub fn attach(canvas: &HtmlCanvasElement, input: Arc<InputState>) -> Self {
        let mut listeners = Vec::new();

        {
            let input_state = Arc::clone(&input);
            listeners.push(EventListener::new(canvas, "pointerdown", move |event| {
                let Some(event) = event.dyn_ref::<PointerEvent>() else {
                    return;
                };
                input_state.set_mouse_position(offset(event));
                input_state.set_mouse_button_down(MouseButton::new(event.button() as u8));
            }));
        }

        {
            let input_state = Arc::clone(&input);
            listeners.push(EventListener::new(canvas, "pointerup", move |event| {
                let Some(event) = event.dyn_ref::<PointerEvent>() else {
                    return;
                };
                input_state.set_mouse_button_up(MouseButton::new(event.button() as u8));
            }));
        }

        {
            let input_state = Arc::clone(&input);
            listeners.push(EventListener::new(canvas, "pointermove", move |event| {
                if let Some(event) = event.dyn_ref::<PointerEvent>() {
                    input_state.set_mouse_position(offset(event));
                }
            }));
        }

        for name in ["pointerleave", "pointercancel"] {
            let input_state = Arc::clone(&input);
            listeners.push(EventListener::new(canvas, name, move |_| {
                input_state.pointer_left();
            }));
        }

        {
            // Page scrolling is suppressed while the wheel zooms the model.
            let input_state = Arc::clone(&input);
            listeners.push(EventListener::new_with_options(
                canvas,
                "wheel",
                EventListenerOptions::enable_prevent_default(),
                move |event| {
                    let Some(event) = event.dyn_ref::<WheelEvent>() else {
                        return;
                    };
                    event.prevent_default();
                    input_state.scroll(event.delta_y() as f32);
                },
            ));
        }

        Self { listeners }
    }
}

impl Drop for CanvasInputHandler {
    fn drop(&mut self) {
        self.listeners.clear();
    }
}

fn offset(event: &PointerEvent) -> Vec2 {
    Vec2::new(event.offset_x() as f32, event.offset_y() as f32)
}
