use std::collections::HashSet;

use glam::Vec2;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[cfg(target_arch = "wasm32")]
pub mod wasm;

/// Identifier for a mouse button (left button is zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MouseButton(u8);

impl MouseButton {
    pub const LEFT: Self = Self(0);
    pub const RIGHT: Self = Self(2);

    pub fn new(index: u8) -> Self {
        Self(index)
    }

    pub fn index(self) -> u8 {
        self.0
    }
}

/// Pointer movement accumulated between two frames.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Gesture {
    /// Drag distance in pixels while the primary button is held.
    pub rotate: Vec2,
    /// Wheel direction: positive zooms out.
    pub zoom: f32,
}

/// Pointer snapshot shared between event handlers and the draw loop.
#[derive(Debug, Default)]
pub struct InputState {
    buttons: RwLock<HashSet<MouseButton>>,
    pointer: RwLock<Option<Vec2>>,
    pending: RwLock<Gesture>,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mouse_button_down(&self, button: MouseButton) {
        self.buttons.write().insert(button);
    }

    pub fn set_mouse_button_up(&self, button: MouseButton) {
        self.buttons.write().remove(&button);
    }

    pub fn is_mouse_button_down(&self, button: MouseButton) -> bool {
        self.buttons.read().contains(&button)
    }

    /// Records a pointer position; drags with the primary button accumulate
    /// into the pending rotate gesture.
    pub fn set_mouse_position(&self, position: Vec2) {
        let previous = self.pointer.write().replace(position);
        if let Some(previous) = previous {
            if self.is_mouse_button_down(MouseButton::LEFT) {
                self.pending.write().rotate += position - previous;
            }
        }
    }

    pub fn mouse_position(&self) -> Option<Vec2> {
        *self.pointer.read()
    }

    pub fn pointer_left(&self) {
        *self.pointer.write() = None;
        self.buttons.write().clear();
    }

    pub fn scroll(&self, delta_y: f32) {
        if delta_y.is_finite() && delta_y != 0.0 {
            self.pending.write().zoom += delta_y.signum();
        }
    }

    /// Returns and clears the gesture accumulated since the last call.
    pub fn take_gesture(&self) -> Gesture {
        std::mem::take(&mut *self.pending.write())
    }
}
