//! Dispatching synthesized input events to the page.

use serde::{Deserialize, Serialize};

use crate::{Command, Method, MethodId, MethodType};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMouseEventType {
    #[serde(rename = "mousePressed")]
    MousePressed,
    #[serde(rename = "mouseReleased")]
    MouseReleased,
    #[serde(rename = "mouseMoved")]
    MouseMoved,
    #[serde(rename = "mouseWheel")]
    MouseWheel,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    None,
    Left,
    Middle,
    Right,
    Back,
    Forward,
}

/// Dispatches a mouse event to the page.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMouseEventParams {
    pub r#type: DispatchMouseEventType,
    /// X coordinate of the event relative to the main frame's viewport in
    /// CSS pixels.
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button: Option<MouseButton>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buttons: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_count: Option<i64>,
    /// X delta in CSS pixels for mouse wheel event (default: 0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_y: Option<f64>,
}

impl DispatchMouseEventParams {
    pub const IDENTIFIER: &'static str = "Input.dispatchMouseEvent";

    /// A bare mouse move to the given viewport coordinates.
    pub fn moved(x: f64, y: f64) -> Self {
        Self::new(DispatchMouseEventType::MouseMoved, x, y)
    }

    pub fn new(r#type: DispatchMouseEventType, x: f64, y: f64) -> Self {
        Self {
            r#type,
            x,
            y,
            button: None,
            buttons: None,
            click_count: None,
            delta_x: None,
            delta_y: None,
        }
    }

    /// Left-button press/release pair helpers for click synthesis.
    pub fn left_button(mut self) -> Self {
        self.button = Some(MouseButton::Left);
        self.click_count = Some(1);
        self
    }

    pub fn wheel(x: f64, y: f64, delta_y: f64) -> Self {
        let mut p = Self::new(DispatchMouseEventType::MouseWheel, x, y);
        p.delta_x = Some(0.0);
        p.delta_y = Some(delta_y);
        p
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DispatchMouseEventReturns {}

impl Method for DispatchMouseEventParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for DispatchMouseEventParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for DispatchMouseEventParams {
    type Response = DispatchMouseEventReturns;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKeyEventType {
    #[serde(rename = "keyDown")]
    KeyDown,
    #[serde(rename = "keyUp")]
    KeyUp,
    #[serde(rename = "rawKeyDown")]
    RawKeyDown,
    #[serde(rename = "char")]
    Char,
}

/// Dispatches a key event to the page.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchKeyEventParams {
    pub r#type: DispatchKeyEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Unique DOM defined string value for each physical key (e.g., 'KeyA').
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Unique DOM defined string value describing the meaning of the key
    /// (e.g., 'AltGr').
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub windows_virtual_key_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_virtual_key_code: Option<i64>,
}

impl DispatchKeyEventParams {
    pub const IDENTIFIER: &'static str = "Input.dispatchKeyEvent";

    pub fn new(r#type: DispatchKeyEventType) -> Self {
        Self {
            r#type,
            text: None,
            code: None,
            key: None,
            windows_virtual_key_code: None,
            native_virtual_key_code: None,
        }
    }

    /// A named key like `Tab`, `ArrowDown` or ` ` (space).
    pub fn named(r#type: DispatchKeyEventType, key: &str, code: &str, vk: i64) -> Self {
        let mut p = Self::new(r#type);
        p.key = Some(key.to_string());
        p.code = Some(code.to_string());
        p.windows_virtual_key_code = Some(vk);
        p.native_virtual_key_code = Some(vk);
        p
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DispatchKeyEventReturns {}

impl Method for DispatchKeyEventParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for DispatchKeyEventParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for DispatchKeyEventParams {
    type Response = DispatchKeyEventReturns;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_event_wire_shape() {
        let params = DispatchMouseEventParams::new(DispatchMouseEventType::MousePressed, 10.5, 20.0)
            .left_button();
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["type"], "mousePressed");
        assert_eq!(json["button"], "left");
        assert_eq!(json["clickCount"], 1);
        assert!(json.get("deltaY").is_none());
    }

    #[test]
    fn key_event_wire_shape() {
        let params = DispatchKeyEventParams::named(DispatchKeyEventType::KeyDown, "Tab", "Tab", 9);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["type"], "keyDown");
        assert_eq!(json["windowsVirtualKeyCode"], 9);
    }
}
