//! Actions and events related to the inspected page.

use serde::{Deserialize, Serialize};

use crate::{Command, Method, MethodId, MethodType};

/// Unique script identifier returned by `addScriptToEvaluateOnNewDocument`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptIdentifier(String);

impl ScriptIdentifier {
    pub fn inner(&self) -> &String {
        &self.0
    }
}

impl From<String> for ScriptIdentifier {
    fn from(id: String) -> Self {
        ScriptIdentifier(id)
    }
}

impl AsRef<str> for ScriptIdentifier {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

/// Enables page domain notifications.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EnableParams {}

impl EnableParams {
    pub const IDENTIFIER: &'static str = "Page.enable";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EnableReturns {}

impl Method for EnableParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for EnableParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for EnableParams {
    type Response = EnableReturns;
}

/// Evaluates given script in every frame upon creation (before loading
/// frame's scripts).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddScriptToEvaluateOnNewDocumentParams {
    pub source: String,
    /// If true, runs the script immediately on existing execution contexts
    /// or worlds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_immediately: Option<bool>,
}

impl AddScriptToEvaluateOnNewDocumentParams {
    pub const IDENTIFIER: &'static str = "Page.addScriptToEvaluateOnNewDocument";

    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            run_immediately: None,
        }
    }

    /// Run the script in already-live contexts as well as future documents.
    pub fn run_immediately(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            run_immediately: Some(true),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddScriptToEvaluateOnNewDocumentReturns {
    pub identifier: ScriptIdentifier,
}

impl Method for AddScriptToEvaluateOnNewDocumentParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for AddScriptToEvaluateOnNewDocumentParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for AddScriptToEvaluateOnNewDocumentParams {
    type Response = AddScriptToEvaluateOnNewDocumentReturns;
}

/// Starts sending each frame using the `screencastFrame` event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartScreencastParams {
    /// Image compression format: `jpeg` or `png`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Compression quality from range [0..100].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<i64>,
    /// Send every n-th frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub every_nth_frame: Option<i64>,
}

impl StartScreencastParams {
    pub const IDENTIFIER: &'static str = "Page.startScreencast";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct StartScreencastReturns {}

impl Method for StartScreencastParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for StartScreencastParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for StartScreencastParams {
    type Response = StartScreencastReturns;
}

/// Stops sending each frame in the `screencastFrame`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct StopScreencastParams {}

impl StopScreencastParams {
    pub const IDENTIFIER: &'static str = "Page.stopScreencast";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct StopScreencastReturns {}

impl Method for StopScreencastParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for StopScreencastParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for StopScreencastParams {
    type Response = StopScreencastReturns;
}

/// Acknowledges that a screencast frame has been received by the frontend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScreencastFrameAckParams {
    /// Frame number.
    pub session_id: i64,
}

impl ScreencastFrameAckParams {
    pub const IDENTIFIER: &'static str = "Page.screencastFrameAck";

    pub fn new(session_id: i64) -> Self {
        Self { session_id }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScreencastFrameAckReturns {}

impl Method for ScreencastFrameAckParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for ScreencastFrameAckParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for ScreencastFrameAckParams {
    type Response = ScreencastFrameAckReturns;
}

/// Screencast frame metadata.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScreencastFrameMetadata {
    pub offset_top: f64,
    pub page_scale_factor: f64,
    pub device_width: f64,
    pub device_height: f64,
    pub scroll_offset_x: f64,
    pub scroll_offset_y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

/// Compressed image data requested by the `startScreencast`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventScreencastFrame {
    /// Base64-encoded compressed image.
    pub data: String,
    pub metadata: ScreencastFrameMetadata,
    /// Frame number, to be acknowledged.
    pub session_id: i64,
}

impl EventScreencastFrame {
    pub const IDENTIFIER: &'static str = "Page.screencastFrame";
}

impl MethodType for EventScreencastFrame {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}
