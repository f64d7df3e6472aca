//! Supports additional targets discovery and allows to attach to them.

use serde::{Deserialize, Serialize};

use crate::{Command, Method, MethodId, MethodType};

/// Opaque identifier of a target (tab, iframe, worker).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        TargetId(id.into())
    }

    pub fn inner(&self) -> &String {
        &self.0
    }
}

impl AsRef<str> for TargetId {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for TargetId {
    fn from(id: String) -> Self {
        TargetId(id)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        TargetId(id.to_string())
    }
}

impl From<TargetId> for String {
    fn from(id: TargetId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier of an attached debugging session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    pub fn inner(&self) -> &String {
        &self.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        SessionId(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        SessionId(id.to_string())
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: TargetId,
    /// `page`, `iframe`, `worker`, `service_worker`, `browser`, ...
    pub r#type: String,
    pub title: String,
    pub url: String,
    /// Whether the target has an attached client.
    pub attached: bool,
    /// Opener target Id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opener_id: Option<TargetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_context_id: Option<String>,
}

impl TargetInfo {
    pub fn is_page(&self) -> bool {
        self.r#type == "page"
    }

    pub fn is_iframe(&self) -> bool {
        self.r#type == "iframe"
    }
}

/// Controls whether to discover available targets and notify via
/// `targetCreated/targetInfoChanged/targetDestroyed` events.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetDiscoverTargetsParams {
    pub discover: bool,
}

impl SetDiscoverTargetsParams {
    pub const IDENTIFIER: &'static str = "Target.setDiscoverTargets";

    pub fn new(discover: bool) -> Self {
        Self { discover }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SetDiscoverTargetsReturns {}

impl Method for SetDiscoverTargetsParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for SetDiscoverTargetsParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for SetDiscoverTargetsParams {
    type Response = SetDiscoverTargetsReturns;
}

/// Controls whether to automatically attach to new targets which are
/// considered to be related to the session issuing this command.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetAutoAttachParams {
    pub auto_attach: bool,
    /// Whether to pause new targets when attaching to them.
    pub wait_for_debugger_on_start: bool,
    /// Enables "flat" access to the session via specifying sessionId
    /// attribute in the commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flatten: Option<bool>,
}

impl SetAutoAttachParams {
    pub const IDENTIFIER: &'static str = "Target.setAutoAttach";

    pub fn new(auto_attach: bool, wait_for_debugger_on_start: bool) -> Self {
        Self {
            auto_attach,
            wait_for_debugger_on_start,
            flatten: Some(true),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SetAutoAttachReturns {}

impl Method for SetAutoAttachParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for SetAutoAttachParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for SetAutoAttachParams {
    type Response = SetAutoAttachReturns;
}

/// Attaches to the target with given id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachToTargetParams {
    pub target_id: TargetId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flatten: Option<bool>,
}

impl AttachToTargetParams {
    pub const IDENTIFIER: &'static str = "Target.attachToTarget";

    pub fn new(target_id: impl Into<TargetId>) -> Self {
        Self {
            target_id: target_id.into(),
            flatten: Some(true),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachToTargetReturns {
    pub session_id: SessionId,
}

impl Method for AttachToTargetParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for AttachToTargetParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for AttachToTargetParams {
    type Response = AttachToTargetReturns;
}

/// Issued when attached to target because of auto-attach or `attachToTarget`
/// command.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventAttachedToTarget {
    /// Identifier assigned to the session used to send/receive messages.
    pub session_id: SessionId,
    pub target_info: TargetInfo,
    pub waiting_for_debugger: bool,
}

impl EventAttachedToTarget {
    pub const IDENTIFIER: &'static str = "Target.attachedToTarget";
}

impl MethodType for EventAttachedToTarget {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

/// Issued when detached from target for any reason (including
/// `detachFromTarget` command).
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventDetachedFromTarget {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
}

impl EventDetachedFromTarget {
    pub const IDENTIFIER: &'static str = "Target.detachedFromTarget";
}

impl MethodType for EventDetachedFromTarget {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

/// Issued when a possible inspection target is created.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventTargetCreated {
    pub target_info: TargetInfo,
}

impl EventTargetCreated {
    pub const IDENTIFIER: &'static str = "Target.targetCreated";
}

impl MethodType for EventTargetCreated {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

/// Issued when some information about a target has changed. This only happens
/// between `targetCreated` and `targetDestroyed`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventTargetInfoChanged {
    pub target_info: TargetInfo,
}

impl EventTargetInfoChanged {
    pub const IDENTIFIER: &'static str = "Target.targetInfoChanged";
}

impl MethodType for EventTargetInfoChanged {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

/// Issued when a target is destroyed.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventTargetDestroyed {
    pub target_id: TargetId,
}

impl EventTargetDestroyed {
    pub const IDENTIFIER: &'static str = "Target.targetDestroyed";
}

impl MethodType for EventTargetDestroyed {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}
