//! Runtime domain: script evaluation, bindings and console observation.

use serde::{Deserialize, Serialize};

use crate::{Command, Method, MethodId, MethodType};

/// Mirror object referencing original JavaScript object.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    /// Object type: `object`, `function`, `undefined`, `string`, `number`,
    /// `boolean`, `symbol`, `bigint`.
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Remote object value in case of primitive values or JSON values (if it
    /// was requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Stack entry for runtime errors and assertions.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub function_name: String,
    pub url: String,
    pub line_number: i64,
    pub column_number: i64,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StackTrace {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub call_frames: Vec<CallFrame>,
}

/// Detailed information about exception (or error) that was thrown during
/// script compilation or execution.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub text: String,
    pub line_number: i64,
    pub column_number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteObject>,
}

impl std::fmt::Display for ExceptionDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}: {}",
            self.line_number, self.column_number, self.text
        )
    }
}

/// Evaluates expression on global object.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
    /// Expression to evaluate.
    pub expression: String,
    /// Whether the result is expected to be a JSON object that should be sent
    /// by value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_by_value: Option<bool>,
    /// Whether execution should `await` for resulting value and return once
    /// awaited promise is resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub await_promise: Option<bool>,
    /// In silent mode exceptions thrown during evaluation are not reported
    /// and do not pause execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_gesture: Option<bool>,
}

impl EvaluateParams {
    pub const IDENTIFIER: &'static str = "Runtime.evaluate";

    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            return_by_value: None,
            await_promise: None,
            silent: None,
            user_gesture: None,
        }
    }

    /// An expression whose JSON result is wanted back, evaluated silently.
    pub fn by_value(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            return_by_value: Some(true),
            await_promise: Some(true),
            silent: Some(true),
            user_gesture: None,
        }
    }
}

impl From<&str> for EvaluateParams {
    fn from(expression: &str) -> Self {
        EvaluateParams::new(expression)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateReturns {
    pub result: RemoteObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_details: Option<ExceptionDetails>,
}

impl Method for EvaluateParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for EvaluateParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for EvaluateParams {
    type Response = EvaluateReturns;
}

/// Enables reporting of execution contexts creation and console messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EnableParams {}

impl EnableParams {
    pub const IDENTIFIER: &'static str = "Runtime.enable";
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

/// If executionContextId is empty, adds binding with the given name on the
/// global objects of all inspected contexts. The binding function survives
/// navigations. Calling it reports its payload via the `bindingCalled` event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddBindingParams {
    pub name: String,
}

impl AddBindingParams {
    pub const IDENTIFIER: &'static str = "Runtime.addBinding";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct AddBindingReturns {}

impl Method for AddBindingParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for AddBindingParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for AddBindingParams {
    type Response = AddBindingReturns;
}

/// Tells inspected instance to run if it was waiting for debugger to attach.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RunIfWaitingForDebuggerParams {}

impl RunIfWaitingForDebuggerParams {
    pub const IDENTIFIER: &'static str = "Runtime.runIfWaitingForDebugger";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RunIfWaitingForDebuggerReturns {}

impl Method for RunIfWaitingForDebuggerParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for RunIfWaitingForDebuggerParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for RunIfWaitingForDebuggerParams {
    type Response = RunIfWaitingForDebuggerReturns;
}

/// Notification is issued every time when binding is called.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventBindingCalled {
    pub name: String,
    pub payload: String,
    /// Identifier of the context where the call was made.
    pub execution_context_id: i64,
}

impl EventBindingCalled {
    pub const IDENTIFIER: &'static str = "Runtime.bindingCalled";
}

impl MethodType for EventBindingCalled {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

/// Issued when console API was called.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventConsoleApiCalled {
    /// Type of the call: `log`, `debug`, `info`, `error`, `warning`, ...
    pub r#type: String,
    #[serde(default)]
    pub args: Vec<RemoteObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<StackTrace>,
}

impl EventConsoleApiCalled {
    pub const IDENTIFIER: &'static str = "Runtime.consoleAPICalled";
}

impl MethodType for EventConsoleApiCalled {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}
