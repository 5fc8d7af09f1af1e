use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::call::{ToolCall, ToolContext, ToolResponse};
use super::definition::ToolDefinition;
use super::panic_message;

pub type HookError = Box<dyn StdError + Send + Sync>;
pub type HookResult = Result<(), HookError>;

type RegisterHookFn = dyn Fn(&ToolDefinition) -> HookResult + Send + Sync;
type ExecutionHookFn = dyn Fn(&ExecutionEvent) -> HookResult + Send + Sync;
type AsyncExecutionHookFn = dyn Fn(ExecutionEvent) -> BoxFuture<'static, HookResult> + Send + Sync;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    BeforeRegister,
    AfterRegister,
    BeforeExecute,
    AfterExecute,
    OnError,
}

impl HookKind {
    pub const ALL: [HookKind; 5] = [
        HookKind::BeforeRegister,
        HookKind::AfterRegister,
        HookKind::BeforeExecute,
        HookKind::AfterExecute,
        HookKind::OnError,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::BeforeRegister => "before_register",
            Self::AfterRegister => "after_register",
            Self::BeforeExecute => "before_execute",
            Self::AfterExecute => "after_execute",
            Self::OnError => "on_error",
        }
    }

    pub fn is_registration(&self) -> bool {
        matches!(self, Self::BeforeRegister | Self::AfterRegister)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot handed to execution hooks. `response` is set for `after_execute` and `on_error`.
#[derive(Clone, Debug)]
pub struct ExecutionEvent {
    pub call: ToolCall,
    pub response: Option<ToolResponse>,
    pub context: ToolContext,
}

impl ExecutionEvent {
    pub fn new(call: ToolCall, context: ToolContext) -> Self {
        Self {
            call,
            response: None,
            context,
        }
    }

    pub fn with_response(mut self, response: ToolResponse) -> Self {
        self.response = Some(response);
        self
    }
}

#[derive(Clone)]
pub enum Hook {
    Register(Arc<RegisterHookFn>),
    Execution(Arc<ExecutionHookFn>),
    AsyncExecution(Arc<AsyncExecutionHookFn>),
}

impl Hook {
    pub fn register<F>(f: F) -> Self
    where
        F: Fn(&ToolDefinition) -> HookResult + Send + Sync + 'static,
    {
        Hook::Register(Arc::new(f))
    }

    pub fn execution<F>(f: F) -> Self
    where
        F: Fn(&ExecutionEvent) -> HookResult + Send + Sync + 'static,
    {
        Hook::Execution(Arc::new(f))
    }

    pub fn async_execution<F, Fut>(f: F) -> Self
    where
        F: Fn(ExecutionEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        Hook::AsyncExecution(Arc::new(move |event| f(event).boxed()))
    }

    pub fn accepts(&self, kind: HookKind) -> bool {
        match self {
            Hook::Register(_) => kind.is_registration(),
            Hook::Execution(_) | Hook::AsyncExecution(_) => !kind.is_registration(),
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Hook::Register(_) => "Hook::Register",
            Hook::Execution(_) => "Hook::Execution",
            Hook::AsyncExecution(_) => "Hook::AsyncExecution",
        };
        f.write_str(label)
    }
}

pub(crate) fn run_register_hooks(hooks: &[Hook], kind: HookKind, definition: &ToolDefinition) {
    for (index, hook) in hooks.iter().enumerate() {
        let Hook::Register(f) = hook else {
            continue;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(definition)));
        report(kind, index, &definition.name, outcome);
    }
}

pub(crate) async fn run_execution_hooks(hooks: &[Hook], kind: HookKind, event: &ExecutionEvent) {
    for (index, hook) in hooks.iter().enumerate() {
        let outcome = match hook {
            Hook::Register(_) => continue,
            Hook::Execution(f) => panic::catch_unwind(AssertUnwindSafe(|| f(event))),
            Hook::AsyncExecution(f) => {
                match panic::catch_unwind(AssertUnwindSafe(|| f(event.clone()))) {
                    Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                    Err(payload) => Err(payload),
                }
            }
        };
        report(kind, index, &event.call.name, outcome);
    }
}

fn report(
    kind: HookKind,
    index: usize,
    tool: &str,
    outcome: Result<HookResult, Box<dyn std::any::Any + Send>>,
) {
    match outcome {
        Ok(Ok(())) => debug!("钩子 {kind}#{index} 已执行 (工具: {tool})"),
        Ok(Err(err)) => error!("钩子 {kind}#{index} 执行失败 (工具: {tool}): {err}"),
        Err(payload) => error!(
            "钩子 {kind}#{index} 发生 panic (工具: {tool}): {}",
            panic_message(payload.as_ref())
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event() -> ExecutionEvent {
        ExecutionEvent::new(
            ToolCall::new("echo", Default::default()),
            ToolContext::new(),
        )
    }

    #[test]
    fn hook_variants_match_their_kinds() {
        let register = Hook::register(|_| Ok(()));
        let execution = Hook::execution(|_| Ok(()));
        assert!(register.accepts(HookKind::BeforeRegister));
        assert!(!register.accepts(HookKind::OnError));
        assert!(execution.accepts(HookKind::AfterExecute));
        assert!(!execution.accepts(HookKind::AfterRegister));
    }

    #[tokio::test]
    async fn failing_hooks_do_not_stop_later_hooks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let third = Arc::clone(&seen);
        let hooks = vec![
            Hook::execution(move |_| {
                first.lock().unwrap().push("first");
                Err("first hook failed".into())
            }),
            Hook::execution(|_| panic!("hook panic")),
            Hook::async_execution(move |_| {
                let third = Arc::clone(&third);
                async move {
                    third.lock().unwrap().push("third");
                    Ok(())
                }
            }),
        ];

        run_execution_hooks(&hooks, HookKind::BeforeExecute, &event()).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "third"]);
    }
}
