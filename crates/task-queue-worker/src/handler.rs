//! Handler shapes a worker can wrap.
//!
//! A handler is either a *full-task* handler, which sees the whole [`Task`]
//! and returns a [`TaskResult`], or a *field-adapting* handler, which
//! declares the input parameter names it wants and gets only those. Which
//! shape applies is fixed when the [`Handler`] is constructed.

use crate::error::HandlerError;
use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use task_queue_core::{Task, TaskOutput, TaskResult};

/// Trait for handlers that take the whole task
#[async_trait]
pub trait TaskFunction: Send + Sync {
    /// Execute the task. Task and workflow ids left empty on the returned
    /// result are filled in by the worker.
    async fn execute(&self, task: &Task) -> Result<TaskResult, HandlerError>;
}

/// Wraps a plain closure as a [`TaskFunction`]
pub struct FnTaskFunction<F>(F);

#[async_trait]
impl<F> TaskFunction for FnTaskFunction<F>
where
    F: Fn(&Task) -> Result<TaskResult, HandlerError> + Send + Sync,
{
    async fn execute(&self, task: &Task) -> Result<TaskResult, HandlerError> {
        (self.0)(task)
    }
}

/// Inputs handed to a field-adapting handler: the declared parameters that
/// were present in the task's input data. Absent parameters are simply
/// missing, not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    values: Map<String, Value>,
}

impl Inputs {
    pub fn new(values: Map<String, Value>) -> Self {
        Inputs { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Deserialize an optional parameter
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.values.get(name) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| HandlerError::failed(format!("Invalid input '{}': {}", name, e))),
            None => Ok(None),
        }
    }

    /// Deserialize a parameter the handler cannot do without
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, HandlerError> {
        self.get_as(name)?
            .ok_or_else(|| HandlerError::failed(format!("Missing input '{}'", name)))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

/// What a field-adapting handler returned
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    /// A complete result, reported as-is
    Result(TaskResult),
    /// A string-keyed map, used verbatim as output data
    Output(TaskOutput),
    /// Any other value, reported as `{"result": value}`
    Value(Value),
}

impl HandlerOutput {
    /// Turn the output into a result for `task`
    pub fn into_task_result(self, task: &Task) -> TaskResult {
        match self {
            HandlerOutput::Result(mut result) => {
                result.stamp(task);
                result
            }
            HandlerOutput::Output(output) => {
                TaskResult::for_task(task).complete().with_output(output)
            }
            HandlerOutput::Value(value) => {
                let mut output = TaskOutput::new();
                output.insert("result".to_string(), value);
                TaskResult::for_task(task).complete().with_output(output)
            }
        }
    }
}

impl From<TaskResult> for HandlerOutput {
    fn from(result: TaskResult) -> Self {
        HandlerOutput::Result(result)
    }
}

impl From<TaskOutput> for HandlerOutput {
    fn from(output: TaskOutput) -> Self {
        HandlerOutput::Output(output)
    }
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(output) => HandlerOutput::Output(output),
            other => HandlerOutput::Value(other),
        }
    }
}

impl From<()> for HandlerOutput {
    fn from(_: ()) -> Self {
        HandlerOutput::Value(Value::Null)
    }
}

macro_rules! value_output {
    ($($t:ty),*) => {
        $(
            impl From<$t> for HandlerOutput {
                fn from(value: $t) -> Self {
                    HandlerOutput::Value(Value::from(value))
                }
            }
        )*
    };
}

value_output!(bool, i32, i64, u32, u64, f64, String, &'static str, Vec<Value>);

type FieldFuture = BoxFuture<'static, Result<HandlerOutput, HandlerError>>;
type FieldFn = dyn Fn(Inputs) -> FieldFuture + Send + Sync;

/// A handler invoked with a fixed list of named input parameters
#[derive(Clone)]
pub struct FieldAdapter {
    params: Arc<[String]>,
    call: Arc<FieldFn>,
}

impl FieldAdapter {
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Pick the declared parameters out of the task's input data
    pub fn adapt(&self, task: &Task) -> Inputs {
        let values = self
            .params
            .iter()
            .filter_map(|name| {
                task.input_data
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();
        Inputs::new(values)
    }
}

/// Calling convention selected once for a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    FullTask,
    FieldAdapting,
}

/// Execution logic bound to a worker
#[derive(Clone)]
pub enum Handler {
    FullTask(Arc<dyn TaskFunction>),
    FieldAdapting(FieldAdapter),
}

impl Handler {
    /// Full-task handler from a [`TaskFunction`] implementation
    pub fn full_task<F: TaskFunction + 'static>(function: F) -> Self {
        Handler::FullTask(Arc::new(function))
    }

    /// Full-task handler from a synchronous closure
    pub fn task_fn<F>(function: F) -> Self
    where
        F: Fn(&Task) -> Result<TaskResult, HandlerError> + Send + Sync + 'static,
    {
        Handler::FullTask(Arc::new(FnTaskFunction(function)))
    }

    /// Field-adapting handler from a synchronous closure
    pub fn fields<I, S, F, R>(params: I, function: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Inputs) -> Result<R, HandlerError> + Send + Sync + 'static,
        R: Into<HandlerOutput>,
    {
        let call = move |inputs: Inputs| -> FieldFuture {
            Box::pin(future::ready(function(inputs).map(Into::into)))
        };
        Handler::FieldAdapting(FieldAdapter {
            params: params.into_iter().map(Into::into).collect(),
            call: Arc::new(call),
        })
    }

    /// Field-adapting handler from an async closure
    pub fn fields_async<I, S, F, Fut, R>(params: I, function: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Into<HandlerOutput>,
    {
        let call = move |inputs: Inputs| -> FieldFuture {
            let fut = function(inputs);
            Box::pin(async move { fut.await.map(Into::into) })
        };
        Handler::FieldAdapting(FieldAdapter {
            params: params.into_iter().map(Into::into).collect(),
            call: Arc::new(call),
        })
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::FullTask(_) => HandlerKind::FullTask,
            Handler::FieldAdapting(_) => HandlerKind::FieldAdapting,
        }
    }

    /// Call the handler with the convention fixed at construction
    pub async fn invoke(&self, task: &Task) -> Result<HandlerOutput, HandlerError> {
        match self {
            Handler::FullTask(function) => function.execute(task).await.map(HandlerOutput::Result),
            Handler::FieldAdapting(adapter) => (adapter.call)(adapter.adapt(task)).await,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::FullTask(_) => f.write_str("Handler::FullTask"),
            Handler::FieldAdapting(adapter) => f
                .debug_tuple("Handler::FieldAdapting")
                .field(&adapter.params)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use task_queue_core::TaskResultStatus;

    fn task() -> Task {
        Task::builder("t-1", "echo")
            .workflow_instance_id("wf-1")
            .input("x", 21)
            .input("name", "tq")
            .input("unused", true)
            .build()
    }

    #[test]
    fn test_adapt_picks_declared_params_only() {
        let handler = Handler::fields(["x", "missing"], |inputs: Inputs| Ok(inputs.len() as u64));
        let Handler::FieldAdapting(adapter) = &handler else {
            panic!("Expected field adapter");
        };

        let inputs = adapter.adapt(&task());
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs.get("x"), Some(&json!(21)));
        assert!(!inputs.contains("missing"));
        assert!(!inputs.contains("unused"));
    }

    #[tokio::test]
    async fn test_map_output_used_verbatim() {
        let handler = Handler::fields(["x"], |inputs: Inputs| {
            let x: i64 = inputs.require("x")?;
            Ok(json!({"value": x * 2}))
        });

        let result = handler.invoke(&task()).await.unwrap().into_task_result(&task());
        assert_eq!(result.status, TaskResultStatus::Completed);
        assert_eq!(Value::Object(result.output_data), json!({"value": 42}));
        assert_eq!(result.task_id, "t-1");
    }

    #[tokio::test]
    async fn test_scalar_output_wrapped() {
        let handler = Handler::fields(["name"], |inputs: Inputs| {
            let name: String = inputs.require("name")?;
            Ok(format!("hello {}", name))
        });

        let result = handler.invoke(&task()).await.unwrap().into_task_result(&task());
        assert_eq!(Value::Object(result.output_data), json!({"result": "hello tq"}));
    }

    #[tokio::test]
    async fn test_missing_param_is_not_an_error() {
        let handler = Handler::fields(["absent"], |inputs: Inputs| {
            let absent: Option<String> = inputs.get_as("absent")?;
            Ok(absent.is_none())
        });

        let output = handler.invoke(&task()).await.unwrap();
        assert_eq!(output, HandlerOutput::Value(json!(true)));
    }

    #[tokio::test]
    async fn test_async_fields_handler() {
        let handler = Handler::fields_async(["x"], |inputs: Inputs| async move {
            tokio::task::yield_now().await;
            let x: i64 = inputs.require("x")?;
            Ok(x + 1)
        });

        let output = handler.invoke(&task()).await.unwrap();
        assert_eq!(output, HandlerOutput::Value(json!(22)));
        assert_eq!(handler.kind(), HandlerKind::FieldAdapting);
    }

    #[tokio::test]
    async fn test_full_task_handler_sees_whole_task() {
        let handler = Handler::task_fn(|task: &Task| {
            let mut result = TaskResult::unaddressed().complete();
            result.add_output_data("inputs", task.input_data.len() as u64);
            Ok(result)
        });

        let output = handler.invoke(&task()).await.unwrap();
        let result = output.into_task_result(&task());
        assert_eq!(result.output_data["inputs"], json!(3));
        assert_eq!(result.workflow_instance_id, "wf-1");
        assert_eq!(handler.kind(), HandlerKind::FullTask);
    }

    #[test]
    fn test_object_value_becomes_output() {
        assert_eq!(
            HandlerOutput::from(json!({"a": 1})),
            HandlerOutput::Output(json!({"a": 1}).as_object().cloned().unwrap())
        );
        assert_eq!(HandlerOutput::from(json!([1, 2])), HandlerOutput::Value(json!([1, 2])));
    }
}
