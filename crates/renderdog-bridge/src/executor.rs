use std::{collections::BTreeMap, fmt};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::RemoteError;

/// Runs domain methods on the remote side. Every method except the built-in diagnostics query
/// ends up here, on a worker thread.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, method: &str, args: &Value) -> Result<Value, RemoteError>;
}

impl<F> Executor for F
where
    F: Fn(&str, &Value) -> Result<Value, RemoteError> + Send + Sync + 'static,
{
    fn execute(&self, method: &str, args: &Value) -> Result<Value, RemoteError> {
        self(method, args)
    }
}

type Handler = Box<dyn Fn(&Value) -> Result<Value, RemoteError> + Send + Sync>;

/// Method-name table. Unknown methods are answered with `-32601`.
#[derive(Default)]
pub struct MethodRouter {
    routes: BTreeMap<String, Handler>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.routes.insert(method.into(), Box::new(handler));
        self
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl fmt::Debug for MethodRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods()).finish()
    }
}

impl Executor for MethodRouter {
    fn execute(&self, method: &str, args: &Value) -> Result<Value, RemoteError> {
        match self.routes.get(method) {
            Some(handler) => handler(args),
            None => Err(RemoteError::method_not_found(method)),
        }
    }
}

/// Decodes a method's arguments; a mismatch is reported as invalid params.
pub fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, RemoteError> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args.clone()
    };
    serde_json::from_value(args).map_err(|e| RemoteError::invalid_params(e.to_string()))
}

pub fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, RemoteError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RemoteError::invalid_params(format!("{key} is required")))
}
