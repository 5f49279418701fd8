use bridge_coords::ComponentId;
use bridge_refs::{
    PayloadReducer, EXTRACT_CHECKED, EXTRACT_KEY_CODE, EXTRACT_NONE, EXTRACT_TARGET_VALUE,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use crate::{ExecError, FunctionId};

/// Suspends for one frame tick and resolves to `null`.
pub const FN_NEXT_FRAME: FunctionId = FunctionId(100);
/// Resolves to its arguments.
pub const FN_ECHO: FunctionId = FunctionId(101);

/// Length of one frame tick for [`FN_NEXT_FRAME`].
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

pub type ExecFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

type Extractor = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
type SyncFunction = Arc<dyn Fn(ExecCall) -> Result<Value, String> + Send + Sync>;
type AsyncFunction = Arc<dyn Fn(ExecCall) -> ExecFuture + Send + Sync>;

/// Arguments of one exec call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecCall {
    /// Element the call is aimed at, if any
    pub target: Option<ComponentId>,
    pub args: Value,
}

#[derive(Clone)]
enum Entry {
    Extractor(Extractor),
    Sync(SyncFunction),
    Async(AsyncFunction),
}

impl Entry {
    fn kind(&self) -> &'static str {
        match self {
            Entry::Extractor(_) => "extractor",
            Entry::Sync(_) => "function",
            Entry::Async(_) => "async function",
        }
    }
}

/// Fixed table of extractors and functions the trusted side is willing to
/// run on behalf of the untrusted side. Immutable once built.
pub struct FunctionRepository {
    entries: HashMap<FunctionId, Entry>,
}

impl FunctionRepository {
    pub fn builder() -> FunctionRepositoryBuilder {
        FunctionRepositoryBuilder::default()
    }

    /// Repository with the standard extractors and built-in functions.
    pub fn standard() -> Self {
        Self::builder().with_standard().build()
    }

    pub fn contains(&self, id: FunctionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs extractor `id` over a raw event.
    pub fn extract(&self, id: FunctionId, raw: &Value) -> Result<Value, ExecError> {
        match self.entries.get(&id) {
            Some(Entry::Extractor(extract)) => Ok(extract(raw)),
            Some(_) => Err(ExecError::not_an_extractor(id)),
            None => Err(ExecError::unknown_function(id)),
        }
    }

    /// Runs function `id`. Extractors may be called too; they see `args` as
    /// the raw event.
    pub async fn call(&self, id: FunctionId, call: ExecCall) -> Result<Value, ExecError> {
        let entry = self
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| ExecError::unknown_function(id))?;
        trace!(function = id.0, kind = entry.kind(), "exec call");
        let outcome = match entry {
            Entry::Extractor(extract) => Ok(extract(&call.args)),
            Entry::Sync(function) => function(call),
            Entry::Async(function) => function(call).await,
        };
        outcome.map_err(ExecError::function_failed)
    }
}

impl PayloadReducer for FunctionRepository {
    fn reduce(&self, extractor_id: u32, raw: &Value) -> Option<Value> {
        self.extract(FunctionId(extractor_id), raw).ok()
    }
}

#[derive(Default)]
pub struct FunctionRepositoryBuilder {
    entries: HashMap<FunctionId, Entry>,
}

impl FunctionRepositoryBuilder {
    fn insert(mut self, id: FunctionId, entry: Entry) -> Self {
        if let Some(previous) = self.entries.insert(id, entry) {
            warn!(function = id.0, previous = previous.kind(), "function id registered twice");
        }
        self
    }

    pub fn extractor(
        self,
        id: u32,
        extract: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.insert(FunctionId(id), Entry::Extractor(Arc::new(extract)))
    }

    pub fn function(
        self,
        id: FunctionId,
        function: impl Fn(ExecCall) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.insert(id, Entry::Sync(Arc::new(function)))
    }

    pub fn async_function<F, Fut>(self, id: FunctionId, function: F) -> Self
    where
        F: Fn(ExecCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let boxed: AsyncFunction = Arc::new(move |call| Box::pin(function(call)) as ExecFuture);
        self.insert(id, Entry::Async(boxed))
    }

    /// Adds the standard extractors and the built-in functions.
    pub fn with_standard(self) -> Self {
        self.extractor(EXTRACT_NONE, |_| json!({}))
            .extractor(EXTRACT_TARGET_VALUE, |raw| {
                json!({"targetValue": raw.pointer("/target/value").cloned().unwrap_or(Value::Null)})
            })
            .extractor(EXTRACT_KEY_CODE, |raw| {
                json!({"keyCode": raw.get("keyCode").cloned().unwrap_or(Value::Null)})
            })
            .extractor(EXTRACT_CHECKED, |raw| {
                json!({"checked": raw.pointer("/target/checked").cloned().unwrap_or(Value::Null)})
            })
            .async_function(FN_NEXT_FRAME, |_| async {
                tokio::time::sleep(FRAME_INTERVAL).await;
                Ok(Value::Null)
            })
            .function(FN_ECHO, |call| Ok(call.args))
    }

    pub fn build(self) -> FunctionRepository {
        FunctionRepository {
            entries: self.entries,
        }
    }
}
