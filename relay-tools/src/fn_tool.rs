use crate::error::Result;
use crate::traits::{Tool, ToolSpec, parse_arguments};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use relay_llm::Schema;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;

type Handler = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// A tool backed by an async closure.
///
/// ```ignore
/// let add = FnTool::typed::<AddArgs, _, _>("add", "Add two numbers", |a| async move {
///     Ok(serde_json::json!(a.x + a.y))
/// });
/// ```
#[derive(Clone)]
pub struct FnTool {
    spec: ToolSpec,
    handler: Handler,
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool").field("name", &self.spec.name).finish()
    }
}

impl FnTool {
    /// Raw JSON arguments in, JSON out.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Schema,
        handler: F,
    ) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            spec: ToolSpec::new(name, description, parameters),
            handler: Arc::new(move |args| handler(args).boxed()),
        }
    }

    /// Arguments are deserialized into `A`, whose derived schema is what the
    /// model is shown.
    pub fn typed<A, F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + schemars::JsonSchema + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(name, description, Schema::of::<A>(), move |args| {
            let handler = Arc::clone(&handler);
            async move {
                let args: A = parse_arguments(args)?;
                handler(args).await
            }
        })
    }
}

#[async_trait]
impl Tool for FnTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tool = %self.spec.name))]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        (self.handler)(arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, schemars::JsonSchema)]
    struct AddArgs {
        x: i64,
        y: i64,
    }

    #[tokio::test]
    async fn typed_tool_parses_arguments_and_exposes_schema() {
        let add = FnTool::typed::<AddArgs, _, _>("add", "Add two integers", |a| async move {
            Ok(json!(a.x + a.y))
        });
        let spec = add.spec().parameters.to_json_schema();
        assert_eq!(spec["properties"]["x"]["type"], "integer");
        assert_eq!(add.execute(json!({ "x": 2, "y": 3 })).await.unwrap(), json!(5));

        let err = add.execute(json!({ "x": "two" })).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn raw_tool_passes_arguments_through() {
        let upper = FnTool::new("upper", "Uppercase", Schema::empty(), |args| async move {
            let s = crate::traits::require_string(&args, "s")?;
            Ok(json!(s.to_uppercase()))
        });
        assert_eq!(upper.execute(json!({ "s": "abc" })).await.unwrap(), json!("ABC"));
    }
}
