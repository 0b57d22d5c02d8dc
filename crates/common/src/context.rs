use std::any::Any;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Per-call state threaded through every API method: caller credentials,
/// request id, cancellation, and typed values attached by wrappers.
#[derive(Clone, Default)]
pub struct RequestContext {
    pub tokens: Vec<String>,
    pub request_id: String,
    pub cancel: CancellationToken,
    values: Vec<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("tokens", &self.tokens.len())
            .field("request_id", &self.request_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            tokens: vec![token.into()],
            ..Self::default()
        }
    }

    pub fn first_token(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }

    pub fn with_tokens(&self, tokens: Vec<String>) -> Self {
        Self {
            tokens,
            ..self.clone()
        }
    }

    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn with_value<T: Any + Send + Sync>(&self, value: Arc<T>) -> Self {
        let mut ctx = self.clone();
        ctx.values.push(value);
        ctx
    }

    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .iter()
            .rev()
            .find_map(|v| Arc::clone(v).downcast::<T>().ok())
    }
}
