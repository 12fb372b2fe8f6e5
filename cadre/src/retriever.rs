//! Retrieval seam for augmenting prompts with external context.
//!
//! A [`Retriever`] turns the operation input into a block of context text
//! that joins the system message. Concrete retrievers (vector stores,
//! keyword search, …) live outside the core; retrieval failures are
//! reported as retriever events and the operation proceeds without
//! context.

use async_trait::async_trait;

use crate::context::OperationContext;
use crate::error::Result;
use crate::message::OperationInput;

/// Produces retrieval context for an operation.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Retrieve context text relevant to the input.
    ///
    /// Returning an empty string means "nothing relevant"; the retrieval
    /// block is omitted from the system message.
    async fn retrieve(&self, input: &OperationInput, ctx: &OperationContext) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl Retriever for Fixed {
        async fn retrieve(
            &self,
            _input: &OperationInput,
            _ctx: &OperationContext,
        ) -> Result<String> {
            Ok(self.0.to_owned())
        }
    }

    #[tokio::test]
    async fn trait_object_retrieval() {
        let retriever: Box<dyn Retriever> = Box::new(Fixed("doc snippet"));
        let ctx = OperationContext::new("op-1", "agent-1");
        let context = retriever.retrieve(&"query".into(), &ctx).await.unwrap();
        assert_eq!(context, "doc snippet");
    }
}
