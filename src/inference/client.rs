use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{
    gate::types::ChatMessage,
    inference::{credentials::Credential, error::InferenceError, types::SamplingConfig},
};

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

/// One streaming chat completion call against the external text-generation service.
///
/// `open` fails when the call cannot be started; once open, the stream yields
/// text fragments as they arrive and may end with an error item mid-way.
#[async_trait]
pub trait StreamingInferenceClient: Send + Sync {
    async fn open(
        &self,
        credential: &Credential,
        messages: &[ChatMessage],
        sampling: &SamplingConfig,
    ) -> Result<FragmentStream, InferenceError>;
}
