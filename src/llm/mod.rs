//! Completion endpoint boundary and the OpenAI-compatible streaming client.

pub mod endpoint;
pub mod error;
pub mod openai_compat;
pub mod sse;

pub use endpoint::{
    CompletionEndpoint, CompletionRequest, ContentPart, EndpointFuture, FragmentStream, ImageUrl,
    MessageContent, OutboundMessage,
};
pub use error::EndpointError;
pub use openai_compat::OpenAiCompatClient;

#[cfg(test)]
pub mod testing {
    //! Scripted endpoint for tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;

    use super::{CompletionEndpoint, CompletionRequest, EndpointError, EndpointFuture, FragmentStream};

    /// Replays a fixed list of fragments, optionally failing.
    #[derive(Default)]
    pub struct ScriptedEndpoint {
        fragments: Vec<String>,
        fail_after: Option<usize>,
        reject: bool,
        calls: AtomicUsize,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedEndpoint {
        /// Stream these fragments, then end.
        pub fn replying(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        /// Stream the first `n` fragments, then yield an error.
        pub fn failing_after(fragments: &[&str], n: usize) -> Self {
            Self {
                fail_after: Some(n),
                ..Self::replying(fragments)
            }
        }

        /// Reject the request before streaming.
        pub fn rejecting() -> Self {
            Self {
                reject: true,
                ..Self::default()
            }
        }

        /// Number of completion calls made.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Last request received.
        pub fn last_request(&self) -> Option<CompletionRequest> {
            self.requests.lock().ok().and_then(|r| r.last().cloned())
        }
    }

    impl CompletionEndpoint for ScriptedEndpoint {
        fn stream_completion<'a>(
            &'a self,
            request: &'a CompletionRequest,
        ) -> EndpointFuture<'a, Result<FragmentStream, EndpointError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut requests) = self.requests.lock() {
                    requests.push(request.clone());
                }
                if self.reject {
                    return Err(EndpointError::Authentication("invalid api key".to_string()));
                }

                let mut items: Vec<Result<String, EndpointError>> = Vec::new();
                let limit = self.fail_after.unwrap_or(self.fragments.len());
                for fragment in self.fragments.iter().take(limit) {
                    items.push(Ok(fragment.clone()));
                }
                if self.fail_after.is_some() {
                    items.push(Err(EndpointError::Api("stream interrupted".to_string())));
                }
                let stream: FragmentStream = Box::pin(stream::iter(items));
                Ok(stream)
            })
        }
    }
}
