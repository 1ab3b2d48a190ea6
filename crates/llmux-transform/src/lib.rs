pub mod stream;
pub mod tokens;
pub mod translate;
pub mod types;

pub use stream::StreamTransformer;
pub use tokens::{IMAGE_TOKEN_ESTIMATE, TokenizerInfo, count_completion_tokens, count_prompt_tokens};
pub use translate::{transform_request, transform_response};
pub use types::{ChatRequest, ChatResponse, GoogleChat, TransformMeta, TranslateError};
