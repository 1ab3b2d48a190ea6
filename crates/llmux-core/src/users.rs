use llmux_common::Dialect;

/// Per-user accounting is delegated to an external collaborator; the core
/// only calls these hooks. The shipped implementation records nothing.
pub trait UserStore: Send + Sync {
    fn increment_prompt_count(&self, token: &str);
    fn increment_token_count(
        &self,
        token: &str,
        model: &str,
        dialect: Dialect,
        input: u64,
        output: u64,
    );
}

pub struct NoopUserStore;

impl UserStore for NoopUserStore {
    fn increment_prompt_count(&self, token: &str) {
        tracing::debug!(token = %token, "prompt count increment (noop store)");
    }

    fn increment_token_count(
        &self,
        token: &str,
        model: &str,
        dialect: Dialect,
        input: u64,
        output: u64,
    ) {
        tracing::debug!(
            token = %token,
            model = %model,
            dialect = %dialect,
            input,
            output,
            "token count increment (noop store)"
        );
    }
}
