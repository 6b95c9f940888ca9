use std::time::Duration;

use tracing::info;

use crate::stream::{CompletedResponse, TokenUsage};

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Token usage of a finished session.
///
/// Rules:
/// - Always prefer non-zero provider-reported values
/// - Output tokens missing or zero are estimated from the classified text
/// - Input tokens are never estimated; the request is not visible here
/// - Compute total = input + output if total is missing
#[must_use]
pub fn session_usage(reported: Option<&TokenUsage>, thinking: &str, response: &str) -> TokenUsage {
    let reported = reported.copied().unwrap_or_default();
    let non_zero = |value: Option<u64>| value.filter(|v| *v > 0);

    let input_tokens = non_zero(reported.input_tokens);
    let output_tokens = non_zero(reported.output_tokens)
        .or_else(|| Some(estimate_tokens(thinking) + estimate_tokens(response)));
    let total_tokens = non_zero(reported.total_tokens)
        .or_else(|| Some(input_tokens.unwrap_or(0) + output_tokens.unwrap_or(0)));

    TokenUsage {
        input_tokens,
        output_tokens,
        total_tokens,
    }
}

/// Log the outcome of a completed session at INFO level.
pub fn log_session_usage(response: &CompletedResponse, duration: Duration) {
    info!(
        correlation_id = %response.correlation_id,
        model = response.message.model.as_deref().unwrap_or(""),
        state = %response.final_state,
        tool_calls = response.tool_calls.len(),
        input_tokens = response.usage.input_tokens.unwrap_or(0),
        output_tokens = response.usage.output_tokens.unwrap_or(0),
        total_tokens = response.usage.total_tokens.unwrap_or(0),
        duration_seconds = duration.as_secs_f64(),
        "stream completed"
    );
}
