/// Sends a request and re-sends it after a fixed cooldown while the upstream
/// answers HTTP 429, up to `max_retries` extra attempts. Evaluates to the last
/// `reqwest::Result<Response>`; a 429 that survives every retry is returned as-is.
macro_rules! retry_rate_limited {
    ($context:expr, $max_retries:expr, $cooldown:expr, $operation:expr) => {{
        let context_value: String = $context.into();
        let max_retries: u32 = $max_retries;
        let cooldown: std::time::Duration = $cooldown;
        let mut retries = 0u32;

        loop {
            match ($operation).await {
                Ok(response)
                    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS
                        && retries < max_retries =>
                {
                    retries += 1;
                    log::warn!(
                        "Rate limit exceeded for {}. Waiting {}s before retry {}/{}.",
                        context_value,
                        cooldown.as_secs(),
                        retries,
                        max_retries
                    );
                    tokio::time::sleep(cooldown).await;
                }
                other => break other,
            }
        }
    }};
}

pub(crate) use retry_rate_limited;
