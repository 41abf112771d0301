use std::str::FromStr;

use anyhow::Context;
use indoc::indoc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::time::Duration;

use crate::error::AppResult;
use crate::model::labels::Religion;
use crate::model::voter::VoterDetails;
use crate::prompt::azure::CompletionApi;
use crate::rate_limiters::RateLimiters;

const BATCH_SYSTEM_PROMPT: &str = indoc! {r#"
    You are an expert at identifying religious backgrounds of voters in Kerala, India based on names.

    HINDU indicators: Names of deities (Krishna, Vishnu, Lakshmi, Devi, etc.), Sanskrit-origin names, names ending in -an/-kuttan (male), -kumari/-devi (female), house names with Bhavanam/Mandiram/Illam, etc.

    CHRISTIAN indicators: Biblical/Western names (George, Jose, Mary, Thomas, etc.), names of Christian saints, house names with Villa/Nivas/Dale/Bhavan, guardian names like Xavier/Sebastian/Francis, etc.

    MUSLIM indicators: Arabic names (Mohammed, Abdul, Ayesha, Fathima, etc.), Islamic naming patterns, house names with Manzil/Padi/Purayidam, etc.

    IMPORTANT: You MUST classify each voter as EXACTLY one of: Hindu, Christian, or Muslim. No other values allowed.

    Return JSON with this exact structure:
    {"predictions": [{"index": 0, "religion": "Hindu"}, {"index": 1, "religion": "Christian"}, ...]}

    Each religion must be STRICTLY one of: Hindu, Christian, or Muslim."#};

const BASE_RETRY_DELAY: Duration = Duration::from_secs(2);

fn batch_user_prompt(voters: &[VoterDetails]) -> String {
    let mut message = String::from("Predict religion for these Kerala voters:\n\n");
    for (idx, voter) in voters.iter().enumerate() {
        message.push_str(&format!(
            "{}. Name: {}, Guardian: {}, House: {}\n",
            idx, voter.name, voter.guardian, voter.house
        ));
    }
    message
}

#[derive(Debug, Deserialize)]
struct PredictionsJson {
    #[serde(default)]
    predictions: Vec<PredictionJson>,
}

#[derive(Debug, Deserialize)]
struct PredictionJson {
    index: usize,
    religion: String,
}

/// Result of classifying one batch. Always carries exactly one label per
/// submitted record; `soft_failure` is set when retries were exhausted and
/// every label is the fallback.
#[derive(Debug)]
pub struct BatchVerdict {
    pub labels: Vec<Religion>,
    pub soft_failure: Option<SoftFailure>,
}

#[derive(Debug, Clone)]
pub struct SoftFailure {
    pub error_msg: String,
    pub attempts: u32,
}

/// Classifies ordered batches of voters in a single chat call per batch,
/// with rate governing, bounded retry, and per-index label validation.
pub struct BatchClassifier<A> {
    api: A,
    rate_limiters: RateLimiters,
    max_retries: u32,
    estimated_tokens_per_call: usize,
}

impl<A: CompletionApi> BatchClassifier<A> {
    pub fn new(
        api: A,
        rate_limiters: RateLimiters,
        max_retries: u32,
        estimated_tokens_per_call: usize,
    ) -> Self {
        Self {
            api,
            rate_limiters,
            max_retries,
            estimated_tokens_per_call,
        }
    }

    /// Classify a non-empty batch. Never fails: exhausted retries downgrade
    /// to a soft failure with fallback labels for every position.
    pub async fn classify(&self, voters: &[VoterDetails]) -> BatchVerdict {
        debug_assert!(
            !voters.is_empty(),
            "empty batches are filtered out before classification"
        );

        let user_prompt = batch_user_prompt(voters);
        let mut attempt: u32 = 0;

        loop {
            self.rate_limiters
                .wait_for_capacity(self.estimated_tokens_per_call)
                .await;

            match self.attempt_once(&user_prompt, voters.len()).await {
                Ok(labels) => {
                    return BatchVerdict {
                        labels,
                        soft_failure: None,
                    }
                }
                Err(e) => {
                    tracing::error!("Batch prediction error (attempt {}): {}", attempt + 1, e);

                    if attempt < self.max_retries {
                        let delay = BASE_RETRY_DELAY * 2u32.pow(attempt);
                        tracing::info!("Retrying in {} seconds...", delay.as_secs());
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else {
                        tracing::error!(
                            "Max retries exceeded for batch, defaulting all to {}",
                            Religion::FALLBACK
                        );
                        return BatchVerdict {
                            labels: vec![Religion::FALLBACK; voters.len()],
                            soft_failure: Some(SoftFailure {
                                error_msg: e.to_string(),
                                attempts: attempt + 1,
                            }),
                        };
                    }
                }
            }
        }
    }

    async fn attempt_once(&self, user_prompt: &str, batch_len: usize) -> AppResult<Vec<Religion>> {
        let resp = self.api.complete(BATCH_SYSTEM_PROMPT, user_prompt).await?;

        // The call itself succeeded, so its tokens were billed even if the
        // body turns out to be unusable below.
        self.rate_limiters
            .record_call(resp.usage.total_tokens.max(0) as usize);

        let content = &resp
            .choices
            .first()
            .context("No choices in response")?
            .message
            .content;
        let predictions = parse_predictions(content)?;

        Ok(reconcile_by_index(batch_len, &predictions))
    }
}

fn parse_predictions(content: &str) -> AppResult<Vec<PredictionJson>> {
    match serde_json::from_str::<PredictionsJson>(content) {
        Ok(parsed) => Ok(parsed.predictions),
        Err(_) => {
            tracing::info!("Could not parse JSON response, parsing manually...");
            static RE_PRED: Lazy<Regex> = Lazy::new(|| {
                Regex::new(r#""index"\s*:\s*(\d+)\s*,\s*"religion"\s*:\s*"([^"]*)""#).unwrap()
            });

            let predictions: Vec<PredictionJson> = RE_PRED
                .captures_iter(content)
                .filter_map(|caps| {
                    Some(PredictionJson {
                        index: caps.get(1)?.as_str().parse().ok()?,
                        religion: caps.get(2)?.as_str().to_string(),
                    })
                })
                .collect();

            if predictions.is_empty() {
                Err(anyhow::anyhow!("Could not parse predictions from response: {content}").into())
            } else {
                Ok(predictions)
            }
        }
    }
}

/// Map response predictions back onto batch positions. First match wins when
/// the response repeats an index; a missing index or a label outside the
/// whitelist yields the fallback with a warning, not a retry.
fn reconcile_by_index(batch_len: usize, predictions: &[PredictionJson]) -> Vec<Religion> {
    (0..batch_len)
        .map(|idx| {
            let Some(pred) = predictions.iter().find(|p| p.index == idx) else {
                tracing::warn!(
                    "No prediction for voter {}, defaulting to {}",
                    idx,
                    Religion::FALLBACK
                );
                return Religion::FALLBACK;
            };

            Religion::from_str(&pred.religion).unwrap_or_else(|_| {
                tracing::warn!(
                    "Invalid religion '{}' for voter {}, defaulting to {}",
                    pred.religion,
                    idx,
                    Religion::FALLBACK
                );
                Religion::FALLBACK
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::testing::{predictions_response, voters, ScriptedApi};

    fn classifier(api: ScriptedApi, max_retries: u32) -> BatchClassifier<ScriptedApi> {
        BatchClassifier::new(api, RateLimiters::new(10_000, 1_000_000), max_retries, 1000)
    }

    #[tokio::test(start_paused = true)]
    async fn test_labels_follow_submitted_index_not_response_order() {
        let api = ScriptedApi::new(vec![Ok(predictions_response(&[
            (2, "Muslim"),
            (0, "Hindu"),
            (1, "Christian"),
        ]))]);
        let classifier = classifier(api, 0);

        let verdict = classifier.classify(&voters(3)).await;

        assert!(verdict.soft_failure.is_none());
        assert_eq!(
            verdict.labels,
            vec![Religion::Hindu, Religion::Christian, Religion::Muslim]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_index_gets_fallback_but_call_counts_as_success() {
        // Batch of 2, response only covers index 0.
        let api = ScriptedApi::new(vec![Ok(predictions_response(&[(0, "Hindu")]))]);
        let classifier = classifier(api, 1);

        let verdict = classifier.classify(&voters(2)).await;

        assert!(verdict.soft_failure.is_none());
        assert_eq!(verdict.labels, vec![Religion::Hindu, Religion::FALLBACK]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_label_corrected_to_fallback() {
        let api = ScriptedApi::new(vec![Ok(predictions_response(&[
            (0, "Christian"),
            (1, "Atheist"),
        ]))]);
        let classifier = classifier(api, 0);

        let verdict = classifier.classify(&voters(2)).await;

        assert!(verdict.soft_failure.is_none());
        assert_eq!(verdict.labels, vec![Religion::Christian, Religion::FALLBACK]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_index_first_match_wins() {
        let api = ScriptedApi::new(vec![Ok(predictions_response(&[
            (0, "Christian"),
            (0, "Muslim"),
        ]))]);
        let classifier = classifier(api, 0);

        let verdict = classifier.classify(&voters(1)).await;

        assert_eq!(verdict.labels, vec![Religion::Christian]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_yield_full_fallback_vector() {
        let api = ScriptedApi::always_failing();
        let classifier = classifier(api, 3);

        let verdict = classifier.classify(&voters(5)).await;

        assert_eq!(verdict.labels, vec![Religion::FALLBACK; 5]);
        let failure = verdict.soft_failure.expect("should be a soft failure");
        assert_eq!(failure.attempts, 4);
        assert_eq!(classifier.api.call_count(), 4);
        // Failed calls never consume rate budget.
        assert_eq!(
            classifier.rate_limiters.get_status(),
            "calls: 0/10000 tokens: 0/1000000"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_on_retry() {
        let api = ScriptedApi::new(vec![
            Err(AppError::RequestTimeout),
            Ok(predictions_response(&[(0, "Muslim")])),
        ]);
        let classifier = classifier(api, 2);

        let verdict = classifier.classify(&voters(1)).await;

        assert!(verdict.soft_failure.is_none());
        assert_eq!(verdict.labels, vec![Religion::Muslim]);
        assert_eq!(classifier.api.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_content_retries_then_regex_fallback_parses() {
        let garbled = "Here are the predictions: {\"predictions\": [{\"index\": 0, \"religion\": \"Christian\"}]}";
        let api = ScriptedApi::new(vec![Ok(crate::testing::chat_response(garbled))]);
        let classifier = classifier(api, 0);

        let verdict = classifier.classify(&voters(1)).await;

        // Leading prose breaks serde but the manual extraction still works.
        assert!(verdict.soft_failure.is_none());
        assert_eq!(verdict.labels, vec![Religion::Christian]);
    }

    #[test]
    fn test_batch_user_prompt_tags_positions() {
        let prompt = batch_user_prompt(&voters(2));
        assert!(prompt.contains("0. Name: Voter 0"));
        assert!(prompt.contains("1. Name: Voter 1"));
    }
}
