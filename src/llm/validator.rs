use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{
    LlmBackend, LlmError, RetryAction, RetryPolicy, SYSTEM_PROMPT, Verdict,
    build_validation_prompt, normalize_confidence, verify_evidence,
};
use crate::models::{DetectionPointConfig, EngineSignal, Transcript};
use crate::stats::PipelineStats;

/// Prior confidences that warrant asking the model, `[low, high)`
///
/// The default covers every rule tier below an exact phrase, so keyword
/// and regex matches are always confirmed by the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UncertainBand {
    pub low: f64,
    pub high: f64,
}

impl Default for UncertainBand {
    fn default() -> Self {
        Self {
            low: 0.0,
            high: 1.0,
        }
    }
}

impl UncertainBand {
    pub fn contains(&self, confidence: f64) -> bool {
        self.low <= confidence && confidence < self.high
    }
}

/// Configuration for LLM validation
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Concurrent requests allowed process-wide
    pub max_concurrency: usize,
    /// Timeout for a single attempt
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub uncertain_band: UncertainBand,
    /// Also validate confident points that some engine already found
    pub secondary_analysis: bool,
    /// Dialogue character budget per prompt
    pub max_context_chars: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            call_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            uncertain_band: UncertainBand::default(),
            secondary_analysis: false,
            max_context_chars: 8000,
        }
    }
}

/// Result of validating one point
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub signal: EngineSignal,
    /// Set when the model failed or its answer was refused
    pub failure_reason: Option<String>,
}

impl ValidationOutcome {
    fn absent() -> Self {
        Self {
            signal: EngineSignal::Absent,
            failure_reason: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            signal: EngineSignal::Absent,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Rate-limited, retried LLM confirmation with evidence checks
pub struct LlmValidator {
    backend: Option<Arc<dyn LlmBackend>>,
    semaphore: Arc<Semaphore>,
    config: ValidatorConfig,
    stats: Arc<PipelineStats>,
}

impl LlmValidator {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        config: ValidatorConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let permits = config.max_concurrency.max(1);
        stats.set_semaphore_capacity(permits);
        Self {
            backend: Some(backend),
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
            stats,
        }
    }

    /// A validator that never calls a model
    pub fn disabled(config: ValidatorConfig, stats: Arc<PipelineStats>) -> Self {
        Self {
            backend: None,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            stats,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Whether the prior engine signals call for a model opinion
    pub fn should_invoke(&self, rule: &EngineSignal, vector: &EngineSignal) -> bool {
        let prior = rule.confidence().max(vector.confidence());
        self.config.uncertain_band.contains(prior)
            || (self.config.secondary_analysis && (rule.is_present() || vector.is_present()))
    }

    /// Ask the model about one point; never fails, degrades to `Absent`
    pub async fn validate(
        &self,
        point: &DetectionPointConfig,
        transcript: &Transcript,
        rule: &EngineSignal,
        vector: &EngineSignal,
        prior_findings: Option<&str>,
    ) -> ValidationOutcome {
        let Some(backend) = &self.backend else {
            return ValidationOutcome::absent();
        };

        if !self.should_invoke(rule, vector) {
            self.stats.record_llm_skipped();
            debug!("LLM validation skipped for {}", point.key());
            return ValidationOutcome::absent();
        }

        let candidates: Vec<_> = rule
            .evidence()
            .iter()
            .chain(vector.evidence().iter())
            .cloned()
            .collect();
        let prompt = build_validation_prompt(
            point,
            transcript,
            &candidates,
            prior_findings,
            self.config.max_context_chars,
        );

        let verdict = match self.request_with_retry(backend.as_ref(), point, &prompt).await {
            Ok(verdict) => verdict,
            Err(e) => {
                self.stats.record_llm_failure();
                warn!("LLM validation failed for {}: {}", point.key(), e);
                return ValidationOutcome::failed(e.to_string());
            }
        };

        self.accept(point, transcript, verdict)
    }

    async fn request_with_retry(
        &self,
        backend: &dyn LlmBackend,
        point: &DetectionPointConfig,
        prompt: &str,
    ) -> Result<Verdict, LlmError> {
        let mut attempt = 1u32;
        loop {
            let result = self.attempt(backend, prompt).await;
            let error = match result {
                Ok(verdict) => return Ok(verdict),
                Err(e) => e,
            };

            match &error {
                LlmError::Timeout(_) => self.stats.record_llm_timeout(),
                LlmError::Transient(_) => self.stats.record_llm_transient(),
                _ => {}
            }

            match self.config.retry.next_action(attempt, &error) {
                RetryAction::Retry { delay } => {
                    self.stats.record_llm_retry();
                    warn!(
                        "LLM attempt {} for {} failed: {}. Retrying in {:?}",
                        attempt,
                        point.key(),
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryAction::GiveUp => return Err(error),
            }
        }
    }

    /// One request holding a semaphore permit for its duration only
    async fn attempt(&self, backend: &dyn LlmBackend, prompt: &str) -> Result<Verdict, LlmError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| LlmError::Unavailable(format!("LLM limiter closed: {}", e)))?;
        let _in_flight = self.stats.enter_llm();
        self.stats.record_llm_call();

        match tokio::time::timeout(
            self.config.call_timeout,
            backend.submit_verdict(SYSTEM_PROMPT, prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.config.call_timeout)),
        }
    }

    fn accept(
        &self,
        point: &DetectionPointConfig,
        transcript: &Transcript,
        verdict: Verdict,
    ) -> ValidationOutcome {
        if !verdict.verdict {
            debug!("LLM rejected {}", point.key());
            return ValidationOutcome::absent();
        }

        let confidence = normalize_confidence(verdict.confidence);
        match verify_evidence(&verdict.evidence, point, transcript, confidence) {
            Ok(span) => ValidationOutcome {
                signal: EngineSignal::present(confidence, vec![span]),
                failure_reason: None,
            },
            Err(violation) => {
                self.stats.record_integrity_violation();
                warn!("LLM answer for {} refused: {}", point.key(), violation);
                ValidationOutcome::failed(format!("integrity check failed: {}", violation))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockBackend;
    use crate::models::{EvidenceSpan, Speaker, Utterance};

    fn transcript() -> Transcript {
        Transcript::new(vec![
            Utterance::new(0, Speaker::Agent, "您好，我是益盟的老师"),
            Utterance::new(1, Speaker::Customer, "嗯"),
            Utterance::new(2, Speaker::Agent, "这次是免费讲解，不收费"),
        ])
        .unwrap()
    }

    fn point() -> DetectionPointConfig {
        DetectionPointConfig::new("free_teach", "icebreak")
    }

    fn fast_config() -> ValidatorConfig {
        ValidatorConfig {
            call_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        }
    }

    fn make_validator(backend: Arc<MockBackend>, config: ValidatorConfig) -> (LlmValidator, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        (LlmValidator::new(backend, config, Arc::clone(&stats)), stats)
    }

    fn rule_signal(confidence: f64) -> EngineSignal {
        EngineSignal::present(
            confidence,
            vec![EvidenceSpan {
                utterance_index: 2,
                quote: "这次是免费讲解，不收费".to_string(),
                timestamp: None,
                confidence,
            }],
        )
    }

    #[tokio::test]
    async fn test_accepts_verbatim_yes() {
        let backend = Arc::new(MockBackend::replying(Verdict::yes("免费讲解", 0.9)));
        let (validator, _) = make_validator(backend, fast_config());

        let outcome = validator
            .validate(&point(), &transcript(), &EngineSignal::Absent, &EngineSignal::Absent, None)
            .await;

        assert!(outcome.failure_reason.is_none());
        assert_eq!(outcome.signal.confidence(), 0.9);
        assert_eq!(outcome.signal.evidence()[0].quote, "免费讲解");
        assert_eq!(outcome.signal.evidence()[0].utterance_index, 2);
    }

    #[tokio::test]
    async fn test_placeholder_yes_is_absent() {
        let backend = Arc::new(MockBackend::replying(Verdict::yes("无", 0.95)));
        let (validator, stats) = make_validator(backend, fast_config());

        let outcome = validator
            .validate(&point(), &transcript(), &EngineSignal::Absent, &EngineSignal::Absent, None)
            .await;

        assert_eq!(outcome.signal, EngineSignal::Absent);
        assert!(outcome.failure_reason.unwrap().contains("integrity"));
        assert_eq!(stats.snapshot().llm_integrity_violations, 1);
    }

    #[tokio::test]
    async fn test_no_verdict_is_absent_without_failure() {
        let backend = Arc::new(MockBackend::replying(Verdict::no()));
        let (validator, _) = make_validator(backend, fast_config());

        let outcome = validator
            .validate(&point(), &transcript(), &EngineSignal::Absent, &EngineSignal::Absent, None)
            .await;

        assert_eq!(outcome.signal, EngineSignal::Absent);
        assert!(outcome.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_keyword_tier_prior_asks_model() {
        let backend = Arc::new(MockBackend::replying(Verdict::yes("免费讲解", 0.9)));
        let (validator, stats) = make_validator(Arc::clone(&backend), fast_config());

        let outcome = validator
            .validate(&point(), &transcript(), &rule_signal(0.8), &EngineSignal::Absent, None)
            .await;

        assert!(outcome.signal.is_present());
        assert_eq!(backend.calls(), 1);
        assert_eq!(stats.snapshot().llm_skipped, 0);
    }

    #[tokio::test]
    async fn test_confident_prior_skips_model() {
        let backend = Arc::new(MockBackend::replying(Verdict::yes("免费讲解", 0.9)));
        let (validator, stats) = make_validator(Arc::clone(&backend), fast_config());

        let outcome = validator
            .validate(&point(), &transcript(), &rule_signal(1.0), &EngineSignal::Absent, None)
            .await;

        assert_eq!(outcome.signal, EngineSignal::Absent);
        assert_eq!(backend.calls(), 0);
        assert_eq!(stats.snapshot().llm_skipped, 1);
    }

    #[tokio::test]
    async fn test_secondary_analysis_validates_confident_prior() {
        let backend = Arc::new(MockBackend::replying(Verdict::yes("免费讲解", 0.9)));
        let config = ValidatorConfig {
            secondary_analysis: true,
            ..fast_config()
        };
        let (validator, _) = make_validator(Arc::clone(&backend), config);

        let outcome = validator
            .validate(&point(), &transcript(), &rule_signal(1.0), &EngineSignal::Absent, None)
            .await;

        assert!(outcome.signal.is_present());
        assert_eq!(backend.calls(), 1);
        assert!(backend.prompts()[0].contains("## Candidate utterances"));
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let backend = Arc::new(MockBackend::scripted(vec![
            Err(LlmError::Transient("overloaded".to_string())),
            Ok(Verdict::yes("免费讲解", 0.8)),
        ]));
        let (validator, stats) = make_validator(Arc::clone(&backend), fast_config());

        let outcome = validator
            .validate(&point(), &transcript(), &EngineSignal::Absent, &EngineSignal::Absent, None)
            .await;

        assert!(outcome.signal.is_present());
        assert_eq!(backend.calls(), 2);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.llm_retries, 1);
        assert_eq!(snapshot.llm_transient_errors, 1);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_retries() {
        let backend = Arc::new(
            MockBackend::replying(Verdict::yes("免费讲解", 0.8))
                .with_delay(Duration::from_millis(500)),
        );
        let config = ValidatorConfig {
            call_timeout: Duration::from_millis(20),
            ..fast_config()
        };
        let (validator, stats) = make_validator(Arc::clone(&backend), config);

        let outcome = validator
            .validate(&point(), &transcript(), &EngineSignal::Absent, &EngineSignal::Absent, None)
            .await;

        assert_eq!(outcome.signal, EngineSignal::Absent);
        assert!(outcome.failure_reason.unwrap().contains("timed out"));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.llm_timeouts, 3);
        assert_eq!(snapshot.llm_retries, 2);
        assert_eq!(snapshot.llm_failures, 1);
    }

    #[tokio::test]
    async fn test_unavailable_not_retried() {
        let backend = Arc::new(MockBackend::failing(LlmError::Unavailable(
            "invalid x-api-key".to_string(),
        )));
        let (validator, _) = make_validator(Arc::clone(&backend), fast_config());

        let outcome = validator
            .validate(&point(), &transcript(), &EngineSignal::Absent, &EngineSignal::Absent, None)
            .await;

        assert!(outcome.failure_reason.is_some());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_semaphore_bounds_concurrency() {
        let backend = Arc::new(
            MockBackend::replying(Verdict::no()).with_delay(Duration::from_millis(30)),
        );
        let (validator, stats) = make_validator(Arc::clone(&backend), fast_config());
        let transcript = transcript();
        let point = point();

        let runs = (0..6).map(|_| {
            validator.validate(&point, &transcript, &EngineSignal::Absent, &EngineSignal::Absent, None)
        });
        futures::future::join_all(runs).await;

        assert_eq!(backend.calls(), 6);
        assert!(backend.peak_in_flight() <= 2);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.semaphore_capacity, 2);
        assert!(snapshot.semaphore_peak_in_flight <= 2);
    }

    #[test]
    fn test_uncertain_band_half_open() {
        let band = UncertainBand::default();
        assert!(band.contains(0.0));
        assert!(band.contains(0.6));
        assert!(band.contains(0.8));
        assert!(!band.contains(1.0));
    }
}
