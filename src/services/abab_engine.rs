//! ABAB Randomization Engine (C6).
//!
//! Grounded directly on `original_source/apps/ml-service/app/services/abab_engine.py`:
//! same fetch/validate/observed-effect/permutation/Cohen's-d pipeline, same
//! deterministic-RNG contract (`numpy.random.default_rng(seed)` ==
//! `rand_chacha::ChaCha8Rng::seed_from_u64(seed)` here).

use crate::models::abab::{AbabAnalyzeRequest, AbabAnalyzeResponse, WwcDetails};
use crate::models::event::{BehavioralEvent, EXPERIMENT_PHASES};
use crate::services::cache::{memoize, ResponseCache};
use crate::services::ingestor::AnalyticsStoreIngestor;
use crate::services::run_registry::RunRegistry;
use crate::services::sced_standards::check_sced_standards;
use crate::utils::EngineError;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct AbabRandomizationEngine {
    store: Arc<AnalyticsStoreIngestor>,
    registry: Arc<RunRegistry>,
    cache: Arc<ResponseCache>,
    timeout_base: Duration,
    timeout_max: Duration,
}

impl AbabRandomizationEngine {
    pub fn new(
        store: Arc<AnalyticsStoreIngestor>,
        registry: Arc<RunRegistry>,
        cache: Arc<ResponseCache>,
        timeout_base_secs: u64,
        timeout_max_secs: u64,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            timeout_base: Duration::from_secs(timeout_base_secs),
            timeout_max: Duration::from_secs(timeout_max_secs),
        }
    }

    /// Linear budget between `timeout_base` at 10,000 permutations and
    /// `timeout_max` at 50,000, matching the ABAB permutation test's
    /// validated request range.
    fn timeout_for(&self, n_permutations: u32) -> Duration {
        let base = self.timeout_base.as_secs_f64();
        let span = (self.timeout_max.as_secs_f64() - base).max(0.0);
        let progress = ((n_permutations as f64 - 10_000.0) / 40_000.0).clamp(0.0, 1.0);
        Duration::from_secs_f64(base + span * progress)
    }

    pub async fn analyze(&self, req: &AbabAnalyzeRequest) -> Result<AbabAnalyzeResponse, EngineError> {
        if !crate::models::abab::OUTCOME_METRIC_RE.is_match(&req.outcome_metric) {
            return Err(EngineError::invalid_request(format!(
                "outcomeMetric '{}' must match ^[A-Za-z0-9_]+$",
                req.outcome_metric
            )));
        }

        let key = ResponseCache::generate_key(
            "abab:analyze",
            "()",
            &format!(
                "[('nPermutations', {}), ('outcomeMetric', '{}'), ('protocolId', '{}'), ('seed', {:?}), ('userId', '{}')]",
                req.n_permutations, req.outcome_metric, req.protocol_id, req.seed, req.user_id
            ),
        );

        let cache = self.cache.clone();
        let store = self.store.clone();
        let registry = self.registry.clone();
        let req = req.clone();
        let timeout = self.timeout_for(req.n_permutations);

        memoize(Some(&cache), &key, Some(Duration::from_secs(300)), move || {
            let store = store.clone();
            let registry = registry.clone();
            let req = req.clone();
            async move { Self::run_analysis(store, registry, req, timeout).await }
        })
        .await
    }

    async fn run_analysis(
        store: Arc<AnalyticsStoreIngestor>,
        registry: Arc<RunRegistry>,
        req: AbabAnalyzeRequest,
        timeout: Duration,
    ) -> Result<AbabAnalyzeResponse, EngineError> {
        let events = store.fetch_for_user(&req.user_id, None, None).await?;

        let req_for_worker = req.clone();
        let handle = tokio::task::spawn_blocking(move || Self::compute(&events, &req_for_worker));

        let computed = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => {
                return Err(EngineError::computation_error(format!("ABAB worker task did not complete: {join_err}")))
            },
            Err(_) => return Err(EngineError::computation_timeout("ABAB permutation test exceeded its time budget")),
        };

        let mut run = registry.start_run("ABAB_randomization");
        run.log_param("user_id", req.user_id.clone());
        run.log_param("protocol_id", req.protocol_id.clone());
        run.log_param("outcome_metric", req.outcome_metric.clone());
        run.log_param("n_permutations", req.n_permutations);
        run.log_param("seed", computed.seed);
        run.log_metric("observed_effect", computed.observed_effect);
        run.log_metric("p_value", computed.p_value);
        run.log_metric("cohens_d", computed.cohens_d);
        for (phase, count) in &computed.n_observations_per_phase {
            run.log_metric(format!("n_{}", phase), *count as i64);
        }
        run.set_tag("analysis_type", "ABAB_randomization");
        run.set_tag("userId", req.user_id.clone());
        run.set_tag("significant", if computed.p_value < 0.05 { "yes" } else { "no" });
        run.set_tag("wwc_rating", computed.wwc_details.wwc_rating.clone());
        run.set_tag("passes_wwc", if computed.passes_sced_standards { "yes" } else { "no" });

        let mlflow_run_id = registry.end_run(run).await.ok();

        Ok(AbabAnalyzeResponse {
            observed_effect: computed.observed_effect,
            p_value: computed.p_value,
            cohens_d: computed.cohens_d,
            permutation_distribution: computed.permutation_distribution,
            n_observations_per_phase: computed.n_observations_per_phase,
            passes_sced_standards: computed.passes_sced_standards,
            wwc_details: computed.wwc_details,
            mlflow_run_id,
            computation_time_seconds: computed.computation_time_seconds,
        })
    }

    /// Runs the CPU-bound core of an ABAB analysis: phase bucketing, the
    /// permutation test, Cohen's d and the WWC SCED rating. Contains no
    /// `.await` points so it can run on a blocking thread.
    fn compute(events: &[BehavioralEvent], req: &AbabAnalyzeRequest) -> Result<ComputedAbab, EngineError> {
        let start = Instant::now();

        let mut phases: HashMap<&str, Vec<f64>> = HashMap::new();
        for phase in EXPERIMENT_PHASES {
            phases.insert(phase, Vec::new());
        }

        for event in events {
            let (Some(phase), Some(value)) =
                (event.experiment_phase.as_deref(), event.outcome(&req.outcome_metric))
            else {
                continue;
            };
            if let Some(bucket) = phases.get_mut(phase) {
                bucket.push(value);
            }
        }

        let missing: Vec<&str> =
            EXPERIMENT_PHASES.iter().filter(|p| phases[*p].is_empty()).copied().collect();
        if !missing.is_empty() {
            return Err(EngineError::invalid_data(format!(
                "Incomplete ABAB design: missing phases {:?} for user {}",
                missing, req.user_id
            )));
        }

        let insufficient: Vec<&str> =
            EXPERIMENT_PHASES.iter().filter(|p| phases[*p].len() < 5).copied().collect();
        if !insufficient.is_empty() {
            return Err(EngineError::invalid_data(format!(
                "Insufficient data in phases {:?}: each ABAB phase needs >= 5 observations",
                insufficient
            )));
        }

        let b1 = &phases["baseline_1"];
        let a1 = &phases["intervention_A_1"];
        let b2 = &phases["baseline_2"];
        let a2 = &phases["intervention_A_2"];

        let phase_sizes = [b1.len(), a1.len(), b2.len(), a2.len()];
        let mut outcomes: Vec<f64> = Vec::with_capacity(phase_sizes.iter().sum());
        outcomes.extend_from_slice(b1);
        outcomes.extend_from_slice(a1);
        outcomes.extend_from_slice(b2);
        outcomes.extend_from_slice(a2);

        let mean_a = mean(a1) + mean(a2);
        let mean_b = mean(b1) + mean(b2);
        let observed_effect = mean_a / 2.0 - mean_b / 2.0;

        let seed = req.seed.unwrap_or_else(|| rand::random::<u64>());
        let permutation_distribution = run_permutation_test(&outcomes, &phase_sizes, req.n_permutations, seed);

        let abs_observed = observed_effect.abs();
        let exceeding = permutation_distribution.iter().filter(|e| e.abs() >= abs_observed).count();
        let p_value = exceeding as f64 / permutation_distribution.len() as f64;

        let cohens_d = calculate_cohens_d(a1, a2, b1, b2);

        let mut phase_refs: HashMap<&str, &[f64]> = HashMap::new();
        phase_refs.insert("baseline_1", b1.as_slice());
        phase_refs.insert("intervention_A_1", a1.as_slice());
        phase_refs.insert("baseline_2", b2.as_slice());
        phase_refs.insert("intervention_A_2", a2.as_slice());
        let (passes_sced_standards, wwc_details): (bool, WwcDetails) =
            check_sced_standards(&phase_refs, p_value, cohens_d);

        let n_observations_per_phase: HashMap<String, usize> =
            phases.iter().map(|(k, v)| (k.to_string(), v.len())).collect();

        let computation_time_seconds = start.elapsed().as_secs_f64();

        Ok(ComputedAbab {
            observed_effect,
            p_value,
            cohens_d,
            permutation_distribution,
            n_observations_per_phase,
            passes_sced_standards,
            wwc_details,
            seed,
            computation_time_seconds,
        })
    }
}

/// Output of the blocking-thread computation, assembled into an
/// [`AbabAnalyzeResponse`] once the run has been persisted.
struct ComputedAbab {
    observed_effect: f64,
    p_value: f64,
    cohens_d: f64,
    permutation_distribution: Vec<f64>,
    n_observations_per_phase: HashMap<String, usize>,
    passes_sced_standards: bool,
    wwc_details: WwcDetails,
    seed: u64,
    computation_time_seconds: f64,
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn sample_var(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() as f64 - 1.0)
}

/// `d = (mean(A) - mean(B)) / s_pooled`; returns 0.0 when the pooled SD is 0.
pub fn calculate_cohens_d(a1: &[f64], a2: &[f64], b1: &[f64], b2: &[f64]) -> f64 {
    let mut a: Vec<f64> = a1.to_vec();
    a.extend_from_slice(a2);
    let mut b: Vec<f64> = b1.to_vec();
    b.extend_from_slice(b2);

    let (n_a, n_b) = (a.len() as f64, b.len() as f64);
    let (var_a, var_b) = (sample_var(&a), sample_var(&b));
    let pooled_sd = (((n_a - 1.0) * var_a + (n_b - 1.0) * var_b) / (n_a + n_b - 2.0)).sqrt();

    if pooled_sd == 0.0 {
        return 0.0;
    }
    (mean(&a) - mean(&b)) / pooled_sd
}

/// Phase-size-preserving permutation test over the canonical phase order
/// `[baseline_1, intervention_A_1, baseline_2, intervention_A_2]`.
pub fn run_permutation_test(outcomes: &[f64], phase_sizes: &[usize; 4], n_permutations: u32, seed: u64) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut shuffled = outcomes.to_vec();
    let mut effects = Vec::with_capacity(n_permutations as usize);

    let b1 = phase_sizes[0];
    let a1 = b1 + phase_sizes[1];
    let b2 = a1 + phase_sizes[2];

    for _ in 0..n_permutations {
        shuffled.shuffle(&mut rng);
        let g1 = &shuffled[0..b1];
        let g2 = &shuffled[b1..a1];
        let g3 = &shuffled[a1..b2];
        let g4 = &shuffled[b2..];
        let effect = (mean(g2) + mean(g4)) / 2.0 - (mean(g1) + mean(g3)) / 2.0;
        effects.push(effect);
    }

    effects
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cohens_d_is_zero_when_pooled_sd_is_zero() {
        let a1 = vec![5.0, 5.0, 5.0, 5.0, 5.0];
        let a2 = vec![5.0, 5.0, 5.0, 5.0, 5.0];
        let b1 = vec![5.0, 5.0, 5.0, 5.0, 5.0];
        let b2 = vec![5.0, 5.0, 5.0, 5.0, 5.0];
        assert_eq!(calculate_cohens_d(&a1, &a2, &b1, &b2), 0.0);
    }

    #[test]
    fn permutation_test_is_deterministic_given_a_seed() {
        let outcomes: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let sizes = [5, 5, 5, 5];
        let first = run_permutation_test(&outcomes, &sizes, 1000, 42);
        let second = run_permutation_test(&outcomes, &sizes, 1000, 42);
        assert_eq!(first, second);
    }

    #[test]
    fn p_value_is_within_unit_interval() {
        let outcomes: Vec<f64> = vec![
            65.0, 64.0, 66.0, 65.0, 64.0, 80.0, 81.0, 79.0, 80.0, 81.0, 68.0, 67.0, 69.0, 68.0, 67.0, 82.0, 81.0, 83.0,
            82.0, 81.0,
        ];
        let sizes = [5, 5, 5, 5];
        let dist = run_permutation_test(&outcomes, &sizes, 2000, 7);
        let observed = 14.5_f64;
        let exceeding = dist.iter().filter(|e| e.abs() >= observed.abs()).count();
        let p = exceeding as f64 / dist.len() as f64;
        assert!((0.0..=1.0).contains(&p));
    }
}
