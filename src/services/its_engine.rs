//! Bayesian Interrupted Time Series Engine (C5).
//!
//! No probabilistic-programming crate is available, so the posterior is
//! drawn with a hand-written Metropolis-within-Gibbs sampler: the regression
//! coefficients have a closed-form conjugate Normal posterior given the
//! residual scale (an exact Gibbs step via `nalgebra`), and the residual
//! scale is updated with a symmetric random-walk Metropolis step against its
//! half-normal prior. See DESIGN.md, Open Question 3.

use crate::models::event::BehavioralEvent;
use crate::models::its::{EffectSummary, ItsAnalyzeRequest, ItsAnalyzeResponse, ItsPlots, McmcDiagnostics};
use crate::services::cache::{memoize, ResponseCache};
use crate::services::ingestor::AnalyticsStoreIngestor;
use crate::services::plots;
use crate::services::run_registry::RunRegistry;
use crate::utils::EngineError;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use statrs::statistics::{Data, OrderStatistics};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MIN_PRE_DAYS: usize = 8;
const MIN_POST_DAYS: usize = 8;
const RHAT_THRESHOLD: f64 = 1.01;
const ESS_WARN_THRESHOLD: f64 = 1000.0;
const PRIOR_BETA_SD: f64 = 10.0;
const PRIOR_SIGMA_HALF_NORMAL_SCALE: f64 = 10.0;
const SIGMA_PROPOSAL_STEP: f64 = 0.15;

pub(crate) struct DailyObservation {
    pub day_index: i64,
    pub intervention: u8,
    pub dow: u32,
    pub hour_mean: f64,
    pub y: f64,
}

/// Output of the blocking-thread computation, assembled into an
/// [`ItsAnalyzeResponse`] once the run has been persisted.
struct ComputedAnalysis {
    immediate_effect: EffectSummary,
    sustained_effect: EffectSummary,
    counterfactual_effect: EffectSummary,
    probability_of_benefit: f64,
    mcmc_diagnostics: McmcDiagnostics,
    max_rhat: f64,
    plot_set: ItsPlots,
    computation_time_seconds: f64,
    n_pre: usize,
    n_post: usize,
}

pub struct BayesianItsEngine {
    store: Arc<AnalyticsStoreIngestor>,
    registry: Arc<RunRegistry>,
    cache: Arc<ResponseCache>,
    timeout: Duration,
    plot_width: u32,
    plot_height: u32,
}

impl BayesianItsEngine {
    pub fn new(
        store: Arc<AnalyticsStoreIngestor>,
        registry: Arc<RunRegistry>,
        cache: Arc<ResponseCache>,
        timeout_secs: u64,
        plot_width: u32,
        plot_height: u32,
    ) -> Self {
        Self { store, registry, cache, timeout: Duration::from_secs(timeout_secs), plot_width, plot_height }
    }

    pub async fn analyze(&self, req: &ItsAnalyzeRequest) -> Result<ItsAnalyzeResponse, EngineError> {
        if let Some(end) = req.end_date
            && let Some(start) = req.start_date
            && end <= start
        {
            return Err(EngineError::invalid_request("endDate must exceed startDate"));
        }
        if let Some(end) = req.end_date
            && req.intervention_date > end
        {
            return Err(EngineError::invalid_request("interventionDate must not exceed endDate"));
        }

        let key = ResponseCache::generate_key(
            "its:analyze",
            "()",
            &format!(
                "[('includeDayOfWeek', {}), ('includeTimeOfDay', {}), ('interventionDate', '{}'), ('mcmcChains', {}), ('mcmcSamples', {}), ('outcomeMetric', '{}'), ('userId', '{}')]",
                req.include_day_of_week,
                req.include_time_of_day,
                req.intervention_date.to_rfc3339(),
                req.mcmc_chains,
                req.mcmc_samples,
                req.outcome_metric,
                req.user_id
            ),
        );

        let cache = self.cache.clone();
        let store = self.store.clone();
        let registry = self.registry.clone();
        let req = req.clone();
        let timeout = self.timeout;
        let (plot_width, plot_height) = (self.plot_width, self.plot_height);

        memoize(Some(&cache), &key, Some(Duration::from_secs(300)), move || async move {
            Self::run_analysis(store, registry, req, plot_width, plot_height, timeout).await
        })
        .await
    }

    async fn run_analysis(
        store: Arc<AnalyticsStoreIngestor>,
        registry: Arc<RunRegistry>,
        req: ItsAnalyzeRequest,
        plot_width: u32,
        plot_height: u32,
        timeout: Duration,
    ) -> Result<ItsAnalyzeResponse, EngineError> {
        let events = store.fetch_for_user(&req.user_id, req.start_date, req.end_date).await?;

        let req_for_worker = req.clone();
        let handle =
            tokio::task::spawn_blocking(move || Self::compute(&events, &req_for_worker, plot_width, plot_height));

        let computed = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => {
                return Err(EngineError::computation_error(format!("ITS worker task did not complete: {join_err}")))
            },
            Err(_) => return Err(EngineError::computation_timeout("ITS analysis exceeded its time budget")),
        };

        let mut run = registry.start_run("ITS");
        run.log_param("user_id", req.user_id.clone());
        run.log_param("intervention_date", req.intervention_date.to_rfc3339());
        run.log_param("outcome_metric", req.outcome_metric.clone());
        run.log_param("mcmc_samples", req.mcmc_samples as i64);
        run.log_param("mcmc_chains", req.mcmc_chains as i64);
        run.log_metric("immediate_effect", computed.immediate_effect.point_estimate);
        run.log_metric("sustained_effect", computed.sustained_effect.point_estimate);
        run.log_metric("counterfactual_effect", computed.counterfactual_effect.point_estimate);
        run.log_metric("probability_of_benefit", computed.probability_of_benefit);
        run.log_metric("max_rhat", computed.max_rhat);
        run.log_metric("computation_time_seconds", computed.computation_time_seconds);
        run.log_metric("n_observations_pre", computed.n_pre as i64);
        run.log_metric("n_observations_post", computed.n_post as i64);
        run.set_tag("analysis_type", "ITS");
        run.set_tag("userId", req.user_id.clone());
        run.set_tag("converged", if computed.mcmc_diagnostics.converged { "yes" } else { "no" });
        run.log_artifact(
            "plots",
            serde_json::json!(["observed_vs_counterfactual", "posterior_predictive_check", "effect_distribution", "mcmc_diagnostics"]),
        );

        let mlflow_run_id = registry.end_run(run).await.ok();

        Ok(ItsAnalyzeResponse {
            immediate_effect: computed.immediate_effect,
            sustained_effect: computed.sustained_effect,
            counterfactual_effect: computed.counterfactual_effect,
            probability_of_benefit: computed.probability_of_benefit,
            mcmc_diagnostics: computed.mcmc_diagnostics,
            plots: computed.plot_set,
            mlflow_run_id,
            computation_time_seconds: computed.computation_time_seconds,
            n_observations_pre: computed.n_pre,
            n_observations_post: computed.n_post,
        })
    }

    /// Runs the CPU-bound core of an ITS analysis: aggregation, MCMC
    /// sampling, convergence diagnostics, effect summarization and plot
    /// rendering. Contains no `.await` points so it can run on a blocking
    /// thread without starving the async executor.
    fn compute(
        events: &[BehavioralEvent],
        req: &ItsAnalyzeRequest,
        plot_width: u32,
        plot_height: u32,
    ) -> Result<ComputedAnalysis, EngineError> {
        let start_instant = Instant::now();

        let daily = Self::aggregate_daily(events, &req.outcome_metric)?;

        let intervention_day = req.intervention_date.date_naive();
        let first_day = daily.first().map(|d| d.0).ok_or_else(|| {
            EngineError::insufficient_data(format!("No observations found for outcome metric {}", req.outcome_metric))
        })?;

        let mut rows: Vec<DailyObservation> = daily
            .iter()
            .map(|(date, hour_mean, y)| {
                let day_index = (*date - first_day).num_days();
                let intervention = if *date >= intervention_day { 1 } else { 0 };
                DailyObservation { day_index, intervention, dow: date.weekday().num_days_from_monday(), hour_mean: *hour_mean, y: *y }
            })
            .collect();
        rows.sort_by_key(|r| r.day_index);

        let n_pre = rows.iter().filter(|r| r.intervention == 0).count();
        let n_post = rows.iter().filter(|r| r.intervention == 1).count();

        if n_pre < MIN_PRE_DAYS {
            return Err(EngineError::insufficient_data(format!(
                "Insufficient pre-intervention data: {} days, need >= {}",
                n_pre, MIN_PRE_DAYS
            )));
        }
        if n_post < MIN_POST_DAYS {
            return Err(EngineError::insufficient_data(format!(
                "Insufficient post-intervention data: {} days, need >= {}",
                n_post, MIN_POST_DAYS
            )));
        }

        let intervention_day_index = rows.iter().find(|r| r.intervention == 1).map(|r| r.day_index).unwrap_or(0);

        let (x, y, param_names) = Self::build_design_matrix(&rows, intervention_day_index, req);
        let (x_counterfactual, _, _) =
            Self::build_counterfactual_matrix(&rows, intervention_day_index, req, &param_names);

        let n_params = param_names.len();
        let mcmc_result = Self::run_mcmc(&x, &y, n_params, req.mcmc_samples, req.mcmc_chains)?;

        let (r_hat, ess) = Self::diagnostics(&mcmc_result, &param_names);
        let max_rhat = r_hat.values().cloned().fold(0.0_f64, f64::max);
        let converged = max_rhat < RHAT_THRESHOLD;
        if !converged {
            return Err(EngineError::convergence_failure(format!(
                "max R-hat {:.4} >= {} threshold",
                max_rhat, RHAT_THRESHOLD
            )));
        }
        let any_low_ess = ess.values().any(|&v| v < ESS_WARN_THRESHOLD);
        if any_low_ess {
            tracing::warn!("ITS MCMC diagnostic: at least one parameter has ESS < {}", ESS_WARN_THRESHOLD);
        }

        let gamma_idx = param_names.iter().position(|n| n == "intervention").unwrap();
        let delta_idx = param_names.iter().position(|n| n == "interaction").unwrap();

        let draws: Vec<&DVector<f64>> = mcmc_result.chains.iter().flat_map(|c| c.betas.iter()).collect();
        let sigmas: Vec<f64> = mcmc_result.chains.iter().flat_map(|c| c.sigmas.iter().copied()).collect();
        let intervention_traces: Vec<Vec<f64>> =
            mcmc_result.chains.iter().map(|c| c.betas.iter().map(|b| b[gamma_idx]).collect()).collect();

        let immediate_samples: Vec<f64> = draws.iter().map(|b| b[gamma_idx]).collect();
        let sustained_samples: Vec<f64> = draws.iter().map(|b| b[delta_idx]).collect();

        let post_rows: Vec<usize> = rows.iter().enumerate().filter(|(_, r)| r.intervention == 1).map(|(i, _)| i).collect();
        let counterfactual_samples: Vec<f64> = draws
            .iter()
            .map(|beta| {
                let preds = &x_counterfactual * *beta;
                let diffs: Vec<f64> = post_rows.iter().map(|&i| y[i] - preds[i]).collect();
                diffs.iter().sum::<f64>() / diffs.len() as f64
            })
            .collect();

        let immediate_effect = summarize_effect(&immediate_samples);
        let sustained_effect = summarize_effect(&sustained_samples);
        let counterfactual_effect = summarize_effect(&counterfactual_samples);
        let probability_of_benefit = immediate_effect
            .probability_positive
            .max(sustained_effect.probability_positive)
            .max(counterfactual_effect.probability_positive);

        let divergent_transitions = mcmc_result.chains.iter().map(|c| c.divergences).sum();

        let plot_set = plots::render_its_plots(
            &rows,
            &x,
            &x_counterfactual,
            &draws,
            &sigmas,
            &intervention_traces,
            &immediate_samples,
            &counterfactual_samples,
            &immediate_effect,
            &counterfactual_effect,
            &r_hat,
            &ess,
            plot_width,
            plot_height,
        )?;

        let computation_time_seconds = start_instant.elapsed().as_secs_f64();

        Ok(ComputedAnalysis {
            immediate_effect,
            sustained_effect,
            counterfactual_effect,
            probability_of_benefit,
            mcmc_diagnostics: McmcDiagnostics {
                r_hat,
                effective_sample_size: ess,
                divergent_transitions,
                max_tree_depth: 10,
                converged,
            },
            max_rhat,
            plot_set,
            computation_time_seconds,
            n_pre,
            n_post,
        })
    }

    /// Groups rows to one observation per calendar day: mean outcome, mean
    /// hour-of-day (for the optional hour fixed effect).
    fn aggregate_daily(
        events: &[BehavioralEvent],
        metric: &str,
    ) -> Result<Vec<(NaiveDate, f64, f64)>, EngineError> {
        let mut by_day: HashMap<NaiveDate, (Vec<f64>, Vec<f64>)> = HashMap::new();
        for event in events {
            let Some(value) = event.outcome(metric) else { continue };
            let date = event.timestamp.date_naive();
            let hour = event.time_of_day.map(|v| v as u32).unwrap_or_else(|| event.timestamp.hour_of_day()) as f64;
            let entry = by_day.entry(date).or_default();
            entry.0.push(value);
            entry.1.push(hour);
        }

        let mut out: Vec<(NaiveDate, f64, f64)> = by_day
            .into_iter()
            .map(|(date, (values, hours))| {
                let y = values.iter().sum::<f64>() / values.len() as f64;
                let hour_mean = hours.iter().sum::<f64>() / hours.len() as f64;
                (date, hour_mean, y)
            })
            .collect();
        out.sort_by_key(|(date, _, _)| *date);
        Ok(out)
    }

    fn build_design_matrix(
        rows: &[DailyObservation],
        intervention_day_index: i64,
        req: &ItsAnalyzeRequest,
    ) -> (DMatrix<f64>, DVector<f64>, Vec<String>) {
        let mut names = vec!["intercept".to_string(), "time".to_string(), "intervention".to_string(), "interaction".to_string()];
        if req.include_day_of_week {
            for i in 1..=6 {
                names.push(format!("dow_{}", i));
            }
        }
        if req.include_time_of_day {
            names.push("hour".to_string());
        }

        let n = rows.len();
        let p = names.len();
        let mut x = DMatrix::<f64>::zeros(n, p);
        let mut y = DVector::<f64>::zeros(n);

        for (i, row) in rows.iter().enumerate() {
            x[(i, 0)] = 1.0;
            x[(i, 1)] = row.day_index as f64;
            x[(i, 2)] = row.intervention as f64;
            x[(i, 3)] = (row.day_index - intervention_day_index) as f64 * row.intervention as f64;
            let mut col = 4;
            if req.include_day_of_week {
                for dow in 1..=6u32 {
                    x[(i, col)] = if row.dow == dow { 1.0 } else { 0.0 };
                    col += 1;
                }
            }
            if req.include_time_of_day {
                x[(i, col)] = row.hour_mean / 23.0;
            }
            y[i] = row.y;
        }

        (x, y, names)
    }

    /// Same design but with the intervention and interaction columns zeroed
    /// out, used to obtain the pre-only counterfactual prediction for every
    /// row (only the post rows' predictions are used downstream).
    fn build_counterfactual_matrix(
        rows: &[DailyObservation],
        intervention_day_index: i64,
        req: &ItsAnalyzeRequest,
        names: &[String],
    ) -> (DMatrix<f64>, DVector<f64>, Vec<String>) {
        let (mut x, y, names) = Self::build_design_matrix(rows, intervention_day_index, req);
        let intervention_col = names.iter().position(|n| n == "intervention").unwrap();
        let interaction_col = names.iter().position(|n| n == "interaction").unwrap();
        for i in 0..x.nrows() {
            x[(i, intervention_col)] = 0.0;
            x[(i, interaction_col)] = 0.0;
        }
        (x, y, names)
    }

    fn run_mcmc(
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        n_params: usize,
        samples_per_chain: usize,
        n_chains: usize,
    ) -> Result<McmcResult, EngineError> {
        let warmup = (samples_per_chain / 2).max(1);
        let xt = x.transpose();
        let xtx = &xt * x;
        let xty = &xt * y;
        let prior_precision = DMatrix::<f64>::identity(n_params, n_params) / (PRIOR_BETA_SD * PRIOR_BETA_SD);

        let mut chains = Vec::with_capacity(n_chains);

        for chain_idx in 0..n_chains {
            let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE + chain_idx as u64 * 97);
            let mut sigma = 1.0 + chain_idx as f64 * 0.5;
            let mut betas = Vec::with_capacity(samples_per_chain);
            let mut sigmas = Vec::with_capacity(samples_per_chain);
            let mut divergences = 0u32;

            for draw_idx in 0..(warmup + samples_per_chain) {
                let precision = &xtx / (sigma * sigma) + &prior_precision;
                let cov = precision
                    .clone()
                    .try_inverse()
                    .ok_or_else(|| EngineError::computation_error("design matrix is not invertible"))?;
                let mean = &cov * (&xty / (sigma * sigma));

                let chol = cov.clone().cholesky().ok_or_else(|| {
                    EngineError::computation_error("posterior covariance is not positive-definite")
                })?;
                let l = chol.l();
                let z = DVector::<f64>::from_iterator(
                    n_params,
                    (0..n_params).map(|_| Normal::new(0.0, 1.0).unwrap().sample(&mut rng)),
                );
                let beta = &mean + &l * z;

                let residual = y - x * &beta;
                let sse = residual.dot(&residual);
                if !sse.is_finite() || sse > 1e12 {
                    divergences += 1;
                }

                sigma = Self::metropolis_sigma_step(sigma, &residual, &mut rng);

                if draw_idx >= warmup {
                    betas.push(beta);
                    sigmas.push(sigma);
                }
            }

            chains.push(Chain { betas, sigmas, divergences });
        }

        Ok(McmcResult { chains })
    }

    fn metropolis_sigma_step(sigma: f64, residual: &DVector<f64>, rng: &mut ChaCha8Rng) -> f64 {
        let n = residual.len() as f64;
        let sse = residual.dot(residual);

        let log_sigma = sigma.ln();
        let proposal_log_sigma = log_sigma + Normal::new(0.0, SIGMA_PROPOSAL_STEP).unwrap().sample(rng);
        let sigma_new = proposal_log_sigma.exp();

        let log_lik = |s: f64| -n * s.ln() - sse / (2.0 * s * s);
        let log_half_normal_prior = |s: f64| -(s * s) / (2.0 * PRIOR_SIGMA_HALF_NORMAL_SCALE * PRIOR_SIGMA_HALF_NORMAL_SCALE);

        // Jacobian of the log-sigma reparameterization: + log(s).
        let log_target = |s: f64| log_lik(s) + log_half_normal_prior(s) + s.ln();

        let log_accept_ratio = log_target(sigma_new) - log_target(sigma);
        if log_accept_ratio >= 0.0 || rng.gen::<f64>().ln() < log_accept_ratio {
            sigma_new
        } else {
            sigma
        }
    }

    fn diagnostics(result: &McmcResult, param_names: &[String]) -> (HashMap<String, f64>, HashMap<String, f64>) {
        let mut r_hat = HashMap::new();
        let mut ess = HashMap::new();

        for (idx, name) in param_names.iter().enumerate() {
            let chain_series: Vec<Vec<f64>> =
                result.chains.iter().map(|c| c.betas.iter().map(|b| b[idx]).collect()).collect();
            r_hat.insert(name.clone(), gelman_rubin(&chain_series));
            ess.insert(name.clone(), effective_sample_size(&chain_series));
        }

        (r_hat, ess)
    }
}

struct Chain {
    betas: Vec<DVector<f64>>,
    sigmas: Vec<f64>,
    divergences: u32,
}

struct McmcResult {
    chains: Vec<Chain>,
}

fn gelman_rubin(chains: &[Vec<f64>]) -> f64 {
    let m = chains.len() as f64;
    let n = chains[0].len() as f64;

    let chain_means: Vec<f64> = chains.iter().map(|c| c.iter().sum::<f64>() / n).collect();
    let grand_mean = chain_means.iter().sum::<f64>() / m;

    let b = (n / (m - 1.0)) * chain_means.iter().map(|cm| (cm - grand_mean).powi(2)).sum::<f64>();
    let w = chains
        .iter()
        .zip(chain_means.iter())
        .map(|(c, cm)| c.iter().map(|v| (v - cm).powi(2)).sum::<f64>() / (n - 1.0))
        .sum::<f64>()
        / m;

    if w <= 0.0 {
        return 1.0;
    }
    let var_hat = ((n - 1.0) / n) * w + b / n;
    (var_hat / w).sqrt()
}

/// Practical initial-positive-sequence autocorrelation estimator (Geyer),
/// applied to the pooled draws across chains.
fn effective_sample_size(chains: &[Vec<f64>]) -> f64 {
    let pooled: Vec<f64> = chains.iter().flatten().cloned().collect();
    let n = pooled.len();
    if n < 4 {
        return n as f64;
    }
    let mean = pooled.iter().sum::<f64>() / n as f64;
    let var = pooled.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    if var <= 0.0 {
        return n as f64;
    }

    let max_lag = (n / 2).min(1000);
    let autocorr = |lag: usize| -> f64 {
        let mut s = 0.0;
        for i in 0..(n - lag) {
            s += (pooled[i] - mean) * (pooled[i + lag] - mean);
        }
        s / (n as f64 * var)
    };

    let mut sum_rho = 0.0;
    let mut lag = 1;
    while lag + 1 < max_lag {
        let pair_sum = autocorr(lag) + autocorr(lag + 1);
        if pair_sum < 0.0 {
            break;
        }
        sum_rho += pair_sum;
        lag += 2;
    }

    let denom = 1.0 + 2.0 * sum_rho;
    if denom <= 0.0 { n as f64 } else { n as f64 / denom }
}

fn summarize_effect(samples: &[f64]) -> EffectSummary {
    let n = samples.len() as f64;
    let point_estimate = samples.iter().sum::<f64>() / n;

    let mut data = Data::new(samples.to_vec());
    let ci_lower = data.quantile(0.025);
    let ci_upper = data.quantile(0.975);

    let probability_positive = samples.iter().filter(|&&v| v > 0.0).count() as f64 / n;
    let probability_negative = samples.iter().filter(|&&v| v < 0.0).count() as f64 / n;

    EffectSummary { point_estimate, ci_lower, ci_upper, probability_positive, probability_negative }
}

trait HourOfDay {
    fn hour_of_day(&self) -> u32;
}

impl HourOfDay for DateTime<Utc> {
    fn hour_of_day(&self) -> u32 {
        use chrono::Timelike;
        self.time().hour()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gelman_rubin_is_close_to_one_for_identical_chains() {
        let chains = vec![vec![1.0, 1.01, 0.99, 1.0, 1.02], vec![1.0, 0.98, 1.0, 1.01, 0.99]];
        let rhat = gelman_rubin(&chains);
        assert!(rhat < 1.1);
    }

    #[test]
    fn effect_summary_respects_ci_ordering() {
        let samples: Vec<f64> = (0..1000).map(|i| i as f64 / 100.0 - 5.0).collect();
        let summary = summarize_effect(&samples);
        assert!(summary.ci_lower <= summary.point_estimate);
        assert!(summary.point_estimate <= summary.ci_upper);
    }

    #[test]
    fn probability_positive_and_negative_are_bounded() {
        let samples = vec![-1.0, -0.5, 0.1, 0.5, 1.0, 2.0];
        let summary = summarize_effect(&samples);
        assert!(summary.probability_positive >= 0.0 && summary.probability_positive <= 1.0);
        assert!(summary.probability_positive + summary.probability_negative <= 1.0);
    }
}
