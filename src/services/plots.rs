//! Plot rendering for the ITS engine's four diagnostic charts.
//!
//! No SVG-to-response path fits a JSON API response field, so charts are
//! rasterized in-memory with `plotters::BitMapBackend`, handed to `image`
//! for PNG encoding, then base64-encoded into the response — the same
//! `plotters` chart-building idiom as
//! `dashflow-evals/src/report/charts.rs`, adapted from its SVG-to-file
//! target to an in-memory bitmap.

use crate::models::its::{EffectSummary, ItsPlots};
use crate::utils::EngineError;
use base64::Engine;
use nalgebra::{DMatrix, DVector};
use plotters::prelude::*;
use std::collections::HashMap;
use std::io::Cursor;

use super::its_engine::DailyObservation;

const RHAT_THRESHOLD: f64 = 1.01;
const ESS_THRESHOLD: f64 = 1000.0;

fn render_error(context: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::computation_error(format!("{context}: {err}"))
}

fn encode_png_base64(width: u32, height: u32, buffer: Vec<u8>) -> Result<String, EngineError> {
    let image = image::RgbImage::from_raw(width, height, buffer)
        .ok_or_else(|| EngineError::computation_error("failed to build plot bitmap"))?;

    let mut png_bytes: Vec<u8> = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png_bytes), image::ImageFormat::Png)
        .map_err(|e| render_error("PNG encode failed", e))?;

    Ok(base64::engine::general_purpose::STANDARD.encode(png_bytes))
}

fn percentile_of_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    let idx = ((n as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(n - 1)]
}

#[allow(clippy::too_many_arguments)]
pub fn render_its_plots(
    rows: &[DailyObservation],
    x: &DMatrix<f64>,
    x_counterfactual: &DMatrix<f64>,
    draws: &[&DVector<f64>],
    sigmas: &[f64],
    intervention_traces: &[Vec<f64>],
    immediate_samples: &[f64],
    counterfactual_samples: &[f64],
    immediate_effect: &EffectSummary,
    counterfactual_effect: &EffectSummary,
    r_hat: &HashMap<String, f64>,
    ess: &HashMap<String, f64>,
    width: u32,
    height: u32,
) -> Result<ItsPlots, EngineError> {
    Ok(ItsPlots {
        observed_vs_counterfactual: observed_vs_counterfactual(rows, x_counterfactual, draws, width, height)?,
        posterior_predictive_check: posterior_predictive_check(rows, x, draws, sigmas, width, height)?,
        effect_distribution: effect_distribution(
            immediate_samples,
            counterfactual_samples,
            immediate_effect,
            counterfactual_effect,
            width,
            height,
        )?,
        mcmc_diagnostics: mcmc_diagnostics_chart(r_hat, ess, intervention_traces, width, height)?,
    })
}

fn observed_vs_counterfactual(
    rows: &[DailyObservation],
    x_counterfactual: &DMatrix<f64>,
    draws: &[&DVector<f64>],
    width: u32,
    height: u32,
) -> Result<String, EngineError> {
    let n = rows.len();
    let mean_beta =
        draws.iter().fold(DVector::<f64>::zeros(x_counterfactual.ncols()), |acc, b| acc + *b) / draws.len() as f64;
    let counterfactual_pred = x_counterfactual * &mean_beta;

    let preds_per_draw: Vec<DVector<f64>> = draws.iter().map(|b| x_counterfactual * *b).collect();
    let mut ci_lower = vec![0.0; n];
    let mut ci_upper = vec![0.0; n];
    for i in 0..n {
        let mut vals: Vec<f64> = preds_per_draw.iter().map(|p| p[i]).collect();
        vals.sort_by(|a, b| a.partial_cmp(b).unwrap());
        ci_lower[i] = percentile_of_sorted(&vals, 0.025);
        ci_upper[i] = percentile_of_sorted(&vals, 0.975);
    }

    let pre_points: Vec<(f64, f64)> =
        rows.iter().filter(|r| r.intervention == 0).map(|r| (r.day_index as f64, r.y)).collect();
    let post_points: Vec<(f64, f64)> =
        rows.iter().filter(|r| r.intervention == 1).map(|r| (r.day_index as f64, r.y)).collect();
    let counterfactual: Vec<(f64, f64)> =
        (0..n).map(|i| (rows[i].day_index as f64, counterfactual_pred[i])).collect();
    let ribbon: Vec<(f64, f64)> = (0..n)
        .map(|i| (rows[i].day_index as f64, ci_upper[i]))
        .chain((0..n).rev().map(|i| (rows[i].day_index as f64, ci_lower[i])))
        .collect();

    let intervention_day_index = rows.iter().find(|r| r.intervention == 1).map(|r| r.day_index as f64);

    let (y_min, y_max) = pre_points
        .iter()
        .chain(post_points.iter())
        .map(|(_, y)| *y)
        .chain(ci_lower.iter().copied())
        .chain(ci_upper.iter().copied())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), y| (lo.min(y), hi.max(y)));
    let x_max = rows.last().map(|r| r.day_index as f64).unwrap_or(1.0);

    let mut buffer = vec![0u8; (width * height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| render_error("fill", e))?;

        let mut chart = ChartBuilder::on(&root)
            .caption("Observed vs Counterfactual", ("sans-serif", 24))
            .margin(15)
            .x_label_area_size(35)
            .y_label_area_size(50)
            .build_cartesian_2d(0.0..x_max.max(1.0), (y_min - 1.0)..(y_max + 1.0))
            .map_err(|e| render_error("chart build", e))?;

        chart.configure_mesh().x_desc("Day").y_desc("Outcome").draw().map_err(|e| render_error("mesh", e))?;

        chart
            .draw_series(std::iter::once(Polygon::new(ribbon, RED.mix(0.15))))
            .map_err(|e| render_error("ci ribbon", e))?
            .label("95% CI")
            .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 20, y + 5)], RED.mix(0.15).filled()));

        chart
            .draw_series(LineSeries::new(counterfactual, RED.mix(0.8)))
            .map_err(|e| render_error("counterfactual series", e))?
            .label("Counterfactual")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

        chart
            .draw_series(pre_points.iter().map(|&(x, y)| Circle::new((x, y), 3, BLUE.filled())))
            .map_err(|e| render_error("pre-intervention scatter", e))?
            .label("Observed (pre)")
            .legend(|(x, y)| Circle::new((x + 10, y), 3, BLUE.filled()));

        chart
            .draw_series(post_points.iter().map(|&(x, y)| Circle::new((x, y), 3, GREEN.filled())))
            .map_err(|e| render_error("post-intervention scatter", e))?
            .label("Observed (post)")
            .legend(|(x, y)| Circle::new((x + 10, y), 3, GREEN.filled()));

        if let Some(iv) = intervention_day_index {
            chart
                .draw_series(std::iter::once(PathElement::new(
                    vec![(iv, y_min - 1.0), (iv, y_max + 1.0)],
                    BLACK.stroke_width(1),
                )))
                .map_err(|e| render_error("intervention line", e))?
                .label("Intervention date")
                .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLACK));
        }

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(|e| render_error("legend", e))?;

        root.present().map_err(|e| render_error("present", e))?;
    }

    encode_png_base64(width, height, buffer)
}

/// Draws observed-outcome density against up to 100 posterior predictive
/// draws: for each of a sample of MCMC draws, a row is picked at random and
/// a replicate outcome is simulated as `x * beta + Normal(0, sigma)`.
fn posterior_predictive_check(
    rows: &[DailyObservation],
    x: &DMatrix<f64>,
    draws: &[&DVector<f64>],
    sigmas: &[f64],
    width: u32,
    height: u32,
) -> Result<String, EngineError> {
    let values: Vec<f64> = rows.iter().map(|r| r.y).collect();
    let predictive = simulate_posterior_predictive(x, draws, sigmas, 100);

    let combined_min =
        values.iter().chain(predictive.iter()).cloned().fold(f64::INFINITY, f64::min);
    let combined_max =
        values.iter().chain(predictive.iter()).cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = (combined_max - combined_min).max(1.0);
    let bins = 12.min(values.len().max(1));
    let bin_width = span / bins as f64;

    let histogram_of = |samples: &[f64]| -> Vec<u32> {
        let mut hist = vec![0u32; bins];
        for &v in samples {
            let idx = (((v - combined_min) / span) * bins as f64).floor() as usize;
            hist[idx.min(bins - 1)] += 1;
        }
        hist
    };
    let observed_hist = histogram_of(&values);
    let predictive_hist = histogram_of(&predictive);
    let max_count = observed_hist.iter().chain(predictive_hist.iter()).cloned().max().unwrap_or(1);

    let mut buffer = vec![0u8; (width * height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| render_error("fill", e))?;

        let mut chart = ChartBuilder::on(&root)
            .caption("Posterior Predictive Check", ("sans-serif", 24))
            .margin(15)
            .x_label_area_size(35)
            .y_label_area_size(50)
            .build_cartesian_2d(combined_min..combined_max, 0u32..(max_count + 1))
            .map_err(|e| render_error("chart build", e))?;

        chart.configure_mesh().x_desc("Outcome").y_desc("Count").draw().map_err(|e| render_error("mesh", e))?;

        chart
            .draw_series(observed_hist.iter().enumerate().map(|(i, &count)| {
                let x0 = combined_min + i as f64 * bin_width;
                let x1 = x0 + bin_width;
                Rectangle::new([(x0, 0), (x1, count)], BLUE.mix(0.6).filled())
            }))
            .map_err(|e| render_error("observed histogram series", e))?
            .label("Observed")
            .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 20, y + 5)], BLUE.mix(0.6).filled()));

        chart
            .draw_series(predictive_hist.iter().enumerate().map(|(i, &count)| {
                let x0 = combined_min + i as f64 * bin_width;
                let x1 = x0 + bin_width;
                Rectangle::new([(x0, 0), (x1, count)], RGBColor(217, 119, 6).mix(0.45).filled())
            }))
            .map_err(|e| render_error("predictive histogram series", e))?
            .label("Posterior predictive")
            .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 20, y + 5)], RGBColor(217, 119, 6).mix(0.45).filled()));

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(|e| render_error("legend", e))?;

        root.present().map_err(|e| render_error("present", e))?;
    }

    encode_png_base64(width, height, buffer)
}

fn simulate_posterior_predictive(
    x: &DMatrix<f64>,
    draws: &[&DVector<f64>],
    sigmas: &[f64],
    max_draws: usize,
) -> Vec<f64> {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    if draws.is_empty() || x.nrows() == 0 {
        return Vec::new();
    }

    let n_draws = draws.len().min(max_draws);
    let step = (draws.len() / n_draws).max(1);
    let mut rng = ChaCha8Rng::seed_from_u64(0xA11CE);

    (0..draws.len())
        .step_by(step)
        .take(n_draws)
        .map(|i| {
            let row = rng.gen_range(0..x.nrows());
            let fitted = x.row(row).iter().zip(draws[i].iter()).map(|(a, b)| a * b).sum::<f64>();
            let sigma = sigmas.get(i).copied().unwrap_or(1.0).max(1e-6);
            fitted + Normal::new(0.0, sigma).unwrap().sample(&mut rng)
        })
        .collect()
}

fn effect_distribution(
    immediate: &[f64],
    counterfactual: &[f64],
    immediate_effect: &EffectSummary,
    counterfactual_effect: &EffectSummary,
    width: u32,
    height: u32,
) -> Result<String, EngineError> {
    let bins = 20;

    let mut buffer = vec![0u8; (width * height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| render_error("fill", e))?;
        let (left, right) = root.split_horizontally(width / 2);

        draw_effect_panel(&left, "Immediate effect", immediate, immediate_effect, BLUE, bins)?;
        draw_effect_panel(&right, "Counterfactual effect", counterfactual, counterfactual_effect, RGBColor(217, 119, 6), bins)?;

        root.present().map_err(|e| render_error("present", e))?;
    }

    encode_png_base64(width, height, buffer)
}

fn draw_effect_panel<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    title: &str,
    samples: &[f64],
    effect: &EffectSummary,
    color: RGBColor,
    bins: usize,
) -> Result<(), EngineError> {
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = (max - min).max(1.0);
    let bin_width = span / bins as f64;

    let mut histogram = vec![0u32; bins];
    for &v in samples {
        let idx = (((v - min) / span) * bins as f64).floor() as usize;
        histogram[idx.min(bins - 1)] += 1;
    }
    let max_count = *histogram.iter().max().unwrap_or(&1);

    let mut chart = ChartBuilder::on(area)
        .caption(title, ("sans-serif", 18))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(45)
        .build_cartesian_2d(min..max, 0u32..(max_count + 1))
        .map_err(|e| render_error("effect chart build", e))?;

    chart.configure_mesh().x_desc("Effect size").y_desc("Count").draw().map_err(|e| render_error("effect mesh", e))?;

    chart
        .draw_series(histogram.iter().enumerate().map(|(i, &count)| {
            let x0 = min + i as f64 * bin_width;
            let x1 = x0 + bin_width;
            Rectangle::new([(x0, 0), (x1, count)], color.mix(0.6).filled())
        }))
        .map_err(|e| render_error("effect histogram series", e))?;

    chart
        .draw_series([effect.ci_lower, effect.ci_upper].iter().map(|&v| {
            PathElement::new(vec![(v, 0), (v, max_count + 1)], BLACK.stroke_width(1))
        }))
        .map_err(|e| render_error("effect CI lines", e))?;

    Ok(())
}

fn mcmc_diagnostics_chart(
    r_hat: &HashMap<String, f64>,
    ess: &HashMap<String, f64>,
    intervention_traces: &[Vec<f64>],
    width: u32,
    height: u32,
) -> Result<String, EngineError> {
    let mut names: Vec<&String> = r_hat.keys().collect();
    names.sort();
    let max_rhat = r_hat.values().cloned().fold(RHAT_THRESHOLD, f64::max);
    let max_ess = ess.values().cloned().fold(ESS_THRESHOLD, f64::max);
    let trace_len = intervention_traces.iter().map(|c| c.len()).max().unwrap_or(1).max(1);
    let trace_colors = [BLUE, RGBColor(217, 119, 6), GREEN, MAGENTA];

    let mut buffer = vec![0u8; (width * height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| render_error("fill", e))?;
        let (top, rest) = root.split_vertically(height / 3);
        let (middle, bottom) = rest.split_vertically(height / 3);

        let mut trace_chart = ChartBuilder::on(&top)
            .caption("Trace: intervention coefficient", ("sans-serif", 18))
            .margin(10)
            .x_label_area_size(25)
            .y_label_area_size(45)
            .build_cartesian_2d(0usize..trace_len, {
                let lo = intervention_traces.iter().flatten().cloned().fold(f64::INFINITY, f64::min);
                let hi = intervention_traces.iter().flatten().cloned().fold(f64::NEG_INFINITY, f64::max);
                if lo.is_finite() && hi.is_finite() { lo..hi } else { 0.0..1.0 }
            })
            .map_err(|e| render_error("trace chart build", e))?;
        trace_chart.configure_mesh().y_desc("value").draw().map_err(|e| render_error("trace mesh", e))?;
        for (chain_idx, series) in intervention_traces.iter().enumerate() {
            let color = trace_colors[chain_idx % trace_colors.len()];
            trace_chart
                .draw_series(LineSeries::new(series.iter().enumerate().map(|(i, &v)| (i, v)), color))
                .map_err(|e| render_error("trace series", e))?;
        }

        let mut rhat_chart = ChartBuilder::on(&middle)
            .caption("R-hat by parameter (1.01 threshold)", ("sans-serif", 18))
            .margin(10)
            .x_label_area_size(25)
            .y_label_area_size(80)
            .build_cartesian_2d(0.9..(max_rhat + 0.05), 0usize..names.len().max(1))
            .map_err(|e| render_error("rhat chart build", e))?;
        rhat_chart.configure_mesh().x_desc("R-hat").draw().map_err(|e| render_error("rhat mesh", e))?;
        rhat_chart
            .draw_series(names.iter().enumerate().map(|(i, name)| {
                let v = r_hat[name.as_str()];
                let color = if v >= RHAT_THRESHOLD { RED } else { GREEN };
                Rectangle::new([(0.9, i), (v, i + 1)], color.filled())
            }))
            .map_err(|e| render_error("rhat series", e))?;
        rhat_chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(RHAT_THRESHOLD, 0), (RHAT_THRESHOLD, names.len().max(1))],
                BLACK.stroke_width(1),
            )))
            .map_err(|e| render_error("rhat threshold", e))?;

        let mut ess_chart = ChartBuilder::on(&bottom)
            .caption("Effective sample size by parameter (1000 threshold)", ("sans-serif", 18))
            .margin(10)
            .x_label_area_size(25)
            .y_label_area_size(80)
            .build_cartesian_2d(0.0..(max_ess + max_ess * 0.1), 0usize..names.len().max(1))
            .map_err(|e| render_error("ess chart build", e))?;
        ess_chart.configure_mesh().x_desc("ESS").draw().map_err(|e| render_error("ess mesh", e))?;
        ess_chart
            .draw_series(names.iter().enumerate().map(|(i, name)| {
                let v = ess[name.as_str()];
                let color = if v < ESS_THRESHOLD { RGBColor(217, 119, 6) } else { BLUE };
                Rectangle::new([(0.0, i), (v, i + 1)], color.filled())
            }))
            .map_err(|e| render_error("ess series", e))?;
        ess_chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(ESS_THRESHOLD, 0), (ESS_THRESHOLD, names.len().max(1))],
                BLACK.stroke_width(1),
            )))
            .map_err(|e| render_error("ess threshold", e))?;

        root.present().map_err(|e| render_error("present", e))?;
    }

    encode_png_base64(width, height, buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows() -> Vec<DailyObservation> {
        (0..16)
            .map(|i| DailyObservation {
                day_index: i,
                intervention: if i >= 8 { 1 } else { 0 },
                dow: (i % 7) as u32,
                hour_mean: 12.0,
                y: 60.0 + i as f64,
            })
            .collect()
    }

    fn sample_effect(samples: &[f64]) -> EffectSummary {
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        EffectSummary {
            point_estimate: samples.iter().sum::<f64>() / samples.len() as f64,
            ci_lower: percentile_of_sorted(&sorted, 0.025),
            ci_upper: percentile_of_sorted(&sorted, 0.975),
            probability_positive: samples.iter().filter(|&&v| v > 0.0).count() as f64 / samples.len() as f64,
            probability_negative: samples.iter().filter(|&&v| v < 0.0).count() as f64 / samples.len() as f64,
        }
    }

    #[test]
    fn encode_png_base64_round_trips_through_a_decodable_image() {
        let width = 64;
        let height = 48;
        let buffer = vec![255u8; (width * height * 3) as usize];
        let encoded = encode_png_base64(width, height, buffer).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD.decode(&encoded).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), width);
        assert_eq!(decoded.height(), height);
    }

    #[test]
    fn posterior_predictive_draws_stay_within_a_plausible_range_of_the_design() {
        let x = DMatrix::<f64>::from_element(8, 2, 1.0);
        let draws: Vec<DVector<f64>> = (0..20).map(|i| DVector::from_vec(vec![60.0 + i as f64 * 0.01, 0.0])).collect();
        let draw_refs: Vec<&DVector<f64>> = draws.iter().collect();
        let sigmas = vec![2.0; draws.len()];
        let predictive = simulate_posterior_predictive(&x, &draw_refs, &sigmas, 100);
        assert_eq!(predictive.len(), 20);
        assert!(predictive.iter().all(|v| (0.0..200.0).contains(v)));
    }

    #[test]
    fn posterior_predictive_check_renders_without_error() {
        let rows = sample_rows();
        let x = DMatrix::<f64>::from_element(rows.len(), 2, 1.0);
        let draws: Vec<DVector<f64>> = (0..10).map(|i| DVector::from_vec(vec![60.0 + i as f64, 0.0])).collect();
        let draw_refs: Vec<&DVector<f64>> = draws.iter().collect();
        let sigmas = vec![1.5; draws.len()];
        let png = posterior_predictive_check(&rows, &x, &draw_refs, &sigmas, 160, 120).unwrap();
        assert!(!png.is_empty());
    }

    #[test]
    fn effect_distribution_renders_two_panels_without_error() {
        let immediate = vec![0.5, 0.6, -0.1, 0.3, 0.2];
        let counterfactual = vec![-0.2, 0.1, 0.4, 0.0, 0.3];
        let immediate_effect = sample_effect(&immediate);
        let counterfactual_effect = sample_effect(&counterfactual);
        let png =
            effect_distribution(&immediate, &counterfactual, &immediate_effect, &counterfactual_effect, 320, 120)
                .unwrap();
        assert!(!png.is_empty());
    }

    #[test]
    fn mcmc_diagnostics_chart_renders_trace_and_threshold_lines() {
        let mut r_hat = HashMap::new();
        r_hat.insert("intercept".to_string(), 1.0);
        r_hat.insert("intervention".to_string(), 1.005);
        let mut ess = HashMap::new();
        ess.insert("intercept".to_string(), 1500.0);
        ess.insert("intervention".to_string(), 800.0);
        let traces = vec![vec![0.1, 0.12, 0.09, 0.11], vec![0.11, 0.1, 0.1, 0.12]];
        let png = mcmc_diagnostics_chart(&r_hat, &ess, &traces, 160, 180).unwrap();
        assert!(!png.is_empty());
    }
}
