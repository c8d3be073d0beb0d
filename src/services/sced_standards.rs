//! What Works Clearinghouse Single-Case Experimental Design rating.
//!
//! Ported arithmetic-for-arithmetic from
//! `original_source/apps/ml-service/app/utils/sced_standards.py`.

use crate::models::abab::WwcDetails;
use std::collections::HashMap;

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample standard deviation (ddof=1), matching `np.std(..., ddof=1)`.
fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() as f64 - 1.0);
    var.sqrt()
}

fn coefficient_of_variation(xs: &[f64]) -> f64 {
    let m = mean(xs);
    if m.abs() < f64::EPSILON {
        return 0.0;
    }
    sample_std(xs) / m.abs()
}

pub fn interpret_cohens_d(d: f64) -> &'static str {
    let abs_d = d.abs();
    if abs_d < 0.2 {
        "negligible"
    } else if abs_d < 0.5 {
        "small"
    } else if abs_d < 0.8 {
        "medium"
    } else {
        "large"
    }
}

fn determine_wwc_rating(criteria_met: u32, p_value: f64) -> &'static str {
    if criteria_met == 6 {
        "Meets Standards"
    } else if criteria_met >= 4 && p_value < 0.10 {
        "Meets Standards with Reservations"
    } else {
        "Does Not Meet Standards"
    }
}

fn check_immediate_change(phases: &HashMap<&str, &[f64]>) -> bool {
    let last_n = |xs: &[f64], n: usize| -> f64 {
        let take = n.min(xs.len());
        mean(&xs[xs.len() - take..])
    };
    let first_n = |xs: &[f64], n: usize| -> f64 {
        let take = n.min(xs.len());
        mean(&xs[..take])
    };

    let b1 = phases["baseline_1"];
    let a1 = phases["intervention_A_1"];
    let b2 = phases["baseline_2"];
    let a2 = phases["intervention_A_2"];

    let b1_last2 = last_n(b1, 2);
    let a1_first2 = first_n(a1, 2);
    let change_1 = (a1_first2 - b1_last2).abs();

    let b2_last2 = last_n(b2, 2);
    let a2_first2 = first_n(a2, 2);
    let change_2 = (a2_first2 - b2_last2).abs();

    let mut all_baseline: Vec<f64> = b1.to_vec();
    all_baseline.extend_from_slice(b2);
    let baseline_sd = sample_std(&all_baseline);
    let threshold = if baseline_sd > 0.0 { 0.5 * baseline_sd } else { 1.0 };

    change_1 > threshold || change_2 > threshold
}

fn check_similar_patterns(phases: &HashMap<&str, &[f64]>) -> (bool, bool) {
    let cv_b1 = coefficient_of_variation(phases["baseline_1"]);
    let cv_b2 = coefficient_of_variation(phases["baseline_2"]);
    let cv_a1 = coefficient_of_variation(phases["intervention_A_1"]);
    let cv_a2 = coefficient_of_variation(phases["intervention_A_2"]);

    let similar = |a: f64, b: f64| -> bool {
        let denom = a.max(b).max(0.01);
        if a.max(b) > 0.0 { (a - b).abs() / denom < 0.5 } else { true }
    };

    (similar(cv_b1, cv_b2), similar(cv_a1, cv_a2))
}

fn calculate_overlap(phases: &HashMap<&str, &[f64]>) -> f64 {
    let mut baseline: Vec<f64> = phases["baseline_1"].to_vec();
    baseline.extend_from_slice(phases["baseline_2"]);
    let mut intervention: Vec<f64> = phases["intervention_A_1"].to_vec();
    intervention.extend_from_slice(phases["intervention_A_2"]);

    if baseline.is_empty() || intervention.is_empty() {
        return 100.0;
    }

    let baseline_min = baseline.iter().cloned().fold(f64::INFINITY, f64::min);
    let baseline_max = baseline.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let intervention_min = intervention.iter().cloned().fold(f64::INFINITY, f64::min);
    let intervention_max = intervention.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let intervention_in_baseline =
        intervention.iter().filter(|&&x| x >= baseline_min && x <= baseline_max).count();
    let baseline_in_intervention =
        baseline.iter().filter(|&&x| x >= intervention_min && x <= intervention_max).count();

    let intervention_overlap_pct = 100.0 * intervention_in_baseline as f64 / intervention.len() as f64;
    let baseline_overlap_pct = 100.0 * baseline_in_intervention as f64 / baseline.len() as f64;

    intervention_overlap_pct.max(baseline_overlap_pct)
}

/// Rates an ABAB study against all six WWC SCED criteria.
///
/// `phases` must contain exactly the four canonical phase keys
/// (`baseline_1`, `intervention_A_1`, `baseline_2`, `intervention_A_2`).
pub fn check_sced_standards(
    phases: &HashMap<&str, &[f64]>,
    p_value: f64,
    cohens_d: f64,
) -> (bool, WwcDetails) {
    let min_observations_per_phase = phases.values().map(|v| v.len()).min().unwrap_or(0);

    let criterion_phase_pairs = true; // ABAB trivially satisfies phase_pairs >= 2
    let criterion_sufficient_data = min_observations_per_phase >= 5;
    let immediate_change_detected = check_immediate_change(phases);
    let criterion_immediate_change = immediate_change_detected;
    let (similar_baseline_phases, similar_intervention_phases) = check_similar_patterns(phases);
    let criterion_similar_patterns = similar_baseline_phases && similar_intervention_phases;
    let overlap_percentage = calculate_overlap(phases);
    let criterion_minimal_overlap = overlap_percentage <= 25.0;
    let criterion_statistically_significant = p_value < 0.05;

    let criteria_met = [
        criterion_phase_pairs,
        criterion_sufficient_data,
        criterion_immediate_change,
        criterion_similar_patterns,
        criterion_minimal_overlap,
        criterion_statistically_significant,
    ]
    .iter()
    .filter(|&&c| c)
    .count() as u32;

    let wwc_rating = determine_wwc_rating(criteria_met, p_value);
    let passes_wwc = wwc_rating == "Meets Standards";

    let details = WwcDetails {
        phase_pairs: 2,
        criterion_phase_pairs,
        min_observations_per_phase,
        criterion_sufficient_data,
        immediate_change_detected,
        criterion_immediate_change,
        similar_baseline_phases,
        similar_intervention_phases,
        criterion_similar_patterns,
        overlap_percentage,
        criterion_minimal_overlap,
        p_value,
        criterion_statistically_significant,
        cohens_d,
        effect_size_interpretation: interpret_cohens_d(cohens_d).to_string(),
        wwc_rating: wwc_rating.to_string(),
        passes_wwc,
    };

    (passes_wwc, details)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_effect_meets_standards() {
        let b1: Vec<f64> = vec![64.0, 65.0, 66.0, 64.0, 65.0, 66.0, 64.0, 65.0, 66.0, 64.0, 65.0, 66.0, 64.0, 65.0, 66.0];
        let a1: Vec<f64> = vec![79.0, 80.0, 81.0, 79.0, 80.0, 81.0, 79.0, 80.0, 81.0, 79.0, 80.0, 81.0, 79.0, 80.0, 81.0];
        let b2: Vec<f64> = vec![67.0, 68.0, 69.0, 67.0, 68.0, 69.0, 67.0, 68.0, 69.0, 67.0, 68.0, 69.0, 67.0, 68.0, 69.0];
        let a2: Vec<f64> = vec![81.0, 82.0, 83.0, 81.0, 82.0, 83.0, 81.0, 82.0, 83.0, 81.0, 82.0, 83.0, 81.0, 82.0, 83.0];

        let mut phases: HashMap<&str, &[f64]> = HashMap::new();
        phases.insert("baseline_1", &b1);
        phases.insert("intervention_A_1", &a1);
        phases.insert("baseline_2", &b2);
        phases.insert("intervention_A_2", &a2);

        let (passes, details) = check_sced_standards(&phases, 0.0001, 1.5);
        assert!(passes);
        assert_eq!(details.wwc_rating, "Meets Standards");
    }

    #[test]
    fn cohens_d_interpretation_bands() {
        assert_eq!(interpret_cohens_d(0.1), "negligible");
        assert_eq!(interpret_cohens_d(0.3), "small");
        assert_eq!(interpret_cohens_d(0.6), "medium");
        assert_eq!(interpret_cohens_d(1.2), "large");
    }
}
