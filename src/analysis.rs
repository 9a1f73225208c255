//! Extraction accuracy analysis
//!
//! Scores every expected field of a test result against what the AI pipeline
//! extracted, then aggregates the per-field validations into accuracy,
//! confidence, recommendations and insights.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Instant;
use uuid::Uuid;

use crate::similarity::{self, MATCH_THRESHOLD};

/// Field-type keywords reported in the pattern analysis, in output order
const PATTERN_KEYWORDS: [&str; 5] = ["date", "amount", "name", "address", "email"];

/// More than this share of failed fields triggers the failure-rate recommendation
const HIGH_FAILURE_RATE: f64 = 0.3;
const LOW_FIELD_SIMILARITY: f64 = 0.7;
const LOW_MEAN_CONFIDENCE: f64 = 0.8;
const LOW_FIELD_CONFIDENCE: f64 = 0.7;
const NEAR_MISS_SIMILARITY: f64 = 0.8;
const MAX_COMMON_ERRORS: usize = 5;

/// Comparison of one expected field against its extracted value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub field: String,
    pub expected: Value,
    pub actual: Value,
    #[serde(rename = "match")]
    pub is_match: bool,
    pub confidence: f64,
    pub similarity: f64,
    pub issues: Vec<String>,
}

impl ValidationResult {
    /// Score a single field. `match` and `confidence` are derived from the similarity.
    pub fn evaluate(field: &str, expected: &Value, actual: &Value) -> Self {
        let similarity = similarity::similarity(expected, actual);
        let issues = similarity::identify_issues(field, expected, actual, similarity);
        Self {
            field: field.to_string(),
            expected: expected.clone(),
            actual: actual.clone(),
            is_match: similarity > MATCH_THRESHOLD,
            confidence: (similarity * 1.1).min(1.0),
            similarity,
            issues,
        }
    }
}

/// How much work an analysis request asks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Basic,
    Detailed,
    #[default]
    Comprehensive,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Basic => "basic",
            AnalysisType::Detailed => "detailed",
            AnalysisType::Comprehensive => "comprehensive",
        }
    }
}

impl std::str::FromStr for AnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "basic" => Ok(AnalysisType::Basic),
            "detailed" => Ok(AnalysisType::Detailed),
            "comprehensive" => Ok(AnalysisType::Comprehensive),
            other => Err(format!("unknown analysis type '{}'", other)),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Input of one analysis run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub test_result_id: String,
    pub expected_extraction: Map<String, Value>,
    pub actual_extraction: Map<String, Value>,
    #[serde(default)]
    pub analysis_type: AnalysisType,
    #[serde(default = "default_true")]
    pub include_recommendations: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insights {
    pub common_errors: Vec<String>,
    pub pattern_analysis: Vec<String>,
    pub improvement_areas: Vec<String>,
}

impl Insights {
    pub fn is_empty(&self) -> bool {
        self.common_errors.is_empty() && self.pattern_analysis.is_empty() && self.improvement_areas.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub processing_time_ms: u64,
    pub fields_analyzed: usize,
    pub analysis_depth: AnalysisType,
}

/// Aggregate analysis of one test execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AIAnalysisResult {
    pub analysis_id: String,
    pub test_result_id: String,
    pub timestamp: DateTime<Utc>,
    pub analysis_type: AnalysisType,
    pub field_validations: Vec<ValidationResult>,
    pub overall_accuracy: f64,
    pub overall_confidence: f64,
    pub recommendations: Vec<String>,
    pub insights: Insights,
    pub performance: PerformanceMetrics,
}

/// Validate every expected field. A field missing from the actual extraction
/// is compared against `null`; fields only present in the actual extraction
/// are not scored.
pub fn validate_fields(
    expected: &Map<String, Value>,
    actual: &Map<String, Value>,
) -> Vec<ValidationResult> {
    expected
        .iter()
        .map(|(field, expected_value)| {
            let actual_value = actual.get(field).unwrap_or(&Value::Null);
            ValidationResult::evaluate(field, expected_value, actual_value)
        })
        .collect()
}

/// Share of matching fields; 0 for an empty list.
pub fn overall_accuracy(validations: &[ValidationResult]) -> f64 {
    if validations.is_empty() {
        return 0.0;
    }
    validations.iter().filter(|v| v.is_match).count() as f64 / validations.len() as f64
}

/// Mean confidence; 0 for an empty list.
pub fn overall_confidence(validations: &[ValidationResult]) -> f64 {
    if validations.is_empty() {
        return 0.0;
    }
    validations.iter().map(|v| v.confidence).sum::<f64>() / validations.len() as f64
}

/// Run a full analysis for one test result.
pub fn analyze(request: &AnalysisRequest) -> AIAnalysisResult {
    let start = Instant::now();

    let field_validations = validate_fields(&request.expected_extraction, &request.actual_extraction);
    let overall_accuracy = overall_accuracy(&field_validations);
    let overall_confidence = overall_confidence(&field_validations);

    let recommendations = if request.include_recommendations {
        generate_recommendations(&field_validations)
    } else {
        Vec::new()
    };

    let insights = match request.analysis_type {
        AnalysisType::Basic => Insights::default(),
        AnalysisType::Detailed | AnalysisType::Comprehensive => generate_insights(&field_validations),
    };

    tracing::debug!(
        "Analyzed {} fields for {}: accuracy={:.3} confidence={:.3}",
        field_validations.len(),
        request.test_result_id,
        overall_accuracy,
        overall_confidence
    );

    AIAnalysisResult {
        analysis_id: Uuid::new_v4().to_string(),
        test_result_id: request.test_result_id.clone(),
        timestamp: Utc::now(),
        analysis_type: request.analysis_type,
        performance: PerformanceMetrics {
            processing_time_ms: start.elapsed().as_millis() as u64,
            fields_analyzed: field_validations.len(),
            analysis_depth: request.analysis_type,
        },
        field_validations,
        overall_accuracy,
        overall_confidence,
        recommendations,
        insights,
    }
}

fn failed_field_contains(validations: &[ValidationResult], keywords: &[&str]) -> bool {
    validations.iter().filter(|v| !v.is_match).any(|v| {
        let field = v.field.to_lowercase();
        keywords.iter().any(|k| field.contains(k))
    })
}

/// Heuristic recommendations, at most one per rule, in a fixed order.
pub fn generate_recommendations(validations: &[ValidationResult]) -> Vec<String> {
    let mut recommendations = Vec::new();
    let total = validations.len();
    if total == 0 {
        return recommendations;
    }

    let failed = validations.iter().filter(|v| !v.is_match).count();
    if failed as f64 > HIGH_FAILURE_RATE * total as f64 {
        recommendations.push(format!(
            "High failure rate ({}/{} fields) - review the extraction prompt and email templates",
            failed, total
        ));
    }

    let low_similarity: Vec<&str> = validations
        .iter()
        .filter(|v| v.similarity < LOW_FIELD_SIMILARITY)
        .map(|v| v.field.as_str())
        .collect();
    if !low_similarity.is_empty() {
        recommendations.push(format!(
            "Fields with low similarity: {} - consider specialized extraction patterns for these fields",
            low_similarity.join(", ")
        ));
    }

    if failed_field_contains(validations, &["date"]) {
        recommendations.push(
            "Improve date parsing - normalize date formats (DD/MM/YYYY, ISO 8601) before comparison".to_string(),
        );
    }

    if failed_field_contains(validations, &["amount", "value", "rate"]) {
        recommendations.push(
            "Enhance numeric extraction patterns - handle currency symbols, thousands separators and percentages"
                .to_string(),
        );
    }

    if failed_field_contains(validations, &["address"]) {
        recommendations.push(
            "Improve address parsing - extract street, suburb, state and postcode as separate components"
                .to_string(),
        );
    }

    if overall_confidence(validations) < LOW_MEAN_CONFIDENCE {
        recommendations.push(
            "Overall confidence is low - consider retraining the extraction model or adjusting its parameters"
                .to_string(),
        );
    }

    recommendations
}

/// Derived insights: frequent issues, per-field-type success, improvement areas.
pub fn generate_insights(validations: &[ValidationResult]) -> Insights {
    Insights {
        common_errors: common_errors(validations),
        pattern_analysis: pattern_analysis(validations),
        improvement_areas: improvement_areas(validations),
    }
}

fn common_errors(validations: &[ValidationResult]) -> Vec<String> {
    // (first-seen order, count) so ties keep a stable order
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for issue in validations.iter().flat_map(|v| v.issues.iter()) {
        let next = counts.len();
        counts.entry(issue.as_str()).or_insert((next, 0)).1 += 1;
    }

    let mut sorted: Vec<_> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1 .1.cmp(&a.1 .1).then(a.1 .0.cmp(&b.1 .0)));

    sorted
        .into_iter()
        .take(MAX_COMMON_ERRORS)
        .map(|(issue, (_, count))| format!("{} ({} occurrences)", issue, count))
        .collect()
}

fn pattern_analysis(validations: &[ValidationResult]) -> Vec<String> {
    PATTERN_KEYWORDS
        .iter()
        .filter_map(|keyword| {
            let fields: Vec<_> = validations
                .iter()
                .filter(|v| v.field.to_lowercase().contains(keyword))
                .collect();
            if fields.is_empty() {
                return None;
            }
            let matched = fields.iter().filter(|v| v.is_match).count();
            Some(format!(
                "{} fields: {:.1}% success rate ({}/{})",
                keyword,
                matched as f64 / fields.len() as f64 * 100.0,
                matched,
                fields.len()
            ))
        })
        .collect()
}

fn improvement_areas(validations: &[ValidationResult]) -> Vec<String> {
    let mut areas = Vec::new();

    let low_confidence: Vec<&str> = validations
        .iter()
        .filter(|v| v.confidence < LOW_FIELD_CONFIDENCE)
        .map(|v| v.field.as_str())
        .collect();
    if !low_confidence.is_empty() {
        areas.push(format!("Low confidence fields: {}", low_confidence.join(", ")));
    }

    let near_misses: Vec<&str> = validations
        .iter()
        .filter(|v| v.similarity > NEAR_MISS_SIMILARITY && !v.is_match)
        .map(|v| v.field.as_str())
        .collect();
    if !near_misses.is_empty() {
        areas.push(format!(
            "Near-miss fields (similarity above {:.0}% but not matching): {} - consider tuning the match threshold",
            NEAR_MISS_SIMILARITY * 100.0,
            near_misses.join(", ")
        ));
    }

    areas
}

/// Print a coloured summary of one analysis
pub fn print_summary(result: &AIAnalysisResult) {
    println!("\n{}", "═".repeat(60).bright_blue());
    println!("{}", "  EXTRACTION ANALYSIS".bright_blue().bold());
    println!("{}", "═".repeat(60).bright_blue());

    let accuracy = result.overall_accuracy * 100.0;
    let accuracy_str = format!("{:.1}%", accuracy);
    let accuracy_color = if accuracy >= 90.0 {
        accuracy_str.bright_green()
    } else if accuracy >= 70.0 {
        accuracy_str.yellow()
    } else {
        accuracy_str.red()
    };

    println!("\n{}", "Overall Results:".bold());
    println!("  Test Result:     {}", result.test_result_id.cyan());
    println!("  Fields:          {}", result.field_validations.len().to_string().cyan());
    println!("  Accuracy:        {}", accuracy_color);
    println!("  Confidence:      {:.1}%", result.overall_confidence * 100.0);
    println!("  Analysis Time:   {} ms", result.performance.processing_time_ms.to_string().cyan());

    println!("\n{}", "Fields:".bold());
    for v in &result.field_validations {
        let status = if v.is_match { "✓".green() } else { "✗".red() };
        println!("  {} {:24} similarity {:.3}", status, v.field.cyan(), v.similarity);
        for issue in &v.issues {
            println!("        {} {}", "→".yellow(), issue);
        }
    }

    if !result.recommendations.is_empty() {
        println!("\n{}", "Recommendations:".bold());
        for rec in &result.recommendations {
            println!("  {} {}", "•".yellow(), rec);
        }
    }

    let insights = &result.insights;
    if !insights.is_empty() {
        println!("\n{}", "Insights:".bold());
        for line in insights
            .common_errors
            .iter()
            .chain(&insights.pattern_analysis)
            .chain(&insights.improvement_areas)
        {
            println!("  {} {}", "•".cyan(), line);
        }
    }

    println!("\n{}", "═".repeat(60).bright_blue());
}

/// Save a serializable report as pretty JSON
pub fn save_report<T: Serialize>(report: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json).context("Failed to write analysis report")?;
    println!("\nReport saved to: {}", path.display().to_string().cyan());
    Ok(())
}
