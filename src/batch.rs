//! Batch analysis of stored extraction cases
//!
//! Walks a directory of `*.json` case files (one analysis request, or an array
//! of them, per file) and analyzes every case in parallel.

use anyhow::{Context, Result};
use colored::Colorize;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

use crate::analysis::{self, AIAnalysisResult, AnalysisRequest, AnalysisType, ValidationResult};

const MAX_WORST_FIELDS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseSummary {
    pub source: String,
    pub test_result_id: String,
    pub accuracy: f64,
    pub confidence: f64,
    pub failed_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldStats {
    pub total: usize,
    pub matched: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub total_cases: usize,
    pub skipped_files: usize,
    pub mean_accuracy: f64,
    pub perfect_cases: usize,
    pub fields: HashMap<String, FieldStats>,
    pub worst_fields: Vec<String>,
    pub recommendations: Vec<String>,
    pub cases: Vec<CaseSummary>,
    pub total_time_ms: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaseFile {
    Many(Vec<AnalysisRequest>),
    One(AnalysisRequest),
}

/// Every `.json` file under `dir`, sorted for stable output
pub fn find_case_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|ext| ext.to_str()) == Some("json"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

fn load_cases(path: &Path) -> Result<Vec<AnalysisRequest>> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let parsed: CaseFile =
        serde_json::from_str(&content).with_context(|| format!("Invalid case file {:?}", path))?;
    Ok(match parsed {
        CaseFile::Many(cases) => cases,
        CaseFile::One(case) => vec![case],
    })
}

/// Analyze every case file found under `dir`.
pub fn run_batch(dir: &Path, analysis_type: AnalysisType) -> Result<BatchReport> {
    let start = Instant::now();
    let files = find_case_files(dir);
    tracing::info!("Found {} case files under {:?}", files.len(), dir);

    let loaded: Vec<(String, Result<Vec<AnalysisRequest>>)> = files
        .par_iter()
        .map(|path| {
            let source = path.strip_prefix(dir).unwrap_or(path).to_string_lossy().to_string();
            (source, load_cases(path))
        })
        .collect();

    let mut skipped_files = 0;
    let mut cases = Vec::new();
    for (source, result) in loaded {
        match result {
            Ok(requests) => cases.extend(requests.into_iter().map(|r| (source.clone(), r))),
            Err(e) => {
                tracing::warn!("Skipping {}: {:#}", source, e);
                skipped_files += 1;
            }
        }
    }

    let results: Vec<(String, AIAnalysisResult)> = cases
        .into_par_iter()
        .map(|(source, mut request)| {
            request.analysis_type = analysis_type;
            let result = analysis::analyze(&request);
            (source, result)
        })
        .collect();

    let mut report = summarize(&results);
    report.skipped_files = skipped_files;
    report.total_time_ms = start.elapsed().as_millis() as u64;
    Ok(report)
}

/// Aggregate individual analyses into a batch report.
pub fn summarize(results: &[(String, AIAnalysisResult)]) -> BatchReport {
    let mut fields: HashMap<String, FieldStats> = HashMap::new();
    let mut all_validations: Vec<ValidationResult> = Vec::new();
    let mut cases = Vec::with_capacity(results.len());

    for (source, result) in results {
        for v in &result.field_validations {
            let stats = fields.entry(v.field.clone()).or_default();
            stats.total += 1;
            if v.is_match {
                stats.matched += 1;
            }
        }
        all_validations.extend(result.field_validations.iter().cloned());

        cases.push(CaseSummary {
            source: source.clone(),
            test_result_id: result.test_result_id.clone(),
            accuracy: result.overall_accuracy,
            confidence: result.overall_confidence,
            failed_fields: result
                .field_validations
                .iter()
                .filter(|v| !v.is_match)
                .map(|v| v.field.clone())
                .collect(),
        });
    }

    for stats in fields.values_mut() {
        stats.accuracy = stats.matched as f64 / stats.total as f64;
    }

    let mut by_accuracy: Vec<(&String, &FieldStats)> = fields.iter().filter(|(_, s)| s.matched < s.total).collect();
    by_accuracy.sort_by(|a, b| a.1.accuracy.total_cmp(&b.1.accuracy).then_with(|| a.0.cmp(b.0)));
    let worst_fields = by_accuracy
        .into_iter()
        .take(MAX_WORST_FIELDS)
        .map(|(field, _)| field.clone())
        .collect();

    let mean_accuracy = if results.is_empty() {
        0.0
    } else {
        results.iter().map(|(_, r)| r.overall_accuracy).sum::<f64>() / results.len() as f64
    };

    BatchReport {
        total_cases: results.len(),
        skipped_files: 0,
        mean_accuracy,
        perfect_cases: results.iter().filter(|(_, r)| r.overall_accuracy >= 1.0).count(),
        recommendations: analysis::generate_recommendations(&all_validations),
        fields,
        worst_fields,
        cases,
        total_time_ms: 0,
    }
}

pub fn print_batch_summary(report: &BatchReport) {
    println!("\n{}", "═".repeat(60).bright_blue());
    println!("{}", "  BATCH EXTRACTION ANALYSIS".bright_blue().bold());
    println!("{}", "═".repeat(60).bright_blue());

    println!("\n{}", "Overall Results:".bold());
    println!("  Cases:           {}", report.total_cases.to_string().cyan());
    println!("  Perfect Cases:   {}", report.perfect_cases.to_string().green());
    println!("  Skipped Files:   {}", report.skipped_files.to_string().yellow());
    println!("  Mean Accuracy:   {:.1}%", report.mean_accuracy * 100.0);
    println!("  Total Time:      {} ms", report.total_time_ms.to_string().cyan());

    if !report.worst_fields.is_empty() {
        println!("\n{}", "Weakest Fields:".bold());
        for field in &report.worst_fields {
            if let Some(stats) = report.fields.get(field) {
                let acc = format!("{:.1}%", stats.accuracy * 100.0);
                let color_acc = if stats.accuracy >= 0.7 { acc.yellow() } else { acc.red() };
                println!("  {:24} {}/{} matched  ({})", field.cyan(), stats.matched, stats.total, color_acc);
            }
        }
    }

    if !report.recommendations.is_empty() {
        println!("\n{}", "Recommendations:".bold());
        for rec in &report.recommendations {
            println!("  {} {}", "•".yellow(), rec);
        }
    }

    println!("\n{}", "═".repeat(60).bright_blue());
}
