// File: testing-framework/src/utilities/summary.rs
//
// Boxed human summaries of scenario runs

use crate::scenarios::ScenarioResult;
use std::fmt::Write;

const WIDTH: usize = 62;

fn rule(out: &mut String, left: char, right: char) {
    let _ = writeln!(out, "{}{}{}", left, "═".repeat(WIDTH + 2), right);
}

fn row(out: &mut String, text: &str) {
    for line in textwrap::wrap(text, WIDTH) {
        let _ = writeln!(out, "║ {:<width$} ║", line, width = WIDTH);
    }
}

/// Summary of one run as a box of text
pub fn render_result_summary(result: &ScenarioResult) -> String {
    let mut out = String::new();
    rule(&mut out, '╔', '╗');
    row(&mut out, &format!("Case:      {}", result.case_name));
    row(&mut out, &format!("Status:    {}", result.status_word()));
    row(&mut out, &format!("Started:   {}", result.started_at.to_rfc3339()));
    row(&mut out, &format!("Duration:  {} ms", result.duration_ms));
    if let Some(outcome) = &result.matched_outcome {
        row(&mut out, &format!("Matched:   {}", outcome));
    }

    if let Some(cause) = &result.cause {
        rule(&mut out, '╠', '╣');
        row(&mut out, "FAILURE CAUSE:");
        row(&mut out, &cause.to_string());
    }

    rule(&mut out, '╠', '╣');
    row(&mut out, "STATES:");
    for visit in &result.states {
        row(&mut out, &format!("  {:>7} ms  {}", visit.at_ms, visit.state));
    }

    for (title, snapshots) in [
        ("AFTER CRASH:", Some(&result.before_restart)),
        ("AFTER RESTART:", Some(&result.after_restart)),
        ("AFTER SECOND RESTART:", result.after_second_restart.as_ref()),
    ] {
        let Some(snapshots) = snapshots else { continue };
        if snapshots.is_empty() {
            continue;
        }
        rule(&mut out, '╠', '╣');
        row(&mut out, title);
        for snapshot in snapshots {
            row(&mut out, &format!("  {}", snapshot));
        }
    }
    rule(&mut out, '╚', '╝');
    out
}

/// Print [`render_result_summary`] to stdout
pub fn print_result_summary(result: &ScenarioResult) {
    print!("{}", render_result_summary(result));
}

/// One line per case plus a total, for multi-case runs
pub fn render_run_summary(results: &[ScenarioResult]) -> String {
    let mut out = String::new();
    for result in results {
        let _ = writeln!(out, "{:<40} {}", result.case_name, result.status_word());
    }
    let passed = results.iter().filter(|r| r.passed()).count();
    let _ = writeln!(out, "{} of {} cases passed", passed, results.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::{FailureCause, ScenarioState, StateVisit, Verdict};

    fn result(verdict: Verdict, cause: Option<FailureCause>) -> ScenarioResult {
        ScenarioResult {
            case_name: "CrashCaseSend06".into(),
            verdict,
            cause,
            matched_outcome: None,
            before_restart: Vec::new(),
            after_restart: Vec::new(),
            after_second_restart: None,
            states: vec![
                StateVisit {
                    state: ScenarioState::Idle,
                    at_ms: 0,
                },
                StateVisit {
                    state: ScenarioState::Evaluated(verdict),
                    at_ms: 3000,
                },
            ],
            started_at: chrono::Utc::now(),
            duration_ms: 3000,
        }
    }

    #[test]
    fn test_summary_box() {
        let failed = result(
            Verdict::Fail,
            Some(FailureCause::NodeDidNotCrash {
                node: "N3".into(),
                grace_ms: 3000,
            }),
        );
        let text = render_result_summary(&failed);
        assert!(text.contains("FAILED"));
        assert!(text.contains("node N3 did not crash"));
        assert!(text.contains("Evaluated(Fail)"));
        // Every line has the same display width
        let widths: Vec<usize> = text.lines().map(|l| l.chars().count()).collect();
        assert!(widths.iter().all(|w| *w == WIDTH + 4));
    }

    #[test]
    fn test_run_summary_counts() {
        let text = render_run_summary(&[result(Verdict::Pass, None), result(Verdict::Fail, None)]);
        assert!(text.ends_with("1 of 2 cases passed\n"));
    }
}
