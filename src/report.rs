use std::fmt::Write;

use crate::models::RunReport;

pub fn build_report(report: &RunReport) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Incident Group Membership Report");
    let _ = writeln!(output, "Recomputed at {}", report.run_at.to_rfc3339());

    for group in &report.groups {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", group.group_name);

        if let Some(comparator) = group.comparator {
            let _ = writeln!(
                output,
                "Rule: incident count {} {}",
                comparator.as_str(),
                group.incident_threshold
            );
        }
        if let Some(warning) = &group.config_warning {
            let _ = writeln!(output, "Misconfigured ({warning}); no student can match.");
        }

        if group.matches.is_empty() {
            let _ = writeln!(output, "No students currently match.");
        } else {
            for entry in &group.matches {
                let _ = writeln!(
                    output,
                    "- {} ({}): {} incidents",
                    entry.student_name, entry.student_id, entry.incident_count
                );
            }
        }
    }

    if !report.failures.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Not recomputed");
        for failure in &report.failures {
            let _ = writeln!(output, "- {}: {}", failure.group_name, failure.error);
        }
    }

    output
}
