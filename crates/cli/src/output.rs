//! Text rendering of command output.

use std::fmt::Write;

use greenops_core::ResultRecord;

use crate::client::SubmitReceipt;
use crate::reconciler::JobSnapshot;

pub fn receipt(r: &SubmitReceipt) -> String {
    let mut out = format!("Job {} {} ({} items)", r.job_id, r.status, r.total_items);
    if r.enqueue_failures > 0 {
        let _ = write!(out, ", {} could not be enqueued", r.enqueue_failures);
    }
    out
}

pub fn job(j: &JobSnapshot) -> String {
    let mut out = format!(
        "Job {}: {} ({}/{} done, {} failed)",
        j.job_id,
        j.status,
        j.processed_items(),
        j.total_items,
        j.failed_items
    );
    if !j.resource_types.is_empty() {
        let _ = write!(out, "\n  types: {}", j.resource_types.join(", "));
    }
    if let Some(at) = j.completed_at {
        let _ = write!(out, "\n  completed at {}", at.to_rfc3339());
    }
    out
}

/// One line per record.
pub fn results(records: &[ResultRecord]) -> String {
    if records.is_empty() {
        return "No results.".to_string();
    }
    let mut out = String::new();
    for r in records {
        let id = r.resource_id.as_deref().unwrap_or("-");
        let _ = write!(out, "#{} [{}] {}: {}", r.item_index, r.item_type, id, r.analysis.trim());
        if let Some(err) = &r.error {
            let _ = write!(out, " (degraded: {err})");
        }
        out.push('\n');
    }
    out.truncate(out.trim_end().len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_lines() {
        let records = vec![
            ResultRecord {
                item_index: 0,
                item_type: "ec2".into(),
                resource_id: Some("i-1".into()),
                analysis: "rightsize to t3.small\n".into(),
                ..Default::default()
            },
            ResultRecord {
                item_index: 2,
                item_type: "s3".into(),
                error: Some("timeout".into()),
                ..Default::default()
            },
        ];
        assert_eq!(
            results(&records),
            "#0 [ec2] i-1: rightsize to t3.small\n#2 [s3] -:  (degraded: timeout)"
        );
        assert_eq!(results(&[]), "No results.");
    }
}
