//! Tabular projection of the job records, and the operator summary.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::record::{Cluster, JobRecord, JobState};

const LABEL_WIDTH: usize = 12;
const NUMBER_WIDTH: usize = 9;

/// Job counts for one (cluster, queue) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub cluster: Cluster,
    pub queue: String,
    pub running: usize,
    pub queued: usize,
    pub other: usize,
}

/// Records sorted by (cluster, queue, state, job id) with per-queue counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTable {
    /// Sorted job records.
    pub jobs: Vec<JobRecord>,
    /// Counts, ordered by (cluster, queue).
    pub queues: Vec<QueueCounts>,
}

impl JobTable {
    /// Build the table from a record list.
    pub fn from_records(records: &[JobRecord]) -> Self {
        let mut jobs = records.to_vec();
        jobs.sort_by(|a, b| {
            (&a.cluster, &a.queue, a.state, job_number(a), &a.job_id)
                .cmp(&(&b.cluster, &b.queue, b.state, job_number(b), &b.job_id))
        });

        let mut queues: Vec<QueueCounts> = Vec::new();
        for job in &jobs {
            let same_queue = queues
                .last()
                .is_some_and(|last| last.cluster == job.cluster && last.queue == job.queue);
            if !same_queue {
                queues.push(QueueCounts {
                    cluster: job.cluster.clone(),
                    queue: job.queue.clone(),
                    running: 0,
                    queued: 0,
                    other: 0,
                });
            }
            if let Some(counts) = queues.last_mut() {
                match job.state {
                    JobState::Running => counts.running += 1,
                    JobState::Queued => counts.queued += 1,
                    JobState::Other => counts.other += 1,
                }
            }
        }

        Self { jobs, queues }
    }

    /// Counts for one (cluster, queue), if it has any jobs.
    pub fn counts(&self, cluster: &Cluster, queue: &str) -> Option<&QueueCounts> {
        self.queues
            .iter()
            .find(|c| &c.cluster == cluster && c.queue == queue)
    }

    /// Render the qstat-style summary: one row per queue, a subtotal per
    /// cluster with more than one queue, and grand totals.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        row(&mut out, "Cluster", "Queue Name", "Running", "Queued", "Run+Queue");
        row(
            &mut out,
            &"-".repeat(LABEL_WIDTH),
            &"-".repeat(LABEL_WIDTH),
            &"-".repeat(NUMBER_WIDTH),
            &"-".repeat(NUMBER_WIDTH),
            &"-".repeat(NUMBER_WIDTH),
        );

        let (mut total_r, mut total_q) = (0, 0);
        let mut idx = 0;
        while idx < self.queues.len() {
            let cluster = &self.queues[idx].cluster;
            let group: Vec<&QueueCounts> = self.queues[idx..]
                .iter()
                .take_while(|c| &c.cluster == cluster)
                .collect();
            idx += group.len();

            let (mut sub_r, mut sub_q) = (0, 0);
            for (n, counts) in group.iter().enumerate() {
                let label = if n == 0 { cluster.as_str() } else { "" };
                row(
                    &mut out,
                    label,
                    &truncate_label(&counts.queue),
                    &counts.running.to_string(),
                    &counts.queued.to_string(),
                    &(counts.running + counts.queued).to_string(),
                );
                sub_r += counts.running;
                sub_q += counts.queued;
            }
            if group.len() > 1 {
                row(
                    &mut out,
                    "",
                    &format!("{:>LABEL_WIDTH$}", "> Subtotals:"),
                    &sub_r.to_string(),
                    &sub_q.to_string(),
                    &(sub_r + sub_q).to_string(),
                );
            }
            out.push('\n');
            total_r += sub_r;
            total_q += sub_q;
        }

        row(
            &mut out,
            "Totals:",
            "",
            &total_r.to_string(),
            &total_q.to_string(),
            &(total_r + total_q).to_string(),
        );
        out
    }
}

fn job_number(job: &JobRecord) -> u64 {
    job.job_id.parse().unwrap_or(u64::MAX)
}

fn truncate_label(label: &str) -> String {
    if label.chars().count() > LABEL_WIDTH {
        let head: String = label.chars().take(LABEL_WIDTH - 3).collect();
        format!("{head}...")
    } else {
        label.to_string()
    }
}

fn row(out: &mut String, cluster: &str, queue: &str, running: &str, queued: &str, total: &str) {
    // Writing to a String cannot fail.
    let _ = writeln!(
        out,
        "{cluster:<LABEL_WIDTH$}  {queue:<LABEL_WIDTH$}  {running:>NUMBER_WIDTH$}  {queued:>NUMBER_WIDTH$}  {total:>NUMBER_WIDTH$}"
    );
}
