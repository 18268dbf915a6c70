//! Canonical processing order for a raw job batch.
//!
//! Signals and updates are attempted before any job that advances the workflow's own control
//! flow (start, timer fire, activity/child resolution, cancellation, ...). Within each group the
//! issuance order recorded by the orchestration layer (`Job::sequence`) is kept. Ordering is a
//! pure function of the batch: no clock, no I/O, no hashing.

use crate::activation::{Job, JobKind};

/// Sort a batch into processing order.
pub fn order_jobs(mut jobs: Vec<Job>) -> Vec<Job> {
    // stable: equal (group, sequence) keys keep their input order
    jobs.sort_by_key(|job| (admission_group(&job.kind), job.sequence));
    jobs
}

fn admission_group(kind: &JobKind) -> u8 {
    if kind.is_signal_or_update() { 0 } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn start(seq: u64) -> Job {
        Job::new(
            seq,
            JobKind::StartWorkflow {
                workflow_type: "wf".into(),
                args: vec![],
            },
        )
    }

    fn signal(seq: u64, name: &str) -> Job {
        Job::new(seq, JobKind::signal(name, vec![json!(seq)]))
    }

    fn update(seq: u64, id: &str) -> Job {
        Job::new(seq, JobKind::update(id, "update", vec![]))
    }

    fn timer(seq: u64) -> Job {
        Job::new(seq, JobKind::FireTimer { seq: seq as u32 })
    }

    fn label(job: &Job) -> String {
        format!("{}#{}", crate::activation::kind_of(&job.kind), job.sequence)
    }

    #[test]
    fn signals_and_updates_precede_control_flow() {
        let batch = vec![start(0), update(1, "u1"), timer(2), signal(3, "s"), update(4, "u2")];
        let ordered: Vec<String> = order_jobs(batch).iter().map(label).collect();
        assert_eq!(
            ordered,
            vec!["Update#1", "Signal#3", "Update#4", "StartWorkflow#0", "FireTimer#2"]
        );
    }

    #[test]
    fn unsorted_batch_is_ordered_by_issuance() {
        let batch = vec![signal(5, "b"), timer(9), signal(2, "a"), start(1), timer(4)];
        let ordered: Vec<String> = order_jobs(batch).iter().map(label).collect();
        assert_eq!(
            ordered,
            vec!["Signal#2", "Signal#5", "StartWorkflow#1", "FireTimer#4", "FireTimer#9"]
        );
    }

    #[test]
    fn queries_stay_with_control_flow_jobs() {
        let query = Job::new(
            1,
            JobKind::Query {
                id: "q".into(),
                name: "get".into(),
                args: vec![],
            },
        );
        let ordered: Vec<String> = order_jobs(vec![query, signal(2, "s"), start(0)])
            .iter()
            .map(label)
            .collect();
        assert_eq!(ordered, vec!["Signal#2", "StartWorkflow#0", "Query#1"]);
    }

    fn arb_job() -> impl Strategy<Value = Job> {
        (0u8..4, 0u64..1_000).prop_map(|(k, seq)| match k {
            0 => signal(seq, "s"),
            1 => update(seq, &format!("u{seq}")),
            2 => timer(seq),
            _ => start(seq),
        })
    }

    proptest! {
        #[test]
        fn ordering_is_deterministic_and_grouped(jobs in prop::collection::vec(arb_job(), 0..40)) {
            let once = order_jobs(jobs.clone());
            let twice = order_jobs(jobs.clone());
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(once.len(), jobs.len());

            // every signal/update precedes every other job
            let first_other = once.iter().position(|j| !j.kind.is_signal_or_update()).unwrap_or(once.len());
            prop_assert!(once[first_other..].iter().all(|j| !j.kind.is_signal_or_update()));

            // issuance order within each group
            for group in [&once[..first_other], &once[first_other..]] {
                prop_assert!(group.windows(2).all(|w| w[0].sequence <= w[1].sequence));
            }
        }

        #[test]
        fn input_permutation_does_not_change_order(mut seqs in prop::collection::btree_set(0u64..500, 1..30)
            .prop_map(|s| s.into_iter().collect::<Vec<_>>()), rot in 0usize..30) {
            let jobs: Vec<Job> = seqs.iter().map(|&s| if s % 3 == 0 { timer(s) } else { signal(s, "s") }).collect();
            let reference = order_jobs(jobs.clone());
            let len = seqs.len();
            seqs.rotate_left(rot % len);
            let rotated: Vec<Job> = seqs.iter().map(|&s| if s % 3 == 0 { timer(s) } else { signal(s, "s") }).collect();
            prop_assert_eq!(order_jobs(rotated), reference);
        }
    }
}
