mod common;

use common::*;
use proptest::prelude::*;
use relayq_jobs::{
    Clock, EnqueueRequest, FakeDurableProvider, InMemoryProvider, JobError, JobPriority,
    ManualClock, Payload, ProviderConfig, QueueProvider, Simulation,
};
use std::sync::Arc;

fn in_process(config: ProviderConfig, clock: Arc<dyn Clock>) -> InMemoryProvider {
    InMemoryProvider::with_config(config).with_clock(clock)
}

fn test_double(config: ProviderConfig, clock: Arc<dyn Clock>) -> FakeDurableProvider {
    FakeDurableProvider::new(config)
        .with_clock(clock)
        .with_simulation(Simulation::instant())
}

macro_rules! provider_contract {
    ($module:ident, $factory:path) => {
        mod $module {
            use super::*;

            fn setup(config: ProviderConfig) -> (impl QueueProvider + 'static, ManualClock) {
                let clock = ManualClock::starting_now();
                ($factory(config, Arc::new(clock.clone())), clock)
            }

            macro_rules! scenario {
                ($name:ident, $scenario:ident) => {
                    scenario!($name, $scenario, config());
                };
                ($name:ident, $scenario:ident, $config:expr) => {
                    #[tokio::test]
                    async fn $name() {
                        let (provider, clock) = setup($config);
                        $scenario(&provider, &clock).await;
                    }
                };
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn test_at_most_one_owner() {
                let (provider, _clock) = setup(config());
                at_most_one_owner(Arc::new(provider)).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn test_one_job_per_idempotency_key() {
                let (provider, _clock) = setup(config());
                one_job_per_idempotency_key(Arc::new(provider)).await;
            }

            scenario!(test_idempotent_enqueue, idempotent_enqueue);
            scenario!(test_finished_key_creates_new_job, finished_key_creates_new_job);
            scenario!(test_backoff_gate_then_reuse, backoff_gate_then_reuse);
            scenario!(test_retry_waits_for_backoff, retry_waits_for_backoff);
            scenario!(test_priority_order, priority_order);
            scenario!(test_exhaustion_is_terminal, exhaustion_is_terminal);
            scenario!(test_unretryable_failures_are_terminal, unretryable_failures_are_terminal);
            scenario!(test_ownership_is_enforced, ownership_is_enforced);
            scenario!(test_lease_reclaimed_after_timeout, lease_reclaimed_after_timeout);
            scenario!(test_heartbeat_extends_lease, heartbeat_extends_lease);
            scenario!(test_expired_final_attempt_fails, expired_final_attempt_fails);
            scenario!(
                test_concurrency_cap_and_type_filter,
                concurrency_cap_and_type_filter,
                ProviderConfig { max_concurrent: 1, ..config() }
            );
            scenario!(
                test_queue_full_is_rate_limited,
                queue_full_is_rate_limited,
                ProviderConfig { max_queue_size: 2, ..config() }
            );
            scenario!(test_request_quota_is_enforced, request_quota_is_enforced);
            scenario!(
                test_global_quota_window_resets,
                global_quota_window_resets,
                ProviderConfig { rate_limit_per_minute: 3, ..config() }
            );
            scenario!(test_validation_rejects_before_state, validation_rejects_before_state);
            scenario!(test_clean_old_jobs_removes_terminal, clean_old_jobs_removes_terminal);
            scenario!(test_eviction_keeps_newer_backoff_gate, eviction_keeps_newer_backoff_gate);
            scenario!(test_request_jobs_are_indexed, request_jobs_are_indexed);
            scenario!(test_stats_are_consistent, stats_are_consistent);
        }
    };
}

provider_contract!(in_process_provider, in_process);
provider_contract!(test_double_provider, test_double);

#[derive(Debug, Clone)]
enum Op {
    Enqueue(JobPriority),
    Reserve,
    Complete,
    Fail,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop::sample::select(JobPriority::ALL.to_vec()).prop_map(Op::Enqueue),
        Just(Op::Reserve),
        Just(Op::Complete),
        Just(Op::Fail),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Status counts always add up to the number of accepted jobs.
    #[test]
    fn prop_stats_match_accepted_jobs(ops in prop::collection::vec(op(), 1..60)) {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let clock = ManualClock::starting_now();
            let provider = in_process(
                ProviderConfig { rate_limit_per_minute: 10_000, ..Default::default() },
                Arc::new(clock.clone()),
            );
            let mut accepted = 0u64;
            let mut held = Vec::new();

            for op in ops {
                match op {
                    Op::Enqueue(priority) => {
                        provider.enqueue(EnqueueRequest::new("preview").priority(priority)).await.unwrap();
                        accepted += 1;
                    }
                    Op::Reserve => {
                        if let Some(job) = provider.reserve("w1", None).await.unwrap() {
                            held.push(job.id);
                        }
                    }
                    Op::Complete => {
                        if let Some(id) = held.pop() {
                            provider.complete(&id, "w1", Payload::new()).await.unwrap();
                        }
                    }
                    Op::Fail => {
                        if let Some(id) = held.pop() {
                            provider.fail(&id, "w1", JobError::new("X", "boom")).await.unwrap();
                        }
                    }
                }
                clock.advance(std::time::Duration::from_millis(1));

                let stats = provider.get_stats().await.unwrap();
                prop_assert_eq!(stats.total, accepted);
                prop_assert_eq!(
                    stats.total,
                    stats.queued + stats.processing + stats.completed + stats.failed + stats.cancelled
                );
                prop_assert_eq!(stats.processing, held.len() as u64);
            }
            Ok(())
        })?;
    }

    /// Reservation order is priority first, then arrival.
    #[test]
    fn prop_reserve_follows_priority_then_arrival(
        priorities in prop::collection::vec(prop::sample::select(JobPriority::ALL.to_vec()), 1..20)
    ) {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let clock = ManualClock::starting_now();
            let provider = in_process(
                ProviderConfig { max_concurrent: 100, ..common::config() },
                Arc::new(clock.clone()),
            );
            let mut expected = Vec::new();
            for (index, priority) in priorities.iter().enumerate() {
                let job = provider.enqueue(EnqueueRequest::new("preview").priority(*priority)).await.unwrap();
                expected.push((priority.rank(), index, job.id));
                clock.advance(std::time::Duration::from_millis(1));
            }
            expected.sort();

            let mut actual = Vec::new();
            while let Some(job) = provider.reserve("w1", None).await.unwrap() {
                actual.push(job.id);
            }
            let expected: Vec<_> = expected.into_iter().map(|(_, _, id)| id).collect();
            prop_assert_eq!(actual, expected);
            Ok(())
        })?;
    }
}
