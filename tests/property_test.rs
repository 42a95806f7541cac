mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{Scenario, Verdict};
use proptest::prelude::*;
use pxedeploy::plan::{Phase, Plan, StepConfig};

const TABLE: usize = 17;

/// Short enough to keep hanging attempts cheap.
const STEP_TIMEOUT: Duration = Duration::from_millis(30);

fn verdict_strategy() -> impl Strategy<Value = Verdict> {
    prop_oneof![
        4 => Just(Verdict::Ok),
        3 => Just(Verdict::Ko),
        1 => Just(Verdict::Both),
        1 => Just(Verdict::Break),
        1 => Just(Verdict::Silent),
        1 => Just(Verdict::Error),
        1 => Just(Verdict::Hang),
    ]
}

// One (variants, retries per variant) pair per phase.
fn phases_strategy() -> impl Strategy<Value = Vec<Vec<u32>>> {
    proptest::collection::vec(proptest::collection::vec(0..3u32, 1..3), 1..4)
}

fn host_index(hostname: &str) -> usize {
    hostname.trim_start_matches('n').parse().unwrap_or(0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_outcome_partitions_every_node(
        phases in phases_strategy(),
        node_count in 1..6usize,
        verdicts in proptest::collection::vec(verdict_strategy(), TABLE),
        nested in proptest::option::of(any::<bool>()),
    ) {
        let verdicts = Arc::new(verdicts);
        let mut scenario = Scenario::new();
        let mut table = Vec::new();
        let mut configs = Vec::new();
        let mut step_index = 0usize;

        for (p, variants) in phases.iter().enumerate() {
            let mut names = Vec::new();
            for (v, retries) in variants.iter().enumerate() {
                let name = format!("p{}v{}", p, v);
                let verdicts = Arc::clone(&verdicts);
                let salt = step_index;
                scenario = scenario.step(&name, move |host, attempt| {
                    let i = salt * 31 + host_index(host) * 7 + attempt as usize * 3;
                    verdicts[i % TABLE]
                });
                configs.push(
                    StepConfig::new(&name)
                        .with_retries(*retries)
                        .with_timeout(STEP_TIMEOUT),
                );
                names.push(name);
                step_index += 1;
            }
            table.push(Phase::alternatives(names));
        }

        let mut plan = Plan::new(table, configs).unwrap();
        // Some runs drive the whole table through a nested manager.
        if let Some(raisable) = nested {
            plan = Plan::new(
                vec![Phase::single("macro")],
                [StepConfig::new("macro").with_nested(plan).with_raisable(raisable)],
            )
            .unwrap();
        }
        let hostnames: Vec<String> = (0..node_count).map(|i| format!("n{}", i)).collect();
        let refs: Vec<&str> = hostnames.iter().map(String::as_str).collect();
        let arena = helpers::arena(&refs);
        let outcome = helpers::manager(plan, &arena, scenario.factory()).start().unwrap();

        prop_assert!(outcome.ok.is_disjoint(&outcome.ko));
        prop_assert!(outcome.ok.is_disjoint(&outcome.brk));
        prop_assert!(outcome.ko.is_disjoint(&outcome.brk));
        prop_assert_eq!(outcome.total(), node_count);

        let mut all = outcome.ok.clone();
        all.add(&outcome.ko);
        all.add(&outcome.brk);
        let mut seen = all.hostnames();
        seen.sort();
        let mut expected = hostnames.clone();
        expected.sort();
        prop_assert_eq!(seen, expected);

        for node in outcome.ko.iter() {
            prop_assert!(node.status().last_error.is_some());
        }
    }
}
