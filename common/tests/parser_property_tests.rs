// Property-based tests for the pipeline spec parser: structural stability of
// parse/emit and validation totality

use common::models::{
    ArtifactSpec, JobSpec, PipelineSpec, StageSpec, TriggerKind, TriggerSpec,
};
use common::spec::{emit, execution_order, parse};
use proptest::prelude::*;
use std::collections::HashMap;

fn job_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{2,12}"
}

/// Generate well-formed specs: jobs may depend on any job generated before
/// them, so the graph is acyclic by construction
fn arb_spec() -> impl Strategy<Value = PipelineSpec> {
    (
        "[a-z][a-z0-9-]{2,16}",
        proptest::collection::vec(job_name(), 1..6),
        proptest::collection::hash_map("[A-Z_]{2,8}", "[a-z0-9]{1,12}", 0..4),
        any::<bool>(),
    )
        .prop_map(|(name, mut jobs, variables, with_cron)| {
            jobs.sort();
            jobs.dedup();
            let mut triggers = vec![TriggerSpec {
                kind: TriggerKind::Manual,
                schedule: None,
                enabled: true,
            }];
            if with_cron {
                triggers.push(TriggerSpec {
                    kind: TriggerKind::Cron,
                    schedule: Some("0 3 * * *".to_string()),
                    enabled: true,
                });
            }
            let specs: Vec<JobSpec> = jobs
                .iter()
                .enumerate()
                .map(|(i, job)| JobSpec {
                    name: job.clone(),
                    image: "alpine:3".to_string(),
                    command: vec!["sh".to_string(), "-c".to_string(), "true".to_string()],
                    env: HashMap::new(),
                    // Depend on the immediately preceding job: acyclic chain
                    needs: if i > 0 { vec![jobs[i - 1].clone()] } else { vec![] },
                    artifacts: if i == 0 {
                        Some(ArtifactSpec {
                            paths: vec!["out".to_string()],
                        })
                    } else {
                        None
                    },
                    timeout_seconds: None,
                })
                .collect();
            PipelineSpec {
                name,
                description: None,
                variables,
                triggers,
                stages: vec![StageSpec {
                    name: "main".to_string(),
                    jobs: specs,
                }],
            }
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // parse(emit(s)) == s for any well-formed spec
    #[test]
    fn prop_emit_parse_is_identity(spec in arb_spec()) {
        let yaml = emit(&spec).unwrap();
        let reparsed = parse(&yaml).unwrap();
        prop_assert_eq!(reparsed, spec);
    }

    // parse(emit(parse(y))) == parse(y): a second roundtrip is stable
    #[test]
    fn prop_double_roundtrip_stable(spec in arb_spec()) {
        let first = parse(&emit(&spec).unwrap()).unwrap();
        let second = parse(&emit(&first).unwrap()).unwrap();
        prop_assert_eq!(first, second);
    }

    // Execution order places every job after all of its dependencies
    #[test]
    fn prop_execution_order_respects_needs(spec in arb_spec()) {
        let levels = execution_order(&spec).unwrap();
        let position: HashMap<String, usize> = levels
            .iter()
            .enumerate()
            .flat_map(|(i, level)| level.iter().map(move |name| (name.clone(), i)))
            .collect();
        for stage in &spec.stages {
            for job in &stage.jobs {
                for dep in &job.needs {
                    prop_assert!(position[dep] < position[&job.name]);
                }
            }
        }
        // Every job is placed exactly once
        let placed: usize = levels.iter().map(|l| l.len()).sum();
        let total: usize = spec.stages.iter().map(|s| s.jobs.len()).sum();
        prop_assert_eq!(placed, total);
    }

    // The parser never panics on arbitrary input
    #[test]
    fn prop_parser_total_on_garbage(input in ".{0,512}") {
        let _ = parse(&input);
    }
}
