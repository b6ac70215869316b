// Pipeline YAML parser: text in, canonical typed spec out.
//
// Re-emitting a parsed spec is not byte-stable against the original document,
// but re-parsing the emitted form yields a structurally equal spec.

use crate::errors::SpecError;
use crate::models::{
    Pipeline, PipelineSpec, PipelineStatus, TriggerKind, TriggerSpec,
};
use crate::schedule;
use crate::webhook;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Parse and validate a pipeline YAML document
pub fn parse(yaml: &str) -> Result<PipelineSpec, SpecError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml).map_err(|e| SpecError::InvalidYaml(e.to_string()))?;

    if !value.is_mapping() {
        return Err(SpecError::InvalidYaml("document is not a map".to_string()));
    }
    if value.get("name").is_none() {
        return Err(SpecError::MissingField("name".to_string()));
    }

    // Trigger types get a targeted pre-check so the error names the offending
    // type instead of a serde variant message
    if let Some(triggers) = value.get("triggers").and_then(|t| t.as_sequence()) {
        for trigger in triggers {
            let kind = trigger
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| SpecError::MissingField("triggers[].type".to_string()))?;
            if !matches!(kind, "manual" | "webhook" | "cron") {
                return Err(SpecError::UnknownTriggerType(kind.to_string()));
            }
        }
    }

    let spec: PipelineSpec =
        serde_yaml::from_value(value).map_err(|e| SpecError::InvalidYaml(e.to_string()))?;

    validate(&spec)?;
    Ok(spec)
}

/// Re-serialize a canonical spec to YAML
pub fn emit(spec: &PipelineSpec) -> Result<String, SpecError> {
    serde_yaml::to_string(spec).map_err(|e| SpecError::InvalidYaml(e.to_string()))
}

fn validate(spec: &PipelineSpec) -> Result<(), SpecError> {
    if spec.name.trim().is_empty() {
        return Err(SpecError::MissingField("name".to_string()));
    }
    if spec.stages.is_empty() {
        return Err(SpecError::MissingField("stages".to_string()));
    }

    for trigger in &spec.triggers {
        validate_trigger(trigger)?;
    }

    let mut job_names = HashSet::new();
    for stage in &spec.stages {
        for job in &stage.jobs {
            if !job_names.insert(job.name.clone()) {
                return Err(SpecError::DuplicateJobName(job.name.clone()));
            }
            if job.image.trim().is_empty() {
                return Err(SpecError::IncompleteJob {
                    stage: stage.name.clone(),
                    job: job.name.clone(),
                    field: "image".to_string(),
                });
            }
            if job.command.is_empty() {
                return Err(SpecError::IncompleteJob {
                    stage: stage.name.clone(),
                    job: job.name.clone(),
                    field: "command".to_string(),
                });
            }
        }
    }

    for stage in &spec.stages {
        for job in &stage.jobs {
            for dep in &job.needs {
                if !job_names.contains(dep) {
                    return Err(SpecError::UnknownDependency {
                        job: job.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
    }

    // Cycle detection doubles as the ordering pass
    execution_order(spec)?;
    Ok(())
}

fn validate_trigger(trigger: &TriggerSpec) -> Result<(), SpecError> {
    match trigger.kind {
        TriggerKind::Cron => {
            let expression = trigger
                .schedule
                .as_deref()
                .ok_or(SpecError::CronWithoutSchedule)?;
            schedule::validate_cron(expression).map_err(|e| match e {
                crate::errors::ScheduleError::InvalidCronExpression { expression, reason } => {
                    SpecError::InvalidCronExpression { expression, reason }
                }
                other => SpecError::InvalidFieldValue {
                    field: "triggers[].schedule".to_string(),
                    reason: other.to_string(),
                },
            })
        }
        TriggerKind::Manual | TriggerKind::Webhook => Ok(()),
    }
}

/// Topological execution order over declared `needs`, as concurrency levels:
/// every job in level N depends only on jobs in levels < N. Stages group jobs
/// for presentation; `needs` edges are the sole ordering source.
pub fn execution_order(spec: &PipelineSpec) -> Result<Vec<Vec<String>>, SpecError> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for stage in &spec.stages {
        for job in &stage.jobs {
            indegree.entry(job.name.as_str()).or_insert(0);
            for dep in &job.needs {
                *indegree.entry(job.name.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(job.name.as_str());
            }
        }
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(name, _)| *name)
        .collect();
    ready.sort_unstable();

    let mut levels = Vec::new();
    let mut placed = 0usize;
    while !ready.is_empty() {
        let level: Vec<String> = ready.iter().map(|n| n.to_string()).collect();
        placed += level.len();
        let mut next: Vec<&str> = Vec::new();
        for name in ready.drain(..) {
            if let Some(children) = dependents.get(name) {
                for child in children {
                    let d = indegree
                        .get_mut(child)
                        .unwrap_or_else(|| unreachable!("every job was seeded"));
                    *d -= 1;
                    if *d == 0 {
                        next.push(child);
                    }
                }
            }
        }
        next.sort_unstable();
        ready = next;
        levels.push(level);
    }

    if placed != indegree.len() {
        let stuck = indegree
            .iter()
            .find(|(_, d)| **d > 0)
            .map(|(name, _)| name.to_string())
            .unwrap_or_default();
        return Err(SpecError::DependencyCycle(stuck));
    }

    Ok(levels)
}

/// Parse YAML into a brand new Pipeline with a fresh webhook token
pub fn new_pipeline(yaml: &str) -> Result<Pipeline, SpecError> {
    let spec = parse(yaml)?;
    let now = Utc::now();
    Ok(Pipeline {
        id: Uuid::new_v4(),
        name: spec.name.clone(),
        description: spec.description.clone(),
        yaml: yaml.to_string(),
        spec,
        status: PipelineStatus {
            webhook_token: webhook::generate_webhook_token(),
            ..Default::default()
        },
        created_at: now,
        updated_at: now,
    })
}

/// Re-parse updated YAML onto an existing pipeline, preserving id, counters
/// and webhook token
pub fn update_pipeline(existing: &Pipeline, yaml: &str) -> Result<Pipeline, SpecError> {
    let spec = parse(yaml)?;
    let mut updated = existing.clone();
    updated.name = spec.name.clone();
    updated.description = spec.description.clone();
    updated.yaml = yaml.to_string();
    updated.spec = spec;
    updated.updated_at = Utc::now();
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
name: build-images
description: build and push
variables:
  REGISTRY: registry.local
triggers:
  - type: manual
  - type: cron
    schedule: "0 2 * * *"
stages:
  - name: build
    jobs:
      - name: compile
        image: rust:1.84
        command: ["cargo", "build", "--release"]
      - name: unit
        image: rust:1.84
        command: ["cargo", "test"]
  - name: ship
    jobs:
      - name: push
        image: docker:24
        command: ["docker", "push", "${REGISTRY}/app"]
        needs: [compile, unit]
"#;

    #[test]
    fn test_parse_basic_pipeline() {
        let spec = parse(BASIC).unwrap();
        assert_eq!(spec.name, "build-images");
        assert_eq!(spec.stages.len(), 2);
        assert_eq!(spec.variables["REGISTRY"], "registry.local");
        assert_eq!(spec.triggers.len(), 2);
    }

    #[test]
    fn test_reject_non_map_document() {
        assert!(matches!(
            parse("- just\n- a\n- list\n").unwrap_err(),
            SpecError::InvalidYaml(_)
        ));
    }

    #[test]
    fn test_reject_missing_name() {
        let err = parse("stages: []").unwrap_err();
        assert!(matches!(err, SpecError::MissingField(f) if f == "name"));
    }

    #[test]
    fn test_reject_unknown_trigger_type() {
        let yaml = "name: x\ntriggers:\n  - type: poll\nstages:\n  - name: s\n    jobs:\n      - name: j\n        image: alpine\n        command: [true]\n";
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, SpecError::UnknownTriggerType(t) if t == "poll"));
    }

    #[test]
    fn test_reject_cron_without_schedule() {
        let yaml = "name: x\ntriggers:\n  - type: cron\nstages:\n  - name: s\n    jobs:\n      - name: j\n        image: alpine\n        command: [true]\n";
        assert!(matches!(
            parse(yaml).unwrap_err(),
            SpecError::CronWithoutSchedule
        ));
    }

    #[test]
    fn test_reject_invalid_cron_expression() {
        let yaml = "name: x\ntriggers:\n  - type: cron\n    schedule: \"banana\"\nstages:\n  - name: s\n    jobs:\n      - name: j\n        image: alpine\n        command: [true]\n";
        assert!(matches!(
            parse(yaml).unwrap_err(),
            SpecError::InvalidCronExpression { .. }
        ));
    }

    #[test]
    fn test_reject_job_without_image() {
        let yaml = "name: x\nstages:\n  - name: s\n    jobs:\n      - name: j\n        image: \"\"\n        command: [true]\n";
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, SpecError::IncompleteJob { field, .. } if field == "image"));
    }

    #[test]
    fn test_reject_unknown_dependency() {
        let yaml = "name: x\nstages:\n  - name: s\n    jobs:\n      - name: j\n        image: alpine\n        command: [true]\n        needs: [ghost]\n";
        let err = parse(yaml).unwrap_err();
        assert!(
            matches!(err, SpecError::UnknownDependency { dependency, .. } if dependency == "ghost")
        );
    }

    #[test]
    fn test_reject_dependency_cycle() {
        let yaml = "name: x\nstages:\n  - name: s\n    jobs:\n      - name: a\n        image: alpine\n        command: [true]\n        needs: [b]\n      - name: b\n        image: alpine\n        command: [true]\n        needs: [a]\n";
        assert!(matches!(
            parse(yaml).unwrap_err(),
            SpecError::DependencyCycle(_)
        ));
    }

    #[test]
    fn test_execution_order_levels() {
        let spec = parse(BASIC).unwrap();
        let levels = execution_order(&spec).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], vec!["compile".to_string(), "unit".to_string()]);
        assert_eq!(levels[1], vec!["push".to_string()]);
    }

    #[test]
    fn test_emit_reparse_structural_stability() {
        let first = parse(BASIC).unwrap();
        let emitted = emit(&first).unwrap();
        let second = parse(&emitted).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_new_pipeline_gets_token() {
        let pipeline = new_pipeline(BASIC).unwrap();
        assert!(pipeline.status.webhook_token.len() >= 32);
        assert_eq!(pipeline.status.total_runs, 0);
    }

    #[test]
    fn test_update_preserves_identity_and_counters() {
        let mut pipeline = new_pipeline(BASIC).unwrap();
        pipeline.status.total_runs = 7;
        let updated = update_pipeline(&pipeline, BASIC).unwrap();
        assert_eq!(updated.id, pipeline.id);
        assert_eq!(updated.status.total_runs, 7);
        assert_eq!(updated.status.webhook_token, pipeline.status.webhook_token);
    }
}
