//! Directive parsing and task-to-unit translation

use std::path::Path;

use ensembly_types::{
    StagingAction, StagingDirective, Task, UnitDescription, WorkflowError, WorkflowResult,
};

// ── Directive Grammar ────────────────────────────────────────────────

/// Parse one directive string into a source/target pair.
///
/// Grammar: `SOURCE` or `SOURCE > TARGET`, with whitespace around the `>`
/// trimmed. Without a target the base filename of SOURCE is used; an
/// explicit target is likewise reduced to its base filename, since targets
/// are paths inside the unit sandbox.
fn parse_directive(directive: &str) -> WorkflowResult<(String, String)> {
    let malformed = || WorkflowError::StagingSyntax(directive.to_string());

    let mut split = directive.split('>');
    let source = split.next().ok_or_else(malformed)?.trim();
    let target = split.next().map(str::trim);
    if split.next().is_some() || source.is_empty() {
        return Err(malformed());
    }

    let target = match target {
        Some(t) if !t.is_empty() => basename(t).ok_or_else(malformed)?,
        Some(_) => return Err(malformed()),
        None => basename(source).ok_or_else(malformed)?,
    };

    Ok((source.to_string(), target))
}

fn basename(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

fn resolve_list(
    directives: &[String],
    action: Option<StagingAction>,
    out: &mut Vec<StagingDirective>,
) -> WorkflowResult<()> {
    for directive in directives {
        let (source, target) = parse_directive(directive)?;
        out.push(StagingDirective {
            source,
            target,
            action,
        });
    }
    Ok(())
}

// ── Public Contract ──────────────────────────────────────────────────

/// Resolve a task's input staging: upload list first (no action), then the
/// copy list (COPY), then the link list (LINK), concatenated in that order.
pub fn resolve_input_directives(task: &Task) -> WorkflowResult<Vec<StagingDirective>> {
    let mut resolved = Vec::with_capacity(
        task.upload_input_data.len() + task.copy_input_data.len() + task.link_input_data.len(),
    );
    resolve_list(&task.upload_input_data, None, &mut resolved)?;
    resolve_list(&task.copy_input_data, Some(StagingAction::Copy), &mut resolved)?;
    resolve_list(&task.link_input_data, Some(StagingAction::Link), &mut resolved)?;
    Ok(resolved)
}

/// Resolve a task's output staging: the copy-output list (COPY), then the
/// download list (no action).
pub fn resolve_output_directives(task: &Task) -> WorkflowResult<Vec<StagingDirective>> {
    let mut resolved =
        Vec::with_capacity(task.copy_output_data.len() + task.download_output_data.len());
    resolve_list(&task.copy_output_data, Some(StagingAction::Copy), &mut resolved)?;
    resolve_list(&task.download_output_data, None, &mut resolved)?;
    Ok(resolved)
}

/// Translate a task into the unit description submitted to the backend.
///
/// The unit name encodes the task, stage and pipeline ids; the executable
/// collapses to a single string (head of the declared list). A task without
/// parent ids or without an executable is a usage error surfaced
/// immediately, never retried.
pub fn describe_unit(task: &Task) -> WorkflowResult<UnitDescription> {
    let (stage, pipeline) = match (&task.parent_stage, &task.parent_pipeline) {
        (Some(stage), Some(pipeline)) => (stage, pipeline),
        _ => {
            return Err(WorkflowError::TypeMismatch {
                expected: "dispatchable task with parent stage and pipeline".into(),
                actual: format!("unattached task '{}'", task.id),
            })
        }
    };
    let executable = task.executable.first().cloned().ok_or_else(|| {
        WorkflowError::TypeMismatch {
            expected: "task with an executable".into(),
            actual: format!("task '{}' with empty executable", task.id),
        }
    })?;

    Ok(UnitDescription {
        name: UnitDescription::compose_name(&task.id, stage, pipeline),
        pre_exec: task.pre_exec.clone(),
        executable,
        arguments: task.arguments.clone(),
        cores: task.cores,
        mpi: task.mpi,
        post_exec: task.post_exec.clone(),
        input_staging: resolve_input_directives(task)?,
        output_staging: resolve_output_directives(task)?,
    })
}
