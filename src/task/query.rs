#![forbid(unsafe_code)]

use crate::error::GwtaskError;
use crate::task::model::{Task, TaskStatus};
use crate::task::storage::TaskStore;

/// Every task, highest priority first.
pub fn list_all(store: &TaskStore) -> anyhow::Result<Vec<Task>> {
    store.list_all()
}

pub fn filter_by_status(tasks: &[Task], status: &str) -> Result<Vec<Task>, GwtaskError> {
    let status: TaskStatus = status.parse()?;
    Ok(tasks.iter().filter(|t| t.status == status).cloned().collect())
}

#[must_use]
pub fn filter_by_min_priority(tasks: &[Task], min: u8) -> Vec<Task> {
    tasks.iter().filter(|t| t.priority >= min).cloned().collect()
}

/// Looks a task up by exact ID, then by a unique substring of its ID, name or
/// worktree, then by a unique fuzzy match on its name.
pub fn find_by_pattern(store: &TaskStore, pattern: &str) -> anyhow::Result<Task> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(GwtaskError::Validation("empty task pattern".to_owned()).into());
    }
    if store.exists(pattern) {
        return store.load(pattern);
    }
    Ok(find_in(&store.list_all()?, pattern)?)
}

pub fn find_in(tasks: &[Task], pattern: &str) -> Result<Task, GwtaskError> {
    if let Some(t) = tasks.iter().find(|t| t.id == pattern) {
        return Ok(t.clone());
    }

    let p = pattern.to_lowercase();
    let substring: Vec<&Task> = tasks
        .iter()
        .filter(|t| {
            t.id.contains(pattern)
                || t.name.to_lowercase().contains(&p)
                || t.worktree.to_lowercase().contains(&p)
        })
        .collect();
    match substring.as_slice() {
        [one] => return Ok((*one).clone()),
        [] => {}
        many => return Err(ambiguous(pattern, many)),
    }

    let fuzzy: Vec<&Task> = tasks
        .iter()
        .filter(|t| is_subsequence(&p, &t.name.to_lowercase()))
        .collect();
    match fuzzy.as_slice() {
        [one] => Ok((*one).clone()),
        [] => Err(GwtaskError::TaskNotFound(pattern.to_owned())),
        many => Err(ambiguous(pattern, many)),
    }
}

fn ambiguous(pattern: &str, matches: &[&Task]) -> GwtaskError {
    GwtaskError::AmbiguousTask {
        pattern: pattern.to_owned(),
        candidates: matches
            .iter()
            .map(|t| format!("{} ({})", t.id, t.display_name()))
            .collect(),
    }
}

fn is_subsequence(needle: &str, haystack: &str) -> bool {
    let mut chars = haystack.chars();
    needle
        .chars()
        .filter(|c| !c.is_whitespace())
        .all(|c| chars.any(|h| h == c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks() -> Vec<Task> {
        let mut a = Task::new("a1b2c3", "Add login form", "feature/login");
        a.priority = 80;
        let mut b = Task::new("d4e5f6", "Refactor database layer", "refactor/db");
        b.priority = 30;
        b.status = TaskStatus::Waiting;
        let c = Task::new("a1ffff", "Write release notes", "docs/release");
        vec![a, b, c]
    }

    #[test]
    fn filters_by_status_and_priority() {
        let all = tasks();
        let waiting = filter_by_status(&all, "Waiting").unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, "d4e5f6");
        assert!(filter_by_status(&all, "stuck").is_err());

        let high: Vec<String> = filter_by_min_priority(&all, 50).into_iter().map(|t| t.id).collect();
        assert_eq!(high, vec!["a1b2c3".to_owned(), "a1ffff".to_owned()]);
    }

    #[test]
    fn finds_by_id_substring_and_fuzzy_name() {
        let all = tasks();
        assert_eq!(find_in(&all, "a1b2c3").unwrap().id, "a1b2c3");
        assert_eq!(find_in(&all, "refactor/db").unwrap().id, "d4e5f6");
        assert_eq!(find_in(&all, "LOGIN").unwrap().id, "a1b2c3");
        assert_eq!(find_in(&all, "rdb lyr").unwrap().id, "d4e5f6");
    }

    #[test]
    fn reports_ambiguous_and_missing_patterns() {
        let all = tasks();
        match find_in(&all, "a1") {
            Err(GwtaskError::AmbiguousTask { candidates, .. }) => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguity, got {other:?}"),
        }
        assert!(matches!(
            find_in(&all, "zzz"),
            Err(GwtaskError::TaskNotFound(_))
        ));
    }

    #[test]
    fn finds_through_the_store() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::new(td.path().to_path_buf());
        for t in tasks() {
            store.save(&t).unwrap();
        }
        assert_eq!(find_by_pattern(&store, "a1ffff").unwrap().name, "Write release notes");
        assert_eq!(list_all(&store).unwrap()[0].id, "a1b2c3");
        let err = find_by_pattern(&store, "nothing-here").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GwtaskError>(),
            Some(GwtaskError::TaskNotFound(_))
        ));
    }
}
