//! Opaque task id generation.
//!
//! Ids are `<6-hex-prefix-of-a-uuidv7>-task-<slug>`: time-ordered (so they
//! sort and index well in SQLite), collision-resistant, and still readable
//! in logs. The uuidv7 timestamp bits make the hex prefix monotonic with
//! creation order, which is a nice property for humans scanning a log file
//! even though the store never relies on it for ordering (`createdAt` does
//! that explicitly).

fn slugify(input: &str) -> String {
    let lower = input.to_lowercase().replace('\'', "");
    let mut slug = String::with_capacity(lower.len());
    let mut last_was_sep = false;
    for ch in lower.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_sep = false;
        } else if !last_was_sep && !slug.is_empty() {
            slug.push('-');
            last_was_sep = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.chars().take(40).collect()
    }
}

/// Generates an opaque task id from a human description.
pub fn generate_task_id_from(description: &str) -> String {
    let hex = uuid::Uuid::now_v7().simple().to_string();
    let prefix = &hex[..6];
    format!("{prefix}-task-{}", slugify(description))
}

/// Generates an opaque task id with no description context (e.g. a
/// programmatically-created subtask placeholder).
pub fn generate_task_id() -> String {
    generate_task_id_from("task")
}

pub fn generate_iteration_id(task_id: &str, sequence: usize) -> String {
    format!("{task_id}-iter-{sequence}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugifies_punctuation_and_case() {
        assert_eq!(slugify("Fix the Bug!!"), "fix-the-bug");
        assert_eq!(slugify("it's broken"), "its-broken");
    }

    #[test]
    fn ids_are_unique_and_well_formed() {
        let a = generate_task_id_from("Implement OAuth login");
        let b = generate_task_id_from("Implement OAuth login");
        assert_ne!(a, b);
        assert!(a.contains("-task-implement-oauth-login"));
    }

    #[test]
    fn iteration_ids_are_namespaced_by_task() {
        assert_eq!(generate_iteration_id("abc-task-x", 3), "abc-task-x-iter-3");
    }
}
