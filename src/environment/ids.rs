//! Identifier Generation

use rand::seq::SliceRandom;
use uuid::Uuid;

/// Draws a random run id of `length` characters from `charset`.
///
/// Returns an empty string if `charset` is empty.
///
/// ```
/// use wesrunner::environment::ids::generate_run_id;
///
/// let id = generate_run_id("ABC", 8);
/// assert_eq!(id.len(), 8);
/// assert!(id.chars().all(|c| "ABC".contains(c)));
/// ```
pub fn generate_run_id(charset: &str, length: usize) -> String {
    let alphabet: Vec<char> = charset.chars().collect();
    let mut rng = rand::thread_rng();
    (0..length)
        .filter_map(|_| alphabet.choose(&mut rng).copied())
        .collect()
}

/// New random job id.
pub fn generate_task_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_RUN_ID_CHARSET;
    use std::collections::HashSet;

    #[test]
    fn test_run_id_uses_charset_and_length() {
        for _ in 0..50 {
            let id = generate_run_id(DEFAULT_RUN_ID_CHARSET, 6);
            assert_eq!(id.chars().count(), 6);
            assert!(id.chars().all(|c| DEFAULT_RUN_ID_CHARSET.contains(c)));
        }
    }

    #[test]
    fn test_multibyte_charset() {
        let id = generate_run_id("äöü", 4);
        assert_eq!(id.chars().count(), 4);
    }

    #[test]
    fn test_empty_charset_yields_empty_id() {
        assert!(generate_run_id("", 6).is_empty());
    }

    #[test]
    fn test_task_ids_are_distinct() {
        let ids: HashSet<_> = (0..1000).map(|_| generate_task_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
