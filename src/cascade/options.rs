use crate::messages::LevelSettings;
use std::time::Duration;

/// Optional per-level client settings, indexed by retry level.
///
/// Entry `i` of each list applies to retry level `i + 1`. Levels without an
/// entry get no setting. Values are handed to the client with each publish
/// and are not enforced by the router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryLevelOptions {
    pub timeout_limit: Vec<Duration>,
    pub batch_limit: Vec<u32>,
}

impl RetryLevelOptions {
    pub fn new(timeout_limit: Vec<Duration>, batch_limit: Vec<u32>) -> Self {
        Self {
            timeout_limit,
            batch_limit,
        }
    }

    /// Settings for 1-based `level`
    pub fn for_level(&self, level: usize) -> LevelSettings {
        let Some(index) = level.checked_sub(1) else {
            return LevelSettings::default();
        };
        LevelSettings {
            timeout: self.timeout_limit.get(index).copied(),
            batch_limit: self.batch_limit.get(index).copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_level_indexes_from_one() {
        let options = RetryLevelOptions::new(
            vec![Duration::from_millis(100), Duration::from_millis(500)],
            vec![10],
        );
        let first = options.for_level(1);
        assert_eq!(first.timeout, Some(Duration::from_millis(100)));
        assert_eq!(first.batch_limit, Some(10));

        let second = options.for_level(2);
        assert_eq!(second.timeout, Some(Duration::from_millis(500)));
        assert_eq!(second.batch_limit, None);

        assert_eq!(options.for_level(0), LevelSettings::default());
        assert_eq!(options.for_level(9), LevelSettings::default());
    }
}
