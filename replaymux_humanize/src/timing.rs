//! Shared human-ish timing draws for clicks and keyboard fallbacks.

use std::time::Duration;

use rand::Rng;

/// How long the primary button stays down for a deliberate click.
pub fn click_hold() -> Duration {
    Duration::from_millis(rand::rng().random_range(80..=150))
}

/// Gap between Tab keyDown and keyUp.
pub fn tab_key_gap() -> Duration {
    Duration::from_millis(rand::rng().random_range(30..=60))
}

/// Settle time between focusing an element and activating it.
pub fn tab_to_space() -> Duration {
    Duration::from_millis(rand::rng().random_range(80..=120))
}

/// How long to wait for the page to react to a Space activation.
pub fn space_result_wait() -> Duration {
    Duration::from_millis(rand::rng().random_range(800..=1200))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_stay_in_range() {
        for _ in 0..50 {
            assert!((80..=150).contains(&(click_hold().as_millis() as u64)));
            assert!((30..=60).contains(&(tab_key_gap().as_millis() as u64)));
            assert!((80..=120).contains(&(tab_to_space().as_millis() as u64)));
            assert!((800..=1200).contains(&(space_result_wait().as_millis() as u64)));
        }
    }
}
