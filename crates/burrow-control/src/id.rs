//! Human-readable tunnel identifiers

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "cool", "eager", "fancy", "fast", "gentle", "giant", "happy",
    "honest", "jolly", "kind", "lazy", "lucky", "mighty", "misty", "nice", "proud", "quick",
    "quiet", "rare", "shy", "silly", "smart", "sour", "swift", "tall", "tidy", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "bear", "bird", "cat", "crab", "deer", "dog", "eagle", "fish", "fox", "frog",
    "goat", "hawk", "horse", "lamb", "lion", "mole", "moose", "mouse", "newt", "otter", "owl",
    "panda", "puma", "seal", "shrimp", "snail", "swan", "tiger", "wolf",
];

/// Generate a random identifier such as `swift-otter-42`.
///
/// The result always satisfies [`is_valid_identifier`](crate::policy::is_valid_identifier) but
/// is not guaranteed to be vacant; callers retry on collision.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quick");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("fox");
    let number: u8 = rng.gen_range(10..100);
    format!("{}-{}-{}", adjective, noun, number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::is_valid_identifier;

    #[test]
    fn test_generated_ids_are_valid() {
        for _ in 0..500 {
            let id = generate_id();
            assert!(is_valid_identifier(&id), "invalid id generated: {}", id);
            assert_eq!(id.split('-').count(), 3);
        }
    }

    #[test]
    fn test_generated_ids_vary() {
        let ids: std::collections::HashSet<_> = (0..50).map(|_| generate_id()).collect();
        assert!(ids.len() > 1);
    }
}
