//! Generated run names: the fallback tier of the naming rule (explicit name
//! > workspace config name > generated adjective-noun name), grounded on the
//! teacher's `generate_session_name` random-suffix scheme but producing a
//! `swift-falcon`-style two-word name instead of a base-name+suffix.

use rand::Rng as _;

const ADJECTIVES: &[&str] = &[
    "swift", "quiet", "brave", "amber", "cobalt", "eager", "frosty", "golden", "hidden", "iron",
    "jovial", "keen", "lucid", "mellow", "nimble", "opal", "proud", "quick", "rustic", "sable",
    "tidy", "umber", "vivid", "wary", "zesty",
];

const NOUNS: &[&str] = &[
    "falcon", "badger", "cedar", "delta", "ember", "fjord", "glacier", "harbor", "ibis", "juniper",
    "kestrel", "lagoon", "meadow", "narwhal", "otter", "pebble", "quarry", "raven", "summit",
    "thicket", "urchin", "valley", "willow", "yucca", "zephyr",
];

/// Generate a two-word `adjective-noun` name (e.g. `swift-falcon`).
#[must_use]
pub fn generate_run_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    format!("{adjective}-{noun}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_name_has_two_hyphenated_words() {
        let name = generate_run_name();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(NOUNS.contains(&parts[1]));
    }

    #[test]
    fn names_vary_across_calls() {
        let names: std::collections::HashSet<String> = (0..20).map(|_| generate_run_name()).collect();
        assert!(names.len() > 1, "20 draws from a 625-combination space should not all collide");
    }
}
