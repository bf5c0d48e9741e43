use crate::peer::types::IceServerConfig;
use rand::seq::IndexedRandom;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

const NAME_HEADS: &[&str] = &[
    "Ar", "Bel", "Cor", "Dra", "El", "Fen", "Gal", "Hal", "Ith", "Jor", "Kael", "Lor", "Mor",
    "Nym", "Or", "Per", "Quel", "Ryn", "Syl", "Thal", "Ul", "Val", "Wyn", "Yor", "Zan",
];

const NAME_TAILS: &[&str] = &[
    "adan", "wen", "ion", "is", "oth", "riel", "an", "dor", "ith", "mir", "a", "orn", "wyn",
];

const SURNAME_ROOTS: &[&str] = &[
    "Ash", "Black", "Briar", "Dawn", "Ember", "Frost", "Gold", "Iron", "Moon", "Oak", "Raven",
    "Silver", "Star", "Storm", "Thorn", "Wolf",
];

const SURNAME_ENDS: &[&str] = &[
    "bane", "blade", "brook", "fall", "forge", "heart", "hollow", "mantle", "shade", "song",
    "vale", "walker", "ward", "wood",
];

fn pick(words: &[&'static str]) -> &'static str {
    words.choose(&mut rand::rng()).copied().unwrap_or_default()
}

/// Random "First Last" fantasy-style display name for sessions that never
/// pick a nickname themselves.
pub fn random_nickname() -> String {
    format!(
        "{}{} {}{}",
        pick(NAME_HEADS),
        pick(NAME_TAILS),
        pick(SURNAME_ROOTS),
        pick(SURNAME_ENDS)
    )
}

// Adds the protocol scheme to an ICE server URL when it is missing
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    // URLs that already carry "turn:", "turns:" or "stun:" are returned as is
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
