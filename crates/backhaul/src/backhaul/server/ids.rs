use rand::{Rng, seq::IndexedRandom};

const ADJECTIVES: &[&str] = &[
    "afraid", "ancient", "angry", "average", "bad", "big", "bitter", "black", "blue", "brave",
    "breezy", "bright", "brown", "calm", "chatty", "chilly", "clever", "cold", "cool", "cuddly",
    "curly", "curvy", "dangerous", "dark", "dirty", "dry", "eager", "early", "easy", "empty",
    "famous", "fancy", "fast", "fat", "fluffy", "fresh", "friendly", "funny", "fuzzy", "gentle",
    "giant", "good", "great", "green", "grumpy", "happy", "heavy", "honest", "hot", "huge",
    "hungry", "itchy", "jolly", "kind", "lazy", "light", "little", "lovely", "loud", "lucky",
    "modern", "moody", "neat", "nervous", "new", "nice", "odd", "old", "orange", "peaceful",
    "pink", "plenty", "polite", "poor", "proud", "purple", "quick", "quiet", "rare", "red",
    "rich", "rotten", "rude", "salty", "selfish", "serious", "shaggy", "shaky", "sharp", "shiny",
    "short", "shy", "silent", "silly", "slimy", "slow", "small", "smart", "smooth", "soft",
    "sour", "spicy", "splendid", "spotty", "stale", "strange", "strong", "stupid", "sweet",
    "swift", "tall", "tame", "tasty", "tender", "thick", "thin", "tidy", "tiny", "tough",
    "tricky", "ugly", "unlucky", "warm", "weak", "wet", "white", "wicked", "wise", "witty",
    "yellow", "young",
];

const ANIMALS: &[&str] = &[
    "ape", "baboon", "badger", "bat", "bear", "bird", "bobcat", "bulldog", "bullfrog", "cat",
    "catfish", "cheetah", "chicken", "chipmunk", "cobra", "cougar", "cow", "crab", "deer", "dingo",
    "dodo", "dog", "dolphin", "donkey", "dragon", "dragonfly", "duck", "eagle", "earwig", "eel",
    "elephant", "emu", "falcon", "fireant", "firefox", "fish", "fly", "fox", "frog", "gecko",
    "goat", "goose", "grasshopper", "horse", "hound", "husky", "impala", "insect", "jellyfish",
    "kangaroo", "ladybug", "liger", "lion", "lionfish", "lizard", "mayfly", "mole", "monkey",
    "moose", "moth", "mouse", "mule", "newt", "octopus", "otter", "owl", "panda", "panther",
    "parrot", "penguin", "pig", "puma", "pug", "quail", "rabbit", "rat", "rattlesnake", "robin",
    "seahorse", "sheep", "shrimp", "skunk", "sloth", "snail", "snake", "squid", "starfish",
    "stingray", "swan", "termite", "tiger", "treefrog", "turkey", "turtle", "vampirebat",
    "walrus", "warthog", "wasp", "wolverine", "wombat", "yak", "zebra",
];

/// A random `adjective-animal-number` tunnel id, e.g. `calm-otter-42`.
pub fn random_id() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("fox");
    let n: u32 = rng.random_range(0..100);
    format!("{adjective}-{animal}-{n}")
}
