use crate::defs::{Classification, SENTINEL_CATEGORY};

/// Keyword table used when no semantic model is available.
pub const KEYWORDS: &[(&str, &[&str])] = &[
    ("sports", &[
        "football", "soccer", "basketball", "baseball", "nba", "nfl", "mlb", "nhl", "goal", "match",
        "game", "score", "team", "athlete", "tournament", "playoffs", "finals", "draft", "coach",
        "stadium", "sports",
    ]),
    ("politics", &[
        "election", "vote", "voting", "president", "presidency", "government", "policy", "bill",
        "congress", "senate", "house", "reform", "democrats", "republicans", "gop", "liberal",
        "conservative", "left-wing", "right-wing", "politics", "political", "campaign",
    ]),
    ("tech", &[
        "tech", "ai", "artificial intelligence", "startup", "startups", "software", "hardware",
        "robotics", "robot", "machine learning", "ml", "gadget", "app", "apps", "dev", "programming",
        "coding", "engineer", "data science", "big data", "cloud", "cybersecurity", "blockchain", "web3",
    ]),
    ("entertainment", &[
        "movie", "film", "cinema", "tv", "show", "series", "netflix", "hulu", "celebrity", "celeb",
        "drama", "comedy", "album", "music", "song", "pop", "rap", "hiphop", "hollywood", "streaming",
        "concert", "trailer", "entertainment",
    ]),
    ("finance", &[
        "finance", "financial", "stock", "stocks", "market", "investment", "investing", "funding",
        "fund", "economy", "economic", "bank", "banking", "interest rate", "inflation", "bitcoin",
        "crypto", "ethereum", "btc", "eth", "portfolio", "wall street", "nasdaq", "s&p",
    ]),
    ("health", &[
        "health", "healthy", "doctor", "nurse", "hospital", "clinic", "mental", "mental health",
        "therapy", "vaccine", "vaccination", "covid", "medicine", "medical", "wellness", "fitness",
        "exercise", "workout", "nutrition", "diet", "healthcare", "depression", "anxiety",
    ]),
    ("education", &[
        "school", "college", "university", "education", "student", "studying", "study", "exam",
        "professor", "lecture", "course", "homework", "assignment", "teacher", "class", "academic",
    ]),
    ("climate", &[
        "climate", "climate change", "global warming", "carbon", "carbon footprint", "sustainability",
        "environment", "environmental", "pollution", "emissions", "green energy", "eco", "renewable",
        "recycling", "solar", "wind power", "wildfire", "drought", "ice caps",
    ]),
    ("travel", &[
        "travel", "flight", "fly", "vacation", "trip", "journey", "airbnb", "hotel", "resort",
        "destination", "tour", "tourism", "passport", "airport", "luggage", "cruise", "beach",
        "backpacking", "road trip", "explore",
    ]),
    ("memes", &[
        "meme", "memes", "funny", "lol", "lmao", "rofl", "😂", "🤣", "joke", "shitpost", "dank",
        "relatable", "humor", "satire", "irony", "banter", "troll", "cringe", "memeing", "pov",
    ]),
    ("fashion", &[
        "fashion", "clothes", "outfit", "ootd", "style", "trendy", "model", "runway", "wardrobe",
        "designer", "aesthetic", "lookbook", "shopping", "haute couture", "accessories", "fit check",
        "vogue", "chic", "streetwear",
    ]),
];

/// Whole-word keyword matcher. Confidence is the share of matched words that
/// point at the winning category.
pub struct KeywordClassifier {
    threshold: f64,
}

impl KeywordClassifier {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn classify(&self, text: &str) -> Classification {
        let normalized = normalize(text);
        let padded = format!(" {} ", normalized);

        let mut hits: Vec<(&str, usize)> = KEYWORDS
            .iter()
            .map(|(category, words)| {
                let count = words
                    .iter()
                    .filter(|word| padded.contains(&format!(" {} ", word)) || (!word.is_ascii() && text.contains(*word)))
                    .count();
                (*category, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();

        let total: usize = hits.iter().map(|(_, count)| count).sum();
        if total == 0 {
            return sentinel();
        }

        // Highest count first; table order breaks ties.
        hits.sort_by(|a, b| b.1.cmp(&a.1));
        let best = hits[0].1 as f64 / total as f64;
        let categories: Vec<String> = hits
            .iter()
            .filter(|(_, count)| *count as f64 / total as f64 >= self.threshold)
            .map(|(category, _)| category.to_string())
            .collect();

        if categories.is_empty() {
            return sentinel();
        }

        Classification {
            categories,
            confidence: best,
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(0.5)
    }
}

fn sentinel() -> Classification {
    Classification {
        categories: vec![SENTINEL_CATEGORY.to_string()],
        confidence: 0.0,
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || "&-".contains(c) { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
