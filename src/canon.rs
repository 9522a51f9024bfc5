use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCORE_CUTOFF: u32 = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketMatch {
    pub canonical: String,
    pub score: u32,
}

#[derive(Debug)]
pub struct MarketRegistry {
    markets: Vec<Market>,
    candidates: Vec<(String, usize)>,
}

impl MarketRegistry {
    pub fn new(markets: Vec<Market>) -> Self {
        let mut candidates = Vec::new();
        for (index, market) in markets.iter().enumerate() {
            candidates.push((market.name.to_lowercase(), index));
            for alias in &market.aliases {
                candidates.push((alias.to_lowercase(), index));
            }
        }

        Self {
            markets,
            candidates,
        }
    }

    pub fn markets(&self) -> &[Market] {
        &self.markets
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    pub fn canonicalize(&self, raw: &str, score_cutoff: u32) -> Option<MarketMatch> {
        let needle = raw.trim().to_lowercase();
        if needle.is_empty() || self.candidates.is_empty() {
            return None;
        }

        let needle_chars: Vec<char> = needle.chars().collect();
        let mut best: Option<MarketMatch> = None;

        for (candidate, index) in &self.candidates {
            let candidate_chars: Vec<char> = candidate.chars().collect();
            let floor = best
                .as_ref()
                .map(|m| m.score)
                .unwrap_or(score_cutoff.saturating_sub(1));

            if ratio_upper_bound(needle_chars.len(), candidate_chars.len()) <= floor {
                continue;
            }

            let score = indel_ratio(&needle_chars, &candidate_chars);
            if score >= score_cutoff && best.as_ref().is_none_or(|m| score > m.score) {
                best = Some(MarketMatch {
                    canonical: self.markets[*index].name.clone(),
                    score,
                });
            }
        }

        best
    }
}

pub fn default_markets() -> Vec<Market> {
    fn market(name: &str, state: &str, aliases: &[&str]) -> Market {
        Market {
            name: name.to_string(),
            state: state.to_string(),
            aliases: aliases.iter().map(|alias| alias.to_string()).collect(),
        }
    }

    vec![
        market("Dodge City", "KS", &["dodge", "dodge city"]),
        market("Garden City", "KS", &["garden", "garden city"]),
        market("Pratt", "KS", &["pratt"]),
        market("Amarillo", "TX", &["amarillo"]),
        market("Dalhart", "TX", &["dalhart"]),
    ]
}

pub fn load_registry(connection: &Connection) -> Result<MarketRegistry> {
    let mut statement = connection
        .prepare("SELECT name, state, aliases FROM markets ORDER BY name")
        .context("failed to prepare markets query")?;

    let mut rows = statement.query([])?;
    let mut markets = Vec::new();

    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let state: String = row.get(1)?;
        let aliases_raw: String = row.get(2)?;
        let aliases: Vec<String> = serde_json::from_str(&aliases_raw)
            .with_context(|| format!("invalid alias list stored for market {name}"))?;

        markets.push(Market {
            name,
            state,
            aliases,
        });
    }

    Ok(MarketRegistry::new(markets))
}

pub fn store_markets(connection: &mut Connection, markets: &[Market]) -> Result<usize> {
    let tx = connection.transaction()?;

    {
        let mut statement = tx.prepare(
            "
            INSERT INTO markets(name, state, aliases)
            VALUES(?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
              state=excluded.state,
              aliases=excluded.aliases
            ",
        )?;

        for market in markets {
            let aliases = serde_json::to_string(&market.aliases)
                .with_context(|| format!("failed to serialize aliases for {}", market.name))?;
            statement.execute(params![&market.name, &market.state, aliases])?;
        }
    }

    tx.commit()?;
    Ok(markets.len())
}

fn ratio_upper_bound(left_len: usize, right_len: usize) -> u32 {
    let total = left_len + right_len;
    if total == 0 {
        return 0;
    }

    let shared = 2 * left_len.min(right_len);
    ((shared as f64 / total as f64) * 100.0).round() as u32
}

fn indel_ratio(left: &[char], right: &[char]) -> u32 {
    let total = left.len() + right.len();
    if total == 0 {
        return 100;
    }

    let shared = 2 * longest_common_subsequence(left, right);
    ((shared as f64 / total as f64) * 100.0).round() as u32
}

fn longest_common_subsequence(left: &[char], right: &[char]) -> usize {
    if left.is_empty() || right.is_empty() {
        return 0;
    }

    let mut prev = vec![0_usize; right.len() + 1];
    let mut curr = vec![0_usize; right.len() + 1];

    for left_ch in left {
        for (j, right_ch) in right.iter().enumerate() {
            curr[j + 1] = if left_ch == right_ch {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[right.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(value: &str) -> Vec<char> {
        value.chars().collect()
    }

    #[test]
    fn indel_ratio_on_identical_strings_is_100() {
        assert_eq!(indel_ratio(&chars("pratt"), &chars("pratt")), 100);
        assert_eq!(indel_ratio(&chars(""), &chars("")), 100);
    }

    #[test]
    fn indel_ratio_on_disjoint_strings_is_0() {
        assert_eq!(indel_ratio(&chars("abc"), &chars("xyz")), 0);
    }

    #[test]
    fn indel_ratio_counts_insertions_and_deletions() {
        // "dodge" vs "dodge city": lcs 5, ratio 2*5/15
        assert_eq!(indel_ratio(&chars("dodge"), &chars("dodge city")), 67);
        // one dropped character
        assert_eq!(indel_ratio(&chars("amarilo"), &chars("amarillo")), 93);
    }

    #[test]
    fn canonicalize_accepts_close_typo_above_cutoff() {
        let registry = MarketRegistry::new(default_markets());
        let matched = registry
            .canonicalize("Amarilo", DEFAULT_SCORE_CUTOFF)
            .unwrap();
        assert_eq!(matched.canonical, "Amarillo");
        assert!(matched.score >= DEFAULT_SCORE_CUTOFF);
    }

    #[test]
    fn canonicalize_resolves_alias_to_canonical_name() {
        let registry = MarketRegistry::new(default_markets());
        let matched = registry.canonicalize("garden", DEFAULT_SCORE_CUTOFF).unwrap();
        assert_eq!(matched.canonical, "Garden City");
        assert_eq!(matched.score, 100);
    }

    #[test]
    fn canonicalize_rejects_below_cutoff() {
        let registry = MarketRegistry::new(default_markets());
        assert!(
            registry
                .canonicalize("Joplin Regional Stockyards", DEFAULT_SCORE_CUTOFF)
                .is_none()
        );
    }

    #[test]
    fn canonicalize_rejects_empty_input_and_empty_registry() {
        let registry = MarketRegistry::new(default_markets());
        assert!(registry.canonicalize("   ", DEFAULT_SCORE_CUTOFF).is_none());

        let empty = MarketRegistry::new(Vec::new());
        assert!(empty.canonicalize("Pratt", DEFAULT_SCORE_CUTOFF).is_none());
    }

    #[test]
    fn canonicalize_is_case_insensitive() {
        let registry = MarketRegistry::new(default_markets());
        let matched = registry
            .canonicalize("DODGE CITY", DEFAULT_SCORE_CUTOFF)
            .unwrap();
        assert_eq!(matched.canonical, "Dodge City");
        assert_eq!(matched.score, 100);
    }

    #[test]
    fn store_and_load_round_trip_through_sqlite() {
        let mut connection = Connection::open_in_memory().unwrap();
        connection
            .execute_batch(
                "CREATE TABLE markets (
                   name TEXT PRIMARY KEY,
                   state TEXT NOT NULL,
                   aliases TEXT NOT NULL
                 )",
            )
            .unwrap();

        let seeded = store_markets(&mut connection, &default_markets()).unwrap();
        assert_eq!(seeded, 5);

        let registry = load_registry(&connection).unwrap();
        assert_eq!(registry.markets().len(), 5);
        assert!(
            registry
                .canonicalize("dalhart", DEFAULT_SCORE_CUTOFF)
                .is_some()
        );
    }
}
