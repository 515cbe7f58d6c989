//! True-value resolution, including derivative markets.
//!
//! A derivative's true value is the weighted sum of its underlyings' values.
//! Missing underlyings and cyclic definitions resolve to `None` rather than
//! recursing forever or panicking.

use common::{Market, MarketId};
use std::collections::{HashMap, HashSet};

/// Resolve the true value of a market: the directly configured value if set,
/// otherwise the weighted sum over `underlying_weights`. Returns `None` when
/// the market is unknown, has no value, references a missing underlying, or
/// participates in a cycle.
pub fn market_true_value(
    market_id: &str,
    markets: &[Market],
    direct: &HashMap<MarketId, f64>,
) -> Option<f64> {
    resolve(market_id, markets, direct, &mut HashSet::new())
}

fn resolve(
    market_id: &str,
    markets: &[Market],
    direct: &HashMap<MarketId, f64>,
    visited: &mut HashSet<MarketId>,
) -> Option<f64> {
    if let Some(value) = direct.get(market_id) {
        return Some(*value);
    }
    // The visited set tracks the recursion path, so a cycle dead-ends while
    // a shared underlying may still be reached through several parents.
    if !visited.insert(market_id.to_string()) {
        return None;
    }
    let result = markets
        .iter()
        .find(|m| m.id == market_id)
        .and_then(|m| m.underlying_weights.as_ref())
        .and_then(|weights| {
            let mut sum = 0.0;
            for (underlying, weight) in weights {
                sum += weight * resolve(underlying, markets, direct, visited)?;
            }
            Some(sum)
        });
    visited.remove(market_id);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_market(id: &str, weights: Option<HashMap<MarketId, f64>>) -> Market {
        Market {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            underlying_weights: weights,
            condition: None,
        }
    }

    #[test]
    fn test_direct_value() {
        let markets = vec![make_market("a", None)];
        let direct = HashMap::from([("a".to_string(), 10.0)]);
        assert_eq!(market_true_value("a", &markets, &direct), Some(10.0));
    }

    #[test]
    fn test_weighted_sum() {
        let markets = vec![
            make_market("a", None),
            make_market("b", None),
            make_market(
                "d",
                Some(HashMap::from([
                    ("a".to_string(), 1.0),
                    ("b".to_string(), -2.0),
                ])),
            ),
        ];
        let direct = HashMap::from([("a".to_string(), 10.0), ("b".to_string(), 4.0)]);
        assert_eq!(market_true_value("d", &markets, &direct), Some(2.0));
    }

    #[test]
    fn test_nested_derivative() {
        let markets = vec![
            make_market("a", None),
            make_market("d1", Some(HashMap::from([("a".to_string(), 2.0)]))),
            make_market("d2", Some(HashMap::from([("d1".to_string(), 3.0)]))),
        ];
        let direct = HashMap::from([("a".to_string(), 5.0)]);
        assert_eq!(market_true_value("d2", &markets, &direct), Some(30.0));
    }

    #[test]
    fn test_missing_underlying_is_undefined() {
        let markets = vec![make_market(
            "d",
            Some(HashMap::from([("ghost".to_string(), 1.0)])),
        )];
        assert_eq!(market_true_value("d", &markets, &HashMap::new()), None);
    }

    #[test]
    fn test_unset_plain_market_is_undefined() {
        let markets = vec![make_market("a", None)];
        assert_eq!(market_true_value("a", &markets, &HashMap::new()), None);
    }

    #[test]
    fn test_shared_underlying_resolves_through_both_parents() {
        // d -> {x, y}, y -> {x}: x is reached twice but is not a cycle.
        let markets = vec![
            make_market("a", None),
            make_market("x", Some(HashMap::from([("a".to_string(), 2.0)]))),
            make_market("y", Some(HashMap::from([("x".to_string(), 1.0)]))),
            make_market(
                "d",
                Some(HashMap::from([
                    ("x".to_string(), 1.0),
                    ("y".to_string(), 1.0),
                ])),
            ),
        ];
        let direct = HashMap::from([("a".to_string(), 3.0)]);
        assert_eq!(market_true_value("d", &markets, &direct), Some(12.0));
    }

    #[test]
    fn test_cycle_terminates_as_undefined() {
        let markets = vec![
            make_market("x", Some(HashMap::from([("y".to_string(), 1.0)]))),
            make_market("y", Some(HashMap::from([("x".to_string(), 1.0)]))),
        ];
        assert_eq!(market_true_value("x", &markets, &HashMap::new()), None);
    }

    #[test]
    fn test_direct_value_shadows_weights() {
        // A derivative with a directly configured value uses it as-is.
        let markets = vec![make_market(
            "d",
            Some(HashMap::from([("ghost".to_string(), 1.0)])),
        )];
        let direct = HashMap::from([("d".to_string(), 7.5)]);
        assert_eq!(market_true_value("d", &markets, &direct), Some(7.5));
    }
}
