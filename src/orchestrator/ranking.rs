//! Candidate ranking
//!
//! Turns the raw sessions of a search into the ordered candidate list a
//! ticket walks through. Sessions without an open slot are dropped, the
//! rest are stable-sorted by the ordering preferences and truncated.

use crate::types::{AttributeValue, OrderingPreference, SearchResult, SessionDescriptor, REGION_ATTRIBUTE};
use std::cmp::Ordering;

/// Rank the sessions of `result`, keeping at most `max` candidates
pub fn rank_candidates(
    result: &SearchResult,
    ordering: &[OrderingPreference],
    max: usize,
) -> Vec<SessionDescriptor> {
    let mut candidates: Vec<SessionDescriptor> = result
        .sessions
        .iter()
        .filter(|session| !session.is_full())
        .cloned()
        .collect();

    candidates.sort_by(|a, b| compare(a, b, ordering));
    candidates.truncate(max);
    candidates
}

fn compare(a: &SessionDescriptor, b: &SessionDescriptor, ordering: &[OrderingPreference]) -> Ordering {
    ordering
        .iter()
        .map(|preference| match preference {
            OrderingPreference::RegionFirst(region) => {
                region_rank(a, region).cmp(&region_rank(b, region))
            }
            OrderingPreference::MostPopulated => b.player_count.cmp(&a.player_count),
            OrderingPreference::LeastPopulated => a.player_count.cmp(&b.player_count),
        })
        .find(|order| *order != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn region_rank(session: &SessionDescriptor, region: &str) -> u8 {
    match session.attribute(REGION_ATTRIBUTE) {
        Some(AttributeValue::Text(value)) if value == region => 0,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Attributes, SearchQuery, SessionId};
    use crate::utils::current_timestamp;
    use proptest::prelude::*;

    fn session(id: &str, region: &str, players: u32, capacity: u32) -> SessionDescriptor {
        let mut attributes = Attributes::new();
        attributes.insert(REGION_ATTRIBUTE.to_string(), region.into());
        SessionDescriptor {
            id: SessionId::new(id),
            attributes,
            player_count: players,
            capacity,
            host_address: None,
        }
    }

    fn result(sessions: Vec<SessionDescriptor>) -> SearchResult {
        SearchResult {
            query: SearchQuery::new(Attributes::new(), 50),
            sessions,
            completed_at: current_timestamp(),
        }
    }

    fn ids(candidates: &[SessionDescriptor]) -> Vec<&str> {
        candidates.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_no_preferences_keeps_backend_order() {
        let ranked = rank_candidates(
            &result(vec![session("a", "eu", 1, 4), session("b", "us", 3, 4)]),
            &[],
            10,
        );
        assert_eq!(ids(&ranked), vec!["a", "b"]);
    }

    #[test]
    fn test_region_then_population() {
        let ranked = rank_candidates(
            &result(vec![
                session("us-busy", "us", 3, 4),
                session("eu-quiet", "eu", 1, 4),
                session("eu-busy", "eu", 2, 4),
            ]),
            &[
                OrderingPreference::RegionFirst("eu".to_string()),
                OrderingPreference::MostPopulated,
            ],
            10,
        );
        assert_eq!(ids(&ranked), vec!["eu-busy", "eu-quiet", "us-busy"]);
    }

    #[test]
    fn test_least_populated() {
        let ranked = rank_candidates(
            &result(vec![session("a", "eu", 3, 4), session("b", "eu", 1, 4)]),
            &[OrderingPreference::LeastPopulated],
            10,
        );
        assert_eq!(ids(&ranked), vec!["b", "a"]);
    }

    #[test]
    fn test_full_sessions_dropped_and_truncated() {
        let ranked = rank_candidates(
            &result(vec![
                session("full", "eu", 4, 4),
                session("a", "eu", 1, 4),
                session("b", "eu", 2, 4),
                session("c", "eu", 3, 4),
            ]),
            &[OrderingPreference::MostPopulated],
            2,
        );
        assert_eq!(ids(&ranked), vec!["c", "b"]);
    }

    proptest! {
        #[test]
        fn prop_ranking_is_bounded_and_ordered(
            players in proptest::collection::vec((0u32..6, prop::bool::ANY), 0..40),
            max in 0usize..50,
        ) {
            let sessions: Vec<SessionDescriptor> = players
                .iter()
                .enumerate()
                .map(|(i, (count, eu))| {
                    session(&format!("s{}", i), if *eu { "eu" } else { "us" }, *count, 5)
                })
                .collect();
            let ranked = rank_candidates(
                &result(sessions.clone()),
                &[OrderingPreference::RegionFirst("eu".to_string()), OrderingPreference::MostPopulated],
                max,
            );

            prop_assert!(ranked.len() <= max);
            prop_assert!(ranked.iter().all(|c| !c.is_full()));
            prop_assert!(ranked.iter().all(|c| sessions.contains(c)));
            for pair in ranked.windows(2) {
                let (a, b) = (region_rank(&pair[0], "eu"), region_rank(&pair[1], "eu"));
                prop_assert!(a <= b);
                if a == b {
                    prop_assert!(pair[0].player_count >= pair[1].player_count);
                }
            }
        }
    }
}
