//! Extracts the most relevant token windows (snippets, summaries) from a
//! document to provide a "keyword in context" functionality.
//!
//! Input is the sorted list of query-term occurrences in the document,
//! each tagged with a weight, a term index and a per-query bit mask (up
//! to 32 queries scored in one pass). Occurrences are clustered by gap,
//! every cluster is segmented into maximum-scoring windows by a recursive
//! best-window search, and `snippets_top` finally diversifies the ranked
//! snippets so repeated term combinations fade out.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// Second occurrence of a term gets BONUS_FACTOR of its full weight.
const BONUS_FACTOR: f64 = 0.15;
const MAX_QUERIES: usize = 32;
// Snippets starting before this token get a boost and a wider window.
const SUMMARY_SNIPPET: f64 = 250.0;

/// One term occurrence in the document, tagged for snippet extraction.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SnippetPosition {
    /// Token position in the document.
    pub position: usize,
    /// Full weight of this occurrence.
    pub weight: f64,
    /// Which top term it is (0..63).
    pub term_index: u32,
    /// Bit mask of the queries this occurrence belongs to.
    pub query_mask: u32,
}

/// A candidate snippet: a contiguous token window with its score.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct Snippet {
    /// First token of the window.
    pub start: usize,
    /// Last token of the window.
    pub end: usize,
    /// Position of the snippet in creation order.
    pub index: usize,
    /// Score divided by the window-length normalization.
    pub density: f64,
    /// Sum of weights of each term's first occurrence.
    pub first_instance_weight: f64,
    /// Matches counted (first and second occurrences).
    pub match_count: usize,
    /// Distinct terms matched (first occurrences).
    pub distinct_match_count: usize,
    /// Bit per term seen, for the winning query.
    pub mask: u64,
    /// `(density + first_instance_weight) * distinct_match_count`.
    pub score: f64,
    /// The query this snippet scored best for (-1 when nothing matched).
    pub query_index: i32,
    /// Whether the next emitted snippet belongs to the same cluster.
    pub next_in_cluster: bool,
}

fn position_ratio(start: usize) -> f64 {
    if start as f64 >= SUMMARY_SNIPPET {
        return 1.0;
    }
    1.0 + (SUMMARY_SNIPPET - start as f64) / SUMMARY_SNIPPET
}

fn adjusted_max_snippet(start: usize, max_snippet: usize) -> usize {
    if start as f64 >= SUMMARY_SNIPPET {
        return max_snippet;
    }
    (position_ratio(start) * max_snippet as f64).round() as usize
}

/// Sort positions by `(position, term_index)` and merge duplicates by
/// OR-ing their query masks. Returns the merged length after truncating.
pub fn snippet_position_sort(positions: &mut Vec<SnippetPosition>) -> usize {
    positions.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then(a.term_index.cmp(&b.term_index))
    });
    let mut write = 0;
    let mut read = 0;
    while read < positions.len() {
        let mut merged = positions[read];
        let mut next = read + 1;
        while next < positions.len()
            && positions[next].position == merged.position
            && positions[next].term_index == merged.term_index
        {
            merged.query_mask |= positions[next].query_mask;
            next += 1;
        }
        positions[write] = merged;
        write += 1;
        read = next;
    }
    positions.truncate(write);
    write
}

// Sliding-window search for the best-scoring window inside
// [range_start, range_end]: every occurrence anchors a window that grows
// while it fits the (position-adjusted) snippet budget, scored per query.
fn find_best_snippet(
    positions: &[SnippetPosition],
    query_mask: u32,
    range_start: usize,
    range_end: usize,
    max_snippet: usize,
) -> Option<Snippet> {
    let highest_bit = 32 - query_mask.leading_zeros() as usize;
    let mut best = Snippet::default();
    let mut found = false;

    for (anchor_index, anchor) in positions.iter().enumerate() {
        if anchor.position < range_start {
            continue;
        }
        if anchor.position > range_end {
            break;
        }
        let adj_max_snippet = adjusted_max_snippet(anchor.position, max_snippet);

        let mut query_score = [0.0f64; MAX_QUERIES];
        let mut query_first_weight = [0.0f64; MAX_QUERIES];
        let mut query_match_count = [0usize; MAX_QUERIES];
        let mut query_distinct_count = [0usize; MAX_QUERIES];
        let mut first_masks = [0u64; MAX_QUERIES];
        let mut second_masks = [0u64; MAX_QUERIES];

        for curr in &positions[anchor_index..] {
            if curr.position > range_end {
                break;
            }
            let snippet_length = curr.position - anchor.position + 1;
            if snippet_length > adj_max_snippet {
                break;
            }

            let bit = 1u64 << curr.term_index;
            for q in 0..highest_bit {
                if curr.query_mask & (1u32 << q) != 0 {
                    if first_masks[q] & bit == 0 {
                        first_masks[q] |= bit;
                        query_score[q] += curr.weight;
                        query_first_weight[q] += curr.weight;
                        query_distinct_count[q] += 1;
                        query_match_count[q] += 1;
                    } else if second_masks[q] & bit == 0 {
                        second_masks[q] |= bit;
                        query_score[q] += curr.weight * BONUS_FACTOR;
                        query_match_count[q] += 1;
                    }
                    // further occurrences are ignored
                }
            }

            let norm = (snippet_length as f64 + 1.0).ln();
            for q in 0..highest_bit {
                if query_match_count[q] > 0 {
                    let density = query_score[q] / norm;
                    let combined =
                        (density + query_first_weight[q]) * query_distinct_count[q] as f64;
                    // prefer a higher match count, then the combined score
                    if query_match_count[q] > best.match_count
                        || (query_match_count[q] == best.match_count && combined > best.score)
                    {
                        best = Snippet {
                            start: anchor.position,
                            end: curr.position,
                            index: 0,
                            density,
                            first_instance_weight: query_first_weight[q],
                            match_count: query_match_count[q],
                            distinct_match_count: query_distinct_count[q],
                            mask: first_masks[q],
                            score: combined,
                            query_index: q as i32,
                            next_in_cluster: true,
                        };
                        found = true;
                    }
                }
            }
        }
    }
    found.then_some(best)
}

fn segment_document(
    out: &mut Vec<Snippet>,
    positions: &[SnippetPosition],
    query_mask: u32,
    region_start: usize,
    region_end: usize,
    max_snippet: usize,
) {
    // base case: the region fits one snippet
    if region_end - region_start + 1 <= adjusted_max_snippet(region_start, max_snippet) {
        let highest_bit = 32 - query_mask.leading_zeros() as usize;
        let mut query_first_weight = [0.0f64; MAX_QUERIES];
        let mut query_match_count = [0usize; MAX_QUERIES];
        let mut query_distinct_count = [0usize; MAX_QUERIES];
        let mut first_masks = [0u64; MAX_QUERIES];
        let mut region_total_weight = 0.0;

        for position in positions {
            if position.position >= region_start && position.position <= region_end {
                region_total_weight += position.weight;
                let bit = 1u64 << position.term_index;
                for q in 0..highest_bit {
                    if position.query_mask & (1u32 << q) != 0 {
                        query_match_count[q] += 1;
                        if first_masks[q] & bit == 0 {
                            first_masks[q] |= bit;
                            query_first_weight[q] += position.weight;
                            query_distinct_count[q] += 1;
                        }
                    }
                }
            }
        }

        let density = region_total_weight / (region_end - region_start + 1) as f64;
        let mut best_score = 0.0;
        let mut best_query: i32 = -1;
        for q in 0..highest_bit {
            if query_match_count[q] > 0 {
                let combined = (density + query_first_weight[q]) * query_distinct_count[q] as f64;
                if combined > best_score {
                    best_score = combined;
                    best_query = q as i32;
                }
            }
        }

        let q = best_query.max(0) as usize;
        out.push(Snippet {
            start: region_start,
            end: region_end,
            index: 0,
            density,
            first_instance_weight: if best_query >= 0 { query_first_weight[q] } else { 0.0 },
            match_count: if best_query >= 0 { query_match_count[q] } else { 0 },
            distinct_match_count: if best_query >= 0 { query_distinct_count[q] } else { 0 },
            mask: if best_query >= 0 { first_masks[q] } else { 0 },
            score: best_score,
            query_index: best_query,
            next_in_cluster: true,
        });
        return;
    }

    let Some(best) = find_best_snippet(positions, query_mask, region_start, region_end, max_snippet)
    else {
        return;
    };

    if best.start > region_start {
        segment_document(out, positions, query_mask, region_start, best.start - 1, max_snippet);
    }
    out.push(best);
    if best.end < region_end {
        segment_document(out, positions, query_mask, best.end + 1, region_end, max_snippet);
    }
}

/// Cluster the (sorted, merged) positions and segment every cluster into
/// snippets of at most `max_snippet` tokens (widened near the document
/// start). The last snippet of each cluster carries
/// `next_in_cluster == false`; scores are boosted by the position ratio
/// and `index` records creation order.
pub fn snippets_create(positions: &[SnippetPosition], max_snippet: usize) -> Vec<Snippet> {
    let mut snippets = Vec::new();
    let mut p = 0;
    while p < positions.len() {
        let cluster_start = p;
        let mut query_mask = positions[p].query_mask;
        p += 1;
        while p < positions.len()
            && positions[p].position - positions[p - 1].position
                < adjusted_max_snippet(positions[p - 1].position, max_snippet)
        {
            query_mask |= positions[p].query_mask;
            p += 1;
        }

        let cluster = &positions[cluster_start..p];
        let region_start = cluster[0].position;
        let region_end = cluster[cluster.len() - 1].position;

        let before = snippets.len();
        segment_document(&mut snippets, cluster, query_mask, region_start, region_end, max_snippet);
        if snippets.len() > before {
            snippets.last_mut().unwrap().next_in_cluster = false; // cluster boundary
        }
    }

    for (i, snippet) in snippets.iter_mut().enumerate() {
        snippet.score *= position_ratio(snippet.start);
        snippet.index = i;
    }
    snippets
}

fn compare_snippets(a: &Snippet, b: &Snippet) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap()
        .then_with(|| b.distinct_match_count.cmp(&a.distinct_match_count))
        .then_with(|| b.match_count.cmp(&a.match_count))
        .then_with(|| b.density.partial_cmp(&a.density).unwrap())
        .then_with(|| {
            b.first_instance_weight
                .partial_cmp(&a.first_instance_weight)
                .unwrap()
        })
        .then_with(|| a.start.cmp(&b.start))
}

/// Sort snippets by descending score (ties broken by distinct matches,
/// matches, density, first-instance weight, then ascending start).
pub fn snippets_sort(snippets: &mut [Snippet]) {
    snippets.sort_by(compare_snippets);
}

fn snippets_top_rec(snippets: &mut [Snippet]) -> usize {
    if snippets.is_empty() {
        return 0;
    }
    snippets.sort_by(compare_snippets);
    let mask = snippets[0].mask;
    if mask == 0 {
        return 0;
    }
    let query_index = snippets[0].query_index;
    for snippet in &mut snippets[1..] {
        // down-weight later snippets of the same query for every term
        // already covered by the winner
        if snippet.query_index != query_index {
            continue;
        }
        let common = snippet.mask & mask;
        if common != 0 {
            let num_bits = common.count_ones() as f64;
            let current_bits = snippet.mask.count_ones() as f64;
            snippet.score *= 1.0 - num_bits / current_bits;
            snippet.mask &= !mask;
        }
    }
    if snippets.len() > 1 {
        return snippets_top_rec(&mut snippets[1..]) + 1;
    }
    1
}

/// Diversified top-k selection: repeatedly takes the best snippet and
/// fades the score of same-query snippets covering the same terms. The
/// kept prefix is re-sorted into creation order; returns its length.
pub fn snippets_top(snippets: &mut [Snippet]) -> usize {
    let kept = snippets_top_rec(snippets);
    snippets[..kept].sort_by(|a, b| a.index.cmp(&b.index));
    kept
}
