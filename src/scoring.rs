use std::collections::HashMap;

use crate::patch_store::PatchHit;

/// A page ranked by its late-interaction score.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPage {
    pub doc_id: String,
    pub page_number: u32,
    pub score: f32,
}

/// Aggregate per-probe hit sets into page scores with the MaxSim rule.
///
/// `probe_hits` holds one hit list per query vector. For each (document,
/// page) seen anywhere, the aggregate score is the sum over probes of the
/// best single-patch similarity that probe achieved against the page; a
/// probe that surfaced no patch of the page contributes 0.
///
/// Summing per-probe maxima is what keeps rankings discriminating: a page
/// must answer *every* aspect of the query to score well. Taking a plain
/// maximum over all probes instead collapses distinct pages onto identical
/// scores whenever they share one strong patch.
///
/// Results are ordered by score descending, then (document id, page
/// number) ascending, so identical inputs always rank identically.
pub fn aggregate_max_sim(probe_hits: &[Vec<PatchHit>]) -> Vec<RankedPage> {
    // (doc, page) -> summed score across probes.
    let mut totals: HashMap<(String, u32), f32> = HashMap::new();

    for hits in probe_hits {
        // Best hit per page within this one probe; a probe may surface
        // several patches of the same page and only the max counts.
        let mut best: HashMap<(&str, u32), f32> = HashMap::new();
        for hit in hits {
            let key = (hit.doc_id.as_str(), hit.page_number);
            let entry = best.entry(key).or_insert(f32::NEG_INFINITY);
            if hit.score > *entry {
                *entry = hit.score;
            }
        }

        for ((doc_id, page_number), score) in best {
            *totals
                .entry((doc_id.to_string(), page_number))
                .or_insert(0.0) += score;
        }
    }

    let mut ranked: Vec<RankedPage> = totals
        .into_iter()
        .map(|((doc_id, page_number), score)| RankedPage {
            doc_id,
            page_number,
            score,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
            .then_with(|| a.page_number.cmp(&b.page_number))
    });

    ranked
}
