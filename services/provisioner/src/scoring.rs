//! Node scoring and selection.
//!
//! Each service plugs in a [`NodeScorer`] that turns an announcement into a
//! number. Selection picks the highest score; a node is only eligible when it
//! scores strictly above zero.

use fleet_messages::Announcement;

/// Computes a node's desirability from its announcement.
pub trait NodeScorer: Send + Sync {
    fn node_score(&self, announcement: &Announcement) -> f64;
}

/// Scores a node by its announced `available_memory`. Missing or non-numeric
/// values score zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvailableMemoryScorer;

impl NodeScorer for AvailableMemoryScorer {
    fn node_score(&self, announcement: &Announcement) -> f64 {
        announcement.available_memory().unwrap_or(0.0)
    }
}

impl<F> NodeScorer for F
where
    F: Fn(&Announcement) -> f64 + Send + Sync,
{
    fn node_score(&self, announcement: &Announcement) -> f64 {
        self(announcement)
    }
}

/// Pick the best announcement.
///
/// Ties go to the earliest announcement in the slice (arrival order). NaN
/// scores are ignored. Returns `None` when nothing scores above zero.
pub fn select_best_node<'a>(
    announcements: &'a [Announcement],
    scorer: &dyn NodeScorer,
) -> Option<(&'a Announcement, f64)> {
    let mut best: Option<(&Announcement, f64)> = None;

    for announcement in announcements {
        let score = scorer.node_score(announcement);
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((announcement, score)),
        }
    }

    best.filter(|(_, score)| *score > 0.0)
}
