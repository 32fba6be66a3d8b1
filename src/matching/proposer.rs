use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::ledger::models::{CandidatePair, Confidence, Item, Snapshot};
use crate::matching::content::{Content, ContentStore};
use crate::matching::oracle::InferenceOracle;
use crate::matching::prompt::{self, Attachment, MatchResponse};
use crate::matching::ProposalStrategy;

/// Images resolved during one run, keyed by item id. `None` marks a failed fetch.
type ImageCache = HashMap<u64, Option<Content>>;

/// Asks the oracle for at most one high-confidence pair from a snapshot
pub struct MatchProposer {
    oracle: Arc<dyn InferenceOracle>,
    content: Arc<dyn ContentStore>,
    strategy: ProposalStrategy,
    timeout: Duration,
}

impl MatchProposer {
    pub fn new(
        oracle: Arc<dyn InferenceOracle>,
        content: Arc<dyn ContentStore>,
        strategy: ProposalStrategy,
        timeout: Duration,
    ) -> Self {
        Self {
            oracle,
            content,
            strategy,
            timeout,
        }
    }

    /// Propose a pair, or `None` when nothing may be committed.
    ///
    /// Oracle faults, timeouts and schema violations all collapse to `None`.
    #[instrument(skip_all, fields(lost = snapshot.unmatched_lost.len(), found = snapshot.unmatched_found.len()))]
    pub async fn propose(&self, snapshot: &Snapshot) -> Option<CandidatePair> {
        if !snapshot.has_candidates() {
            debug!("One side is empty, skipping oracle");
            return None;
        }

        let mut images = ImageCache::new();
        let found: Vec<&Item> = snapshot.unmatched_found.iter().collect();

        match self.strategy {
            ProposalStrategy::AllAtOnce => {
                let lost: Vec<&Item> = snapshot.unmatched_lost.iter().collect();
                self.ask(&lost, &found, &mut images).await
            }
            ProposalStrategy::PerLostItem => {
                for lost in &snapshot.unmatched_lost {
                    if let Some(pair) = self.ask(&[lost], &found, &mut images).await {
                        return Some(pair);
                    }
                }
                None
            }
        }
    }

    async fn ask(
        &self,
        lost: &[&Item],
        found: &[&Item],
        images: &mut ImageCache,
    ) -> Option<CandidatePair> {
        let items: Vec<&Item> = lost.iter().chain(found.iter()).copied().collect();

        // Image resolution counts against the same cutoff as the oracle call.
        let exchange = async {
            let attachments = self.attachments(&items, images).await;
            let request = prompt::build_request(lost, found, attachments);
            self.oracle.infer(&request).await
        };

        let response = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Oracle call failed, treating as no match: {}", e);
                return None;
            }
            Err(_) => {
                warn!("Oracle call exceeded {:?}, treating as no match", self.timeout);
                return None;
            }
        };

        accept(&response, lost, found)
    }

    /// Resolve item images, falling back to text-only for any that fail
    async fn attachments(&self, items: &[&Item], images: &mut ImageCache) -> Vec<Attachment> {
        let mut attachments = Vec::new();

        for item in items {
            let Some(reference) = item.content_ref.as_deref() else {
                continue;
            };

            if !images.contains_key(&item.id) {
                let fetched = match self.content.fetch(reference).await {
                    Ok(content) => Some(content),
                    Err(e) => {
                        warn!("Image for item {} unavailable, using text only: {}", item.id, e);
                        None
                    }
                };
                images.insert(item.id, fetched);
            }

            if let Some(Some(content)) = images.get(&item.id) {
                attachments.push(Attachment {
                    item_id: item.id,
                    content: content.clone(),
                });
            }
        }

        attachments
    }
}

/// Apply the commit policy to an oracle answer.
///
/// Only the top confidence tier passes, and both ids must belong to the sets
/// that were actually offered.
fn accept(response: &MatchResponse, lost: &[&Item], found: &[&Item]) -> Option<CandidatePair> {
    let proposed = response.proposed.as_ref()?;

    let Some(confidence) = proposed.confidence.as_deref().and_then(Confidence::parse) else {
        info!(
            "Discarding {}/{}: missing or unknown confidence",
            proposed.lost_id, proposed.found_id
        );
        return None;
    };

    if confidence < Confidence::ACCEPTED {
        info!(
            "Discarding {}/{}: confidence {} below {}",
            proposed.lost_id,
            proposed.found_id,
            confidence,
            Confidence::ACCEPTED
        );
        return None;
    }

    let lost_ok = lost.iter().any(|item| item.id == proposed.lost_id);
    let found_ok = found.iter().any(|item| item.id == proposed.found_id);
    if !lost_ok || !found_ok {
        warn!(
            "Oracle proposed ids outside the snapshot: lost={} found={}",
            proposed.lost_id, proposed.found_id
        );
        return None;
    }

    Some(CandidatePair {
        lost_id: proposed.lost_id,
        found_id: proposed.found_id,
        confidence,
    })
}
