pub mod content;
pub mod oracle;
pub mod prompt;
pub mod proposer;

use serde::{Deserialize, Serialize};

pub use content::IpfsGateway;
pub use oracle::GeminiOracle;
pub use proposer::MatchProposer;

/// How the proposer partitions a snapshot into oracle calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalStrategy {
    /// One call comparing every unmatched lost item against every unmatched found item
    #[default]
    AllAtOnce,
    /// One call per unmatched lost item, stopping at the first accepted pair
    PerLostItem,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        let strategy: ProposalStrategy = serde_json::from_str("\"per-lost-item\"").unwrap();
        assert_eq!(strategy, ProposalStrategy::PerLostItem);
        assert_eq!(ProposalStrategy::default(), ProposalStrategy::AllAtOnce);
    }
}
