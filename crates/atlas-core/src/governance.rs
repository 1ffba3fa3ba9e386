//! On-ledger governance registry: proposals, votes, and tallying.
//!
//! Proposals open at the block that includes them and stay active for
//! `duration` blocks. A tally after the end block settles the outcome.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::TransactionError;
use crate::types::VoteChoice;

/// Lifecycle of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalState {
    Pending,
    Active,
    Succeeded,
    Failed,
    Executed,
}

/// A governance proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub proposer: String,
    pub description: String,
    pub actions: String,
    pub state: ProposalState,
    pub votes_for: i64,
    pub votes_against: i64,
    pub start_block: u64,
    pub end_block: u64,
    pub voters: HashSet<String>,
}

/// A recorded vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub proposal_id: String,
    pub voter: String,
    pub choice: VoteChoice,
    pub weight: i64,
}

/// Registry of proposals and their votes.
///
/// Cloned as a unit when a block is staged so that a failing block leaves
/// no governance side effects behind.
#[derive(Debug, Clone, Default)]
pub struct Governance {
    proposals: HashMap<String, Proposal>,
    votes: HashMap<String, Vec<Vote>>,
}

impl Governance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a proposal active from `start_block` through `end_block`.
    pub fn submit(
        &mut self,
        proposer: &str,
        description: &str,
        actions: &str,
        start_block: u64,
        end_block: u64,
    ) -> &Proposal {
        let id = format!("proposal_{}", self.proposals.len() + 1);
        self.proposals.entry(id.clone()).or_insert(Proposal {
            id,
            proposer: proposer.to_string(),
            description: description.to_string(),
            actions: actions.to_string(),
            state: ProposalState::Active,
            votes_for: 0,
            votes_against: 0,
            start_block,
            end_block,
            voters: HashSet::new(),
        })
    }

    /// Record a vote. Each voter may vote once per proposal.
    pub fn cast_vote(
        &mut self,
        proposal_id: &str,
        voter: &str,
        choice: VoteChoice,
        weight: i64,
    ) -> Result<(), TransactionError> {
        let proposal = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| TransactionError::Governance(format!("proposal not found: {proposal_id}")))?;
        if proposal.voters.contains(voter) {
            return Err(TransactionError::Governance(format!(
                "{voter} has already voted on {proposal_id}"
            )));
        }
        if proposal.state != ProposalState::Active {
            return Err(TransactionError::Governance(format!(
                "proposal {proposal_id} is not active"
            )));
        }
        if weight < 0 {
            return Err(TransactionError::Governance("negative vote weight".into()));
        }
        match choice {
            VoteChoice::For => proposal.votes_for = proposal.votes_for.saturating_add(weight),
            VoteChoice::Against => {
                proposal.votes_against = proposal.votes_against.saturating_add(weight)
            }
        }
        proposal.voters.insert(voter.to_string());
        self.votes.entry(proposal_id.to_string()).or_default().push(Vote {
            proposal_id: proposal_id.to_string(),
            voter: voter.to_string(),
            choice,
            weight,
        });
        Ok(())
    }

    /// Settle an active proposal once `current_block` is past its end.
    pub fn tally(&mut self, proposal_id: &str, current_block: u64) {
        if let Some(p) = self.proposals.get_mut(proposal_id) {
            if p.state == ProposalState::Active && current_block > p.end_block {
                p.state = if p.votes_for > p.votes_against {
                    ProposalState::Succeeded
                } else {
                    ProposalState::Failed
                };
            }
        }
    }

    /// Settle every active proposal whose voting period has ended.
    pub fn tally_all(&mut self, current_block: u64) {
        let ids: Vec<String> = self.proposals.keys().cloned().collect();
        for id in ids {
            self.tally(&id, current_block);
        }
    }

    pub fn proposal(&self, id: &str) -> Option<&Proposal> {
        self.proposals.get(id)
    }

    pub fn votes(&self, id: &str) -> &[Vote] {
        self.votes.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }
}
