//! Merge cascade planning: which branch merges into which, with what strategy.

use serde::{Deserialize, Serialize};
use tiller_core::{BranchTier, MergeConfig, MergeStrategy, ParentRef};

use crate::branch::{epic_branch, prd_branch, task_branch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBranch {
    pub tier: BranchTier,
    /// Backlog id of the task/epic/PRD; the branch name for the main tier.
    pub id: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeStep {
    pub source: TierBranch,
    pub target: TierBranch,
    pub strategy: MergeStrategy,
}

/// Ordered branches from a starting tier up to main. Tiers a task does not
/// belong to are skipped, so a task with no epic merges straight into its PRD
/// branch (or main).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierChain {
    pub tiers: Vec<TierBranch>,
}

impl TierChain {
    pub fn for_task(task_id: &str, parent: &ParentRef, main: &str) -> Self {
        let mut tiers = vec![TierBranch {
            tier: BranchTier::Task,
            id: task_id.to_string(),
            branch: task_branch(task_id),
        }];
        tiers.extend(Self::parents(parent.epic.as_deref(), parent.prd.as_deref(), main));
        Self { tiers }
    }

    pub fn for_epic(epic_id: &str, prd: Option<&str>, main: &str) -> Self {
        Self {
            tiers: Self::parents(Some(epic_id), prd, main),
        }
    }

    pub fn for_prd(prd_id: &str, main: &str) -> Self {
        Self {
            tiers: Self::parents(None, Some(prd_id), main),
        }
    }

    fn parents(epic: Option<&str>, prd: Option<&str>, main: &str) -> Vec<TierBranch> {
        let mut tiers = Vec::new();
        if let Some(epic) = epic.filter(|id| !id.trim().is_empty()) {
            tiers.push(TierBranch {
                tier: BranchTier::Epic,
                id: epic.to_string(),
                branch: epic_branch(epic),
            });
        }
        if let Some(prd) = prd.filter(|id| !id.trim().is_empty()) {
            tiers.push(TierBranch {
                tier: BranchTier::Prd,
                id: prd.to_string(),
                branch: prd_branch(prd),
            });
        }
        tiers.push(TierBranch {
            tier: BranchTier::Main,
            id: main.to_string(),
            branch: main.to_string(),
        });
        tiers
    }

    /// The tier directly above the first one: where the starting branch is cut from.
    pub fn parent_of_start(&self) -> Option<&TierBranch> {
        self.tiers.get(1)
    }

    /// Branches above the start that must exist before the start can be cut,
    /// highest first, each paired with the branch it is cut from.
    pub fn ancestors_to_ensure(&self) -> Vec<(&TierBranch, &TierBranch)> {
        let mut pairs: Vec<_> = self
            .tiers
            .windows(2)
            .skip(1)
            .filter(|pair| pair[0].tier != BranchTier::Main)
            .map(|pair| (&pair[0], &pair[1]))
            .collect();
        pairs.reverse();
        pairs
    }

    pub fn steps(&self, config: &MergeConfig) -> Vec<CascadeStep> {
        self.tiers
            .windows(2)
            .map(|pair| CascadeStep {
                source: pair[0].clone(),
                target: pair[1].clone(),
                strategy: config.strategy_for(pair[0].tier),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_core::SquashLevel;

    fn parent(prd: Option<&str>, epic: Option<&str>) -> ParentRef {
        ParentRef {
            prd: prd.map(str::to_string),
            epic: epic.map(str::to_string),
        }
    }

    #[test]
    fn full_chain_runs_task_epic_prd_main() {
        let chain = TierChain::for_task("T1", &parent(Some("P1"), Some("E1")), "main");
        let branches: Vec<_> = chain.tiers.iter().map(|t| t.branch.as_str()).collect();
        assert_eq!(branches, vec!["task/T1", "epic/E1", "prd/P1", "main"]);
        assert_eq!(
            chain.parent_of_start().map(|t| t.branch.as_str()),
            Some("epic/E1")
        );
    }

    #[test]
    fn missing_tiers_are_skipped() {
        let chain = TierChain::for_task("T1", &parent(Some("P1"), None), "trunk");
        let branches: Vec<_> = chain.tiers.iter().map(|t| t.branch.as_str()).collect();
        assert_eq!(branches, vec!["task/T1", "prd/P1", "trunk"]);

        let orphan = TierChain::for_task("T2", &ParentRef::default(), "main");
        assert_eq!(orphan.steps(&MergeConfig::default()).len(), 1);
    }

    #[test]
    fn default_config_squashes_only_prd_into_main() {
        let chain = TierChain::for_task("T1", &parent(Some("P1"), Some("E1")), "main");
        let strategies: Vec<_> = chain
            .steps(&MergeConfig::default())
            .into_iter()
            .map(|step| step.strategy)
            .collect();
        assert_eq!(
            strategies,
            vec![
                MergeStrategy::Merge,
                MergeStrategy::Merge,
                MergeStrategy::Squash
            ]
        );
    }

    #[test]
    fn squash_level_task_collapses_at_first_step() {
        let mut config = MergeConfig::default();
        config.squash_level = SquashLevel::Task;
        config.prd_strategy = MergeStrategy::Merge;
        let steps = TierChain::for_task("T1", &parent(Some("P1"), Some("E1")), "main")
            .steps(&config);
        assert_eq!(steps[0].strategy, MergeStrategy::Squash);
        assert_eq!(steps[2].strategy, MergeStrategy::Merge);
    }

    #[test]
    fn ancestors_are_ensured_top_down() {
        let chain = TierChain::for_task("T1", &parent(Some("P1"), Some("E1")), "main");
        let pairs: Vec<_> = chain
            .ancestors_to_ensure()
            .into_iter()
            .map(|(branch, base)| (branch.branch.as_str(), base.branch.as_str()))
            .collect();
        assert_eq!(pairs, vec![("prd/P1", "main"), ("epic/E1", "prd/P1")]);

        let epic_chain = TierChain::for_epic("E1", None, "main");
        assert!(epic_chain.ancestors_to_ensure().is_empty());
        assert_eq!(TierChain::for_prd("P1", "main").steps(&MergeConfig::default()).len(), 1);
    }
}
