//! Per-sample shrinking
//!
//! Minimization is stepwise: the minimizer proposes a smaller sample, the
//! engine runs the target and reports back whether the coverage that made
//! the sample interesting survived. The engine owns the run loop; the
//! minimizer owns the shrinking strategy.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::grammar::{Grammar, TreeNode};
use crate::sample::Sample;

/// Initial tail-trim size for the byte trimmer
const TRIM_STEP_INITIAL: usize = 16;

/// Per-sample minimizer state
pub enum MinimizerContext {
    /// Byte trimmer state: the current tail-trim size
    Trimmer {
        /// Bytes removed per step; halves on failure
        trim_step: usize,
    },

    /// Grammar tree pruning state
    Grammar(GrammarMinimizerContext),
}

/// A shrinking strategy
pub trait Minimizer: Send {
    /// Build the minimization state for `sample`
    fn create_context(&self, sample: &Sample) -> Result<MinimizerContext>;

    /// Propose the next smaller candidate by mutating `sample` in place.
    /// Returns `false` when no further progress is possible.
    fn minimize_step(&self, sample: &mut Sample, ctx: &mut MinimizerContext) -> bool;

    /// The last proposed candidate kept the required coverage
    fn report_success(&self, _sample: &mut Sample, _ctx: &mut MinimizerContext) {}

    /// The last proposed candidate lost coverage and was rolled back
    fn report_fail(&self, _sample: &mut Sample, _ctx: &mut MinimizerContext) {}
}

/// Linear tail trimmer: cut `trim_step` bytes off the end, halving the
/// step whenever that loses coverage
pub struct SimpleTrimmer;

impl Minimizer for SimpleTrimmer {
    fn create_context(&self, _sample: &Sample) -> Result<MinimizerContext> {
        Ok(MinimizerContext::Trimmer {
            trim_step: TRIM_STEP_INITIAL,
        })
    }

    fn minimize_step(&self, sample: &mut Sample, ctx: &mut MinimizerContext) -> bool {
        let MinimizerContext::Trimmer { trim_step } = ctx else {
            return false;
        };

        if sample.size() <= 1 {
            return false;
        }
        while *trim_step >= sample.size() {
            *trim_step /= 2;
        }
        if *trim_step == 0 {
            return false;
        }

        sample.trim(sample.size() - *trim_step);
        true
    }

    fn report_fail(&self, _sample: &mut Sample, ctx: &mut MinimizerContext) {
        if let MinimizerContext::Trimmer { trim_step } = ctx {
            *trim_step /= 2;
        }
    }
}

/// Grammar tree pruning state
pub struct GrammarMinimizerContext {
    /// The derivation tree being shrunk
    tree: TreeNode,

    /// Paths of prunable nodes (repeat or can-be-empty interiors with
    /// children), in pre-order; processed back to front so subtrees are
    /// handled before their ancestors
    candidates: Vec<Vec<usize>>,

    /// Candidate currently being drained; `None` once exhausted
    current_candidate: Option<usize>,

    /// Child position within the current candidate
    current_pos: usize,

    /// Children removed by the pending step, for rollback
    removed: Vec<TreeNode>,

    /// Node count of the tree at context creation
    num_nodes_initial: usize,

    /// Nodes removed by accepted steps
    num_nodes_removed: usize,
}

/// Prunes repeat and can-be-empty nodes bottom-to-top, one step at a time
pub struct GrammarMinimizer {
    grammar: Arc<Grammar>,

    /// Stop shrinking once the tree is down to this many nodes
    minimization_limit: usize,
}

impl GrammarMinimizer {
    /// Create a grammar minimizer that stops at `minimization_limit`
    /// remaining nodes
    pub fn new(grammar: Arc<Grammar>, minimization_limit: usize) -> Self {
        GrammarMinimizer {
            grammar,
            minimization_limit,
        }
    }

    fn collect_candidates(
        &self,
        node: &TreeNode,
        path: &mut Vec<usize>,
        candidates: &mut Vec<Vec<usize>>,
    ) {
        let Some(symbol_id) = node.symbol() else {
            return;
        };
        let symbol = self.grammar.symbol(symbol_id);

        if (symbol.can_be_empty || symbol.repeat_symbol.is_some()) && !node.children.is_empty() {
            candidates.push(path.clone());
        }

        for (index, child) in node.children.iter().enumerate() {
            path.push(index);
            self.collect_candidates(child, path, candidates);
            path.pop();
        }
    }
}

/// Walk to the node addressed by `path`
fn node_at_path<'a>(tree: &'a mut TreeNode, path: &[usize]) -> &'a mut TreeNode {
    let mut node = tree;
    for &index in path {
        node = &mut node.children[index];
    }
    node
}

impl Minimizer for GrammarMinimizer {
    fn create_context(&self, sample: &Sample) -> Result<MinimizerContext> {
        let tree = self
            .grammar
            .decode_sample(sample)
            .context("Error decoding grammar sample for minimization")?;

        let mut candidates = Vec::new();
        let mut path = Vec::new();
        self.collect_candidates(&tree, &mut path, &mut candidates);

        let current_candidate = candidates.len().checked_sub(1);
        let current_pos = match current_candidate {
            Some(index) => {
                let mut node = &tree;
                for &child in &candidates[index] {
                    node = &node.children[child];
                }
                node.children.len()
            }
            None => 0,
        };

        let num_nodes_initial = tree.num_nodes();

        Ok(MinimizerContext::Grammar(GrammarMinimizerContext {
            tree,
            candidates,
            current_candidate,
            current_pos,
            removed: Vec::new(),
            num_nodes_initial,
            num_nodes_removed: 0,
        }))
    }

    fn minimize_step(&self, sample: &mut Sample, ctx: &mut MinimizerContext) -> bool {
        let MinimizerContext::Grammar(gctx) = ctx else {
            return false;
        };

        if gctx.num_nodes_initial - gctx.num_nodes_removed <= self.minimization_limit {
            return false;
        }

        let mut candidate = match gctx.current_candidate {
            Some(index) => index,
            None => return false,
        };

        // Skip candidates that have been fully drained
        while gctx.current_pos == 0 {
            if candidate == 0 {
                gctx.current_candidate = None;
                return false;
            }
            candidate -= 1;
            gctx.current_candidate = Some(candidate);
            gctx.current_pos = node_at_path(&mut gctx.tree, &gctx.candidates[candidate])
                .children
                .len();
        }

        gctx.removed.clear();

        let path = &gctx.candidates[candidate];
        let symbol_id = node_at_path(&mut gctx.tree, path).symbol().unwrap();
        let is_repeat = self.grammar.symbol(symbol_id).repeat_symbol.is_some();
        let node = node_at_path(&mut gctx.tree, path);

        if is_repeat {
            // Remove one trailing child per step
            gctx.current_pos -= 1;
            gctx.removed.push(node.children.remove(gctx.current_pos));
        } else {
            // A can-be-empty node loses all children in one step
            gctx.removed.append(&mut node.children);
            gctx.current_pos = 0;
        }

        self.grammar.encode_sample(&gctx.tree, sample).is_ok()
    }

    fn report_success(&self, _sample: &mut Sample, ctx: &mut MinimizerContext) {
        if let MinimizerContext::Grammar(gctx) = ctx {
            gctx.num_nodes_removed += gctx.removed.iter().map(TreeNode::num_nodes).sum::<usize>();
            gctx.removed.clear();
        }
    }

    fn report_fail(&self, _sample: &mut Sample, ctx: &mut MinimizerContext) {
        let MinimizerContext::Grammar(gctx) = ctx else {
            return;
        };
        let Some(candidate) = gctx.current_candidate else {
            return;
        };

        // Put the removed children back where they came from
        let node = node_at_path(&mut gctx.tree, &gctx.candidates[candidate]);
        let at = gctx.current_pos.min(node.children.len());
        node.children.splice(at..at, gctx.removed.drain(..));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trimmer_shrinks_and_halves_on_failure() {
        let trimmer = SimpleTrimmer;
        let mut sample = Sample::from_bytes(&[7; 100]);
        let mut ctx = trimmer.create_context(&sample).unwrap();

        assert!(trimmer.minimize_step(&mut sample, &mut ctx));
        assert_eq!(sample.size(), 84);

        trimmer.report_fail(&mut sample, &mut ctx);
        assert!(trimmer.minimize_step(&mut sample, &mut ctx));
        assert_eq!(sample.size(), 76);
    }

    #[test]
    fn trimmer_terminates_at_step_zero() {
        let trimmer = SimpleTrimmer;
        let mut sample = Sample::from_bytes(&[7; 64]);
        let mut ctx = trimmer.create_context(&sample).unwrap();

        let mut steps = 0;
        loop {
            let before = sample.size();
            if !trimmer.minimize_step(&mut sample, &mut ctx) {
                break;
            }
            assert!(sample.size() < before);
            trimmer.report_fail(&mut sample, &mut ctx);
            steps += 1;
            assert!(steps < 100, "trimmer failed to terminate");
        }
        assert!(sample.size() >= 1);
    }

    #[test]
    fn trimmer_accepted_steps_shrink_to_one_byte() {
        let trimmer = SimpleTrimmer;
        let mut sample = Sample::from_bytes(&[7; 50]);
        let mut ctx = trimmer.create_context(&sample).unwrap();

        while trimmer.minimize_step(&mut sample, &mut ctx) {
            trimmer.report_success(&mut sample, &mut ctx);
        }
        assert_eq!(sample.size(), 1);
    }

    const LIST_GRAMMAR: &str = "\
<root> = <repeat_item>
<item> = item
";

    fn encoded_list(grammar: &Arc<Grammar>, items: usize) -> (Sample, usize) {
        // Build root -> repeat_item -> item * N by hand for determinism
        use crate::grammar::{NodeKind, TreeNode};

        let root = grammar.symbol_id("root").unwrap();
        let repeat = grammar.symbol_id("repeat_item").unwrap();
        let item = grammar.symbol_id("item").unwrap();
        let literal: std::sync::Arc<[u8]> = b"item".to_vec().into();

        let item_nodes = (0..items)
            .map(|_| TreeNode {
                kind: NodeKind::Symbol(item),
                children: vec![TreeNode::literal(literal.clone())],
            })
            .collect();
        let tree = TreeNode {
            kind: NodeKind::Symbol(root),
            children: vec![TreeNode {
                kind: NodeKind::Symbol(repeat),
                children: item_nodes,
            }],
        };

        let mut sample = Sample::default();
        grammar.encode_sample(&tree, &mut sample).unwrap();
        let num_nodes = tree.num_nodes();
        (sample, num_nodes)
    }

    #[test]
    fn grammar_minimizer_removes_last_child_per_success() {
        let grammar = Arc::new(Grammar::from_str(LIST_GRAMMAR).unwrap());
        let (sample, initial_nodes) = encoded_list(&grammar, 3);

        let minimizer = GrammarMinimizer::new(grammar.clone(), 1);
        let mut ctx = minimizer.create_context(&sample).unwrap();

        let mut work = sample.clone();
        let mut successes = 0;
        while minimizer.minimize_step(&mut work, &mut ctx) {
            minimizer.report_success(&mut work, &mut ctx);
            successes += 1;
        }
        // Three item subtrees (2 nodes each) removed one at a time
        assert_eq!(successes, 3);

        let tree = grammar.decode_sample(&work).unwrap();
        assert_eq!(tree.num_nodes(), initial_nodes - 3 * 2);
        assert!(tree.children[0].children.is_empty());
    }

    #[test]
    fn grammar_minimizer_rolls_back_failed_steps() {
        let grammar = Arc::new(Grammar::from_str(LIST_GRAMMAR).unwrap());
        let (sample, initial_nodes) = encoded_list(&grammar, 3);

        let minimizer = GrammarMinimizer::new(grammar.clone(), 1);
        let mut ctx = minimizer.create_context(&sample).unwrap();

        let mut work = sample.clone();
        assert!(minimizer.minimize_step(&mut work, &mut ctx));
        minimizer.report_fail(&mut work, &mut ctx);

        if let MinimizerContext::Grammar(gctx) = &ctx {
            assert_eq!(gctx.tree.num_nodes(), initial_nodes);
        } else {
            panic!("grammar context expected");
        }
    }

    #[test]
    fn grammar_minimizer_stops_at_limit() {
        let grammar = Arc::new(Grammar::from_str(LIST_GRAMMAR).unwrap());
        let (sample, initial_nodes) = encoded_list(&grammar, 5);

        // A limit at the initial size means no steps at all
        let minimizer = GrammarMinimizer::new(grammar.clone(), initial_nodes);
        let mut ctx = minimizer.create_context(&sample).unwrap();
        let mut work = sample.clone();
        assert!(!minimizer.minimize_step(&mut work, &mut ctx));
    }
}
