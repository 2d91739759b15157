//! Grammar-tree mutation
//!
//! Works on the derivation tree carried inside encoded samples rather
//! than on raw bytes. Five operations: regenerate the whole tree, replace
//! a random interior node with a fresh generation of the same symbol,
//! splice an equivalent subtree from another interesting tree, grow or
//! shrink a repeat node, and splice a run of repeat children from another
//! tree. Trees that earned a place in the corpus are snapshotted into a
//! shared [`TreeRegistry`] that the splice operations draw from.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::grammar::{Grammar, NodeKind, SymbolId, TreeNode, MAX_DEPTH, REPEAT_PROBABILITY};
use crate::mutators::{Mutator, MutatorContext};
use crate::rng::Prng;
use crate::sample::Sample;

/// Probability of doing another mutation on the same tree
const MUTATOR_REPEAT_PROB: f64 = 0.5;

/// Per-level decay of mutation candidate probability
const DEPTH_DECAY: f64 = 1.4;

/// Mutation attempts before giving up on a tree
const MAX_MUTATE_ATTEMPTS: usize = 100;

/// Shared pool of derivation trees with unique coverage. Readers clone
/// subtrees on consumption; the snapshots themselves are immutable.
#[derive(Default)]
pub struct TreeRegistry {
    trees: Mutex<Vec<Arc<TreeNode>>>,
}

impl TreeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        TreeRegistry::default()
    }

    /// Add an interesting tree snapshot
    pub fn register(&self, tree: Arc<TreeNode>) {
        self.trees.lock().unwrap().push(tree);
    }

    /// A uniformly random snapshot, if any exist
    pub fn random(&self, prng: &mut dyn Prng) -> Option<Arc<TreeNode>> {
        let trees = self.trees.lock().unwrap();
        if trees.is_empty() {
            return None;
        }
        Some(trees[prng.rand_u32() as usize % trees.len()].clone())
    }

    /// Number of registered trees
    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.lock().unwrap().len()
    }

    /// True when no tree has been registered yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The grammar mutator's per-sample state: the decoded derivation tree
pub struct GrammarContext {
    /// Derivation tree of the corpus sample
    pub tree: TreeNode,
}

/// A node eligible for mutation, addressed by its path from the root
struct MutationCandidate {
    /// Child indices from the root to the node
    path: Vec<usize>,

    /// Depth of the node within the tree
    depth: usize,

    /// Selection probability weight
    p: f64,
}

/// Walk to the node addressed by `path`
fn node_at_path<'a>(tree: &'a mut TreeNode, path: &[usize]) -> &'a mut TreeNode {
    let mut node = tree;
    for &index in path {
        node = &mut node.children[index];
    }
    node
}

/// Immutable walk to the node addressed by `path`
fn node_at_path_ref<'a>(tree: &'a TreeNode, path: &[usize]) -> &'a TreeNode {
    let mut node = tree;
    for &index in path {
        node = &node.children[index];
    }
    node
}

/// Mutates encoded grammar samples through their derivation trees
pub struct GrammarMutator {
    grammar: Arc<Grammar>,
    registry: Arc<TreeRegistry>,
    root: SymbolId,
}

impl GrammarMutator {
    /// Create a grammar mutator drawing splice material from `registry`
    pub fn new(grammar: Arc<Grammar>, registry: Arc<TreeRegistry>) -> Result<Self> {
        let root = grammar
            .symbol_id("root")
            .context("Grammar has no <root> symbol")?;
        Ok(GrammarMutator {
            grammar,
            registry,
            root,
        })
    }

    /// Collect mutation candidates under `node`. `filter` restricts to a
    /// single symbol, `just_repeat` to repeat nodes; probability decays
    /// geometrically with depth.
    fn collect_candidates(
        &self,
        candidates: &mut Vec<MutationCandidate>,
        node: &TreeNode,
        filter: Option<SymbolId>,
        path: &mut Vec<usize>,
        depth: usize,
        max_depth: usize,
        p: f64,
        just_repeat: bool,
    ) {
        if depth > max_depth {
            return;
        }
        let Some(symbol) = node.symbol() else {
            return;
        };

        if filter.is_none() || filter == Some(symbol) {
            let is_repeat = self.grammar.symbol(symbol).repeat_symbol.is_some();
            if !just_repeat || is_repeat {
                candidates.push(MutationCandidate {
                    path: path.clone(),
                    depth,
                    p,
                });
            }
        }

        for (index, child) in node.children.iter().enumerate() {
            if matches!(child.kind, NodeKind::Literal(_)) {
                continue;
            }
            path.push(index);
            self.collect_candidates(
                candidates,
                child,
                filter,
                path,
                depth + 1,
                max_depth,
                p / DEPTH_DECAY,
                just_repeat,
            );
            path.pop();
        }
    }

    fn candidates_for(
        &self,
        tree: &TreeNode,
        filter: Option<SymbolId>,
        max_depth: usize,
        just_repeat: bool,
    ) -> Vec<MutationCandidate> {
        let mut candidates = Vec::new();
        let mut path = Vec::new();
        self.collect_candidates(
            &mut candidates,
            tree,
            filter,
            &mut path,
            0,
            max_depth,
            1.0,
            just_repeat,
        );
        candidates
    }

    /// Weighted pick over candidate probabilities
    fn pick_candidate<'a>(
        candidates: &'a [MutationCandidate],
        prng: &mut dyn Prng,
    ) -> Option<&'a MutationCandidate> {
        if candidates.is_empty() {
            return None;
        }
        let psum: f64 = candidates.iter().map(|c| c.p).sum();
        if psum == 0.0 {
            return None;
        }
        let p = prng.rand_real() * psum;
        let mut sum = 0.0;
        for (i, candidate) in candidates.iter().enumerate() {
            sum += candidate.p;
            if p < sum || i == candidates.len() - 1 {
                return Some(candidate);
            }
        }
        None
    }

    /// Regenerate a random node from its own symbol at the same depth
    fn replace_node(&self, tree: &mut TreeNode, prng: &mut dyn Prng) -> bool {
        let candidates = self.candidates_for(tree, None, MAX_DEPTH, false);
        let Some(candidate) = Self::pick_candidate(&candidates, prng) else {
            return false;
        };

        let node = node_at_path(tree, &candidate.path);
        let symbol = node.symbol().unwrap();
        match self.grammar.generate_tree(symbol, prng, candidate.depth) {
            Some(replacement) => {
                *node = replacement;
                true
            }
            None => false,
        }
    }

    /// Replace a node with an equivalent subtree from another tree
    fn splice(&self, tree: &mut TreeNode, prng: &mut dyn Prng) -> bool {
        let candidates = self.candidates_for(tree, None, MAX_DEPTH, false);
        let Some(candidate) = Self::pick_candidate(&candidates, prng) else {
            return false;
        };
        let symbol = node_at_path_ref(tree, &candidate.path).symbol().unwrap();

        let Some(other_tree) = self.registry.random(prng) else {
            return false;
        };
        let other_candidates =
            self.candidates_for(&other_tree, Some(symbol), candidate.depth, false);
        let Some(other_candidate) = Self::pick_candidate(&other_candidates, prng) else {
            return false;
        };

        let replacement = node_at_path_ref(&other_tree, &other_candidate.path).clone();
        *node_at_path(tree, &candidate.path) = replacement;
        true
    }

    /// Delete and/or insert children at a repeat node
    fn repeat_mutate(&self, tree: &mut TreeNode, prng: &mut dyn Prng) -> bool {
        let candidates = self.candidates_for(tree, None, MAX_DEPTH, true);
        let Some(candidate) = Self::pick_candidate(&candidates, prng) else {
            return false;
        };
        let depth = candidate.depth;
        let path = candidate.path.clone();

        let symbol = node_at_path_ref(tree, &path).symbol().unwrap();
        let repeat_symbol = self.grammar.symbol(symbol).repeat_symbol.unwrap();

        let select = prng.rand_real();
        let (do_delete, do_insert) = if select < 0.2 {
            (true, false)
        } else if select < 0.4 {
            (true, true)
        } else {
            (false, true)
        };

        // Generate first so a failed generation leaves the tree untouched
        let mut new_children = Vec::new();
        if do_insert {
            loop {
                if let Some(child) = self.grammar.generate_tree(repeat_symbol, prng, depth + 1) {
                    new_children.push(child);
                }
                if prng.rand_real() > REPEAT_PROBABILITY {
                    break;
                }
            }
            if new_children.is_empty() {
                return false;
            }
        }

        let node = node_at_path(tree, &path);
        let mut position = 0;
        if !node.children.is_empty() {
            position = prng.rand_u32() as usize % node.children.len();
        }

        if do_delete {
            while position < node.children.len() {
                node.children.remove(position);
                if prng.rand_real() > REPEAT_PROBABILITY {
                    break;
                }
            }
        }

        if do_insert {
            let insert_at = (position + 1).min(node.children.len());
            node.children.splice(insert_at..insert_at, new_children);
        }

        true
    }

    /// Mix a run of children from another tree's compatible repeat node
    fn repeat_splice(&self, tree: &mut TreeNode, prng: &mut dyn Prng) -> bool {
        let candidates = self.candidates_for(tree, None, MAX_DEPTH, true);
        let Some(candidate) = Self::pick_candidate(&candidates, prng) else {
            return false;
        };
        let path = candidate.path.clone();
        let symbol = node_at_path_ref(tree, &path).symbol().unwrap();

        let Some(other_tree) = self.registry.random(prng) else {
            return false;
        };
        let other_candidates =
            self.candidates_for(&other_tree, Some(symbol), candidate.depth, true);
        let Some(other_candidate) = Self::pick_candidate(&other_candidates, prng) else {
            return false;
        };
        let other_node = node_at_path_ref(&other_tree, &other_candidate.path);

        let node = node_at_path(tree, &path);
        let mut position = 0;
        if !node.children.is_empty() {
            position = prng.rand_u32() as usize % node.children.len();
        }
        let mut other_position = 0;
        if !other_node.children.is_empty() {
            other_position = prng.rand_u32() as usize % other_node.children.len();
        }

        if prng.rand_real() < 0.4 {
            while position < node.children.len() {
                node.children.remove(position);
                if prng.rand_real() > REPEAT_PROBABILITY {
                    break;
                }
            }
        }

        let mut insert_at = (position + 1).min(node.children.len());
        for other_child in &other_node.children[other_position.min(other_node.children.len())..] {
            node.children.insert(insert_at, other_child.clone());
            insert_at += 1;
            if prng.rand_real() > REPEAT_PROBABILITY {
                break;
            }
        }

        true
    }

    /// Generate a tree from `root`, retrying until an attempt fits the
    /// depth cap
    fn generate_tree_no_fail(&self, prng: &mut dyn Prng) -> TreeNode {
        let mut attempts = 0_usize;
        loop {
            if attempts > 0 && attempts % 100 == 0 {
                log::warn!("Repeatedly failing to generate sample from grammar");
            }
            if let Some(tree) = self.grammar.generate_tree(self.root, prng, 0) {
                return tree;
            }
            attempts += 1;
        }
    }
}

impl Mutator for GrammarMutator {
    fn create_context(&self, sample: &Sample) -> Result<MutatorContext> {
        let tree = self
            .grammar
            .decode_sample(sample)
            .context("Error decoding grammar sample")?;

        // Contexts are only created for interesting samples, so this is
        // the registration point for splice material
        self.registry.register(Arc::new(tree.clone()));

        Ok(MutatorContext::Grammar(GrammarContext { tree }))
    }

    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        _all_samples: &[Arc<Sample>],
    ) -> bool {
        let MutatorContext::Grammar(gctx) = ctx else {
            return false;
        };

        // In a small number of cases regenerate from scratch instead of
        // mutating
        if prng.rand_real() < 0.1 {
            if let Some(generated) = self.grammar.generate_tree(self.root, prng, 0) {
                return self.grammar.encode_sample(&generated, sample).is_ok();
            }
        }

        let mut tree = gctx.tree.clone();
        let mut success = false;

        for _ in 0..MAX_MUTATE_ATTEMPTS {
            let select = prng.rand_real();
            let mutated = if select < 0.3 {
                self.replace_node(&mut tree, prng)
            } else if select < 0.5 {
                self.splice(&mut tree, prng)
            } else if select < 0.8 {
                self.repeat_mutate(&mut tree, prng)
            } else {
                self.repeat_splice(&mut tree, prng)
            };

            if mutated {
                success = true;
                // Flip a coin and potentially do another round
                if prng.rand_real() > MUTATOR_REPEAT_PROB {
                    break;
                }
            }
        }

        if !success {
            log::warn!("Repeatedly failing to mutate a sample. Check grammar.");
        }

        self.grammar.encode_sample(&tree, sample).is_ok()
    }

    fn can_generate(&self) -> bool {
        true
    }

    fn generate(&mut self, sample: &mut Sample, prng: &mut dyn Prng) -> bool {
        let tree = self.generate_tree_no_fail(prng);
        self.grammar.encode_sample(&tree, sample).is_ok()
    }

    // The tree is recovered from the sample bytes on restore, so the
    // context itself carries nothing to persist
    fn save_context(&self, _ctx: &MutatorContext, _w: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    fn load_context(&self, _ctx: &mut MutatorContext, _r: &mut dyn Read) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Mt19937;
    use rand::SeedableRng;

    const TEST_GRAMMAR: &str = "\
<root> = BEGIN <repeat_item> END
<item> = item(<value>)<space>
<value> = 1
<value> = 2
<value> = 3
";

    fn mutator() -> (GrammarMutator, Arc<TreeRegistry>) {
        let grammar = Arc::new(Grammar::from_str(TEST_GRAMMAR).unwrap());
        let registry = Arc::new(TreeRegistry::new());
        (
            GrammarMutator::new(grammar, registry.clone()).unwrap(),
            registry,
        )
    }

    #[test]
    fn generated_samples_decode_and_flatten() {
        let (mut mutator, _registry) = mutator();
        let mut rng = Mt19937::from_seed([1; 16]);

        let mut sample = Sample::default();
        assert!(mutator.generate(&mut sample, &mut rng));

        let flattened = Grammar::flattened_from_sample(&sample).unwrap();
        let text = String::from_utf8(flattened).unwrap();
        assert!(text.starts_with("BEGIN "));
        assert!(text.ends_with("END"));
    }

    #[test]
    fn create_context_registers_interesting_tree() {
        let (mut mutator, registry) = mutator();
        let mut rng = Mt19937::from_seed([2; 16]);

        let mut sample = Sample::default();
        mutator.generate(&mut sample, &mut rng);
        assert!(registry.is_empty());

        let ctx = mutator.create_context(&sample).unwrap();
        assert_eq!(registry.len(), 1);
        match ctx {
            MutatorContext::Grammar(gctx) => assert!(gctx.tree.num_nodes() >= 1),
            _ => panic!("grammar context expected"),
        }
    }

    #[test]
    fn mutate_keeps_samples_well_formed() {
        let (mut mutator, _registry) = mutator();
        let mut rng = Mt19937::from_seed([3; 16]);

        let mut sample = Sample::default();
        mutator.generate(&mut sample, &mut rng);
        let mut ctx = mutator.create_context(&sample).unwrap();

        for _ in 0..50 {
            let mut work = sample.clone();
            assert!(mutator.mutate(&mut work, &mut ctx, &mut rng, &[]));

            // Every mutated sample still decodes to a tree whose
            // flattening matches the embedded string
            let grammar = Grammar::from_str(TEST_GRAMMAR).unwrap();
            let tree = grammar.decode_sample(&work).unwrap();
            let mut flattened = Vec::new();
            grammar.to_bytes(&tree, &mut flattened);
            assert_eq!(Grammar::flattened_from_sample(&work).unwrap(), flattened);
        }
    }

    #[test]
    fn mutation_changes_trees_over_time() {
        let (mut mutator, _registry) = mutator();
        let mut rng = Mt19937::from_seed([4; 16]);

        let mut sample = Sample::default();
        mutator.generate(&mut sample, &mut rng);
        let mut ctx = mutator.create_context(&sample).unwrap();

        let original = Grammar::flattened_from_sample(&sample).unwrap();
        let mut changed = false;
        for _ in 0..50 {
            let mut work = sample.clone();
            mutator.mutate(&mut work, &mut ctx, &mut rng, &[]);
            if Grammar::flattened_from_sample(&work).unwrap() != original {
                changed = true;
                break;
            }
        }
        assert!(changed, "mutation never altered the flattened sample");
    }
}
