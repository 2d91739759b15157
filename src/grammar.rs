//! Context-free grammar support for structured targets
//!
//! A grammar file is line oriented: `#` starts a comment and every
//! non-empty line reads `<Symbol> = <Part><Part>literal<Part>...` where
//! angle-bracketed tokens reference other symbols and bare text is
//! literal. Inside `<...>`, named constants (`lt`, `gt`, `hash`, `cr`,
//! `lf`, `crlf`, `space`, `tab`) and hex literals (`0xDEADBEEF`) decode
//! to fixed bytes. Symbols named `repeat_X` automatically repeat `X`
//! with a Bernoulli continuation.
//!
//! Samples produced from a grammar carry their derivation tree: the
//! encoded form is `[len:u64][flattened string][tree]` so the mutators
//! can recover the tree while the target only ever sees the flattened
//! string (the engine's output filter strips the prefix).

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::error::Error;
use crate::rng::Prng;
use crate::sample::Sample;
use crate::utils::{read_bytes, read_u64, write_bytes, write_u64};

/// Recursion limit for tree generation
pub const MAX_DEPTH: usize = 100;

/// Bernoulli continuation probability for repeat symbols
pub const REPEAT_PROBABILITY: f64 = 0.7;

/// Index of a symbol within the grammar's symbol table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(
    /// Position in the symbol table
    pub usize,
);

/// One element of a generator rule
#[derive(Debug, Clone)]
pub enum RulePart {
    /// Fixed bytes emitted verbatim
    Literal(Arc<[u8]>),

    /// Reference to another symbol
    Symbol(SymbolId),
}

/// One way to generate a symbol
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// The parts, materialized in order
    pub parts: Vec<RulePart>,
}

/// A grammar symbol with its generator rules
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Symbol name as written in the grammar file
    pub name: String,

    /// The alternative productions of this symbol
    pub generators: Vec<Rule>,

    /// For `repeat_X` symbols, the symbol being repeated
    pub repeat_symbol: Option<SymbolId>,

    /// True when some generator rule is empty
    pub can_be_empty: bool,

    /// Referenced from some rule (or is the root)
    used: bool,
}

/// A node in a derivation tree: a literal leaf or a symbol interior
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Fixed bytes
    Literal(Arc<[u8]>),

    /// A generated symbol; its expansion is the children
    Symbol(SymbolId),
}

/// A derivation tree produced from the grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Leaf bytes or interior symbol
    pub kind: NodeKind,

    /// Ordered children; empty for literal leaves
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Create a literal leaf
    #[must_use]
    pub fn literal(bytes: Arc<[u8]>) -> Self {
        TreeNode {
            kind: NodeKind::Literal(bytes),
            children: Vec::new(),
        }
    }

    /// Number of nodes in this subtree, including `self`
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        1 + self.children.iter().map(TreeNode::num_nodes).sum::<usize>()
    }

    /// The symbol id of an interior node
    #[must_use]
    pub fn symbol(&self) -> Option<SymbolId> {
        match self.kind {
            NodeKind::Symbol(id) => Some(id),
            NodeKind::Literal(_) => None,
        }
    }
}

/// A parsed grammar: the symbol table plus the byte-level constants
#[derive(Debug)]
pub struct Grammar {
    /// All symbols, indexed by [`SymbolId`]
    symbols: Vec<Symbol>,

    /// Name to id lookup
    by_name: HashMap<String, SymbolId>,

    /// Named byte constants usable inside `<...>`
    constants: HashMap<&'static str, &'static [u8]>,

    /// Interned literal byte strings
    literal_cache: HashMap<Vec<u8>, Arc<[u8]>>,
}

impl Grammar {
    /// Create an empty grammar with the default constants
    #[must_use]
    pub fn new() -> Self {
        let mut constants: HashMap<&'static str, &'static [u8]> = HashMap::new();
        constants.insert("lt", b"<");
        constants.insert("gt", b">");
        constants.insert("hash", b"#");
        constants.insert("cr", b"\x0d");
        constants.insert("lf", b"\x0a");
        constants.insert("crlf", b"\x0d\x0a");
        constants.insert("space", b" ");
        constants.insert("tab", b"\t");

        Grammar {
            symbols: Vec::new(),
            by_name: HashMap::new(),
            constants,
            literal_cache: HashMap::new(),
        }
    }

    /// Parse a grammar file. Malformed grammars are fatal at startup.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Parse grammar text
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self> {
        let mut grammar = Grammar::new();
        for (lineno, line) in text.lines().enumerate() {
            grammar.parse_line(line, lineno)?;
        }
        grammar.analyze();
        grammar.check()?;
        Ok(grammar)
    }

    /// The symbol with the given name
    #[must_use]
    pub fn symbol_id(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    /// The symbol table entry for `id`
    #[must_use]
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    fn get_or_create_symbol(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = SymbolId(self.symbols.len());
        self.symbols.push(Symbol {
            name: name.to_string(),
            generators: Vec::new(),
            repeat_symbol: None,
            can_be_empty: false,
            used: false,
        });
        self.by_name.insert(name.to_string(), id);

        if let Some(repeated) = name.strip_prefix("repeat_") {
            let repeated = repeated.to_string();
            let repeated_id = self.get_or_create_symbol(&repeated);
            self.symbols[repeated_id.0].used = true;
            self.symbols[id.0].repeat_symbol = Some(repeated_id);
        }

        id
    }

    fn intern(&mut self, bytes: Vec<u8>) -> Arc<[u8]> {
        if let Some(cached) = self.literal_cache.get(&bytes) {
            return cached.clone();
        }
        let arc: Arc<[u8]> = bytes.clone().into();
        self.literal_cache.insert(bytes, arc.clone());
        arc
    }

    /// Append a part to `rule`, resolving constants and hex literals and
    /// merging adjacent literals
    fn add_rule_part(&mut self, rule: &mut Vec<(bool, Vec<u8>)>, is_symbol: bool, value: &str) -> bool {
        if is_symbol {
            // A bracketed token may turn out to be literal text: a named
            // constant or a hex literal
            if let Some(constant) = self.constants.get(value).copied() {
                self.push_literal(rule, constant);
                return true;
            }
            if let Some(hex) = value.strip_prefix("0x") {
                let Some(decoded) = decode_hex(hex) else {
                    return false;
                };
                self.push_literal(rule, &decoded);
                return true;
            }
            rule.push((true, value.as_bytes().to_vec()));
            true
        } else {
            self.push_literal(rule, value.as_bytes());
            true
        }
    }

    fn push_literal(&mut self, rule: &mut Vec<(bool, Vec<u8>)>, bytes: &[u8]) {
        if let Some((false, last)) = rule.last_mut().map(|(s, v)| (*s, v)) {
            last.extend_from_slice(bytes);
            return;
        }
        rule.push((false, bytes.to_vec()));
    }

    fn parse_line(&mut self, line: &str, lineno: usize) -> Result<()> {
        // Strip comments and trailing whitespace
        let clean = line.split('#').next().unwrap_or("").trim_end();
        if clean.trim().is_empty() {
            return Ok(());
        }

        let malformed = || Error::MalformedGrammar {
            line: lineno,
            text: line.to_string(),
        };

        let rest = clean.trim_start();
        let rest = rest.strip_prefix('<').ok_or_else(malformed)?;
        let (generates, rest) = rest.split_once('>').ok_or_else(malformed)?;
        if generates.is_empty() {
            bail!(malformed());
        }

        let rest = rest.trim_start();
        let mut rest = rest.strip_prefix('=').ok_or_else(malformed)?;
        // A single space or tab separates '=' from the first part
        if let Some(stripped) = rest.strip_prefix([' ', '\t']) {
            rest = stripped;
        }

        // Alternate between <symbol> tokens and literal runs
        let mut raw_parts: Vec<(bool, Vec<u8>)> = Vec::new();
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('<') {
                let (token, tail) = after.split_once('>').ok_or_else(malformed)?;
                if token.is_empty() || !self.add_rule_part(&mut raw_parts, true, token) {
                    bail!(malformed());
                }
                rest = tail;
            } else {
                let end = rest.find('<').unwrap_or(rest.len());
                self.add_rule_part(&mut raw_parts, false, &rest[..end]);
                rest = &rest[end..];
            }
        }

        // Resolve symbol references and intern literals
        let mut rule = Rule::default();
        for (is_symbol, value) in raw_parts {
            if is_symbol {
                let name = String::from_utf8(value).map_err(|_| malformed())?;
                let id = self.get_or_create_symbol(&name);
                self.symbols[id.0].used = true;
                rule.parts.push(RulePart::Symbol(id));
            } else {
                let literal = self.intern(value);
                rule.parts.push(RulePart::Literal(literal));
            }
        }

        let target = self.get_or_create_symbol(generates);
        self.symbols[target.0].generators.push(rule);
        Ok(())
    }

    /// Mark symbols that can derive the empty string through some rule
    fn analyze(&mut self) {
        for symbol in &mut self.symbols {
            symbol.can_be_empty = symbol.generators.iter().any(|rule| rule.parts.is_empty());
        }
    }

    /// Well-formedness: every non-repeat symbol needs a generator
    fn check(&self) -> Result<()> {
        for symbol in &self.symbols {
            if symbol.generators.is_empty() && symbol.repeat_symbol.is_none() {
                bail!(Error::EmptyGrammarSymbol(symbol.name.clone()));
            }
            if !symbol.used && symbol.name != "root" {
                log::warn!("Unused grammar symbol: {}", symbol.name);
            }
        }
        Ok(())
    }

    /// Generate a derivation tree for `symbol`. Returns `None` when the
    /// depth cap is hit; callers retry.
    pub fn generate_tree(
        &self,
        symbol: SymbolId,
        prng: &mut dyn Prng,
        depth: usize,
    ) -> Option<TreeNode> {
        if depth > MAX_DEPTH {
            return None;
        }

        let sym = &self.symbols[symbol.0];
        let mut node = TreeNode {
            kind: NodeKind::Symbol(symbol),
            children: Vec::new(),
        };

        if let Some(repeated) = sym.repeat_symbol {
            loop {
                if prng.rand_real() > REPEAT_PROBABILITY {
                    break;
                }
                let child = self.generate_tree(repeated, prng, depth + 1)?;
                node.children.push(child);
            }
            return Some(node);
        }

        let rule = &sym.generators[prng.rand_u32() as usize % sym.generators.len()];
        for part in &rule.parts {
            match part {
                RulePart::Symbol(child_symbol) => {
                    let child = self.generate_tree(*child_symbol, prng, depth + 1)?;
                    node.children.push(child);
                }
                RulePart::Literal(bytes) => {
                    node.children.push(TreeNode::literal(bytes.clone()));
                }
            }
        }
        Some(node)
    }

    /// Generate a tree for the named symbol
    pub fn generate_tree_for(&self, name: &str, prng: &mut dyn Prng) -> Result<Option<TreeNode>> {
        let id = self
            .symbol_id(name)
            .ok_or_else(|| Error::UnknownGrammarSymbol(name.to_string()))?;
        Ok(self.generate_tree(id, prng, 0))
    }

    /// Flatten a tree into the string the target consumes
    pub fn to_bytes(&self, tree: &TreeNode, out: &mut Vec<u8>) {
        match &tree.kind {
            NodeKind::Literal(bytes) => out.extend_from_slice(bytes),
            NodeKind::Symbol(_) => {
                for child in &tree.children {
                    self.to_bytes(child, out);
                }
            }
        }
    }

    fn encode_tree(&self, tree: &TreeNode, out: &mut Vec<u8>) -> Result<()> {
        match &tree.kind {
            NodeKind::Literal(bytes) => {
                out.push(0);
                write_bytes(out, bytes)?;
            }
            NodeKind::Symbol(id) => {
                out.push(1);
                write_bytes(out, self.symbols[id.0].name.as_bytes())?;
            }
        }
        write_u64(out, tree.children.len() as u64)?;
        for child in &tree.children {
            self.encode_tree(child, out)?;
        }
        Ok(())
    }

    fn decode_tree(&self, r: &mut Cursor<&[u8]>) -> Result<TreeNode> {
        let mut kind_byte = [0_u8; 1];
        std::io::Read::read_exact(r, &mut kind_byte)?;

        let kind = match kind_byte[0] {
            0 => {
                let bytes = read_bytes(r)?;
                NodeKind::Literal(bytes.into())
            }
            1 => {
                let name = String::from_utf8(read_bytes(r)?)?;
                let id = self
                    .symbol_id(&name)
                    .ok_or_else(|| Error::UnknownGrammarSymbol(name))?;
                NodeKind::Symbol(id)
            }
            other => bail!("Invalid tree node type {other}"),
        };

        let num_children = read_u64(r)?;
        let mut children = Vec::with_capacity(num_children.min(1024) as usize);
        for _ in 0..num_children {
            children.push(self.decode_tree(r)?);
        }

        Ok(TreeNode { kind, children })
    }

    /// Encode a tree into a sample: the flattened string, length-prefixed,
    /// followed by the tree itself
    pub fn encode_sample(&self, tree: &TreeNode, sample: &mut Sample) -> Result<()> {
        let mut flattened = Vec::new();
        self.to_bytes(tree, &mut flattened);

        let mut buf = Vec::with_capacity(flattened.len() + 64);
        write_bytes(&mut buf, &flattened)?;
        self.encode_tree(tree, &mut buf)?;

        sample.init(&buf);
        Ok(())
    }

    /// Decode the derivation tree out of an encoded sample
    pub fn decode_sample(&self, sample: &Sample) -> Result<TreeNode> {
        let bytes = sample.bytes().unwrap_or(&[]);
        let mut cursor = Cursor::new(bytes);
        let _flattened = read_bytes(&mut cursor)?;
        self.decode_tree(&mut cursor)
    }

    /// Extract just the flattened string from an encoded sample; this is
    /// what the output filter delivers to the target
    pub fn flattened_from_sample(sample: &Sample) -> Result<Vec<u8>> {
        let bytes = sample.bytes().unwrap_or(&[]);
        read_bytes(&mut Cursor::new(bytes))
    }
}

impl Default for Grammar {
    fn default() -> Self {
        Grammar::new()
    }
}

/// Decode an even-length hex string into raw bytes
fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push((hi * 16 + lo) as u8);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Mt19937;
    use rand::SeedableRng;

    const TEST_GRAMMAR: &str = "\
# html-ish test grammar
<root> = <lt>html<gt><repeat_tag><lt>/html<gt>
<tag> = <lt>p<gt><text><lt>/p<gt>
<text> = hello
<text> = world
<text> =
<magic> = <0x1337>
";

    #[test]
    fn parses_symbols_constants_and_hex() {
        let grammar = Grammar::from_str(TEST_GRAMMAR).unwrap();

        let root = grammar.symbol_id("root").unwrap();
        assert_eq!(grammar.symbol(root).generators.len(), 1);

        // <lt>html<gt> merges into one literal
        let rule = &grammar.symbol(root).generators[0].parts;
        match &rule[0] {
            RulePart::Literal(bytes) => assert_eq!(&bytes[..], b"<html>"),
            RulePart::Symbol(_) => panic!("expected merged literal"),
        }

        let magic = grammar.symbol_id("magic").unwrap();
        match &grammar.symbol(magic).generators[0].parts[0] {
            RulePart::Literal(bytes) => assert_eq!(&bytes[..], &[0x13, 0x37]),
            RulePart::Symbol(_) => panic!("expected hex literal"),
        }
    }

    #[test]
    fn repeat_symbols_are_recognized() {
        let grammar = Grammar::from_str(TEST_GRAMMAR).unwrap();
        let repeat = grammar.symbol_id("repeat_tag").unwrap();
        let tag = grammar.symbol_id("tag").unwrap();
        assert_eq!(grammar.symbol(repeat).repeat_symbol, Some(tag));
    }

    #[test]
    fn empty_rule_marks_can_be_empty() {
        let grammar = Grammar::from_str(TEST_GRAMMAR).unwrap();
        let text = grammar.symbol_id("text").unwrap();
        assert!(grammar.symbol(text).can_be_empty);
        let tag = grammar.symbol_id("tag").unwrap();
        assert!(!grammar.symbol(tag).can_be_empty);
    }

    #[test]
    fn symbol_without_generators_is_rejected() {
        let err = Grammar::from_str("<root> = <missing>\n").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(Grammar::from_str("root = nope\n").is_err());
        assert!(Grammar::from_str("<root = x\n").is_err());
    }

    #[test]
    fn generated_trees_flatten_to_valid_strings() {
        let grammar = Grammar::from_str(TEST_GRAMMAR).unwrap();
        let mut rng = Mt19937::from_seed([3; 16]);

        let tree = grammar
            .generate_tree_for("root", &mut rng)
            .unwrap()
            .expect("generation should succeed at depth 0");

        let mut out = Vec::new();
        grammar.to_bytes(&tree, &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("<html>"));
        assert!(text.ends_with("</html>"));
    }

    #[test]
    fn encoded_sample_roundtrip_and_flatten() {
        let grammar = Grammar::from_str(TEST_GRAMMAR).unwrap();
        let mut rng = Mt19937::from_seed([9; 16]);
        let tree = grammar
            .generate_tree_for("root", &mut rng)
            .unwrap()
            .unwrap();

        let mut sample = Sample::default();
        grammar.encode_sample(&tree, &mut sample).unwrap();

        let decoded = grammar.decode_sample(&sample).unwrap();
        assert_eq!(decoded.num_nodes(), tree.num_nodes());

        let mut expected = Vec::new();
        grammar.to_bytes(&tree, &mut expected);
        assert_eq!(Grammar::flattened_from_sample(&sample).unwrap(), expected);
    }

    #[test]
    fn num_nodes_counts_the_whole_subtree() {
        let leaf = TreeNode::literal(b"x".to_vec().into());
        assert_eq!(leaf.num_nodes(), 1);

        let parent = TreeNode {
            kind: NodeKind::Symbol(SymbolId(0)),
            children: vec![leaf.clone(), leaf.clone(), leaf],
        };
        assert_eq!(parent.num_nodes(), 4);
    }
}
