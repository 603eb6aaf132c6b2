//! Lineage identifiers ("cascade ids").
//!
//! Every item that flows through a pipeline is addressed by a
//! [`LineageId`] that encodes its full derivation path. The canonical string
//! form follows this grammar:
//!
//! ```text
//! root   := step_name ":count=" digits
//! chain  := id "/" step_name [":index=" digits]
//! merge  := "[" id ("|" id)* "]" "/" step_name
//! id     := root | chain | merge
//! ```
//!
//! # Examples
//!
//! ```text
//! gen:count=0                           root: first item of source `gen`
//! gen:count=0/xform                     chain: `xform` applied to it
//! gen:count=0/explode:index=2           chain: third output of a fan-out
//! [a:count=0|b:count=0]/merge_step      merge: joint input of a fan-in
//! ```
//!
//! Ids are values. Deriving the same parent through the same step with the
//! same index always yields the same string, so ids double as idempotency
//! keys. Merge parents are sorted by their canonical string (and
//! deduplicated) before serialization, which makes fan-in ids independent
//! of arrival order.
//!
//! All functions here are pure and safe to call from any number of workers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CascadeError, Result};

/// Characters with structural meaning in the id grammar.
const RESERVED: &[char] = &['/', ':', '[', ']', '|'];

/// A deterministic, write-once identifier for one item of pipeline data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LineageId {
    /// The `count`-th item emitted by a source step.
    Root {
        /// Source step name.
        step: String,
        /// Zero-based emission index.
        count: u64,
    },
    /// `step`'s output derived from `parent`.
    Chain {
        /// The id this output was derived from.
        parent: Box<LineageId>,
        /// Deriving step name.
        step: String,
        /// Position within a fan-out, if the step produced several outputs.
        index: Option<u64>,
    },
    /// `step`'s output derived jointly from several parents.
    Merge {
        /// Parents in canonical (sorted, deduplicated) order.
        parents: Vec<LineageId>,
        /// Consuming step name.
        step: String,
    },
}

/// Checks that `name` can be embedded in an id without breaking the grammar.
pub fn validate_step_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CascadeError::malformed(name, "empty step name"));
    }
    if let Some(c) = name.chars().find(|c| RESERVED.contains(c)) {
        return Err(CascadeError::malformed(
            name,
            format!("step name contains reserved character {c:?}"),
        ));
    }
    Ok(())
}

impl LineageId {
    /// Id of the `index`-th item emitted by source `step`.
    pub fn root(step: impl Into<String>, index: u64) -> Result<Self> {
        let step = step.into();
        validate_step_name(&step)?;
        Ok(LineageId::Root { step, count: index })
    }

    /// Id of `step`'s output derived from `parent`.
    ///
    /// `index` is set when one input fans out into several outputs.
    pub fn chain(parent: &LineageId, step: impl Into<String>, index: Option<u64>) -> Result<Self> {
        let step = step.into();
        validate_step_name(&step)?;
        Ok(LineageId::Chain {
            parent: Box::new(parent.clone()),
            step,
            index,
        })
    }

    /// Id of `step`'s output derived jointly from `parents`.
    ///
    /// Parents are sorted by canonical string and deduplicated, so the
    /// result does not depend on the order they arrived in.
    pub fn merge<I>(parents: I, step: impl Into<String>) -> Result<Self>
    where
        I: IntoIterator<Item = LineageId>,
    {
        let step = step.into();
        validate_step_name(&step)?;

        let mut keyed: Vec<(String, LineageId)> =
            parents.into_iter().map(|p| (p.to_string(), p)).collect();
        if keyed.is_empty() {
            return Err(CascadeError::malformed(
                &format!("[]/{step}"),
                "merge needs at least one parent",
            ));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);

        Ok(LineageId::Merge {
            parents: keyed.into_iter().map(|(_, p)| p).collect(),
            step,
        })
    }

    /// Parse the canonical string form.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = Parser::new(input);
        let id = parser.parse_id()?;
        if !parser.at_end() {
            return Err(parser.error(match parser.peek() {
                Some(']') => "unbalanced brackets".to_string(),
                Some(c) => format!("unexpected {c:?} at byte {}", parser.pos),
                None => "trailing input".to_string(),
            }));
        }
        Ok(id)
    }

    /// Canonical string form. Inverse of [`LineageId::parse`].
    pub fn format(&self) -> String {
        self.to_string()
    }

    /// Name of the step that produced this id (the last path segment).
    pub fn producing_step(&self) -> &str {
        match self {
            LineageId::Root { step, .. }
            | LineageId::Chain { step, .. }
            | LineageId::Merge { step, .. } => step,
        }
    }

    /// Fan-out position of the last link, if any.
    pub fn index(&self) -> Option<u64> {
        match self {
            LineageId::Chain { index, .. } => *index,
            _ => None,
        }
    }

    /// This id with the fan-out index of its last link removed.
    ///
    /// All outputs of one step invocation share the same base, which is
    /// what the ledger is keyed by.
    pub fn base(&self) -> LineageId {
        match self {
            LineageId::Chain {
                parent,
                step,
                index: Some(_),
            } => LineageId::Chain {
                parent: parent.clone(),
                step: step.clone(),
                index: None,
            },
            other => other.clone(),
        }
    }

    /// Direct ancestors of this id.
    pub fn parents(&self) -> &[LineageId] {
        match self {
            LineageId::Root { .. } => &[],
            LineageId::Chain { parent, .. } => std::slice::from_ref(parent.as_ref()),
            LineageId::Merge { parents, .. } => parents,
        }
    }

    /// Number of steps on the longest path from a root to this id.
    pub fn depth(&self) -> usize {
        match self {
            LineageId::Root { .. } => 1,
            LineageId::Chain { parent, .. } => parent.depth() + 1,
            LineageId::Merge { parents, .. } => {
                parents.iter().map(LineageId::depth).max().unwrap_or(0) + 1
            }
        }
    }

    /// Stable 64-bit hash of the canonical string.
    ///
    /// Uses the first 8 bytes of SHA-256 so the value is identical across
    /// processes, platforms, and compiler versions.
    pub fn routing_hash(&self) -> u64 {
        let digest = Sha256::digest(self.to_string().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }

    /// Source index followed by every fan-out index on the first-parent
    /// path, root first.
    ///
    /// `gen:count=3/split:index=1/upper` gives `[3, 1]`. Merges follow their
    /// first (smallest) parent. Fan-in steps pair inputs whose ordinals are
    /// equal, so pairing depends only on the ids.
    pub fn ordinals(&self) -> Vec<u64> {
        let mut ordinals = Vec::new();
        let mut current = self;
        loop {
            match current {
                LineageId::Root { count, .. } => {
                    ordinals.push(*count);
                    break;
                }
                LineageId::Chain { parent, index, .. } => {
                    ordinals.extend(*index);
                    current = &**parent;
                }
                LineageId::Merge { parents, .. } => match parents.first() {
                    Some(first) => current = first,
                    None => break,
                },
            }
        }
        ordinals.reverse();
        ordinals
    }
}

impl fmt::Display for LineageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineageId::Root { step, count } => write!(f, "{step}:count={count}"),
            LineageId::Chain {
                parent,
                step,
                index,
            } => {
                write!(f, "{parent}/{step}")?;
                if let Some(index) = index {
                    write!(f, ":index={index}")?;
                }
                Ok(())
            }
            LineageId::Merge { parents, step } => {
                f.write_str("[")?;
                for (i, parent) in parents.iter().enumerate() {
                    if i > 0 {
                        f.write_str("|")?;
                    }
                    write!(f, "{parent}")?;
                }
                write!(f, "]/{step}")
            }
        }
    }
}

impl FromStr for LineageId {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self> {
        LineageId::parse(s)
    }
}

impl TryFrom<String> for LineageId {
    type Error = CascadeError;

    fn try_from(value: String) -> Result<Self> {
        LineageId::parse(&value)
    }
}

impl From<LineageId> for String {
    fn from(id: LineageId) -> Self {
        id.to_string()
    }
}

// =============================================================================
// Parser
// =============================================================================

/// Deepest merge-bracket nesting the parser accepts.
pub const MAX_MERGE_NESTING: usize = 256;

/// Recursive-descent parser over the id grammar.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
    nesting: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            nesting: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> CascadeError {
        CascadeError::malformed(self.input, reason)
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect_literal(&mut self, literal: &str, reason: &str) -> Result<()> {
        if self.input[self.pos..].starts_with(literal) {
            self.pos += literal.len();
            Ok(())
        } else {
            Err(self.error(reason))
        }
    }

    fn parse_id(&mut self) -> Result<LineageId> {
        if self.at_end() {
            return Err(self.error("empty id"));
        }

        let mut id = if self.peek() == Some('[') {
            self.parse_merge()?
        } else {
            self.parse_root()?
        };

        while self.eat('/') {
            let step = self.parse_name()?;
            let index = if self.peek() == Some(':') {
                self.expect_literal(":index=", "expected \":index=\" after step name")?;
                Some(self.parse_digits()?)
            } else {
                None
            };
            id = LineageId::Chain {
                parent: Box::new(id),
                step,
                index,
            };
        }

        Ok(id)
    }

    fn parse_root(&mut self) -> Result<LineageId> {
        let step = self.parse_name()?;
        self.expect_literal(":count=", "missing count")?;
        let count = self.parse_digits()?;
        Ok(LineageId::Root { step, count })
    }

    fn parse_merge(&mut self) -> Result<LineageId> {
        self.eat('[');
        if self.nesting >= MAX_MERGE_NESTING {
            return Err(self.error(format!(
                "merge brackets nested deeper than {MAX_MERGE_NESTING}"
            )));
        }
        self.nesting += 1;
        let parents = self.parse_parents();
        self.nesting -= 1;
        let parents = parents?;
        if !self.eat(']') {
            return Err(self.error("unbalanced brackets"));
        }
        if !self.eat('/') {
            return Err(self.error("merge must be followed by \"/step_name\""));
        }
        let step = self.parse_name()?;
        LineageId::merge(parents, step).map_err(|e| match e {
            CascadeError::MalformedId { reason, .. } => self.error(reason),
            other => other,
        })
    }

    fn parse_parents(&mut self) -> Result<Vec<LineageId>> {
        let mut parents = vec![self.parse_id()?];
        while self.eat('|') {
            parents.push(self.parse_id()?);
        }
        Ok(parents)
    }

    fn parse_name(&mut self) -> Result<String> {
        let rest = &self.input[self.pos..];
        let end = rest.find(RESERVED).unwrap_or(rest.len());
        if end == 0 {
            return Err(self.error(match rest.chars().next() {
                Some('[') => "merge bracket must start an id".to_string(),
                _ => "empty step name".to_string(),
            }));
        }
        self.pos += end;
        Ok(rest[..end].to_string())
    }

    fn parse_digits(&mut self) -> Result<u64> {
        let rest = &self.input[self.pos..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let digits = &rest[..end];
        if digits.is_empty() {
            return Err(self.error("expected digits"));
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return Err(self.error(format!("non-canonical number {digits:?}")));
        }
        let value = digits
            .parse::<u64>()
            .map_err(|e| self.error(format!("invalid number {digits:?}: {e}")))?;
        self.pos += end;
        Ok(value)
    }
}
