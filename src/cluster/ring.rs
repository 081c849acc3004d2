//! Sorted token ring

use std::sync::Arc;

use super::node::Node;
use super::token::Token;

#[derive(Debug, Clone, Default)]
pub struct Ring {
    entries: Vec<(Token, Arc<Node>)>,
}

impl Ring {
    pub fn new<'a>(nodes: impl IntoIterator<Item = &'a Arc<Node>>) -> Self {
        let mut entries: Vec<(Token, Arc<Node>)> = nodes
            .into_iter()
            .flat_map(|node| node.tokens.iter().map(move |t| (*t, node.clone())))
            .collect();
        entries.sort_by_key(|(token, _)| *token);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Token, Arc<Node>)] {
        &self.entries
    }

    /// Index of the first entry with a token `>= token`, wrapping to 0
    pub fn primary_index(&self, token: Token) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.entries.partition_point(|(t, _)| *t < token);
        Some(if idx == self.entries.len() { 0 } else { idx })
    }

    pub fn primary(&self, token: Token) -> Option<&Arc<Node>> {
        self.primary_index(token).map(|i| &self.entries[i].1)
    }

    /// Every ring entry once, clockwise from the primary replica of `token`
    pub fn walk(&self, token: Token) -> impl Iterator<Item = &Arc<Node>> + '_ {
        let start = self.primary_index(token).unwrap_or(0);
        let len = self.entries.len();
        (0..len).map(move |i| &self.entries[(start + i) % len].1)
    }
}
