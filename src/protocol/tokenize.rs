//! `TokenizeRefiner`: merges adjacent leaf runs of "token" bytes into a
//! single node, depth-gated so the refinement doesn't collapse structure
//! the tree has already discovered at a shallower level (spec §4.7).
//! Ported directly from
//! `Prophet/protocol/analyzers/tokenize_refiner.cpp`.

use std::collections::HashMap;

use super::message::Message;
use super::msgtree::{MessageTree, MessageTreeNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ascii,
    Binary,
}

pub struct TokenizeRefiner<'a> {
    msg: &'a Message,
    msg_type: MessageType,
    depth: usize,
    node_depth: HashMap<*const MessageTreeNode, usize>,
}

impl<'a> TokenizeRefiner<'a> {
    pub fn new(msg: &'a Message, msg_type: MessageType, depth: usize) -> Self {
        TokenizeRefiner {
            msg,
            msg_type,
            depth,
            node_depth: HashMap::new(),
        }
    }

    pub fn is_token_char(&self, ch: u8) -> bool {
        match self.msg_type {
            MessageType::Ascii => !(ch as char).is_whitespace() && !(ch as char).is_control(),
            MessageType::Binary => (0x20..=0x7f).contains(&ch) || ch == 0x0a || ch == 0x0d,
        }
    }

    fn is_token_run(&self, l: usize, r: usize) -> bool {
        (l..=r).all(|i| self.is_token_char(self.msg.get(i)))
    }

    /// Two leaves can be merged into one token run if both are pure token
    /// runs, and neither is a lone literal space.
    pub fn can_concatenate(&self, l: &MessageTreeNode, r: &MessageTreeNode) -> bool {
        if !l.is_leaf() || !r.is_leaf() {
            return false;
        }
        if l.l == l.r && self.msg.get(l.l) == b' ' {
            return false;
        }
        if r.l == r.r && self.msg.get(r.l) == b' ' {
            return false;
        }
        self.is_token_run(l.l, l.r) && self.is_token_run(r.l, r.r)
    }

    fn calculate_depth(&mut self, node: &MessageTreeNode) -> usize {
        if node.is_leaf() {
            self.node_depth.insert(node as *const _, 0);
            return 0;
        }
        let mut d = 0;
        for child in &node.children {
            let cd = self.calculate_depth(child);
            d = d.max(cd);
        }
        self.node_depth.insert(node as *const _, d + 1);
        d + 1
    }

    fn depth_of(&self, node: &MessageTreeNode) -> usize {
        *self.node_depth.get(&(node as *const _)).unwrap_or(&0)
    }

    /// Refines `node` in place: adjacent children whose subtree-depth is
    /// below the configured cutoff and which can be concatenated are
    /// merged into a single node covering their combined range. If every
    /// child collapses into one, the node itself becomes a leaf.
    fn refine_node(&self, node: &mut MessageTreeNode) {
        if node.is_leaf() {
            return;
        }

        let mut new_children: Vec<MessageTreeNode> = Vec::new();
        new_children.push(node.children[0].clone());

        for child in node.children.iter().skip(1) {
            let prev = new_children.last_mut().unwrap();
            if self.depth_of(child) < self.depth && self.can_concatenate(prev, child) {
                prev.r = child.r;
            } else {
                new_children.push(child.clone());
            }
        }

        if new_children.len() == 1 {
            node.children.clear();
        } else {
            node.children = new_children;
        }
    }

    /// Walks the tree bottom-up, refining every internal node.
    fn refine_recursive(&self, node: &mut MessageTreeNode) {
        for child in &mut node.children {
            self.refine_recursive(child);
        }
        self.refine_node(node);
    }

    pub fn refine_tree(&mut self, tree: &mut MessageTree) {
        self.calculate_depth(tree.root());
        self.refine_recursive(tree.root_mut());
    }
}
