//! Topic-exchange binding table
//!
//! A trie over `.`-separated routing-key words, supporting the AMQP topic
//! exchange wildcards: `*` matches exactly one word, `#` (final position)
//! matches zero or more words. Node values are sets of queue names, so
//! rebinding the same pattern to the same queue is a no-op.

use ahash::{AHashMap, AHashSet};
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug, Default)]
struct TrieNode {
    /// Queues bound at exactly this word sequence
    queues: AHashSet<CompactString>,
    /// Children indexed by routing-key word
    children: AHashMap<CompactString, TrieNode>,
    /// Single-word wildcard (*) child
    single_wildcard: Option<Box<TrieNode>>,
    /// Multi-word wildcard (#) bindings
    multi_wildcard: AHashSet<CompactString>,
}

/// Binding table for one topic exchange
#[derive(Debug, Default)]
pub struct BindingTable {
    root: TrieNode,
}

impl BindingTable {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
        }
    }

    /// Bind a queue to a pattern; idempotent
    pub fn bind(&mut self, pattern: &str, queue: &str) {
        let mut node = &mut self.root;
        let mut words = pattern.split('.').peekable();

        while let Some(word) = words.next() {
            let is_last = words.peek().is_none();

            if word == "#" {
                node.multi_wildcard.insert(CompactString::new(queue));
                return;
            } else if word == "*" {
                node = node
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::default()));
            } else {
                node = node.children.entry(CompactString::new(word)).or_default();
            }

            if is_last {
                node.queues.insert(CompactString::new(queue));
                return;
            }
        }
    }

    /// Remove one binding; returns true if it existed
    pub fn unbind(&mut self, pattern: &str, queue: &str) -> bool {
        let words: SmallVec<[&str; 8]> = pattern.split('.').collect();
        Self::unbind_recursive(&mut self.root, &words, 0, queue)
    }

    fn unbind_recursive(node: &mut TrieNode, words: &[&str], index: usize, queue: &str) -> bool {
        if index >= words.len() {
            return node.queues.remove(queue);
        }

        match words[index] {
            "#" => node.multi_wildcard.remove(queue),
            "*" => {
                if let Some(ref mut child) = node.single_wildcard {
                    Self::unbind_recursive(child, words, index + 1, queue)
                } else {
                    false
                }
            }
            word => {
                if let Some(child) = node.children.get_mut(word) {
                    Self::unbind_recursive(child, words, index + 1, queue)
                } else {
                    false
                }
            }
        }
    }

    /// Remove every binding owned by a queue (queue deletion)
    pub fn remove_queue(&mut self, queue: &str) {
        Self::remove_queue_recursive(&mut self.root, queue);
    }

    fn remove_queue_recursive(node: &mut TrieNode, queue: &str) {
        node.queues.remove(queue);
        node.multi_wildcard.remove(queue);

        if let Some(ref mut child) = node.single_wildcard {
            Self::remove_queue_recursive(child, queue);
        }

        for child in node.children.values_mut() {
            Self::remove_queue_recursive(child, queue);
        }
    }

    /// Collect the queues a routing key routes to
    ///
    /// Each queue appears once even when several of its patterns match.
    pub fn matches(&self, routing_key: &str) -> AHashSet<CompactString> {
        let words: SmallVec<[&str; 8]> = routing_key.split('.').collect();
        let mut result = AHashSet::new();
        Self::matches_recursive(&self.root, &words, 0, &mut result);
        result
    }

    fn matches_recursive(
        node: &TrieNode,
        words: &[&str],
        index: usize,
        result: &mut AHashSet<CompactString>,
    ) {
        // # matches the rest of the key, including zero words
        for queue in &node.multi_wildcard {
            result.insert(queue.clone());
        }

        if index >= words.len() {
            for queue in &node.queues {
                result.insert(queue.clone());
            }
            return;
        }

        if let Some(ref child) = node.single_wildcard {
            Self::matches_recursive(child, words, index + 1, result);
        }

        if let Some(child) = node.children.get(words[index]) {
            Self::matches_recursive(child, words, index + 1, result);
        }
    }
}
