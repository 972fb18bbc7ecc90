// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Entity chain bookkeeping for a single data file.
//!
//! An entity is one serialized object; the chain records where each entity
//! starts in its data file and how long it is, in write order. Nodes carry
//! the file number explicitly rather than a back-pointer to the owning
//! [`crate::data_file::DataFile`], per the "no cyclic parent pointer" design
//! note: the file already knows its own number, and entities never migrate
//! files without also migrating through a fresh `Store`/`Transfer` record.

/// One node in a data file's entity chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntityHandle {
    /// File the entity lives in.
    pub file_number: u64,
    /// Byte offset where the entity starts.
    pub position: u64,
    /// Length, in bytes, of the entity's serialized form.
    pub length: u64,
}

impl EntityHandle {
    /// The offset immediately past this entity.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.position + self.length
    }
}

/// An ordered, singly-linked list of entities written to one data file.
///
/// Write order is append order; garbage collection trims from the head
/// (oldest writes), consolidation splices whole chains onto the tail of a
/// fresh file.
#[derive(Default, Clone, Debug)]
pub struct EntityChain {
    nodes: Vec<EntityHandle>,
}

impl EntityChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a chain directly from already-ordered entries, e.g. entries
    /// relocated into a fresh file by consolidation.
    #[must_use]
    pub fn from_entries(nodes: Vec<EntityHandle>) -> Self {
        Self { nodes }
    }

    /// Number of entities currently chained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The first (oldest) entity, if any.
    #[must_use]
    pub fn first(&self) -> Option<&EntityHandle> {
        self.nodes.first()
    }

    /// The last (newest) entity, if any.
    #[must_use]
    pub fn last(&self) -> Option<&EntityHandle> {
        self.nodes.last()
    }

    /// Iterates the chain in write order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityHandle> {
        self.nodes.iter()
    }

    /// Appends one entity to the tail. Used on every committed store.
    pub fn append_entry(&mut self, entry: EntityHandle) {
        self.nodes.push(entry);
    }

    /// Drops every node whose end offset is `<= removed_bytes`, i.e. removes
    /// a head-bound run of dead entities after garbage collection has
    /// determined they are no longer reachable.
    ///
    /// `new_head` documents the expected first surviving position and is
    /// checked in debug builds to catch GC/entity-chain drift early.
    pub fn remove_head_bound_chain(&mut self, new_head: Option<u64>, removed_bytes: u64) {
        self.nodes.retain(|node| node.end() > removed_bytes);

        debug_assert!(
            match (self.nodes.first(), new_head) {
                (Some(node), Some(expected)) => node.position == expected,
                (None, _) | (_, None) => true,
            },
            "entity chain head drifted from GC's expectation"
        );
    }

    /// Splices another file's whole chain onto this chain's tail, used when
    /// consolidation relocates live entities into a fresh file.
    pub fn add_chain_to_tail(&mut self, mut first: EntityChain) {
        self.nodes.append(&mut first.nodes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_trims_head_bound_dead_entries() {
        let mut chain = EntityChain::new();
        chain.append_entry(EntityHandle { file_number: 1, position: 0, length: 10 });
        chain.append_entry(EntityHandle { file_number: 1, position: 10, length: 10 });
        chain.append_entry(EntityHandle { file_number: 1, position: 20, length: 10 });

        chain.remove_head_bound_chain(Some(20), 20);

        assert_eq!(chain.len(), 1);
        assert_eq!(chain.first().unwrap().position, 20);
    }

    #[test]
    fn consolidation_appends_whole_chain() {
        let mut dst = EntityChain::new();
        dst.append_entry(EntityHandle { file_number: 2, position: 0, length: 5 });

        let mut src = EntityChain::new();
        src.append_entry(EntityHandle { file_number: 1, position: 0, length: 5 });
        src.append_entry(EntityHandle { file_number: 1, position: 5, length: 5 });

        dst.add_chain_to_tail(src);

        assert_eq!(dst.len(), 3);
        assert_eq!(dst.last().unwrap().file_number, 1);
    }
}
