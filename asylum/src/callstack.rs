//! Interning call stacks as chains of (leaf frame, parent stack) nodes

use ahash::RandomState;
use hashbrown::{raw::RawTable, HashMap};
use lasso::{Rodeo, Spur};
use std::hash::{BuildHasher, Hash, Hasher};

/// Key to a previously interned frame
///
/// Two frames which were interned from the same name get the same key, unless
/// one of them was later renamed via `CallStackInterner::rename_frame()`.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FrameIndex(u32);
//
impl FrameIndex {
    /// Position of this frame in the interner's frame table
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Key to a previously interned call stack
///
/// A call stack is identified by its leaf frame and the call stack of its
/// caller. It is guaranteed that two keys are equal if and only if the
/// underlying (frame, parent) chains are equal.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CallStackIndex(u32);
//
impl CallStackIndex {
    /// Position of this call stack in the interner's node table
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One node of the call stack tree
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
struct CallStackNode {
    /// Innermost frame of this call stack
    frame: FrameIndex,

    /// Call stack of the caller, None at the root
    parent: Option<CallStackIndex>,
}

/// Interner for frame names and call stacks
pub struct CallStackInterner {
    /// Frame name strings
    names: Rodeo,

    /// Name of each frame, indexed by FrameIndex
    frames: Vec<Spur>,

    /// Frame associated with each interned name
    frame_lookup: HashMap<Spur, FrameIndex>,

    /// Call stack nodes, indexed by CallStackIndex
    nodes: Vec<CallStackNode>,

    /// Hasher factory used by the node RawTable
    random_state: RandomState,

    /// Keys to nodes interned so far in `nodes`
    node_lookup: RawTable<CallStackIndex>,
}
//
impl CallStackInterner {
    /// Set up a call stack interner
    pub fn new() -> Self {
        Self {
            names: Rodeo::new(),
            frames: Vec::new(),
            frame_lookup: HashMap::new(),
            nodes: Vec::new(),
            random_state: RandomState::new(),
            node_lookup: RawTable::new(),
        }
    }

    /// Intern a frame name
    pub fn intern_frame(&mut self, name: &str) -> FrameIndex {
        let spur = self.names.get_or_intern(name);
        let frames = &mut self.frames;
        *self.frame_lookup.entry(spur).or_insert_with(|| {
            let frame = FrameIndex(frames.len() as u32);
            frames.push(spur);
            frame
        })
    }

    /// Name of a previously interned frame
    pub fn frame_name(&self, frame: FrameIndex) -> &str {
        self.names.resolve(&self.frames[frame.index()])
    }

    /// Give a new name to an existing frame
    ///
    /// Every call stack which goes through this frame will see the new name.
    /// Interning the old name afterwards yields a fresh frame.
    pub fn rename_frame(&mut self, frame: FrameIndex, new_name: &str) {
        let old_spur = self.frames[frame.index()];
        if self.frame_lookup.get(&old_spur) == Some(&frame) {
            self.frame_lookup.remove(&old_spur);
        }
        let new_spur = self.names.get_or_intern(new_name);
        self.frames[frame.index()] = new_spur;
        self.frame_lookup.entry(new_spur).or_insert(frame);
    }

    /// Intern a call stack made of a leaf frame on top of a parent call stack
    pub fn intern(&mut self, frame: FrameIndex, parent: Option<CallStackIndex>) -> CallStackIndex {
        let node = CallStackNode { frame, parent };
        let node_hash = hash_node(&self.random_state, &node);

        // If this node was interned before, return the same key
        let nodes = &mut self.nodes;
        if let Some(&index) = self
            .node_lookup
            .get(node_hash, |index| nodes[index.index()] == node)
        {
            return index;
        }

        // Otherwise intern the node
        let index = CallStackIndex(nodes.len() as u32);
        nodes.push(node);
        let random_state = &self.random_state;
        self.node_lookup.insert(node_hash, index, |index| {
            hash_node(random_state, &nodes[index.index()])
        });
        index
    }

    /// Intern a frame name and push it on top of a parent call stack
    pub fn intern_named(&mut self, name: &str, parent: Option<CallStackIndex>) -> CallStackIndex {
        let frame = self.intern_frame(name);
        self.intern(frame, parent)
    }

    /// Leaf frame of a call stack
    pub fn frame(&self, stack: CallStackIndex) -> FrameIndex {
        self.nodes[stack.index()].frame
    }

    /// Call stack of the caller, if this is not a root
    pub fn caller(&self, stack: CallStackIndex) -> Option<CallStackIndex> {
        self.nodes[stack.index()].parent
    }

    /// Iterate over the frames of a call stack, from leaf to root
    pub fn frames(&self, stack: CallStackIndex) -> impl Iterator<Item = FrameIndex> + '_ {
        std::iter::successors(Some(stack), move |&stack| self.caller(stack))
            .map(move |stack| self.frame(stack))
    }

    /// Names of the frames of a call stack, from leaf to root
    pub fn frame_names(&self, stack: CallStackIndex) -> Vec<&str> {
        self.frames(stack)
            .map(|frame| self.frame_name(frame))
            .collect()
    }

    /// Number of frames in a call stack
    pub fn depth(&self, stack: CallStackIndex) -> usize {
        self.frames(stack).count()
    }

    /// Number of distinct frames interned so far
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Number of distinct call stacks interned so far
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Truth that no call stack has been interned yet
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
//
impl Default for CallStackInterner {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a call stack node
fn hash_node(random_state: &RandomState, node: &CallStackNode) -> u64 {
    let mut hasher = random_state.build_hasher();
    node.hash(&mut hasher);
    hasher.finish()
}
