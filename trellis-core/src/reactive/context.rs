//! Tracking Context
//!
//! The tracking context records which nodes were read during a computation.
//! This enables automatic dependency tracking: once the computation returns,
//! its caller subscribes to exactly the nodes that were read.
//!
//! # Implementation
//!
//! Each engine owns a stack of recording frames. Entering a tracked
//! computation pushes a frame; every read made through the accessor layer is
//! appended to the innermost frame only. Leaving the computation pops the
//! frame and hands back its records.
//!
//! This design supports nested tracked computations (e.g., an effect that
//! reads a computed value which activates its own effect).

use indexmap::IndexMap;

use super::runtime::Engine;
use crate::graph::NodeId;
use crate::value::Path;

/// One read captured while a tracking frame was active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRead {
    /// The node that was read.
    pub node: NodeId,
    /// Path of the node from its root.
    pub path: Path,
    /// The read did not look at descendants.
    pub shallow: bool,
}

#[derive(Debug)]
struct Frame {
    id: u64,
    reads: IndexMap<(NodeId, bool), TrackedRead>,
}

/// Stack of active recording frames.
#[derive(Debug, Default)]
pub(crate) struct TrackingStack {
    frames: Vec<Frame>,
    next_id: u64,
}

impl TrackingStack {
    fn push(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.frames.push(Frame {
            id,
            reads: IndexMap::new(),
        });
        id
    }

    fn pop(&mut self, id: u64) -> Vec<TrackedRead> {
        let popped = self.frames.pop();

        // Frames must close in the reverse order they were opened.
        match popped {
            Some(frame) => {
                debug_assert_eq!(
                    frame.id, id,
                    "tracking frame mismatch: expected {}, got {}",
                    id, frame.id
                );
                frame.reads.into_values().collect()
            }
            None => Vec::new(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Record a read in the innermost frame. Duplicate (node, shallow) pairs
    /// are recorded once.
    pub(crate) fn record(&mut self, node: NodeId, path: Path, shallow: bool) {
        if let Some(frame) = self.frames.last_mut() {
            frame
                .reads
                .entry((node, shallow))
                .or_insert(TrackedRead {
                    node,
                    path,
                    shallow,
                });
        }
    }

    /// Suspend tracking: returns the frames so that reads fall through.
    pub(crate) fn suspend(&mut self) -> Vec<FrameState> {
        std::mem::take(&mut self.frames)
            .into_iter()
            .map(FrameState)
            .collect()
    }

    pub(crate) fn resume(&mut self, frames: Vec<FrameState>) {
        let nested = std::mem::replace(
            &mut self.frames,
            frames.into_iter().map(|state| state.0).collect(),
        );
        debug_assert!(nested.is_empty(), "tracking frame leaked from untracked section");
    }
}

/// Opaque saved frame used by [`Engine::untracked`].
#[derive(Debug)]
pub(crate) struct FrameState(Frame);

/// Guard for one tracking frame.
///
/// The frame is popped when the guard is dropped, so the stack stays
/// balanced even if the tracked computation panics.
pub struct TrackingScope {
    engine: Engine,
    id: Option<u64>,
}

impl TrackingScope {
    /// Open a new frame on `engine`'s tracking stack.
    pub fn enter(engine: &Engine) -> Self {
        let id = engine.tracking().borrow_mut().push();
        Self {
            engine: engine.clone(),
            id: Some(id),
        }
    }

    /// Close the frame and return everything recorded in it.
    pub fn finish(mut self) -> Vec<TrackedRead> {
        match self.id.take() {
            Some(id) => self.engine.tracking().borrow_mut().pop(id),
            None => Vec::new(),
        }
    }
}

impl Drop for TrackingScope {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.engine.tracking().borrow_mut().pop(id);
        }
    }
}
