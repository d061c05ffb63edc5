use smallvec::SmallVec;

use crate::*;

/// Tags protected by one call frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameState {
    /// The ID of the call this frame corresponds to.
    pub call_id: CallId,
    /// If this frame protected any tags, they are listed here. We use this list to do
    /// incremental updates of the global list of protected tags stored in the
    /// `GlobalCtx` when a function returns. Most frames protect zero or one or two
    /// tags.
    pub protected_tags: SmallVec<[(AllocId, BorTag); 2]>,
}

impl FrameState {
    pub fn new(call_id: CallId) -> Self {
        Self { call_id, protected_tags: SmallVec::new() }
    }
}

/// The stack of call frames that carry protectors.
#[derive(Debug, Default)]
pub struct LocalCtx {
    frames: Vec<FrameState>,
}

impl LocalCtx {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push_frame(&mut self, call_id: CallId) {
        self.frames.push(FrameState::new(call_id));
    }

    /// Record a protected tag in the innermost frame.
    /// Returns `false` if there is no frame to attach it to.
    #[inline]
    pub fn add_protected_tag(&mut self, alloc_id: AllocId, tag: BorTag) -> bool {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.protected_tags.push((alloc_id, tag));
                true
            }
            None => false,
        }
    }

    /// Pop every frame up to and including the one of `call_id`, innermost first.
    /// Returns `None`, and leaves the stack untouched, if no frame has that id.
    pub fn pop_frames_until(&mut self, call_id: CallId) -> Option<Vec<FrameState>> {
        let position = self.frames.iter().rposition(|frame| frame.call_id == call_id)?;
        let mut popped = self.frames.split_off(position);
        popped.reverse();
        Some(popped)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn innermost_call(&self) -> Option<CallId> {
        self.frames.last().map(|frame| frame.call_id)
    }
}
