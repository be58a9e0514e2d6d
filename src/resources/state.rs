//! Resource State Machine
//!
//! Every entry carries an [`AtomicResourceState`]. All changes are
//! compare-and-set against an expected source state; a failed transition means
//! another actor already moved the entry and the caller must back off.
//!
//! ```text
//! Unknown ─▶ Requesting ─▶ Requested ─▶ ProcessingRequest ─┬─▶ Ready ─▶ Uploading ─▶ Uploaded ◀─▶ IsBeingUsed
//!                              │                  │        └─▶ Unavailable     │          │
//!                              │                  ▼                            ▼          ▼
//!                              │   RequestCanceledWhileBeingProcessed       Ready    UnloadPending ─▶ Unloading ─▶ Unloaded
//!                              ▼                  │                                                          │
//!                        JustBeforeDeath ◀────────┴──────────── (Ready | Unavailable | Unloaded) ◀───────────┘
//! ```
//!
//! The state word also holds a generation counter bumped by every successful
//! transition, so `Uploaded → IsBeingUsed → Uploaded` is never mistaken for
//! "nothing happened".

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lifecycle state of a resource entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum ResourceState {
    Unknown = 0,
    Requesting = 1,
    Requested = 2,
    ProcessingRequest = 3,
    RequestCanceledWhileBeingProcessed = 4,
    Unavailable = 5,
    Ready = 6,
    Uploading = 7,
    Uploaded = 8,
    IsBeingUsed = 9,
    UnloadPending = 10,
    Unloading = 11,
    Unloaded = 12,
    JustBeforeDeath = 13,
}

impl ResourceState {
    /// Every state, in declaration order
    pub const ALL: [ResourceState; 14] = [
        ResourceState::Unknown,
        ResourceState::Requesting,
        ResourceState::Requested,
        ResourceState::ProcessingRequest,
        ResourceState::RequestCanceledWhileBeingProcessed,
        ResourceState::Unavailable,
        ResourceState::Ready,
        ResourceState::Uploading,
        ResourceState::Uploaded,
        ResourceState::IsBeingUsed,
        ResourceState::UnloadPending,
        ResourceState::Unloading,
        ResourceState::Unloaded,
        ResourceState::JustBeforeDeath,
    ];

    fn from_u8(raw: u8) -> ResourceState {
        match Self::ALL.get(raw as usize) {
            Some(state) => *state,
            None => unreachable!("corrupt resource state {}", raw),
        }
    }

    /// Whether `self → to` is an edge of the lifecycle graph
    pub fn can_transition_to(self, to: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, to),
            (Unknown, Requesting)
                | (Requesting, Requested)
                | (Requested, ProcessingRequest)
                | (Requested, JustBeforeDeath)
                | (ProcessingRequest, Ready)
                | (ProcessingRequest, Unavailable)
                | (ProcessingRequest, RequestCanceledWhileBeingProcessed)
                | (RequestCanceledWhileBeingProcessed, JustBeforeDeath)
                | (Ready, Uploading)
                | (Ready, JustBeforeDeath)
                | (Unavailable, JustBeforeDeath)
                | (Uploading, Uploaded)
                | (Uploading, Ready)
                | (Uploaded, IsBeingUsed)
                | (IsBeingUsed, Uploaded)
                | (Uploaded, UnloadPending)
                | (UnloadPending, Unloading)
                | (Unloading, Unloaded)
                | (Unloaded, JustBeforeDeath)
        )
    }

    /// Entry has a GPU handle the renderer may borrow
    pub fn is_usable(self) -> bool {
        matches!(self, ResourceState::Uploaded | ResourceState::IsBeingUsed)
    }

    /// Some actor is currently working on the entry and owns the next move
    pub fn is_being_processed(self) -> bool {
        use ResourceState::*;
        matches!(
            self,
            Unknown
                | Requesting
                | ProcessingRequest
                | RequestCanceledWhileBeingProcessed
                | Uploading
                | IsBeingUsed
                | UnloadPending
                | Unloading
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A successful transition, as observed by the winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ResourceState,
    pub to: ResourceState,
    /// Generation after the transition
    pub generation: u64,
}

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

#[inline]
fn pack(state: ResourceState, generation: u64) -> u64 {
    (generation << STATE_BITS) | state as u64
}

#[inline]
fn unpack(word: u64) -> (ResourceState, u64) {
    (ResourceState::from_u8((word & STATE_MASK) as u8), word >> STATE_BITS)
}

/// Lock-free state cell with compare-and-set transitions.
#[derive(Debug)]
pub struct AtomicResourceState {
    word: AtomicU64,
}

impl Default for AtomicResourceState {
    fn default() -> Self {
        Self::new(ResourceState::Unknown)
    }
}

impl AtomicResourceState {
    pub fn new(initial: ResourceState) -> Self {
        Self {
            word: AtomicU64::new(pack(initial, 0)),
        }
    }

    /// Current state
    #[inline]
    pub fn load(&self) -> ResourceState {
        unpack(self.word.load(Ordering::Acquire)).0
    }

    /// Current state and generation
    #[inline]
    pub fn load_with_generation(&self) -> (ResourceState, u64) {
        unpack(self.word.load(Ordering::Acquire))
    }

    /// Move `from → to` if the entry is still in `from`.
    ///
    /// Returns the winning [`Transition`], or `None` if another actor moved the
    /// entry first.
    ///
    /// # Panics
    ///
    /// Panics if `from → to` is not an edge of the lifecycle graph.
    pub fn transition(&self, from: ResourceState, to: ResourceState) -> Option<Transition> {
        assert!(
            from.can_transition_to(to),
            "illegal resource state transition {} -> {}",
            from,
            to
        );

        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let (state, generation) = unpack(current);
            if state != from {
                return None;
            }
            let next = pack(to, generation + 1);
            match self
                .word
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Some(Transition {
                        from,
                        to,
                        generation: generation + 1,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
