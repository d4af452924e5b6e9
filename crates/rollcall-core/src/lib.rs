//! rollcall-core: Data model and matching policy for the attendance pipeline.
//!
//! Holds the embedding and person types, the nearest-neighbour matcher with
//! its acceptance threshold, the descriptor-extractor contract, and the
//! events pushed to real-time observers.

pub mod events;
pub mod extractor;
pub mod frame;
pub mod matcher;
pub mod types;

pub use events::{BroadcastEvent, ClientMessage, ResetScope, PONG};
pub use extractor::{Descriptor, DescriptorExtractor, ExtractError, ScreenedExtractor};
pub use frame::{Frame, FrameError};
pub use matcher::{LinearMatcher, MatchDecision, MatchPolicy, Matcher, Nearest};
pub use types::{
    AttendanceRecord, Embedding, GalleryEntry, PersonId, PersonSummary, RecognitionOutcome,
    StudentListing,
};
