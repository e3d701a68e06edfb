pub mod activity;
pub mod channel;
pub mod controller;
pub mod events;

pub use activity::{ActivityAnalyzer, ActivitySample};
pub use controller::{SessionBuilder, SessionState, VoiceSession, VoiceSessionHandle};
pub use events::{ConnectFailure, SessionEvent, SessionEventStream};
