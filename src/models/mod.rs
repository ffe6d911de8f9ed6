mod event;
mod history;
mod match_;
mod queue;
mod user;

pub use event::{Event, EventKind};
pub use history::{NeverPair, PairHistory};
pub use match_::{Match, MatchId, MatchStatus, Outcome, Vote, VoteValue};
pub use queue::QueueEntry;
pub use user::{Gender, GenderPreference, Preferences, User, UserLifecycleState, UserState};
